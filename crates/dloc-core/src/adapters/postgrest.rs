//! ---
//! dloc_section: "05-networking-external-interfaces"
//! dloc_subsection: "module"
//! dloc_type: "source"
//! dloc_scope: "code"
//! dloc_description: "PostgREST-backed location record store."
//! dloc_version: "v0.0.0-prealpha"
//! dloc_owner: "tbd"
//! ---
//! Record store backed by a PostgREST endpoint (`/rest/v1/<table>`).

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dloc_common::config::{StoreConfig, DEFAULT_ACCURACY_METERS};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;
use url::Url;

use super::RecordStore;
use crate::error::StoreError;
use crate::model::{DriverId, LocationPatch, LocationRecord};

/// Connection settings for [`PostgrestRecordStore`].
#[derive(Debug, Clone)]
pub struct PostgrestConfig {
    pub base_url: Url,
    pub table: String,
    pub key_column: String,
    pub api_key: Option<String>,
    /// Per-request bound enforced by the HTTP client.
    pub timeout: Duration,
}

impl PostgrestConfig {
    /// Resolve settings from the store section; the key is read from the named env var.
    pub fn from_store_config(config: &StoreConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty());
        if api_key.is_none() {
            debug!(env = %config.api_key_env, "no store api key in environment");
        }
        Ok(Self {
            base_url: config.base_url()?,
            table: config.table.clone(),
            key_column: config.key_column.clone(),
            api_key,
            timeout: config.timeout,
        })
    }
}

#[derive(Debug, Deserialize)]
struct RowFields {
    latitude: f64,
    longitude: f64,
    #[serde(default)]
    heading: Option<f64>,
    #[serde(default)]
    speed: Option<f64>,
    #[serde(default)]
    accuracy: Option<f64>,
    updated_at: DateTime<Utc>,
}

/// HTTP client for the remote location table.
#[derive(Debug, Clone)]
pub struct PostgrestRecordStore {
    client: Client,
    endpoint: Url,
    key_column: String,
    timeout: Duration,
}

impl PostgrestRecordStore {
    pub fn new(config: PostgrestConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(key) = &config.api_key {
            headers.insert(
                "apikey",
                HeaderValue::from_str(key).context("store api key is not a valid header value")?,
            );
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {key}"))
                    .context("store api key is not a valid header value")?,
            );
        }
        let client = Client::builder()
            .timeout(config.timeout)
            .default_headers(headers)
            .build()
            .context("failed to build reqwest client")?;

        let mut base = config.base_url.clone();
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let endpoint = base
            .join(&format!("rest/v1/{}", config.table))
            .with_context(|| format!("invalid table name '{}'", config.table))?;

        Ok(Self {
            client,
            endpoint,
            key_column: config.key_column,
            timeout: config.timeout,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn key_filter(&self, driver: &DriverId) -> (String, String) {
        (self.key_column.clone(), format!("eq.{driver}"))
    }

    fn row_body(&self, record: &LocationRecord) -> Value {
        let mut row = patch_body(&record.patch());
        row.insert(
            self.key_column.clone(),
            Value::String(record.driver_id.as_str().to_owned()),
        );
        Value::Object(row)
    }

    fn parse_row(&self, row: Value) -> Result<LocationRecord, StoreError> {
        let driver = row
            .get(&self.key_column)
            .and_then(|value| match value {
                Value::String(id) => Some(id.clone()),
                Value::Number(id) => Some(id.to_string()),
                _ => None,
            })
            .ok_or_else(|| {
                StoreError::Transport(format!("row is missing key column '{}'", self.key_column))
            })?;
        let fields: RowFields = serde_json::from_value(row)
            .map_err(|err| StoreError::Transport(format!("malformed row: {err}")))?;
        Ok(LocationRecord {
            driver_id: DriverId::new(driver),
            latitude: fields.latitude,
            longitude: fields.longitude,
            heading: fields.heading,
            speed: fields.speed,
            accuracy: fields.accuracy.unwrap_or(DEFAULT_ACCURACY_METERS),
            updated_at: fields.updated_at,
        })
    }

    async fn send_for_rows(
        &self,
        driver: &DriverId,
        request: RequestBuilder,
    ) -> Result<Vec<Value>, StoreError> {
        let response = request.send().await.map_err(|err| self.transport(err))?;
        let status = response.status();
        if status == StatusCode::CONFLICT {
            let detail = response.text().await.unwrap_or_default();
            return Err(StoreError::Constraint {
                driver: driver.clone(),
                detail,
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Transport(format!("{status}: {body}")));
        }
        response
            .json::<Vec<Value>>()
            .await
            .map_err(|err| self.transport(err))
    }

    fn transport(&self, err: reqwest::Error) -> StoreError {
        if err.is_timeout() {
            StoreError::Timeout(self.timeout)
        } else {
            StoreError::Transport(err.to_string())
        }
    }
}

fn patch_body(patch: &LocationPatch) -> Map<String, Value> {
    let mut row = Map::new();
    row.insert("latitude".into(), Value::from(patch.latitude));
    row.insert("longitude".into(), Value::from(patch.longitude));
    row.insert("heading".into(), patch.heading.map_or(Value::Null, Value::from));
    row.insert("speed".into(), patch.speed.map_or(Value::Null, Value::from));
    row.insert("accuracy".into(), Value::from(patch.accuracy));
    row.insert("updated_at".into(), Value::String(patch.updated_at.to_rfc3339()));
    row
}

#[async_trait]
impl RecordStore for PostgrestRecordStore {
    async fn find(&self, driver: &DriverId) -> Result<Option<LocationRecord>, StoreError> {
        let request = self
            .client
            .get(self.endpoint.clone())
            .query(&[self.key_filter(driver), ("limit".into(), "1".into())]);
        let rows = self.send_for_rows(driver, request).await?;
        rows.into_iter().next().map(|row| self.parse_row(row)).transpose()
    }

    async fn upsert(&self, record: &LocationRecord) -> Result<LocationRecord, StoreError> {
        let request = self
            .client
            .post(self.endpoint.clone())
            .query(&[("on_conflict", self.key_column.as_str())])
            .header("Prefer", "resolution=merge-duplicates,return=representation")
            .json(&self.row_body(record));
        let rows = self.send_for_rows(&record.driver_id, request).await?;
        match rows.into_iter().next() {
            Some(row) => self.parse_row(row),
            None => Ok(record.clone()),
        }
    }

    async fn update(
        &self,
        driver: &DriverId,
        patch: &LocationPatch,
    ) -> Result<LocationRecord, StoreError> {
        let request = self
            .client
            .patch(self.endpoint.clone())
            .query(&[self.key_filter(driver)])
            .header("Prefer", "return=representation")
            .json(&Value::Object(patch_body(patch)));
        let rows = self.send_for_rows(driver, request).await?;
        match rows.into_iter().next() {
            Some(row) => self.parse_row(row),
            None => Err(StoreError::NotFound(driver.clone())),
        }
    }
}
