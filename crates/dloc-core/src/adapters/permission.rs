//! ---
//! dloc_section: "05-networking-external-interfaces"
//! dloc_subsection: "module"
//! dloc_type: "source"
//! dloc_scope: "code"
//! dloc_description: "Fixed-answer permission source."
//! dloc_version: "v0.0.0-prealpha"
//! dloc_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use anyhow::anyhow;
use async_trait::async_trait;
use parking_lot::Mutex;

use super::PermissionSource;
use crate::model::PermissionStatus;

/// Permission source with a scripted answer to prompts.
#[derive(Debug)]
pub struct StaticPermissionSource {
    status: Mutex<PermissionStatus>,
    answer: PermissionStatus,
    failing: AtomicBool,
    prompts: AtomicUsize,
}

impl StaticPermissionSource {
    /// `initial` is reported until a prompt is answered with `answer`.
    pub fn new(initial: PermissionStatus, answer: PermissionStatus) -> Self {
        Self {
            status: Mutex::new(initial),
            answer,
            failing: AtomicBool::new(false),
            prompts: AtomicUsize::new(0),
        }
    }

    pub fn granted() -> Self {
        Self::new(PermissionStatus::Granted, PermissionStatus::Granted)
    }

    pub fn denied() -> Self {
        Self::new(PermissionStatus::Denied, PermissionStatus::Denied)
    }

    /// Undetermined until prompted, then `answer`.
    pub fn prompting(answer: PermissionStatus) -> Self {
        Self::new(PermissionStatus::Undetermined, answer)
    }

    /// Make every call fail as if the platform API threw.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn prompts(&self) -> usize {
        self.prompts.load(Ordering::SeqCst)
    }

    fn check_failure(&self) -> anyhow::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(anyhow!("permission service unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl PermissionSource for StaticPermissionSource {
    async fn status(&self) -> anyhow::Result<PermissionStatus> {
        self.check_failure()?;
        Ok(*self.status.lock())
    }

    async fn request_access(&self) -> anyhow::Result<PermissionStatus> {
        self.check_failure()?;
        self.prompts.fetch_add(1, Ordering::SeqCst);
        let mut status = self.status.lock();
        *status = self.answer;
        Ok(*status)
    }
}
