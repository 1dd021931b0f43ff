//! ---
//! dloc_section: "03-persistence-logging"
//! dloc_subsection: "module"
//! dloc_type: "source"
//! dloc_scope: "code"
//! dloc_description: "Context-aware tracing macros."
//! dloc_version: "v0.0.0-prealpha"
//! dloc_owner: "tbd"
//! ---
//! Level-specific macros attaching [`LogContext`](crate::LogContext) fields.

/// Shared expansion for the level-specific macros.
#[doc(hidden)]
#[macro_export]
macro_rules! __track_event {
    ($level:expr, $ctx:expr, $($arg:tt)+) => {{
        let ctx = &$ctx;
        ::tracing::event!(
            $level,
            driver = ctx.driver.unwrap_or(""),
            session = ctx.session.unwrap_or_default(),
            state = ctx.state.unwrap_or(""),
            message = %format_args!($($arg)+)
        );
    }};
}

/// Emit an informational log enriched with tracking context.
#[macro_export]
macro_rules! track_info {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__track_event!(::tracing::Level::INFO, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__track_event!(::tracing::Level::INFO, $crate::LogContext::default(), $($arg)+)
    };
}

/// Emit a debug log enriched with tracking context.
#[macro_export]
macro_rules! track_debug {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__track_event!(::tracing::Level::DEBUG, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__track_event!(::tracing::Level::DEBUG, $crate::LogContext::default(), $($arg)+)
    };
}

/// Emit a warning log enriched with tracking context.
#[macro_export]
macro_rules! track_warn {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__track_event!(::tracing::Level::WARN, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__track_event!(::tracing::Level::WARN, $crate::LogContext::default(), $($arg)+)
    };
}

/// Emit an error log enriched with tracking context.
#[macro_export]
macro_rules! track_error {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__track_event!(::tracing::Level::ERROR, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__track_event!(::tracing::Level::ERROR, $crate::LogContext::default(), $($arg)+)
    };
}
