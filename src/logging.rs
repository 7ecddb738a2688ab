//! Durable job-log macros.
//!
//! These log into the job record (via the context buffer), not into the
//! process tracing output: lines survive with the job and can be read back
//! from `JobState.logs` after the fact.

use crate::{LogLevel, WorkflowContext};

pub fn push_buffer(ctx: &WorkflowContext, level: LogLevel, msg: String) {
    ctx.log(level, msg, None);
}

#[macro_export]
macro_rules! job_debug {
    ($ctx:expr, $($arg:tt)+) => {{
        $crate::logging::push_buffer(&$ctx, $crate::LogLevel::Debug, format!($($arg)+));
    }};
}

#[macro_export]
macro_rules! job_info {
    ($ctx:expr, $($arg:tt)+) => {{
        $crate::logging::push_buffer(&$ctx, $crate::LogLevel::Info, format!($($arg)+));
    }};
}

#[macro_export]
macro_rules! job_warn {
    ($ctx:expr, $($arg:tt)+) => {{
        $crate::logging::push_buffer(&$ctx, $crate::LogLevel::Warn, format!($($arg)+));
    }};
}

#[macro_export]
macro_rules! job_error {
    ($ctx:expr, $($arg:tt)+) => {{
        $crate::logging::push_buffer(&$ctx, $crate::LogLevel::Error, format!($($arg)+));
    }};
}
