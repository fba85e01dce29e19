//! Execution-fault capture.
//!
//! A failing handler must not take its worker down. Its error (or panic) is
//! turned into an [`ErrorPayload`] carrying the message, where it happened
//! and, when known, the statement that failed. Handlers opt into precise
//! locations by wrapping fallible steps in [`step!`](crate::step).

use super::registry::TaskHandlerRegistry;
use crate::queue::types::ErrorPayload;

use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// A handler error annotated with the failing step.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct StepFailure {
    pub message: String,
    /// `file:line`
    pub location: String,
    pub statement: String,
}

impl StepFailure {
    pub fn new(message: impl fmt::Display, location: &str, statement: &str) -> Self {
        Self {
            message: message.to_string(),
            location: location.to_string(),
            statement: statement.to_string(),
        }
    }

    pub fn into_error(self) -> anyhow::Error {
        anyhow::Error::new(self)
    }
}

/// Evaluates a `Result` expression inside a handler, returning early with a
/// [`StepFailure`] that records the expression text and its `file:line`.
///
/// ```ignore
/// let n: u64 = step!(args[0].as_str().unwrap_or("").parse::<u64>());
/// ```
#[macro_export]
macro_rules! step {
    ($expr:expr) => {
        match $expr {
            Ok(value) => value,
            Err(e) => {
                return Err($crate::node::fault::StepFailure::new(
                    e,
                    concat!(file!(), ":", line!()),
                    stringify!($expr),
                )
                .into_error())
            }
        }
    };
}

/// Builds the error payload stored for a failed handler.
pub fn describe_failure(task_name: &str, error: &anyhow::Error) -> ErrorPayload {
    match error.downcast_ref::<StepFailure>() {
        Some(step) => ErrorPayload {
            error: step.message.clone(),
            task_name: task_name.to_string(),
            location: Some(step.location.clone()),
            statement: Some(step.statement.clone()),
        },
        None => ErrorPayload {
            error: format!("{:#}", error),
            task_name: task_name.to_string(),
            location: None,
            statement: None,
        },
    }
}

/// Runs a registered handler on its own tokio task so a panic is reported
/// like any other failure.
pub async fn run_isolated(
    registry: Arc<TaskHandlerRegistry>,
    task_name: &str,
    args: Vec<Value>,
) -> Result<Value, ErrorPayload> {
    let name = task_name.to_string();
    let joined = tokio::spawn(async move { registry.execute(&name, args).await }).await;

    match joined {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(describe_failure(task_name, &e)),
        Err(join_error) if join_error.is_panic() => {
            let panic = join_error.into_panic();
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "handler panicked".to_string());
            Err(ErrorPayload {
                error: format!("panic: {}", message),
                task_name: task_name.to_string(),
                location: None,
                statement: None,
            })
        }
        Err(join_error) => Err(ErrorPayload {
            error: format!("handler cancelled: {}", join_error),
            task_name: task_name.to_string(),
            location: None,
            statement: None,
        }),
    }
}
