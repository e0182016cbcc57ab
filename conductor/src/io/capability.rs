//! Capability executor abstraction.
//!
//! The [`CapabilityExecutor`] trait decouples orchestration from the concrete
//! backends that do the work (code generation, sandboxed checks, file edits).
//! Tests use scripted executors that return predetermined outputs.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// One named unit of work with structured parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    pub name: String,
    pub params: Value,
}

impl Invocation {
    pub fn new(name: impl Into<String>, params: Value) -> Self {
        Self {
            name: name.into(),
            params,
        }
    }
}

/// Result of a capability call that ran to completion.
///
/// `ok = false` is a domain failure (for example, checks that did not pass),
/// not an infrastructure error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityOutput {
    pub ok: bool,
    #[serde(default)]
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Cost reported by the backend, when it knows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
}

impl CapabilityOutput {
    pub fn success(output: Value) -> Self {
        Self {
            ok: true,
            output,
            error: None,
            cost: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            output: Value::Null,
            error: Some(error.into()),
            cost: None,
        }
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = Some(cost);
        self
    }

    /// Best available description of a failed call.
    pub fn failure_detail(&self) -> String {
        if let Some(error) = self.error.as_deref().filter(|e| !e.trim().is_empty()) {
            return error.to_string();
        }
        match &self.output {
            Value::Null => "capability reported failure without detail".to_string(),
            Value::String(text) => text.clone(),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CapabilityError {
    #[error("capability '{0}' is not available")]
    Unavailable(String),
    #[error("capability timed out after {0:?}")]
    TimedOut(Duration),
    #[error("capability call cancelled")]
    Cancelled,
    #[error("capability failed: {0}")]
    Failed(String),
}

/// Abstraction over capability backends.
///
/// Implementations should observe `cancel` where they can; the orchestration
/// layer also races every call against the token and a deadline.
#[async_trait]
pub trait CapabilityExecutor: Send + Sync {
    async fn invoke(
        &self,
        invocation: &Invocation,
        cancel: &CancellationToken,
    ) -> Result<CapabilityOutput, CapabilityError>;
}

/// Invoke a capability bounded by `timeout` and `cancel`.
///
/// Whichever fires first wins; the in-flight call future is dropped. The
/// executor sees a per-call child token that is cancelled whenever this
/// function returns, so work the backend runs off the async task (a child
/// process, a blocking thread) stops with the call.
#[instrument(skip_all, fields(capability = %invocation.name, timeout_ms = timeout.as_millis() as u64))]
pub async fn invoke_bounded(
    executor: &dyn CapabilityExecutor,
    invocation: &Invocation,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<CapabilityOutput, CapabilityError> {
    if cancel.is_cancelled() {
        return Err(CapabilityError::Cancelled);
    }
    let call = cancel.child_token();
    let _stop_on_return = call.clone().drop_guard();
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            debug!("capability call cancelled");
            Err(CapabilityError::Cancelled)
        }
        result = tokio::time::timeout(timeout, executor.invoke(invocation, &call)) => {
            match result {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!("capability call timed out");
                    Err(CapabilityError::TimedOut(timeout))
                }
            }
        }
    }
}
