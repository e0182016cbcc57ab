//! Intent resolution and the explicit routing table.
//!
//! Payloads are opaque JSON objects; only three fields are interpreted here:
//! `intent` (required), `params` (forwarded to the capability) and
//! `target_file` (required for `code_fix`).

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Closed set of intents the orchestrator knows how to route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    /// Free-form text generation.
    Generate,
    /// Source-control operation.
    Git,
    /// Browser automation.
    Browse,
    /// Single file modification.
    FileEdit,
    /// Modify code until verification passes.
    CodeFix,
}

impl Intent {
    pub const ALL: [Intent; 5] = [
        Intent::Generate,
        Intent::Git,
        Intent::Browse,
        Intent::FileEdit,
        Intent::CodeFix,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Intent::Generate => "generate",
            Intent::Git => "git",
            Intent::Browse => "browse",
            Intent::FileEdit => "file_edit",
            Intent::CodeFix => "code_fix",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|intent| intent.as_str() == raw.trim())
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handler an intent is routed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Invoke one capability once with the payload params.
    Direct { capability: String },
    /// Run a healing loop session against the payload's target file.
    Healing,
}

impl Route {
    /// Human-readable description recorded in the routing decision gate.
    pub fn describe(&self) -> String {
        match self {
            Route::Direct { capability } => {
                format!("route to direct capability call: {capability}")
            }
            Route::Healing => "route to code-fix healing loop".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    #[error("payload must be a JSON object")]
    InvalidPayload,
    #[error("payload is missing an `intent` field")]
    MissingIntent,
    #[error("unknown intent '{0}'")]
    UnknownIntent(String),
    #[error("no route registered for intent '{0}'")]
    Unrouted(Intent),
    #[error("intent '{0}' requires a `target_file`")]
    MissingTarget(Intent),
}

/// Explicit mapping from intent to handler.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    routes: HashMap<Intent, Route>,
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::empty()
            .with_route(Intent::Generate, direct("llm.generate"))
            .with_route(Intent::Git, direct("git"))
            .with_route(Intent::Browse, direct("browser"))
            .with_route(Intent::FileEdit, direct("file.edit"))
            .with_route(Intent::CodeFix, Route::Healing)
    }
}

fn direct(capability: &str) -> Route {
    Route::Direct {
        capability: capability.to_string(),
    }
}

impl RoutingTable {
    pub fn empty() -> Self {
        Self {
            routes: HashMap::new(),
        }
    }

    pub fn with_route(mut self, intent: Intent, route: Route) -> Self {
        self.routes.insert(intent, route);
        self
    }

    pub fn route(&self, intent: Intent) -> Result<&Route, RouteError> {
        self.routes.get(&intent).ok_or(RouteError::Unrouted(intent))
    }
}

/// Fully resolved routing decision for one payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch {
    pub intent: Intent,
    pub route: Route,
    pub params: Value,
    pub target_file: Option<String>,
}

/// Read the `intent` field of a payload.
pub fn resolve_intent(payload: &Value) -> Result<Intent, RouteError> {
    let object = payload.as_object().ok_or(RouteError::InvalidPayload)?;
    let raw = object
        .get("intent")
        .and_then(Value::as_str)
        .ok_or(RouteError::MissingIntent)?;
    Intent::parse(raw).ok_or_else(|| RouteError::UnknownIntent(raw.to_string()))
}

/// Resolve intent, route, params and target for a payload.
pub fn plan_dispatch(payload: &Value, table: &RoutingTable) -> Result<Dispatch, RouteError> {
    let intent = resolve_intent(payload)?;
    let route = table.route(intent)?.clone();
    let params = payload
        .get("params")
        .cloned()
        .filter(|value| !value.is_null())
        .unwrap_or_else(|| Value::Object(Map::new()));
    let target_file = payload
        .get("target_file")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|target| !target.is_empty())
        .map(str::to_string);

    if route == Route::Healing && target_file.is_none() {
        return Err(RouteError::MissingTarget(intent));
    }

    Ok(Dispatch {
        intent,
        route,
        params,
        target_file,
    })
}
