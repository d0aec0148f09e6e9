//! Schema-first tool registry with audited dispatch
//!
//! Every externally invokable operation is a tool: a unique name, a typed
//! parameter schema, and a handler. `execute` validates arguments against
//! the schema, runs the handler, and appends one complete audit record
//! with both timestamps and the outcome - validation, start event, handler,
//! and end event form one observational unit, so the history never shows a
//! half-finished invocation.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{ErrorKind, FieldDiagnostic};
use crate::events::{Event, EventBridge};
use crate::{Error, Result};

/// Audit ring capacity
const MAX_HISTORY: usize = 1000;

/// Parameter value types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
}

/// One declared tool parameter
#[derive(Debug, Clone, Serialize)]
pub struct ToolParameter {
    pub name: String,
    pub param_type: ParamType,
    pub description: String,
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl ToolParameter {
    /// New optional parameter
    #[must_use]
    pub fn new(name: &str, param_type: ParamType, description: &str) -> Self {
        Self {
            name: name.to_string(),
            param_type,
            description: description.to_string(),
            required: false,
            allowed: None,
            default: None,
        }
    }

    /// Mark required
    #[must_use]
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Restrict string values to a closed set
    #[must_use]
    pub fn one_of(mut self, values: &[&str]) -> Self {
        self.allowed = Some(values.iter().map(ToString::to_string).collect());
        self
    }

    /// Default value injected when the caller omits the parameter
    #[must_use]
    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    fn type_matches(&self, value: &Value) -> bool {
        match self.param_type {
            ParamType::String => value.is_string(),
            ParamType::Integer => value.is_i64() || value.is_u64(),
            ParamType::Number => value.is_number(),
            ParamType::Boolean => value.is_boolean(),
        }
    }
}

/// Future returned by tool handlers
pub type ToolFuture = Pin<Box<dyn Future<Output = Result<Value>> + Send>>;

/// Tool handler: validated arguments in, JSON result out
pub type ToolHandlerFn = Arc<dyn Fn(Map<String, Value>) -> ToolFuture + Send + Sync>;

/// A registered tool
#[derive(Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub category: String,
    /// Whether the tool mutates system state; executions are logged louder
    pub dangerous: bool,
    pub parameters: Vec<ToolParameter>,
    pub handler: ToolHandlerFn,
}

impl ToolSpec {
    /// New tool with the given handler
    pub fn new<F, Fut>(name: &str, description: &str, category: &str, handler: F) -> Self
    where
        F: Fn(Map<String, Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            category: category.to_string(),
            dangerous: false,
            parameters: Vec::new(),
            handler: Arc::new(move |args| -> ToolFuture { Box::pin(handler(args)) }),
        }
    }

    /// Mark as state-mutating
    #[must_use]
    pub fn dangerous(mut self) -> Self {
        self.dangerous = true;
        self
    }

    /// Add a parameter
    #[must_use]
    pub fn param(mut self, parameter: ToolParameter) -> Self {
        self.parameters.push(parameter);
        self
    }
}

/// Serializable view of a tool for listings
#[derive(Debug, Clone, Serialize)]
pub struct ToolDescription {
    pub name: String,
    pub description: String,
    pub category: String,
    pub dangerous: bool,
    pub parameters: Vec<ToolParameter>,
}

/// Outcome of a recorded invocation
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum InvocationOutcome {
    Ok {
        result: Value,
    },
    Error {
        error_kind: ErrorKind,
        message: String,
        retryable: bool,
    },
}

impl InvocationOutcome {
    /// Whether the invocation succeeded
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }
}

/// One audited tool invocation
#[derive(Debug, Clone, Serialize)]
pub struct ToolInvocation {
    pub id: Uuid,
    pub tool: String,
    pub args: Value,
    pub caller_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(flatten)]
    pub outcome: InvocationOutcome,
}

/// History query filter
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    pub tool: Option<String>,
    pub caller_id: Option<String>,
    pub limit: Option<usize>,
}

/// Persistence hook invoked for each completed record
pub type PersistHook = Arc<dyn Fn(&ToolInvocation) + Send + Sync>;

/// Process-wide audited tool dispatcher
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, ToolSpec>>,
    history: Mutex<VecDeque<ToolInvocation>>,
    bridge: EventBridge,
    persist: RwLock<Option<PersistHook>>,
}

impl ToolRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new(bridge: EventBridge) -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
            history: Mutex::new(VecDeque::with_capacity(MAX_HISTORY)),
            bridge,
            persist: RwLock::new(None),
        }
    }

    /// Install a hook that persists each completed record
    pub fn set_persist_hook(&self, hook: PersistHook) {
        *self.persist.write().expect("persist lock") = Some(hook);
    }

    /// Register a tool.
    ///
    /// # Errors
    ///
    /// Returns `tool_exists` on a name collision.
    pub fn register(&self, spec: ToolSpec) -> Result<()> {
        let mut tools = self.tools.write().expect("tools lock");
        if tools.contains_key(&spec.name) {
            return Err(Error::ToolExists(spec.name));
        }
        tracing::debug!(tool = %spec.name, category = %spec.category, "registered tool");
        tools.insert(spec.name.clone(), spec);
        Ok(())
    }

    /// Names of all registered tools, sorted
    #[must_use]
    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .tools
            .read()
            .expect("tools lock")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Serializable tool listing
    #[must_use]
    pub fn describe(&self) -> Vec<ToolDescription> {
        let mut out: Vec<ToolDescription> = self
            .tools
            .read()
            .expect("tools lock")
            .values()
            .map(|spec| ToolDescription {
                name: spec.name.clone(),
                description: spec.description.clone(),
                category: spec.category.clone(),
                dangerous: spec.dangerous,
                parameters: spec.parameters.clone(),
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Execute a tool and record the invocation.
    ///
    /// Lookup and validation failures are audited like any other outcome.
    pub async fn execute(&self, name: &str, args: Value, caller_id: &str) -> ToolInvocation {
        let started_at = Utc::now();
        let id = Uuid::new_v4();

        self.bridge.publish(Event::ToolInvocationStarted {
            invocation_id: id.to_string(),
            tool: name.to_string(),
            caller_id: caller_id.to_string(),
        });

        let outcome = self.run(name, &args, caller_id).await;

        let record = ToolInvocation {
            id,
            tool: name.to_string(),
            args,
            caller_id: caller_id.to_string(),
            started_at,
            finished_at: Utc::now(),
            outcome: match outcome {
                Ok(result) => InvocationOutcome::Ok { result },
                Err(e) => {
                    tracing::warn!(tool = name, caller = caller_id, error = %e, "tool failed");
                    InvocationOutcome::Error {
                        error_kind: e.kind(),
                        message: e.to_string(),
                        retryable: e.retryable(),
                    }
                }
            },
        };

        self.bridge.publish(Event::ToolInvocationFinished {
            invocation_id: id.to_string(),
            tool: record.tool.clone(),
            ok: record.outcome.is_ok(),
            error_kind: match &record.outcome {
                InvocationOutcome::Ok { .. } => None,
                InvocationOutcome::Error { error_kind, .. } => Some(*error_kind),
            },
        });

        if let Some(hook) = self.persist.read().expect("persist lock").clone() {
            hook(&record);
        }

        let mut history = self.history.lock().expect("history lock");
        if history.len() == MAX_HISTORY {
            history.pop_front();
        }
        history.push_back(record.clone());
        drop(history);

        record
    }

    /// Recent invocations from the bounded ring, newest last
    #[must_use]
    pub fn history(&self, filter: &HistoryFilter) -> Vec<ToolInvocation> {
        let history = self.history.lock().expect("history lock");
        let matches: Vec<ToolInvocation> = history
            .iter()
            .filter(|inv| filter.tool.as_ref().map_or(true, |t| &inv.tool == t))
            .filter(|inv| {
                filter
                    .caller_id
                    .as_ref()
                    .map_or(true, |c| &inv.caller_id == c)
            })
            .cloned()
            .collect();
        let limit = filter.limit.unwrap_or(50);
        let skip = matches.len().saturating_sub(limit);
        matches.into_iter().skip(skip).collect()
    }

    async fn run(&self, name: &str, args: &Value, caller_id: &str) -> Result<Value> {
        let spec = self
            .tools
            .read()
            .expect("tools lock")
            .get(name)
            .cloned()
            .ok_or_else(|| Error::ToolNotFound(name.to_string()))?;

        let validated = validate_args(&spec.parameters, args)?;

        if spec.dangerous {
            tracing::warn!(tool = %spec.name, caller = caller_id, "dangerous tool execution");
        }

        (spec.handler)(validated).await
    }
}

/// Validate `args` against the schema, applying defaults.
///
/// # Errors
///
/// Returns `invalid_args` with one diagnostic per offending field.
pub fn validate_args(parameters: &[ToolParameter], args: &Value) -> Result<Map<String, Value>> {
    let mut diagnostics = Vec::new();

    let supplied: Map<String, Value> = match args {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        _ => {
            return Err(Error::InvalidArgs(vec![FieldDiagnostic {
                field: "<root>".to_string(),
                problem: "arguments must be an object".to_string(),
            }]))
        }
    };

    let known: HashMap<&str, &ToolParameter> =
        parameters.iter().map(|p| (p.name.as_str(), p)).collect();

    for name in supplied.keys() {
        if !known.contains_key(name.as_str()) {
            diagnostics.push(FieldDiagnostic {
                field: name.clone(),
                problem: "unexpected parameter".to_string(),
            });
        }
    }

    let mut validated = Map::new();
    for param in parameters {
        match supplied.get(&param.name) {
            Some(value) => {
                if !param.type_matches(value) {
                    diagnostics.push(FieldDiagnostic {
                        field: param.name.clone(),
                        problem: format!("must be {:?}", param.param_type).to_lowercase(),
                    });
                    continue;
                }
                if let (Some(allowed), Some(s)) = (&param.allowed, value.as_str()) {
                    if !allowed.iter().any(|a| a == s) {
                        diagnostics.push(FieldDiagnostic {
                            field: param.name.clone(),
                            problem: format!("must be one of {allowed:?}"),
                        });
                        continue;
                    }
                }
                validated.insert(param.name.clone(), value.clone());
            }
            None if param.required => {
                diagnostics.push(FieldDiagnostic {
                    field: param.name.clone(),
                    problem: "missing required parameter".to_string(),
                });
            }
            None => {
                if let Some(default) = &param.default {
                    validated.insert(param.name.clone(), default.clone());
                }
            }
        }
    }

    if diagnostics.is_empty() {
        Ok(validated)
    } else {
        Err(Error::InvalidArgs(diagnostics))
    }
}
