//! Tool registry, built-in tools, and recording

mod builtin;
mod record;
mod registry;

pub use builtin::{register_builtin_tools, register_coordinator_tools, BuiltinDeps};
pub use record::{Recorder, RecordingSummary};
pub use registry::{
    validate_args, HistoryFilter, InvocationOutcome, ParamType, PersistHook, ToolDescription,
    ToolInvocation, ToolParameter, ToolRegistry, ToolSpec,
};
