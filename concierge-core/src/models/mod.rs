pub mod context;
pub mod session;
pub mod tool;

pub use context::{keys, Context, ToolCallMeta, Turn, TurnRole, TOOL_USAGE_CAP};
pub use session::{is_valid_session_id, new_session_id, Role};
pub use tool::{ToolCall, ToolOutcome, ToolSpec, ToolUsage};
