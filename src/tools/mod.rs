//! 工具层：参数与调用描述、注册表、网关（超时 + 审计）、内置工具与子智能体委派工具

pub mod args;
pub mod echo;
pub mod filesystem;
pub mod gateway;
pub mod registry;
pub mod schema;
pub mod spawn_agent;

pub use args::{ToolArgs, ToolInvocation};
pub use echo::EchoTool;
pub use filesystem::{ListDirTool, ReadFileTool, SafeFs};
pub use gateway::ToolGateway;
pub use registry::{Tool, ToolError, ToolRegistry, ToolResult, ToolSpec};
pub use schema::parameters_schema_for;
pub use spawn_agent::{SpawnAgentTool, SpawnAgentsTool};
