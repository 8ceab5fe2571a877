pub mod error;
pub mod gate;
pub mod mcp_server;
pub mod mode;
pub mod tags;
pub mod use_aws;

pub use error::{ConfigError, McpError, TagLookupError};
pub use gate::{DenyReason, GateDecision, MutationGate, MutationRequest, OperationKind, OwnershipGate, TagObligation};
pub use mcp_server::{AwsCliTagging, AwsMcpServer, TaggingBackend};
pub use mode::{ModeFlags, ServerConfig, ServerMode};
pub use tags::{OwnershipMarker, OwnershipTag, TagInspector, TagLookup};
pub use use_aws::{AwsCli, AwsCliTagInspector, AwsProcess, CliOutput, CommandRunner, UseAws, UseAwsRequest, UseAwsResponse};

/// Maximum size for tool response output
pub const MAX_TOOL_RESPONSE_SIZE: usize = 100_000;

/// Output kind for tool responses
#[derive(Debug, Clone)]
pub enum OutputKind {
    Text(String),
    Json(serde_json::Value),
}

impl Default for OutputKind {
    fn default() -> Self {
        Self::Text(String::new())
    }
}

/// Tool invocation output
#[derive(Debug, Default)]
pub struct InvokeOutput {
    pub output: OutputKind,
}
