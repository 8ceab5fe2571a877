use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use clap::Args;
use serde::Serialize;

use crate::error::ConfigError;
use crate::tags::OwnershipMarker;

pub const READONLY_ENV: &str = "MCP_READONLY";
pub const ALLOW_WRITES_ENV: &str = "MCP_ALLOW_WRITES";
pub const ALLOW_RESOURCE_CREATION_ENV: &str = "MCP_ALLOW_RESOURCE_CREATION";

/// Process-wide permission level, fixed at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerMode {
    ReadOnly,
    AllowWrite,
    AllowCreate,
}

impl ServerMode {
    pub fn allows_writes(self) -> bool {
        matches!(self, Self::AllowWrite | Self::AllowCreate)
    }

    pub fn allows_creation(self) -> bool {
        self == Self::AllowCreate
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReadOnly => "read_only",
            Self::AllowWrite => "allow_write",
            Self::AllowCreate => "allow_write_and_create",
        }
    }
}

impl fmt::Display for ServerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Startup flags that decide the permission mode
#[derive(Debug, Clone, Default, Args)]
pub struct ModeFlags {
    /// Refuse every mutating operation (also MCP_READONLY)
    #[arg(long)]
    pub readonly: bool,

    /// Allow update, delete and restart of resources this server created (also MCP_ALLOW_WRITES)
    #[arg(long)]
    pub allow_writes: bool,

    /// Allow creating new resources; implies --allow-writes (also MCP_ALLOW_RESOURCE_CREATION)
    #[arg(long)]
    pub allow_resource_creation: bool,

    /// Only treat resources tagged with this mcp_server_version as owned (repeatable)
    #[arg(long = "accept-tag-version", value_name = "VERSION")]
    pub accept_tag_versions: Vec<String>,

    /// Upper bound for a single tag lookup; 0 leaves it to the AWS CLI
    #[arg(long, value_name = "SECS", default_value_t = 30)]
    pub tag_timeout_secs: u64,
}

/// Everything the gate and the handlers need from startup, built once in `main`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub mode: ServerMode,
    pub marker: OwnershipMarker,
    pub tag_timeout: Option<Duration>,
}

impl ServerConfig {
    pub fn from_startup(flags: &ModeFlags, env: &HashMap<String, String>) -> Result<Self, ConfigError> {
        Ok(Self {
            mode: resolve(flags, env)?,
            marker: OwnershipMarker::new(flags.accept_tag_versions.clone()),
            tag_timeout: (flags.tag_timeout_secs > 0).then(|| Duration::from_secs(flags.tag_timeout_secs)),
        })
    }

    pub fn with_mode(mode: ServerMode) -> Self {
        Self {
            mode,
            marker: OwnershipMarker::default(),
            tag_timeout: None,
        }
    }
}

/// Derives the effective mode from flags and an environment snapshot.
///
/// Each intent is the OR of its flag and its environment variable. Read-only
/// combined with any write intent is rejected rather than guessed at.
pub fn resolve(flags: &ModeFlags, env: &HashMap<String, String>) -> Result<ServerMode, ConfigError> {
    let readonly = flags.readonly || env_flag(env, READONLY_ENV)?;
    let allow_writes = flags.allow_writes || env_flag(env, ALLOW_WRITES_ENV)?;
    let allow_creation = flags.allow_resource_creation || env_flag(env, ALLOW_RESOURCE_CREATION_ENV)?;

    if readonly && allow_creation {
        return Err(ConfigError::Contradictory("--readonly", "--allow-resource-creation"));
    }
    if readonly && allow_writes {
        return Err(ConfigError::Contradictory("--readonly", "--allow-writes"));
    }

    Ok(if allow_creation {
        ServerMode::AllowCreate
    } else if allow_writes {
        ServerMode::AllowWrite
    } else {
        ServerMode::ReadOnly
    })
}

fn env_flag(env: &HashMap<String, String>, name: &'static str) -> Result<bool, ConfigError> {
    let Some(value) = env.get(name) else {
        return Ok(false);
    };
    match value.trim().to_ascii_lowercase().as_str() {
        "" | "0" | "false" | "no" | "off" => Ok(false),
        "1" | "true" | "yes" | "on" => Ok(true),
        _ => Err(ConfigError::InvalidEnv {
            name,
            value: value.clone(),
        }),
    }
}
