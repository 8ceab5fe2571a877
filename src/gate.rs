use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::TagLookupError;
use crate::mode::{ServerConfig, ServerMode};
use crate::tags::{OwnershipMarker, OwnershipTag, TagInspector};

/// What a tool call does to the resource it targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
    RebootOrRestart,
    Read,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::RebootOrRestart => "reboot_or_restart",
            Self::Read => "read",
        }
    }

    /// Operations that act on an existing resource and need an ownership check.
    pub fn targets_existing_resource(self) -> bool {
        matches!(self, Self::Update | Self::Delete | Self::RebootOrRestart)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The operation under evaluation. Built per call, never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationRequest {
    pub operation: OperationKind,
    pub resource_id: Option<String>,
}

impl MutationRequest {
    pub fn new(operation: OperationKind, resource_id: Option<String>) -> Self {
        Self { operation, resource_id }
    }

    pub fn read() -> Self {
        Self::new(OperationKind::Read, None)
    }

    pub fn create() -> Self {
        Self::new(OperationKind::Create, None)
    }

    pub fn on_resource(operation: OperationKind, resource_id: impl Into<String>) -> Self {
        Self::new(operation, Some(resource_id.into()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    ServerReadOnly,
    CreationDisabled,
    ResourceNotOwned,
    TagLookupFailed,
    ResourceNotFound,
}

impl DenyReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ServerReadOnly => "server_read_only",
            Self::CreationDisabled => "creation_disabled",
            Self::ResourceNotOwned => "resource_not_owned",
            Self::TagLookupFailed => "tag_lookup_failed",
            Self::ResourceNotFound => "resource_not_found",
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            Self::ServerReadOnly => {
                "The server is running in read-only mode; restart it with --allow-writes to modify resources."
            }
            Self::CreationDisabled => {
                "Resource creation is disabled; restart the server with --allow-resource-creation to create resources."
            }
            Self::ResourceNotOwned => {
                "The resource was not created by this server (missing or unrecognized mcp_server_version tag) and will not be modified."
            }
            Self::TagLookupFailed => {
                "The ownership tags of the resource could not be read, so the operation was refused. Retrying the call may succeed."
            }
            Self::ResourceNotFound => "The resource does not exist.",
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Attached to a create permission: the handler must put this tag on the new resource.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use = "a created resource without the ownership tag can never be modified again"]
pub struct TagObligation {
    tag: OwnershipTag,
}

impl TagObligation {
    pub fn tag(&self) -> &OwnershipTag {
        &self.tag
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Allow,
    AllowCreate(TagObligation),
    Deny(DenyReason),
}

impl GateDecision {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Self::Deny(_))
    }

    pub fn deny_reason(&self) -> Option<DenyReason> {
        match self {
            Self::Deny(reason) => Some(*reason),
            _ => None,
        }
    }
}

/// A single allow/deny predicate guarding every state-changing tool call.
#[async_trait]
pub trait OwnershipGate: Send + Sync {
    fn mode(&self) -> ServerMode;

    async fn authorize(&self, request: &MutationRequest) -> GateDecision;
}

/// Mode check first, then one ownership-tag lookup for operations on existing resources.
pub struct MutationGate<I> {
    mode: ServerMode,
    marker: OwnershipMarker,
    tag_timeout: Option<Duration>,
    inspector: I,
}

impl<I: TagInspector> MutationGate<I> {
    pub fn new(config: &ServerConfig, inspector: I) -> Self {
        Self {
            mode: config.mode,
            marker: config.marker.clone(),
            tag_timeout: config.tag_timeout,
            inspector,
        }
    }

    /// Same as `authorize`, but gives up with `TagLookupFailed` once `cancel` resolves.
    pub async fn authorize_until<C>(&self, request: &MutationRequest, cancel: C) -> GateDecision
    where
        C: Future<Output = ()> + Send,
    {
        let decision = match self.decide_locally(request) {
            Some(decision) => decision,
            None => self.check_ownership(request.resource_id.as_deref(), cancel).await,
        };

        match &decision {
            GateDecision::Deny(reason) => tracing::info!(
                operation = %request.operation,
                resource = request.resource_id.as_deref().unwrap_or("-"),
                mode = %self.mode,
                reason = %reason,
                "mutation denied"
            ),
            _ => tracing::debug!(
                operation = %request.operation,
                resource = request.resource_id.as_deref().unwrap_or("-"),
                "mutation allowed"
            ),
        }
        decision
    }

    /// Everything that can be decided without a remote call.
    fn decide_locally(&self, request: &MutationRequest) -> Option<GateDecision> {
        match request.operation {
            OperationKind::Read => Some(GateDecision::Allow),
            _ if self.mode == ServerMode::ReadOnly => Some(GateDecision::Deny(DenyReason::ServerReadOnly)),
            OperationKind::Create if self.mode.allows_creation() => Some(GateDecision::AllowCreate(TagObligation {
                tag: self.marker.stamp().clone(),
            })),
            OperationKind::Create => Some(GateDecision::Deny(DenyReason::CreationDisabled)),
            _ => None,
        }
    }

    async fn check_ownership<C>(&self, resource_id: Option<&str>, cancel: C) -> GateDecision
    where
        C: Future<Output = ()> + Send,
    {
        let Some(resource_id) = resource_id else {
            return GateDecision::Deny(DenyReason::ResourceNotOwned);
        };

        let lookup = async {
            let fetch = self.inspector.fetch_ownership_tag(resource_id);
            match self.tag_timeout {
                Some(limit) => tokio::time::timeout(limit, fetch).await.unwrap_or_else(|_| {
                    Err(TagLookupError::Failed {
                        resource: resource_id.to_string(),
                        message: format!("timed out after {}s", limit.as_secs_f64()),
                    })
                }),
                None => fetch.await,
            }
        };

        let outcome = tokio::select! {
            biased;
            _ = cancel => Err(TagLookupError::Cancelled(resource_id.to_string())),
            outcome = lookup => outcome,
        };

        match outcome {
            Ok(lookup) if self.marker.recognizes(&lookup) => GateDecision::Allow,
            Ok(_) => GateDecision::Deny(DenyReason::ResourceNotOwned),
            Err(TagLookupError::ResourceNotFound(_)) => GateDecision::Deny(DenyReason::ResourceNotFound),
            Err(e) => {
                tracing::warn!("{}", e);
                GateDecision::Deny(DenyReason::TagLookupFailed)
            }
        }
    }
}

#[async_trait]
impl<I: TagInspector> OwnershipGate for MutationGate<I> {
    fn mode(&self) -> ServerMode {
        self.mode
    }

    async fn authorize(&self, request: &MutationRequest) -> GateDecision {
        self.authorize_until(request, std::future::pending()).await
    }
}
