use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::TagLookupError;

/// Tag key stamped on every resource this server creates.
pub const OWNERSHIP_TAG_KEY: &str = "mcp_server_version";

/// Value stamped on newly created resources.
pub const OWNERSHIP_TAG_VALUE: &str = env!("CARGO_PKG_VERSION");

/// The ownership marker found on (or written to) a cloud resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OwnershipTag {
    pub key: String,
    pub value: String,
}

impl OwnershipTag {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            key: OWNERSHIP_TAG_KEY.to_string(),
            value: value.into(),
        }
    }

    /// The tag this build stamps on resources it creates.
    pub fn current() -> Self {
        Self::new(OWNERSHIP_TAG_VALUE)
    }
}

/// Outcome of looking for the ownership marker on a resource that exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagLookup {
    Present(OwnershipTag),
    Absent,
}

impl TagLookup {
    /// Picks the ownership marker out of an arbitrary tag set.
    pub fn from_tags<I, K, V>(tags: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        tags.into_iter()
            .find(|(key, _)| key.as_ref() == OWNERSHIP_TAG_KEY)
            .map(|(_, value)| Self::Present(OwnershipTag::new(value)))
            .unwrap_or(Self::Absent)
    }

    pub fn tag(&self) -> Option<&OwnershipTag> {
        match self {
            Self::Present(tag) => Some(tag),
            Self::Absent => None,
        }
    }
}

/// Decides which marker values count as "created by us".
///
/// With no accepted versions configured, any non-empty value is recognized.
/// A present-but-empty value is never recognized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OwnershipMarker {
    stamp: OwnershipTag,
    accepted_versions: Vec<String>,
}

impl OwnershipMarker {
    pub fn new(accepted_versions: Vec<String>) -> Self {
        Self {
            stamp: OwnershipTag::current(),
            accepted_versions,
        }
    }

    pub fn stamp(&self) -> &OwnershipTag {
        &self.stamp
    }

    pub fn accepted_versions(&self) -> &[String] {
        &self.accepted_versions
    }

    pub fn recognizes(&self, lookup: &TagLookup) -> bool {
        let Some(tag) = lookup.tag() else {
            return false;
        };
        if tag.key != OWNERSHIP_TAG_KEY || tag.value.trim().is_empty() {
            return false;
        }
        self.accepted_versions.is_empty() || self.accepted_versions.iter().any(|v| *v == tag.value)
    }
}

impl Default for OwnershipMarker {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

/// Reads the ownership marker of an existing resource from the cloud provider.
///
/// One read-only remote call per invocation. Implementations must not retry
/// and must not cache across calls.
#[async_trait]
pub trait TagInspector: Send + Sync {
    async fn fetch_ownership_tag(&self, resource_id: &str) -> Result<TagLookup, TagLookupError>;
}

#[async_trait]
impl<T: TagInspector + ?Sized> TagInspector for Arc<T> {
    async fn fetch_ownership_tag(&self, resource_id: &str) -> Result<TagLookup, TagLookupError> {
        (**self).fetch_ownership_tag(resource_id).await
    }
}
