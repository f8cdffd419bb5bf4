//! Per-request access grants.
//!
//! Authentication happens upstream. The permission layer forwards its verdict
//! in request headers, and an [`AccessPolicy`] turns those into a grant. Grants
//! are never stored; each connection or request gets a fresh one.

use async_trait::async_trait;
use tandem_protocol::headers::parse_can_edit;

/// Raw access inputs taken from a request.
#[derive(Debug, Clone, Copy, Default)]
pub struct AccessRequest<'a> {
    /// Room the request targets.
    pub room: &'a str,
    /// Value of the edit permission header.
    pub can_edit: Option<&'a str>,
    /// Value of the user identity header.
    pub user_id: Option<&'a str>,
}

/// The access decision for one connection or request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessGrant {
    /// Whether mutations are applied.
    pub can_edit: bool,
    /// Authenticated user, if known.
    pub user_id: Option<String>,
    /// Room the grant applies to.
    pub room: String,
}

impl AccessGrant {
    /// Create a grant.
    #[must_use]
    pub fn new(room: impl Into<String>, can_edit: bool, user_id: Option<String>) -> Self {
        Self {
            can_edit,
            user_id,
            room: room.into(),
        }
    }

    /// A read-only grant for `room`.
    #[must_use]
    pub fn read_only(room: impl Into<String>) -> Self {
        Self::new(room, false, None)
    }

    /// An editing grant for `room`.
    #[must_use]
    pub fn editor(room: impl Into<String>) -> Self {
        Self::new(room, true, None)
    }

    /// Check if writes under this grant must be dropped.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        !self.can_edit
    }
}

/// Source of access grants.
#[async_trait]
pub trait AccessPolicy: Send + Sync {
    /// Decide access for a request.
    async fn grant(&self, request: AccessRequest<'_>) -> AccessGrant;
}

/// Policy that trusts the headers set by the upstream permission layer.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeaderAccessPolicy;

#[async_trait]
impl AccessPolicy for HeaderAccessPolicy {
    async fn grant(&self, request: AccessRequest<'_>) -> AccessGrant {
        AccessGrant::new(
            request.room,
            parse_can_edit(request.can_edit),
            request
                .user_id
                .filter(|u| !u.is_empty())
                .map(str::to_string),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_header_policy() {
        let grant = HeaderAccessPolicy
            .grant(AccessRequest {
                room: "doc-1",
                can_edit: Some("True"),
                user_id: Some("alice"),
            })
            .await;
        assert_eq!(grant, AccessGrant::new("doc-1", true, Some("alice".into())));
    }

    #[tokio::test]
    async fn test_header_policy_defaults_to_read_only() {
        let grant = HeaderAccessPolicy
            .grant(AccessRequest {
                room: "doc-1",
                can_edit: None,
                user_id: Some(""),
            })
            .await;
        assert!(grant.is_read_only());
        assert!(grant.user_id.is_none());
    }
}
