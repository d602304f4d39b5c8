//! Access authority boundary
//!
//! `AccessGate` asks the configured authority and records ACCESS_DENIED on
//! every denial. Allowed checks leave no audit trace.

use crate::audit::{Auditor, EventDetail, EventType, NewEvent};
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccessVerdict {
    Allowed,
    Denied,
}

/// Decides whether a principal may exercise a permission on a resource
#[async_trait]
pub trait AccessAuthority: Send + Sync {
    async fn check(&self, principal: &str, resource: &str, permission: &str) -> Result<AccessVerdict>;

    fn name(&self) -> &str;
}

/// One grant. `*` matches anything; a trailing `/*` on `resource` matches
/// everything under that prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessGrant {
    pub principal: String,
    pub resource: String,
    pub permission: String,
}

impl AccessGrant {
    pub fn new(principal: &str, resource: &str, permission: &str) -> Self {
        Self {
            principal: principal.to_string(),
            resource: resource.to_string(),
            permission: permission.to_string(),
        }
    }

    fn covers(&self, principal: &str, resource: &str, permission: &str) -> bool {
        let resource_ok = match self.resource.strip_suffix("/*") {
            Some(prefix) => resource
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with('/')),
            None => self.resource == "*" || self.resource == resource,
        };
        (self.principal == "*" || self.principal == principal)
            && (self.permission == "*" || self.permission == permission)
            && resource_ok
    }
}

/// In-memory grant table; everything not granted is denied
#[derive(Debug, Clone, Default)]
pub struct StaticAccessAuthority {
    grants: Vec<AccessGrant>,
}

impl StaticAccessAuthority {
    pub fn new(grants: Vec<AccessGrant>) -> Self {
        Self { grants }
    }
}

#[async_trait]
impl AccessAuthority for StaticAccessAuthority {
    async fn check(&self, principal: &str, resource: &str, permission: &str) -> Result<AccessVerdict> {
        if self
            .grants
            .iter()
            .any(|g| g.covers(principal, resource, permission))
        {
            Ok(AccessVerdict::Allowed)
        } else {
            Ok(AccessVerdict::Denied)
        }
    }

    fn name(&self) -> &str {
        "static"
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessDecision {
    pub verdict: AccessVerdict,
    #[serde(skip)]
    pub audit_ok: bool,
}

/// Front for the authority that records denials
#[derive(Clone)]
pub struct AccessGate {
    authority: std::sync::Arc<dyn AccessAuthority>,
    auditor: Auditor,
}

impl AccessGate {
    pub fn new(authority: std::sync::Arc<dyn AccessAuthority>, auditor: Auditor) -> Self {
        Self { authority, auditor }
    }

    pub async fn authorize(&self, principal: &str, resource: &str, permission: &str) -> Result<AccessDecision> {
        let verdict = self.authority.check(principal, resource, permission).await?;
        if verdict == AccessVerdict::Allowed {
            return Ok(AccessDecision {
                verdict,
                audit_ok: true,
            });
        }

        tracing::warn!(
            principal,
            resource,
            permission,
            authority = self.authority.name(),
            "Access denied"
        );
        let audit_ok = self
            .auditor
            .emit(vec![NewEvent::new(
                EventType::AccessDenied,
                principal,
                EventDetail::Access {
                    principal: principal.to_string(),
                    resource: resource.to_string(),
                    permission: permission.to_string(),
                },
            )])
            .await;

        Ok(AccessDecision { verdict, audit_ok })
    }
}
