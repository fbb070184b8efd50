//! Structured audit events, emitted on the `audit` tracing target.
//!
//! A check that could not be evaluated is reported as an outage, never as a
//! denial, so audit trails keep infrastructure failures apart from real
//! access decisions.

use crate::error::Error;
use crate::types::{ActionId, ObjectId, SubjectId, TenantId};

/// Kind of policy mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MutationKind {
    Grant,
    Revoke,
    GrantRole,
    RevokeRole,
}

impl MutationKind {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Grant => "policy_grant",
            Self::Revoke => "policy_revoke",
            Self::GrantRole => "role_grant",
            Self::RevokeRole => "role_revoke",
        }
    }
}

pub(crate) fn audit_mutation(
    kind: MutationKind,
    tenant: &TenantId,
    subject: &SubjectId,
    resource: &str,
    changed: bool,
) {
    tracing::info!(
        target: "audit",
        event = kind.as_str(),
        tenant = %tenant,
        subject = %subject,
        resource = resource,
        changed = changed,
        "policy mutation applied"
    );
}

pub(crate) fn audit_mutation_failed(
    kind: MutationKind,
    tenant: &TenantId,
    subject: &SubjectId,
    error: &Error,
) {
    tracing::warn!(
        target: "audit",
        event = kind.as_str(),
        tenant = %tenant,
        subject = %subject,
        error = %error,
        "policy mutation failed"
    );
}

pub(crate) fn audit_check_unavailable(
    tenant: &TenantId,
    subject: &SubjectId,
    object: &ObjectId,
    action: &ActionId,
    error: &Error,
) {
    tracing::warn!(
        target: "audit",
        event = "check_unavailable",
        tenant = %tenant,
        subject = %subject,
        object = %object,
        action = %action,
        reason = "service temporarily unavailable",
        error = %error,
        "authorization check could not be evaluated"
    );
}
