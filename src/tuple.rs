use crate::error::Result;
use crate::types::{ActionId, ObjectId, SubjectId, TenantId};
use std::collections::HashSet;

/// Direct grant: `subject` may perform `action` on `object` within `tenant`.
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PermissionTuple {
    pub tenant: TenantId,
    pub subject: SubjectId,
    pub object: ObjectId,
    pub action: ActionId,
}

impl PermissionTuple {
    /// Creates a tuple from already validated identifiers.
    pub fn new(tenant: TenantId, subject: SubjectId, object: ObjectId, action: ActionId) -> Self {
        Self {
            tenant,
            subject,
            object,
            action,
        }
    }

    /// Parses and validates every field.
    pub fn parse(tenant: &str, subject: &str, object: &str, action: &str) -> Result<Self> {
        Ok(Self::new(
            TenantId::new(tenant)?,
            SubjectId::new(subject)?,
            ObjectId::new(object)?,
            ActionId::new(action)?,
        ))
    }
}

/// Role membership: `subject` is a member of `role` within `tenant`.
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GroupingTuple {
    pub tenant: TenantId,
    pub subject: SubjectId,
    pub role: SubjectId,
}

impl GroupingTuple {
    /// Creates a tuple from already validated identifiers.
    pub fn new(tenant: TenantId, subject: SubjectId, role: SubjectId) -> Self {
        Self {
            tenant,
            subject,
            role,
        }
    }

    /// Parses and validates every field.
    pub fn parse(tenant: &str, subject: &str, role: &str) -> Result<Self> {
        Ok(Self::new(
            TenantId::new(tenant)?,
            SubjectId::new(subject)?,
            SubjectId::new(role)?,
        ))
    }
}

/// A set of permission and grouping tuples, as exchanged with a store.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Policies {
    pub permissions: HashSet<PermissionTuple>,
    pub groupings: HashSet<GroupingTuple>,
}

impl Policies {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the tuples that belong to `tenant`.
    pub fn for_tenant(&self, tenant: &TenantId) -> Policies {
        Policies {
            permissions: self
                .permissions
                .iter()
                .filter(|tuple| &tuple.tenant == tenant)
                .cloned()
                .collect(),
            groupings: self
                .groupings
                .iter()
                .filter(|tuple| &tuple.tenant == tenant)
                .cloned()
                .collect(),
        }
    }

    /// Replaces every tuple of `tenant` with the tuples of `replacement` that
    /// belong to `tenant`. Tuples of other tenants are left alone.
    pub fn replace_tenant(&mut self, tenant: &TenantId, replacement: &Policies) {
        self.permissions.retain(|tuple| &tuple.tenant != tenant);
        self.groupings.retain(|tuple| &tuple.tenant != tenant);
        self.permissions.extend(
            replacement
                .permissions
                .iter()
                .filter(|tuple| &tuple.tenant == tenant)
                .cloned(),
        );
        self.groupings.extend(
            replacement
                .groupings
                .iter()
                .filter(|tuple| &tuple.tenant == tenant)
                .cloned(),
        );
    }

    /// Total number of tuples.
    pub fn len(&self) -> usize {
        self.permissions.len() + self.groupings.len()
    }

    /// Returns whether there are no tuples at all.
    pub fn is_empty(&self) -> bool {
        self.permissions.is_empty() && self.groupings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Policies {
        let mut policies = Policies::new();
        policies
            .permissions
            .insert(PermissionTuple::parse("t1", "alice", "doc1", "read").unwrap());
        policies
            .permissions
            .insert(PermissionTuple::parse("t2", "alice", "doc1", "read").unwrap());
        policies
            .groupings
            .insert(GroupingTuple::parse("t1", "alice", "admin").unwrap());
        policies
    }

    #[test]
    fn parse_should_reject_empty_fields() {
        assert!(PermissionTuple::parse("t1", "", "doc1", "read").is_err());
        assert!(GroupingTuple::parse("t1", "alice", " ").is_err());
    }

    #[test]
    fn for_tenant_should_keep_only_that_tenant() {
        let tenant = TenantId::new("t1").unwrap();
        let filtered = sample().for_tenant(&tenant);

        assert_eq!(filtered.permissions.len(), 1);
        assert_eq!(filtered.groupings.len(), 1);
        assert!(filtered.permissions.iter().all(|t| t.tenant == tenant));
    }

    #[test]
    fn replace_tenant_should_leave_other_tenants_untouched() {
        let tenant = TenantId::new("t1").unwrap();
        let mut policies = sample();
        let mut replacement = Policies::new();
        replacement
            .permissions
            .insert(PermissionTuple::parse("t1", "bob", "file", "write").unwrap());
        // Foreign tuples in the replacement are ignored.
        replacement
            .permissions
            .insert(PermissionTuple::parse("t3", "eve", "file", "write").unwrap());

        policies.replace_tenant(&tenant, &replacement);

        assert_eq!(policies.permissions.len(), 2);
        assert!(policies.groupings.is_empty());
        assert!(
            policies
                .permissions
                .contains(&PermissionTuple::parse("t2", "alice", "doc1", "read").unwrap())
        );
        assert!(
            policies
                .permissions
                .contains(&PermissionTuple::parse("t1", "bob", "file", "write").unwrap())
        );
    }

    #[cfg(feature = "serde")]
    #[test]
    fn deserialized_tuple_should_reject_empty_subject() {
        let ok: PermissionTuple = serde_json::from_str(
            r#"{"tenant":"t1","subject":"bob","object":"file","action":"write"}"#,
        )
        .unwrap();
        assert_eq!(ok, PermissionTuple::parse("t1", "bob", "file", "write").unwrap());

        let err = serde_json::from_str::<GroupingTuple>(
            r#"{"tenant":"t1","subject":"","role":"admin"}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("invalid tuple"));
    }
}
