use std::collections::{HashMap, HashSet, VecDeque};

use crate::tuple::{GroupingTuple, PermissionTuple, Policies};
use crate::types::{ActionId, ObjectId, SubjectId, TenantId};

/// In-memory policy view of exactly one tenant.
///
/// Holds direct grants indexed by subject and a membership graph with edges
/// pointing from member to role. The graph may contain cycles.
#[derive(Debug, Clone)]
pub struct TenantPolicySet {
    tenant: TenantId,
    grants: HashMap<SubjectId, HashMap<ObjectId, HashSet<ActionId>>>,
    roles: HashMap<SubjectId, HashSet<SubjectId>>,
    permission_count: usize,
    grouping_count: usize,
}

impl TenantPolicySet {
    /// Creates an empty set for `tenant`.
    pub fn new(tenant: TenantId) -> Self {
        Self {
            tenant,
            grants: HashMap::new(),
            roles: HashMap::new(),
            permission_count: 0,
            grouping_count: 0,
        }
    }

    /// Builds a set from loaded tuples. Tuples of any other tenant are dropped.
    pub fn from_policies(tenant: TenantId, policies: Policies) -> Self {
        let mut set = Self::new(tenant);
        let mut foreign = 0usize;
        for tuple in policies.permissions {
            if tuple.tenant == set.tenant {
                set.add_permission(tuple.subject, tuple.object, tuple.action);
            } else {
                foreign += 1;
            }
        }
        for tuple in policies.groupings {
            if tuple.tenant == set.tenant {
                set.add_grouping(tuple.subject, tuple.role);
            } else {
                foreign += 1;
            }
        }
        if foreign > 0 {
            tracing::warn!(
                tenant = %set.tenant,
                foreign,
                "dropped tuples belonging to other tenants"
            );
        }
        set
    }

    /// Tenant this set belongs to.
    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    /// Returns whether `subject`, directly or through any role reachable from
    /// it, holds `action` on `object`.
    ///
    /// Runs a breadth-first walk over the membership graph visiting each
    /// subject at most once, so cycles terminate and the cost is linear in the
    /// size of the reachable graph.
    pub fn check(&self, subject: &SubjectId, object: &ObjectId, action: &ActionId) -> bool {
        self.walk_closure(subject, |node| self.has_direct(node, object, action))
    }

    /// Every role reachable from `subject`, excluding `subject` itself, in
    /// breadth-first order.
    pub fn implicit_roles(&self, subject: &SubjectId) -> Vec<SubjectId> {
        let mut roles = Vec::new();
        self.walk_closure(subject, |node| {
            if node != subject {
                roles.push(node.clone());
            }
            false
        });
        roles
    }

    /// Every `(object, action)` pair `subject` holds directly or through roles.
    pub fn implicit_permissions(&self, subject: &SubjectId) -> Vec<(ObjectId, ActionId)> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        self.walk_closure(subject, |node| {
            for (object, actions) in self.grants.get(node).into_iter().flatten() {
                for action in actions {
                    if seen.insert((object, action)) {
                        out.push((object.clone(), action.clone()));
                    }
                }
            }
            false
        });
        out
    }

    /// Returns whether the exact grant exists, ignoring roles.
    pub fn has_permission(&self, subject: &SubjectId, object: &ObjectId, action: &ActionId) -> bool {
        self.has_direct(subject, object, action)
    }

    /// Returns whether the exact membership edge exists.
    pub fn has_grouping(&self, subject: &SubjectId, role: &SubjectId) -> bool {
        self.roles
            .get(subject)
            .is_some_and(|roles| roles.contains(role))
    }

    /// Inserts a grant. Returns `false` if it was already present.
    pub fn add_permission(&mut self, subject: SubjectId, object: ObjectId, action: ActionId) -> bool {
        let added = self
            .grants
            .entry(subject)
            .or_default()
            .entry(object)
            .or_default()
            .insert(action);
        if added {
            self.permission_count += 1;
        }
        added
    }

    /// Removes a grant. Returns `false` if it was absent.
    pub fn remove_permission(
        &mut self,
        subject: &SubjectId,
        object: &ObjectId,
        action: &ActionId,
    ) -> bool {
        let Some(objects) = self.grants.get_mut(subject) else {
            return false;
        };
        let Some(actions) = objects.get_mut(object) else {
            return false;
        };
        if !actions.remove(action) {
            return false;
        }
        if actions.is_empty() {
            objects.remove(object);
        }
        if objects.is_empty() {
            self.grants.remove(subject);
        }
        self.permission_count -= 1;
        true
    }

    /// Inserts a membership edge. Returns `false` if it was already present.
    pub fn add_grouping(&mut self, subject: SubjectId, role: SubjectId) -> bool {
        let added = self.roles.entry(subject).or_default().insert(role);
        if added {
            self.grouping_count += 1;
        }
        added
    }

    /// Removes a membership edge. Returns `false` if it was absent.
    pub fn remove_grouping(&mut self, subject: &SubjectId, role: &SubjectId) -> bool {
        let Some(roles) = self.roles.get_mut(subject) else {
            return false;
        };
        if !roles.remove(role) {
            return false;
        }
        if roles.is_empty() {
            self.roles.remove(subject);
        }
        self.grouping_count -= 1;
        true
    }

    /// Number of grant tuples.
    pub fn permission_count(&self) -> usize {
        self.permission_count
    }

    /// Number of membership tuples.
    pub fn grouping_count(&self) -> usize {
        self.grouping_count
    }

    /// Materializes the set back into tuples, e.g. for persisting.
    pub fn to_policies(&self) -> Policies {
        let mut policies = Policies::new();
        for (subject, objects) in &self.grants {
            for (object, actions) in objects {
                for action in actions {
                    policies.permissions.insert(PermissionTuple::new(
                        self.tenant.clone(),
                        subject.clone(),
                        object.clone(),
                        action.clone(),
                    ));
                }
            }
        }
        for (subject, roles) in &self.roles {
            for role in roles {
                policies.groupings.insert(GroupingTuple::new(
                    self.tenant.clone(),
                    subject.clone(),
                    role.clone(),
                ));
            }
        }
        policies
    }

    fn has_direct(&self, subject: &SubjectId, object: &ObjectId, action: &ActionId) -> bool {
        self.grants
            .get(subject)
            .and_then(|objects| objects.get(object))
            .is_some_and(|actions| actions.contains(action))
    }

    /// Visits the reflexive-transitive closure of `subject` until `visit`
    /// returns `true`. Returns whether the walk was stopped early.
    fn walk_closure<'a>(
        &'a self,
        subject: &'a SubjectId,
        mut visit: impl FnMut(&'a SubjectId) -> bool,
    ) -> bool {
        let mut visited: HashSet<&SubjectId> = HashSet::new();
        let mut queue: VecDeque<&SubjectId> = VecDeque::new();
        visited.insert(subject);
        queue.push_back(subject);

        while let Some(current) = queue.pop_front() {
            if visit(current) {
                return true;
            }
            for role in self.roles.get(current).into_iter().flatten() {
                if visited.insert(role) {
                    queue.push_back(role);
                }
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant() -> TenantId {
        TenantId::new("t1").unwrap()
    }

    fn subject(value: &str) -> SubjectId {
        SubjectId::new(value).unwrap()
    }

    fn object(value: &str) -> ObjectId {
        ObjectId::new(value).unwrap()
    }

    fn action(value: &str) -> ActionId {
        ActionId::new(value).unwrap()
    }

    #[test]
    fn check_should_match_exact_direct_grant() {
        let mut set = TenantPolicySet::new(tenant());
        set.add_permission(subject("bob"), object("file"), action("write"));

        assert!(set.check(&subject("bob"), &object("file"), &action("write")));
        assert!(!set.check(&subject("bob"), &object("file"), &action("read")));
        assert!(!set.check(&subject("bob"), &object("other"), &action("write")));
    }

    #[test]
    fn check_should_follow_role_chain() {
        let mut set = TenantPolicySet::new(tenant());
        set.add_grouping(subject("alice"), subject("editor"));
        set.add_grouping(subject("editor"), subject("admin"));
        set.add_permission(subject("admin"), object("doc1"), action("read"));

        assert!(set.check(&subject("alice"), &object("doc1"), &action("read")));
        assert!(set.check(&subject("editor"), &object("doc1"), &action("read")));
        // Edges point from member to role, never the other way.
        set.add_permission(subject("alice"), object("doc2"), action("read"));
        assert!(!set.check(&subject("admin"), &object("doc2"), &action("read")));
    }

    #[test]
    fn check_should_terminate_on_cycles() {
        let mut set = TenantPolicySet::new(tenant());
        set.add_grouping(subject("a"), subject("b"));
        set.add_grouping(subject("b"), subject("a"));
        set.add_grouping(subject("c"), subject("c"));
        set.add_permission(subject("a"), object("doc_a"), action("read"));
        set.add_permission(subject("b"), object("doc_b"), action("read"));

        assert!(set.check(&subject("a"), &object("doc_b"), &action("read")));
        assert!(set.check(&subject("b"), &object("doc_a"), &action("read")));
        assert!(!set.check(&subject("a"), &object("doc_c"), &action("read")));
        assert!(!set.check(&subject("c"), &object("doc_a"), &action("read")));
    }

    #[test]
    fn add_and_remove_should_be_idempotent() {
        let mut set = TenantPolicySet::new(tenant());

        assert!(set.add_permission(subject("bob"), object("file"), action("write")));
        assert!(!set.add_permission(subject("bob"), object("file"), action("write")));
        assert_eq!(set.permission_count(), 1);

        assert!(set.remove_permission(&subject("bob"), &object("file"), &action("write")));
        assert!(!set.remove_permission(&subject("bob"), &object("file"), &action("write")));
        assert_eq!(set.permission_count(), 0);

        assert!(set.add_grouping(subject("bob"), subject("admin")));
        assert!(!set.add_grouping(subject("bob"), subject("admin")));
        assert!(set.remove_grouping(&subject("bob"), &subject("admin")));
        assert!(!set.remove_grouping(&subject("bob"), &subject("admin")));
        assert_eq!(set.grouping_count(), 0);
        assert!(set.to_policies().is_empty());
    }

    #[test]
    fn removing_edge_should_keep_direct_grants() {
        let mut set = TenantPolicySet::new(tenant());
        set.add_grouping(subject("alice"), subject("admin"));
        set.add_permission(subject("admin"), object("doc1"), action("read"));
        set.add_permission(subject("alice"), object("doc2"), action("write"));

        set.remove_grouping(&subject("alice"), &subject("admin"));

        assert!(!set.check(&subject("alice"), &object("doc1"), &action("read")));
        assert!(set.check(&subject("alice"), &object("doc2"), &action("write")));
    }

    #[test]
    fn from_policies_should_drop_foreign_tuples() {
        let mut policies = Policies::new();
        policies
            .permissions
            .insert(PermissionTuple::parse("t1", "alice", "doc1", "read").unwrap());
        policies
            .permissions
            .insert(PermissionTuple::parse("t2", "alice", "doc2", "read").unwrap());
        policies
            .groupings
            .insert(GroupingTuple::parse("t2", "alice", "admin").unwrap());

        let set = TenantPolicySet::from_policies(tenant(), policies);

        assert_eq!(set.permission_count(), 1);
        assert_eq!(set.grouping_count(), 0);
        assert!(!set.check(&subject("alice"), &object("doc2"), &action("read")));
        assert!(set.to_policies().permissions.iter().all(|t| t.tenant == tenant()));
    }

    #[test]
    fn implicit_roles_and_permissions_should_cover_closure() {
        let mut set = TenantPolicySet::new(tenant());
        set.add_grouping(subject("alice"), subject("editor"));
        set.add_grouping(subject("editor"), subject("admin"));
        set.add_grouping(subject("admin"), subject("editor"));
        set.add_permission(subject("alice"), object("doc1"), action("read"));
        set.add_permission(subject("editor"), object("doc1"), action("read"));
        set.add_permission(subject("admin"), object("doc2"), action("publish"));

        let mut roles = set.implicit_roles(&subject("alice"));
        roles.sort();
        assert_eq!(roles, vec![subject("admin"), subject("editor")]);

        let mut perms = set.implicit_permissions(&subject("alice"));
        perms.sort();
        assert_eq!(
            perms,
            vec![
                (object("doc1"), action("read")),
                (object("doc2"), action("publish")),
            ]
        );
    }

    #[test]
    fn to_policies_should_round_trip_through_from_policies() {
        let mut set = TenantPolicySet::new(tenant());
        set.add_grouping(subject("alice"), subject("admin"));
        set.add_permission(subject("admin"), object("doc1"), action("read"));

        let rebuilt = TenantPolicySet::from_policies(tenant(), set.to_policies());

        assert_eq!(rebuilt.to_policies(), set.to_policies());
        assert!(rebuilt.check(&subject("alice"), &object("doc1"), &action("read")));
    }
}
