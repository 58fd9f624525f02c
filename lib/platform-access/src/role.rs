//! Realm roles and the local groups that mirror them.
//!
//! Each realm role observed at login is mirrored as a local group named
//! `{prefix}{role}` (default prefix `kc:`). The prefix keeps mirrored groups
//! apart from groups managed by other means, and makes the mapping
//! deterministic: the same role always lands in the same group.

use keygate_core::GroupId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Default prefix for groups mirroring realm roles.
pub const DEFAULT_GROUP_PREFIX: &str = "kc:";

/// Returns the name of the group mirroring `role`.
#[must_use]
pub fn mirror_group_name(prefix: &str, role: &str) -> String {
    format!("{prefix}{role}")
}

/// Set of role names carried by a token.
///
/// Duplicates collapse; iteration is in name order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleSet {
    roles: BTreeSet<String>,
}

impl RoleSet {
    /// Returns true if `role` is a member. Matching is exact.
    #[must_use]
    pub fn contains(&self, role: &str) -> bool {
        self.roles.contains(role)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.roles.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.roles.iter().map(String::as_str)
    }

    /// Names of the groups mirroring these roles.
    #[must_use]
    pub fn group_names(&self, prefix: &str) -> BTreeSet<String> {
        self.roles
            .iter()
            .map(|role| mirror_group_name(prefix, role))
            .collect()
    }
}

impl<S: Into<String>> FromIterator<S> for RoleSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self {
            roles: iter.into_iter().map(Into::into).collect(),
        }
    }
}

/// A local group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Group {
    id: GroupId,
    name: String,
}

impl Group {
    /// Creates a group with a fresh ID.
    #[must_use]
    pub fn new(name: String) -> Self {
        Self {
            id: GroupId::new(),
            name,
        }
    }

    /// Reconstitutes a group from storage.
    #[must_use]
    pub fn with_id(id: GroupId, name: String) -> Self {
        Self { id, name }
    }

    #[must_use]
    pub fn id(&self) -> GroupId {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}
