//! Local user accounts.
//!
//! A `User` is the application's own record of someone who has logged in
//! through the identity provider. It is created on first login and its
//! profile and group memberships are synchronized from claims on every
//! later login. Users are never deleted here.

use chrono::{DateTime, Utc};
use keygate_core::UserId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::claims::ClaimSet;

/// A local user account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Internal user ID.
    id: UserId,
    /// Login name, resolved from claims when the user was created.
    username: String,
    email: Option<String>,
    first_name: Option<String>,
    last_name: Option<String>,
    /// Names of the groups the user belongs to.
    groups: BTreeSet<String>,
    /// When the user record was created.
    created_at: DateTime<Utc>,
    /// When the user record was last updated.
    updated_at: DateTime<Utc>,
}

impl User {
    /// Creates a new user with a generated ID.
    #[must_use]
    pub fn new(username: String) -> Self {
        let now = Utc::now();
        Self {
            id: UserId::new(),
            username,
            email: None,
            first_name: None,
            last_name: None,
            groups: BTreeSet::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Creates a user with all fields specified.
    ///
    /// Use this when reconstituting a user from storage.
    #[must_use]
    #[expect(clippy::too_many_arguments)]
    pub fn with_all_fields(
        id: UserId,
        username: String,
        email: Option<String>,
        first_name: Option<String>,
        last_name: Option<String>,
        groups: BTreeSet<String>,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            username,
            email,
            first_name,
            last_name,
            groups,
            created_at,
            updated_at,
        }
    }

    #[must_use]
    pub fn id(&self) -> UserId {
        self.id
    }

    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    #[must_use]
    pub fn email(&self) -> Option<&str> {
        self.email.as_deref()
    }

    #[must_use]
    pub fn first_name(&self) -> Option<&str> {
        self.first_name.as_deref()
    }

    #[must_use]
    pub fn last_name(&self) -> Option<&str> {
        self.last_name.as_deref()
    }

    /// Names of the groups the user belongs to, in name order.
    #[must_use]
    pub fn groups(&self) -> &BTreeSet<String> {
        &self.groups
    }

    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    #[must_use]
    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Copies email and names from claims.
    ///
    /// Empty or missing claims never overwrite a stored value. Returns true
    /// if anything changed.
    pub fn sync_profile(&mut self, claims: &ClaimSet) -> bool {
        let mut changed = false;
        for (field, claim) in [
            (&mut self.email, claims.email()),
            (&mut self.first_name, claims.given_name()),
            (&mut self.last_name, claims.family_name()),
        ] {
            match claim {
                Some(value) if field.as_deref() != Some(value) => {
                    *field = Some(value.to_string());
                    changed = true;
                }
                _ => {}
            }
        }
        if changed {
            self.updated_at = Utc::now();
        }
        changed
    }

    /// Replaces the user's group memberships.
    pub fn set_groups(&mut self, groups: BTreeSet<String>) {
        if self.groups != groups {
            self.groups = groups;
            self.updated_at = Utc::now();
        }
    }
}
