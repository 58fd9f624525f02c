//! Identity mapping: from identity-provider claims to a local user.
//!
//! [`IdentityMapper::resolve_user`] runs once per completed login. It finds
//! or creates the local account, synchronizes its profile fields, and mirrors
//! the user's realm roles as group memberships.
//!
//! # Lookup
//!
//! 1. When the claims carry an email and local users share it
//!    (case-insensitive), that user is chosen. More than one match is an
//!    error rather than a guess.
//! 2. Otherwise the resolved username (`preferred_username`, then `email`,
//!    then `sub`) is matched case-insensitively.
//! 3. No match creates a new user under the resolved username.
//!
//! # Role mirroring
//!
//! A `realm_roles` list in the claims replaces the user's groups with exactly
//! `{prefix}{role}` for each role. Without that list, memberships are left
//! alone.

use async_trait::async_trait;
use keygate_core::UserId;
use rootcause::prelude::Report;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument};

use crate::claims::{ClaimSet, ClaimValue, REALM_ACCESS_CLAIM, REALM_ROLES_CLAIM};
use crate::error::{DirectoryError, IdentityError};
use crate::role::{DEFAULT_GROUP_PREFIX, Group, RoleSet};
use crate::user::User;

/// Storage for local users and groups.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// All users whose email matches, ignoring case.
    async fn find_by_email(&self, email: &str) -> Result<Vec<User>, Report<DirectoryError>>;

    /// The user whose username matches, ignoring case.
    async fn find_by_username(&self, username: &str)
    -> Result<Option<User>, Report<DirectoryError>>;

    /// Stores a new user. Group memberships are set separately.
    async fn create_user(&self, user: &User) -> Result<(), Report<DirectoryError>>;

    /// Updates a user's profile fields.
    async fn update_user(&self, user: &User) -> Result<(), Report<DirectoryError>>;

    /// Returns the named group, creating it if needed.
    async fn ensure_group(&self, name: &str) -> Result<Group, Report<DirectoryError>>;

    /// Replaces a user's memberships with exactly `groups`.
    async fn set_memberships(
        &self,
        user_id: UserId,
        groups: &[Group],
    ) -> Result<(), Report<DirectoryError>>;
}

/// Outcome of resolving a login to a local user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedUser {
    pub user: User,
    /// True when this login created the account.
    pub created: bool,
}

/// Maps claims onto local users.
pub struct IdentityMapper {
    directory: Arc<dyn UserDirectory>,
    group_prefix: String,
}

impl IdentityMapper {
    /// Creates a mapper using the default `kc:` group prefix.
    #[must_use]
    pub fn new(directory: Arc<dyn UserDirectory>) -> Self {
        Self {
            directory,
            group_prefix: DEFAULT_GROUP_PREFIX.to_string(),
        }
    }

    #[must_use]
    pub fn with_group_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.group_prefix = prefix.into();
        self
    }

    /// Finds or creates the local user for `claims` and synchronizes it.
    #[instrument(skip_all, fields(username = claims.resolved_username()))]
    pub async fn resolve_user(
        &self,
        claims: &ClaimSet,
    ) -> Result<ResolvedUser, Report<IdentityError>> {
        let username = claims
            .resolved_username()
            .ok_or(IdentityError::MissingIdentifier)?;

        let (mut user, created) = match self.find_existing(claims, username).await? {
            Some(mut user) => {
                if user.sync_profile(claims) {
                    self.directory
                        .update_user(&user)
                        .await
                        .map_err(directory_failure)?;
                }
                (user, false)
            }
            None => {
                let mut user = User::new(username.to_string());
                user.sync_profile(claims);
                self.directory
                    .create_user(&user)
                    .await
                    .map_err(directory_failure)?;
                info!(user_id = %user.id(), "created local user");
                (user, true)
            }
        };

        if let Some(roles) = claims.string_list(REALM_ROLES_CLAIM) {
            let roles: RoleSet = roles.into_iter().collect();
            self.sync_groups(&mut user, &roles).await?;
        } else {
            debug!("no realm roles in claims, leaving memberships unchanged");
        }

        Ok(ResolvedUser { user, created })
    }

    async fn find_existing(
        &self,
        claims: &ClaimSet,
        username: &str,
    ) -> Result<Option<User>, Report<IdentityError>> {
        if let Some(email) = claims.email() {
            let mut matches = self
                .directory
                .find_by_email(email)
                .await
                .map_err(directory_failure)?;
            match matches.len() {
                0 => {}
                1 => return Ok(matches.pop()),
                n => {
                    return Err(IdentityError::AmbiguousIdentity {
                        email: email.to_string(),
                        matches: n,
                    }
                    .into());
                }
            }
        }

        self.directory
            .find_by_username(username)
            .await
            .map_err(directory_failure)
    }

    async fn sync_groups(
        &self,
        user: &mut User,
        roles: &RoleSet,
    ) -> Result<(), Report<IdentityError>> {
        let mut groups = Vec::new();
        for name in roles.group_names(&self.group_prefix) {
            groups.push(
                self.directory
                    .ensure_group(&name)
                    .await
                    .map_err(directory_failure)?,
            );
        }

        self.directory
            .set_memberships(user.id(), &groups)
            .await
            .map_err(directory_failure)?;
        user.set_groups(groups.iter().map(|g| g.name().to_string()).collect());
        if roles.is_empty() {
            debug!("realm roles empty, cleared role groups");
        } else {
            debug!(roles = ?roles.iter().collect::<Vec<_>>(), "synchronized role groups");
        }
        Ok(())
    }
}

fn directory_failure(err: Report<DirectoryError>) -> Report<IdentityError> {
    IdentityError::Directory {
        details: err.to_string(),
    }
    .into()
}

/// Builds the login-completion payload: ID-token claims plus `realm_roles`.
///
/// Realm roles live in the access token, not the ID token. When the access
/// token carries no `realm_access.roles` list, `realm_roles` is left out so
/// memberships stay as they are.
#[must_use]
pub fn enrich_with_realm_roles(id_claims: &ClaimSet, access_claims: &ClaimSet) -> ClaimSet {
    let mut enriched = id_claims.clone();
    if let Some(roles) = access_claims
        .get_path(&[REALM_ACCESS_CLAIM, "roles"])
        .and_then(ClaimValue::as_string_list)
    {
        enriched.insert(REALM_ROLES_CLAIM, roles);
    }
    enriched
}

#[derive(Default)]
struct DirectoryState {
    users: BTreeMap<UserId, User>,
    groups: BTreeMap<String, Group>,
}

/// In-process user directory.
#[derive(Default)]
pub struct MemoryDirectory {
    state: RwLock<DirectoryState>,
}

impl MemoryDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All users, in ID order.
    pub async fn users(&self) -> Vec<User> {
        self.state.read().await.users.values().cloned().collect()
    }

    /// All group names, in name order.
    pub async fn group_names(&self) -> Vec<String> {
        self.state.read().await.groups.keys().cloned().collect()
    }
}

#[async_trait]
impl UserDirectory for MemoryDirectory {
    async fn find_by_email(&self, email: &str) -> Result<Vec<User>, Report<DirectoryError>> {
        let email = email.to_lowercase();
        Ok(self
            .state
            .read()
            .await
            .users
            .values()
            .filter(|u| u.email().is_some_and(|e| e.to_lowercase() == email))
            .cloned()
            .collect())
    }

    async fn find_by_username(
        &self,
        username: &str,
    ) -> Result<Option<User>, Report<DirectoryError>> {
        let username = username.to_lowercase();
        Ok(self
            .state
            .read()
            .await
            .users
            .values()
            .find(|u| u.username().to_lowercase() == username)
            .cloned())
    }

    async fn create_user(&self, user: &User) -> Result<(), Report<DirectoryError>> {
        self.state
            .write()
            .await
            .users
            .insert(user.id(), user.clone());
        Ok(())
    }

    async fn update_user(&self, user: &User) -> Result<(), Report<DirectoryError>> {
        let mut state = self.state.write().await;
        let stored = state
            .users
            .get_mut(&user.id())
            .ok_or_else(|| DirectoryError::NotFound {
                entity: format!("user {}", user.id()),
            })?;
        let groups = stored.groups().clone();
        *stored = user.clone();
        stored.set_groups(groups);
        Ok(())
    }

    async fn ensure_group(&self, name: &str) -> Result<Group, Report<DirectoryError>> {
        let mut state = self.state.write().await;
        Ok(state
            .groups
            .entry(name.to_string())
            .or_insert_with(|| Group::new(name.to_string()))
            .clone())
    }

    async fn set_memberships(
        &self,
        user_id: UserId,
        groups: &[Group],
    ) -> Result<(), Report<DirectoryError>> {
        let mut state = self.state.write().await;
        if let Some(missing) = groups.iter().find(|g| !state.groups.contains_key(g.name())) {
            return Err(DirectoryError::NotFound {
                entity: format!("group {}", missing.name()),
            }
            .into());
        }
        let user = state
            .users
            .get_mut(&user_id)
            .ok_or_else(|| DirectoryError::NotFound {
                entity: format!("user {user_id}"),
            })?;
        let names: BTreeSet<String> = groups.iter().map(|g| g.name().to_string()).collect();
        user.set_groups(names);
        Ok(())
    }
}
