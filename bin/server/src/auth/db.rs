//! Database repositories for users, groups and sessions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keygate_core::{GroupId, UserId};
use keygate_platform_access::session::{ACCESS_TOKEN, ID_TOKEN, REFRESH_TOKEN};
use keygate_platform_access::{
    DirectoryError, Group, Session, SessionId, SessionStore, StoreError, TokenSet, User,
    UserDirectory,
};
use rootcause::prelude::Report;
use sqlx::{FromRow, PgPool};
use std::str::FromStr;

/// Columns shared by every user query. Groups are aggregated per user.
const USER_SELECT: &str = r#"
    SELECT u.id, u.username, u.email, u.first_name, u.last_name, u.created_at, u.updated_at,
           COALESCE(array_agg(g.name ORDER BY g.name) FILTER (WHERE g.name IS NOT NULL), '{}') AS groups
    FROM users u
    LEFT JOIN user_groups ug ON ug.user_id = u.id
    LEFT JOIN groups g ON g.id = ug.group_id
"#;

/// Row type for user queries.
#[derive(FromRow)]
struct UserRow {
    id: String,
    username: String,
    email: Option<String>,
    first_name: Option<String>,
    last_name: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    groups: Vec<String>,
}

impl UserRow {
    fn try_into_user(self) -> Result<User, sqlx::Error> {
        let id = UserId::from_str(&self.id).map_err(|e| invalid_column("user id", &self.id, e))?;
        Ok(User::with_all_fields(
            id,
            self.username,
            self.email,
            self.first_name,
            self.last_name,
            self.groups.into_iter().collect(),
            self.created_at,
            self.updated_at,
        ))
    }
}

/// Row type for group queries.
#[derive(FromRow)]
struct GroupRow {
    id: String,
    name: String,
}

impl GroupRow {
    fn try_into_group(self) -> Result<Group, sqlx::Error> {
        let id =
            GroupId::from_str(&self.id).map_err(|e| invalid_column("group id", &self.id, e))?;
        Ok(Group::with_id(id, self.name))
    }
}

/// Row type for session queries.
#[derive(FromRow)]
struct SessionRow {
    id: String,
    user_id: String,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl SessionRow {
    fn try_into_session(self) -> Result<Session, sqlx::Error> {
        let user_id = UserId::from_str(&self.user_id)
            .map_err(|e| invalid_column("user id", &self.user_id, e))?;
        Ok(Session::from_parts(
            SessionId::new(self.id),
            user_id,
            self.created_at,
            self.expires_at,
        ))
    }
}

fn invalid_column(what: &str, value: &str, err: impl std::fmt::Display) -> sqlx::Error {
    sqlx::Error::Decode(Box::new(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        format!("invalid {what} '{value}': {err}"),
    )))
}

fn directory_backend(err: sqlx::Error) -> Report<DirectoryError> {
    DirectoryError::Backend {
        details: err.to_string(),
    }
    .into()
}

/// Repository for users and their group memberships.
pub struct UserRepository {
    pool: PgPool,
}

impl UserRepository {
    /// Creates a new user repository.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Finds a user by their internal ID.
    pub async fn find_by_id(&self, id: UserId) -> Result<Option<User>, sqlx::Error> {
        let query = format!("{USER_SELECT} WHERE u.id = $1 GROUP BY u.id");
        let row: Option<UserRow> = sqlx::query_as(&query)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(UserRow::try_into_user).transpose()
    }
}

#[async_trait]
impl UserDirectory for UserRepository {
    async fn find_by_email(&self, email: &str) -> Result<Vec<User>, Report<DirectoryError>> {
        let query = format!("{USER_SELECT} WHERE lower(u.email) = lower($1) GROUP BY u.id");
        let rows: Vec<UserRow> = sqlx::query_as(&query)
            .bind(email)
            .fetch_all(&self.pool)
            .await
            .map_err(directory_backend)?;

        rows.into_iter()
            .map(|row| row.try_into_user().map_err(directory_backend))
            .collect()
    }

    async fn find_by_username(
        &self,
        username: &str,
    ) -> Result<Option<User>, Report<DirectoryError>> {
        let query = format!("{USER_SELECT} WHERE lower(u.username) = lower($1) GROUP BY u.id");
        let row: Option<UserRow> = sqlx::query_as(&query)
            .bind(username)
            .fetch_optional(&self.pool)
            .await
            .map_err(directory_backend)?;

        row.map(UserRow::try_into_user)
            .transpose()
            .map_err(directory_backend)
    }

    async fn create_user(&self, user: &User) -> Result<(), Report<DirectoryError>> {
        sqlx::query(
            r#"
            INSERT INTO users (id, username, email, first_name, last_name, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(user.id().to_string())
        .bind(user.username())
        .bind(user.email())
        .bind(user.first_name())
        .bind(user.last_name())
        .bind(user.created_at())
        .bind(user.updated_at())
        .execute(&self.pool)
        .await
        .map_err(directory_backend)?;

        Ok(())
    }

    async fn update_user(&self, user: &User) -> Result<(), Report<DirectoryError>> {
        let result = sqlx::query(
            r#"
            UPDATE users
            SET email = $2, first_name = $3, last_name = $4, updated_at = $5
            WHERE id = $1
            "#,
        )
        .bind(user.id().to_string())
        .bind(user.email())
        .bind(user.first_name())
        .bind(user.last_name())
        .bind(user.updated_at())
        .execute(&self.pool)
        .await
        .map_err(directory_backend)?;

        if result.rows_affected() == 0 {
            return Err(DirectoryError::NotFound {
                entity: format!("user {}", user.id()),
            }
            .into());
        }
        Ok(())
    }

    async fn ensure_group(&self, name: &str) -> Result<Group, Report<DirectoryError>> {
        sqlx::query(
            r#"
            INSERT INTO groups (id, name)
            VALUES ($1, $2)
            ON CONFLICT (name) DO NOTHING
            "#,
        )
        .bind(GroupId::new().to_string())
        .bind(name)
        .execute(&self.pool)
        .await
        .map_err(directory_backend)?;

        let row: GroupRow = sqlx::query_as("SELECT id, name FROM groups WHERE name = $1")
            .bind(name)
            .fetch_one(&self.pool)
            .await
            .map_err(directory_backend)?;

        row.try_into_group().map_err(directory_backend)
    }

    async fn set_memberships(
        &self,
        user_id: UserId,
        groups: &[Group],
    ) -> Result<(), Report<DirectoryError>> {
        let mut tx = self.pool.begin().await.map_err(directory_backend)?;

        sqlx::query("DELETE FROM user_groups WHERE user_id = $1")
            .bind(user_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(directory_backend)?;

        for group in groups {
            sqlx::query("INSERT INTO user_groups (user_id, group_id) VALUES ($1, $2)")
                .bind(user_id.to_string())
                .bind(group.id().to_string())
                .execute(&mut *tx)
                .await
                .map_err(directory_backend)?;
        }

        tx.commit().await.map_err(directory_backend)?;
        Ok(())
    }
}

/// Repository for session records.
pub struct SessionRepository {
    pool: PgPool,
}

impl SessionRepository {
    /// Creates a new session repository.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Finds a session by ID.
    pub async fn find_by_id(&self, id: &SessionId) -> Result<Option<Session>, sqlx::Error> {
        let row: Option<SessionRow> = sqlx::query_as(
            r#"
            SELECT id, user_id, created_at, expires_at
            FROM sessions
            WHERE id = $1
            "#,
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(SessionRow::try_into_session).transpose()
    }

    /// Creates a new session holding the tokens from login.
    pub async fn create(&self, session: &Session, tokens: &TokenSet) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO sessions (id, user_id, created_at, expires_at, access_token, refresh_token, id_token)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(session.id().as_str())
        .bind(session.user_id().to_string())
        .bind(session.created_at())
        .bind(session.expires_at())
        .bind(tokens.access_token.as_deref())
        .bind(tokens.refresh_token.as_deref())
        .bind(tokens.id_token.as_deref())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Deletes a session by ID.
    pub async fn delete(&self, id: &SessionId) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM sessions WHERE id = $1")
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Deletes expired sessions.
    pub async fn delete_expired(&self) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM sessions WHERE expires_at < NOW()")
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

/// Session store over one row of the `sessions` table.
///
/// Each supported key is a column; clearing deletes the row, which ends the
/// session for every later request. A row past `expires_at` behaves as if it
/// were already gone.
pub struct PgSessionStore {
    pool: PgPool,
    id: SessionId,
}

impl PgSessionStore {
    pub fn new(pool: PgPool, id: SessionId) -> Self {
        Self { pool, id }
    }
}

fn token_column(key: &str) -> Result<&'static str, StoreError> {
    match key {
        ACCESS_TOKEN => Ok("access_token"),
        REFRESH_TOKEN => Ok("refresh_token"),
        ID_TOKEN => Ok("id_token"),
        other => Err(StoreError::UnsupportedKey {
            key: other.to_string(),
        }),
    }
}

/// Reads one token column of a live session. Expired rows read as absent.
fn select_token_sql(column: &str) -> String {
    format!("SELECT {column} FROM sessions WHERE id = $1 AND expires_at > NOW()")
}

/// Writes one token column of a live session. Expired rows are not touched.
fn update_token_sql(column: &str) -> String {
    format!("UPDATE sessions SET {column} = $2 WHERE id = $1 AND expires_at > NOW()")
}

fn store_backend(err: sqlx::Error) -> Report<StoreError> {
    StoreError::Backend {
        details: err.to_string(),
    }
    .into()
}

#[async_trait]
impl SessionStore for PgSessionStore {
    fn session_id(&self) -> &SessionId {
        &self.id
    }

    async fn get(&self, key: &str) -> Result<Option<String>, Report<StoreError>> {
        let query = select_token_sql(token_column(key)?);
        let value: Option<Option<String>> = sqlx::query_scalar(&query)
            .bind(self.id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(store_backend)?;

        Ok(value.flatten())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), Report<StoreError>> {
        let query = update_token_sql(token_column(key)?);
        let result = sqlx::query(&query)
            .bind(self.id.as_str())
            .bind(value)
            .execute(&self.pool)
            .await
            .map_err(store_backend)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Backend {
                details: format!("session {} no longer exists or has expired", self.id),
            }
            .into());
        }
        Ok(())
    }

    async fn clear(&self) -> Result<(), Report<StoreError>> {
        SessionRepository::new(self.pool.clone())
            .delete(&self.id)
            .await
            .map_err(store_backend)
    }
}

/// Generates a unique session ID using ULID.
pub fn generate_session_id() -> SessionId {
    SessionId::new(ulid::Ulid::new().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_keys_map_to_columns() {
        assert_eq!(token_column(ACCESS_TOKEN), Ok("access_token"));
        assert_eq!(token_column(REFRESH_TOKEN), Ok("refresh_token"));
        assert_eq!(token_column(ID_TOKEN), Ok("id_token"));
    }

    #[test]
    fn other_keys_are_unsupported() {
        assert_eq!(
            token_column("access_token; DROP TABLE sessions"),
            Err(StoreError::UnsupportedKey {
                key: "access_token; DROP TABLE sessions".to_string()
            })
        );
    }

    #[test]
    fn token_reads_skip_expired_sessions() {
        assert_eq!(
            select_token_sql("access_token"),
            "SELECT access_token FROM sessions WHERE id = $1 AND expires_at > NOW()"
        );
    }

    #[test]
    fn token_writes_skip_expired_sessions() {
        assert_eq!(
            update_token_sql("refresh_token"),
            "UPDATE sessions SET refresh_token = $2 WHERE id = $1 AND expires_at > NOW()"
        );
    }

    #[test]
    fn generated_session_ids_are_unique() {
        assert_ne!(generate_session_id(), generate_session_id());
    }
}
