//! Persistence contracts for users, the role-change audit trail and refresh tokens.
//!
//! Every user query takes an explicit [`DeletedFilter`]; soft-deleted rows are never
//! hidden or revealed by convention.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::model::{RoleChangeEntry, User};

pub mod memory;
pub mod postgres;

pub use memory::{InMemoryRefreshTokenStore, InMemoryRoleChangeLog, InMemoryUserStore};
pub use postgres::{PgRefreshTokenStore, PgRoleChangeLog, PgUserStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletedFilter {
    Exclude,
    Include,
}

impl DeletedFilter {
    pub fn admits(&self, user: &User) -> bool {
        match self {
            DeletedFilter::Exclude => !user.is_deleted(),
            DeletedFilter::Include => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityField {
    Email,
    Username,
}

impl IdentityField {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentityField::Email => "email",
            IdentityField::Username => "username",
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{} is already in use", .field.as_str())]
    DuplicateIdentity { field: IdentityField },
    #[error("user not found")]
    NotFound,
    #[error("operation would leave no active administrator")]
    LastAdmin,
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(value: sqlx::Error) -> Self {
        StoreError::Backend(value.into())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoftDeleteOutcome {
    Deleted,
    AlreadyDeleted,
}

/// Result of an atomic role mutation: the user as stored afterwards and whether the role
/// set actually changed.
#[derive(Debug, Clone)]
pub struct RoleMutation {
    pub user: User,
    pub changed: bool,
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_by_id(&self, id: Uuid, filter: DeletedFilter) -> StoreResult<Option<User>>;

    /// `email` is compared case-insensitively.
    async fn find_by_email(&self, email: &str, filter: DeletedFilter)
        -> StoreResult<Option<User>>;

    async fn find_by_username(
        &self,
        username: &str,
        filter: DeletedFilter,
    ) -> StoreResult<Option<User>>;

    async fn exists_by_email(&self, email: &str, filter: DeletedFilter) -> StoreResult<bool>;

    async fn exists_by_username(&self, username: &str, filter: DeletedFilter)
        -> StoreResult<bool>;

    /// Creates the user. Email/username collisions with a non-deleted user fail with
    /// `DuplicateIdentity` even when two inserts race.
    async fn insert(&self, user: &User) -> StoreResult<()>;

    /// Persists the profile fields (email, username, names, enabled, attributes) of an
    /// existing non-deleted user. Refuses to disable the last active administrator.
    async fn save(&self, user: &User) -> StoreResult<User>;

    async fn set_password_hash(&self, id: Uuid, hash: &str, at: DateTime<Utc>)
        -> StoreResult<()>;

    /// Idempotent. Refuses to delete the last active administrator.
    async fn soft_delete(&self, id: Uuid, at: DateTime<Utc>) -> StoreResult<SoftDeleteOutcome>;

    /// Grants or removes `change.role` on `change.target_user_id` and appends `change` to
    /// the role-change log in the same atomic step. Nothing is written when the role set
    /// is already in the requested state. Refuses to strip `ADMIN` from the last active
    /// administrator.
    async fn change_role(&self, change: &RoleChangeEntry) -> StoreResult<RoleMutation>;

    async fn list_all(&self, filter: DeletedFilter) -> StoreResult<Vec<User>>;
}

/// Append-only audit trail of role mutations. Writes normally arrive through
/// [`UserStore::change_role`].
#[async_trait]
pub trait RoleChangeLog: Send + Sync {
    async fn append(&self, entry: &RoleChangeEntry) -> StoreResult<()>;

    /// Entries for one user, oldest first.
    async fn entries_for(&self, target_user_id: Uuid) -> StoreResult<Vec<RoleChangeEntry>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshTokenRecord {
    pub token_id: Uuid,
    pub user_id: Uuid,
    pub token_hash: Vec<u8>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Server-side registry of outstanding refresh tokens, keyed by digest.
#[async_trait]
pub trait RefreshTokenStore: Send + Sync {
    /// Stores `record`. Records already past their expiry are purged on the way.
    async fn insert(&self, record: RefreshTokenRecord) -> StoreResult<()>;

    /// Removes and returns the record matching `token_hash`; a token can be consumed once.
    /// Expiry is left to the caller.
    async fn consume(&self, token_hash: &[u8]) -> StoreResult<Option<RefreshTokenRecord>>;

    /// Removes the record matching `token_hash` if it belongs to `user_id`.
    async fn revoke(&self, token_hash: &[u8], user_id: Uuid) -> StoreResult<bool>;

    async fn revoke_all_for_user(&self, user_id: Uuid) -> StoreResult<u64>;
}
