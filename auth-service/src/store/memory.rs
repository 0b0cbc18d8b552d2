use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common_auth::ROLE_ADMIN;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    DeletedFilter, IdentityField, RefreshTokenRecord, RefreshTokenStore, RoleChangeLog,
    RoleMutation, SoftDeleteOutcome, StoreError, StoreResult, UserStore,
};
use crate::model::{RoleAction, RoleChangeEntry, User};

/// Process-local user store. Each mutation holds the write lock across its check and its
/// write, which gives the same atomicity the database constraints provide. Role changes
/// are appended to `role_log` while that lock is held.
pub struct InMemoryUserStore {
    users: RwLock<HashMap<Uuid, User>>,
    role_log: Arc<dyn RoleChangeLog>,
}

impl InMemoryUserStore {
    pub fn new() -> Self {
        Self::with_role_log(Arc::new(InMemoryRoleChangeLog::new()))
    }

    pub fn with_role_log(role_log: Arc<dyn RoleChangeLog>) -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
            role_log,
        }
    }
}

impl Default for InMemoryUserStore {
    fn default() -> Self {
        Self::new()
    }
}

fn same_email(left: &str, right: &str) -> bool {
    left.to_lowercase() == right.to_lowercase()
}

/// First identity field of `candidate` already held by another non-deleted user.
fn identity_conflict(users: &HashMap<Uuid, User>, candidate: &User) -> Option<IdentityField> {
    let others = || {
        users
            .values()
            .filter(|existing| existing.id != candidate.id && !existing.is_deleted())
    };
    if others().any(|existing| same_email(&existing.email, &candidate.email)) {
        return Some(IdentityField::Email);
    }
    if let Some(username) = candidate.username.as_deref() {
        if others().any(|existing| existing.username.as_deref() == Some(username)) {
            return Some(IdentityField::Username);
        }
    }
    None
}

fn is_sole_admin(users: &HashMap<Uuid, User>, target: &User) -> bool {
    target.is_active_admin()
        && !users
            .values()
            .any(|other| other.id != target.id && other.is_active_admin())
}

#[async_trait]
impl UserStore for InMemoryUserStore {
    async fn find_by_id(&self, id: Uuid, filter: DeletedFilter) -> StoreResult<Option<User>> {
        let users = self.users.read().await;
        Ok(users.get(&id).filter(|user| filter.admits(user)).cloned())
    }

    async fn find_by_email(
        &self,
        email: &str,
        filter: DeletedFilter,
    ) -> StoreResult<Option<User>> {
        let users = self.users.read().await;
        let mut matches = users
            .values()
            .filter(|user| filter.admits(user) && same_email(&user.email, email))
            .collect::<Vec<_>>();
        // A live record wins over deleted ones that once held the same address.
        matches.sort_by_key(|user| (user.is_deleted(), std::cmp::Reverse(user.created_at)));
        Ok(matches.first().map(|user| (*user).clone()))
    }

    async fn find_by_username(
        &self,
        username: &str,
        filter: DeletedFilter,
    ) -> StoreResult<Option<User>> {
        let users = self.users.read().await;
        let mut matches = users
            .values()
            .filter(|user| filter.admits(user) && user.username.as_deref() == Some(username))
            .collect::<Vec<_>>();
        matches.sort_by_key(|user| (user.is_deleted(), std::cmp::Reverse(user.created_at)));
        Ok(matches.first().map(|user| (*user).clone()))
    }

    async fn exists_by_email(&self, email: &str, filter: DeletedFilter) -> StoreResult<bool> {
        Ok(self.find_by_email(email, filter).await?.is_some())
    }

    async fn exists_by_username(
        &self,
        username: &str,
        filter: DeletedFilter,
    ) -> StoreResult<bool> {
        Ok(self.find_by_username(username, filter).await?.is_some())
    }

    async fn insert(&self, user: &User) -> StoreResult<()> {
        let mut users = self.users.write().await;
        if users.contains_key(&user.id) {
            return Err(StoreError::Backend(anyhow::anyhow!(
                "user id {} already exists",
                user.id
            )));
        }
        if let Some(field) = identity_conflict(&users, user) {
            return Err(StoreError::DuplicateIdentity { field });
        }
        users.insert(user.id, user.clone());
        Ok(())
    }

    async fn save(&self, user: &User) -> StoreResult<User> {
        let mut users = self.users.write().await;
        let current = users
            .get(&user.id)
            .filter(|stored| !stored.is_deleted())
            .ok_or(StoreError::NotFound)?;
        if !user.enabled && is_sole_admin(&users, current) {
            return Err(StoreError::LastAdmin);
        }
        if let Some(field) = identity_conflict(&users, user) {
            return Err(StoreError::DuplicateIdentity { field });
        }
        let stored = users.get_mut(&user.id).ok_or(StoreError::NotFound)?;
        stored.email = user.email.clone();
        stored.username = user.username.clone();
        stored.first_name = user.first_name.clone();
        stored.last_name = user.last_name.clone();
        stored.enabled = user.enabled;
        stored.attributes = user.attributes.clone();
        stored.updated_at = user.updated_at;
        Ok(stored.clone())
    }

    async fn set_password_hash(
        &self,
        id: Uuid,
        hash: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut users = self.users.write().await;
        let stored = users
            .get_mut(&id)
            .filter(|stored| !stored.is_deleted())
            .ok_or(StoreError::NotFound)?;
        stored.password_hash = hash.to_string();
        stored.updated_at = at;
        Ok(())
    }

    async fn soft_delete(&self, id: Uuid, at: DateTime<Utc>) -> StoreResult<SoftDeleteOutcome> {
        let mut users = self.users.write().await;
        let target = users.get(&id).ok_or(StoreError::NotFound)?;
        if target.is_deleted() {
            return Ok(SoftDeleteOutcome::AlreadyDeleted);
        }
        if is_sole_admin(&users, target) {
            return Err(StoreError::LastAdmin);
        }
        if let Some(stored) = users.get_mut(&id) {
            stored.deleted_at = Some(at);
            stored.updated_at = at;
        }
        Ok(SoftDeleteOutcome::Deleted)
    }

    async fn change_role(&self, change: &RoleChangeEntry) -> StoreResult<RoleMutation> {
        let mut users = self.users.write().await;
        let target = users
            .get(&change.target_user_id)
            .filter(|stored| !stored.is_deleted())
            .ok_or(StoreError::NotFound)?;

        let mut updated = target.clone();
        let changed = match change.action {
            RoleAction::Add => updated.roles.insert(change.role.clone()),
            RoleAction::Remove => {
                if change.role == ROLE_ADMIN && is_sole_admin(&users, target) {
                    return Err(StoreError::LastAdmin);
                }
                updated.roles.remove(&change.role)
            }
        };
        if !changed {
            return Ok(RoleMutation {
                user: updated,
                changed,
            });
        }

        // Log first: a failed append leaves the roles untouched.
        self.role_log.append(change).await?;
        updated.updated_at = change.timestamp;
        users.insert(updated.id, updated.clone());
        Ok(RoleMutation {
            user: updated,
            changed,
        })
    }

    async fn list_all(&self, filter: DeletedFilter) -> StoreResult<Vec<User>> {
        let users = self.users.read().await;
        let mut listed = users
            .values()
            .filter(|user| filter.admits(user))
            .cloned()
            .collect::<Vec<_>>();
        listed.sort_by(|a, b| a.email.cmp(&b.email).then(a.created_at.cmp(&b.created_at)));
        Ok(listed)
    }
}

#[derive(Default)]
pub struct InMemoryRoleChangeLog {
    entries: RwLock<Vec<RoleChangeEntry>>,
}

impl InMemoryRoleChangeLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RoleChangeLog for InMemoryRoleChangeLog {
    async fn append(&self, entry: &RoleChangeEntry) -> StoreResult<()> {
        self.entries.write().await.push(entry.clone());
        Ok(())
    }

    async fn entries_for(&self, target_user_id: Uuid) -> StoreResult<Vec<RoleChangeEntry>> {
        let entries = self.entries.read().await;
        Ok(entries
            .iter()
            .filter(|entry| entry.target_user_id == target_user_id)
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct InMemoryRefreshTokenStore {
    tokens: RwLock<HashMap<Vec<u8>, RefreshTokenRecord>>,
}

impl InMemoryRefreshTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.tokens.read().await.len()
    }
}

#[async_trait]
impl RefreshTokenStore for InMemoryRefreshTokenStore {
    async fn insert(&self, record: RefreshTokenRecord) -> StoreResult<()> {
        let now = Utc::now();
        let mut tokens = self.tokens.write().await;
        tokens.retain(|_, existing| existing.expires_at > now);
        tokens.insert(record.token_hash.clone(), record);
        Ok(())
    }

    async fn consume(&self, token_hash: &[u8]) -> StoreResult<Option<RefreshTokenRecord>> {
        Ok(self.tokens.write().await.remove(token_hash))
    }

    async fn revoke(&self, token_hash: &[u8], user_id: Uuid) -> StoreResult<bool> {
        let mut tokens = self.tokens.write().await;
        if tokens
            .get(token_hash)
            .is_some_and(|record| record.user_id == user_id)
        {
            tokens.remove(token_hash);
            return Ok(true);
        }
        Ok(false)
    }

    async fn revoke_all_for_user(&self, user_id: Uuid) -> StoreResult<u64> {
        let mut tokens = self.tokens.write().await;
        let before = tokens.len();
        tokens.retain(|_, record| record.user_id != user_id);
        Ok((before - tokens.len()) as u64)
    }
}
