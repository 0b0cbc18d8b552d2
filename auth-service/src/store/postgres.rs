use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common_auth::ROLE_ADMIN;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use super::{
    DeletedFilter, IdentityField, RefreshTokenRecord, RefreshTokenStore, RoleChangeLog,
    RoleMutation, SoftDeleteOutcome, StoreError, StoreResult, UserStore,
};
use crate::model::{RoleAction, RoleChangeEntry, User, UserAttributes};

const USER_COLUMNS: &str = "id, email, username, password_hash, first_name, last_name, roles, \
     enabled, attributes, created_at, updated_at, deleted_at";

const UNIQUE_VIOLATION: &str = "23505";

fn deleted_clause(filter: DeletedFilter) -> &'static str {
    match filter {
        DeletedFilter::Exclude => " AND deleted_at IS NULL",
        DeletedFilter::Include => "",
    }
}

fn user_from_row(row: &PgRow) -> Result<User, sqlx::Error> {
    let roles: Vec<String> = row.try_get("roles")?;
    let attributes: serde_json::Value = row.try_get("attributes")?;
    Ok(User {
        id: row.try_get("id")?,
        email: row.try_get("email")?,
        username: row.try_get("username")?,
        password_hash: row.try_get("password_hash")?,
        first_name: row.try_get("first_name")?,
        last_name: row.try_get("last_name")?,
        roles: roles.into_iter().collect(),
        enabled: row.try_get("enabled")?,
        attributes: UserAttributes::from_value(attributes),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        deleted_at: row.try_get("deleted_at")?,
    })
}

/// Unique index violations become `DuplicateIdentity`; the index name tells which field.
fn map_write_error(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.code().as_deref() == Some(UNIQUE_VIOLATION) {
            let field = if db_err.message().contains("username") {
                IdentityField::Username
            } else {
                IdentityField::Email
            };
            return StoreError::DuplicateIdentity { field };
        }
    }
    err.into()
}

/// Advisory lock key serialising every write that can shrink the set of active admins.
const ADMIN_SET_LOCK: i64 = 0x6164_6d69_6e73;

/// Must be taken before any row lock in the same transaction. Released on commit or rollback.
async fn lock_admin_set(tx: &mut Transaction<'_, Postgres>) -> StoreResult<()> {
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(ADMIN_SET_LOCK)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Whether `target` is the only enabled, non-deleted admin. Callers hold the admin-set lock.
async fn is_sole_admin(tx: &mut Transaction<'_, Postgres>, target: &User) -> StoreResult<bool> {
    if !target.is_active_admin() {
        return Ok(false);
    }
    let others: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM users \
         WHERE deleted_at IS NULL AND enabled AND $1 = ANY(roles) AND id <> $2",
    )
    .bind(ROLE_ADMIN)
    .bind(target.id)
    .fetch_one(&mut **tx)
    .await?;
    Ok(others == 0)
}

async fn insert_role_change<'e, E>(executor: E, entry: &RoleChangeEntry) -> StoreResult<()>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    sqlx::query(
        "INSERT INTO role_change_log (id, target_user_id, acting_user_id, role, action, changed_at) \
         VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(entry.id)
    .bind(entry.target_user_id)
    .bind(entry.acting_user_id)
    .bind(&entry.role)
    .bind(entry.action.as_str())
    .bind(entry.timestamp)
    .execute(executor)
    .await?;
    Ok(())
}

async fn lock_active_user(tx: &mut Transaction<'_, Postgres>, id: Uuid) -> StoreResult<User> {
    let row = sqlx::query(&format!(
        "SELECT {USER_COLUMNS} FROM users WHERE id = $1 AND deleted_at IS NULL FOR UPDATE"
    ))
    .bind(id)
    .fetch_optional(&mut **tx)
    .await?;
    match row {
        Some(row) => Ok(user_from_row(&row)?),
        None => Err(StoreError::NotFound),
    }
}

#[derive(Clone)]
pub struct PgUserStore {
    pool: PgPool,
}

impl PgUserStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_one_where(
        &self,
        predicate: &str,
        value: &str,
        filter: DeletedFilter,
    ) -> StoreResult<Option<User>> {
        let sql = format!(
            "SELECT {USER_COLUMNS} FROM users WHERE {predicate}{} \
             ORDER BY deleted_at IS NOT NULL, created_at DESC LIMIT 1",
            deleted_clause(filter)
        );
        let row = sqlx::query(&sql)
            .bind(value)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(user_from_row).transpose()?)
    }
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn find_by_id(&self, id: Uuid, filter: DeletedFilter) -> StoreResult<Option<User>> {
        let sql = format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = $1{}",
            deleted_clause(filter)
        );
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        Ok(row.as_ref().map(user_from_row).transpose()?)
    }

    async fn find_by_email(
        &self,
        email: &str,
        filter: DeletedFilter,
    ) -> StoreResult<Option<User>> {
        self.fetch_one_where("lower(email) = lower($1)", email, filter)
            .await
    }

    async fn find_by_username(
        &self,
        username: &str,
        filter: DeletedFilter,
    ) -> StoreResult<Option<User>> {
        self.fetch_one_where("username = $1", username, filter).await
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
        sqlx::query(
            "INSERT INTO users (id, email, username, password_hash, first_name, last_name, roles, \
             enabled, attributes, created_at, updated_at, deleted_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
        )
        .bind(user.id)
        .bind(&user.email)
        .bind(&user.username)
        .bind(&user.password_hash)
        .bind(&user.first_name)
        .bind(&user.last_name)
        .bind(user.role_list())
        .bind(user.enabled)
        .bind(user.attributes.to_value())
        .bind(user.created_at)
        .bind(user.updated_at)
        .bind(user.deleted_at)
        .execute(&self.pool)
        .await
        .map_err(map_write_error)?;
        Ok(())
    }

    async fn save(&self, user: &User) -> StoreResult<User> {
        let mut tx = self.pool.begin().await?;
        if !user.enabled {
            lock_admin_set(&mut tx).await?;
            let current = lock_active_user(&mut tx, user.id).await?;
            if is_sole_admin(&mut tx, &current).await? {
                return Err(StoreError::LastAdmin);
            }
        }
        let row = sqlx::query(&format!(
            "UPDATE users SET email = $2, username = $3, first_name = $4, last_name = $5, \
             enabled = $6, attributes = $7, updated_at = $8 \
             WHERE id = $1 AND deleted_at IS NULL RETURNING {USER_COLUMNS}"
        ))
        .bind(user.id)
        .bind(&user.email)
        .bind(&user.username)
        .bind(&user.first_name)
        .bind(&user.last_name)
        .bind(user.enabled)
        .bind(user.attributes.to_value())
        .bind(user.updated_at)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_write_error)?;
        let saved = match row {
            Some(row) => user_from_row(&row)?,
            None => return Err(StoreError::NotFound),
        };
        tx.commit().await?;
        Ok(saved)
    }

    async fn set_password_hash(
        &self,
        id: Uuid,
        hash: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE users SET password_hash = $2, updated_at = $3 WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(id)
        .bind(hash)
        .bind(at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn soft_delete(&self, id: Uuid, at: DateTime<Utc>) -> StoreResult<SoftDeleteOutcome> {
        let mut tx = self.pool.begin().await?;
        lock_admin_set(&mut tx).await?;
        let row = sqlx::query(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;
        let user = match row {
            Some(row) => user_from_row(&row)?,
            None => return Err(StoreError::NotFound),
        };
        if user.is_deleted() {
            return Ok(SoftDeleteOutcome::AlreadyDeleted);
        }
        if is_sole_admin(&mut tx, &user).await? {
            return Err(StoreError::LastAdmin);
        }
        sqlx::query("UPDATE users SET deleted_at = $2, updated_at = $2 WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(SoftDeleteOutcome::Deleted)
    }

    async fn change_role(&self, change: &RoleChangeEntry) -> StoreResult<RoleMutation> {
        let demoting_admin = change.action == RoleAction::Remove && change.role == ROLE_ADMIN;
        let mut tx = self.pool.begin().await?;
        if demoting_admin {
            lock_admin_set(&mut tx).await?;
        }
        let mut user = lock_active_user(&mut tx, change.target_user_id).await?;
        if demoting_admin && is_sole_admin(&mut tx, &user).await? {
            return Err(StoreError::LastAdmin);
        }

        let changed = match change.action {
            RoleAction::Add => user.roles.insert(change.role.clone()),
            RoleAction::Remove => user.roles.remove(&change.role),
        };
        if changed {
            user.updated_at = change.timestamp;
            sqlx::query("UPDATE users SET roles = $2, updated_at = $3 WHERE id = $1")
                .bind(user.id)
                .bind(user.role_list())
                .bind(change.timestamp)
                .execute(&mut *tx)
                .await?;
            insert_role_change(&mut *tx, change).await?;
        }
        tx.commit().await?;
        Ok(RoleMutation { user, changed })
    }

    async fn list_all(&self, filter: DeletedFilter) -> StoreResult<Vec<User>> {
        let sql = format!(
            "SELECT {USER_COLUMNS} FROM users WHERE TRUE{} ORDER BY email, created_at",
            deleted_clause(filter)
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        let users = rows
            .iter()
            .map(user_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(users)
    }
}

#[derive(Clone)]
pub struct PgRoleChangeLog {
    pool: PgPool,
}

impl PgRoleChangeLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RoleChangeLog for PgRoleChangeLog {
    async fn append(&self, entry: &RoleChangeEntry) -> StoreResult<()> {
        insert_role_change(&self.pool, entry).await
    }

    async fn entries_for(&self, target_user_id: Uuid) -> StoreResult<Vec<RoleChangeEntry>> {
        let rows = sqlx::query(
            "SELECT id, target_user_id, acting_user_id, role, action, changed_at \
             FROM role_change_log WHERE target_user_id = $1 ORDER BY changed_at, id",
        )
        .bind(target_user_id)
        .fetch_all(&self.pool)
        .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let action: String = row.try_get("action")?;
            let action = RoleAction::parse(&action).ok_or_else(|| {
                StoreError::Backend(anyhow::anyhow!("unknown role action '{action}'"))
            })?;
            entries.push(RoleChangeEntry {
                id: row.try_get("id")?,
                target_user_id: row.try_get("target_user_id")?,
                acting_user_id: row.try_get("acting_user_id")?,
                role: row.try_get("role")?,
                action,
                timestamp: row.try_get("changed_at")?,
            });
        }
        Ok(entries)
    }
}

#[derive(Clone)]
pub struct PgRefreshTokenStore {
    pool: PgPool,
}

impl PgRefreshTokenStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn refresh_from_row(row: &PgRow) -> Result<RefreshTokenRecord, sqlx::Error> {
    Ok(RefreshTokenRecord {
        token_id: row.try_get("jti")?,
        user_id: row.try_get("user_id")?,
        token_hash: row.try_get("token_hash")?,
        issued_at: row.try_get("issued_at")?,
        expires_at: row.try_get("expires_at")?,
    })
}

#[async_trait]
impl RefreshTokenStore for PgRefreshTokenStore {
    async fn insert(&self, record: RefreshTokenRecord) -> StoreResult<()> {
        sqlx::query("DELETE FROM auth_refresh_tokens WHERE expires_at <= $1")
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "INSERT INTO auth_refresh_tokens (jti, user_id, token_hash, issued_at, expires_at) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(record.token_id)
        .bind(record.user_id)
        .bind(&record.token_hash)
        .bind(record.issued_at)
        .bind(record.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn consume(&self, token_hash: &[u8]) -> StoreResult<Option<RefreshTokenRecord>> {
        let row = sqlx::query(
            "DELETE FROM auth_refresh_tokens WHERE token_hash = $1 \
             RETURNING jti, user_id, token_hash, issued_at, expires_at",
        )
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(refresh_from_row).transpose()?)
    }

    async fn revoke(&self, token_hash: &[u8], user_id: Uuid) -> StoreResult<bool> {
        let result =
            sqlx::query("DELETE FROM auth_refresh_tokens WHERE token_hash = $1 AND user_id = $2")
                .bind(token_hash)
                .bind(user_id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn revoke_all_for_user(&self, user_id: Uuid) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM auth_refresh_tokens WHERE user_id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
