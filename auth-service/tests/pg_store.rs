mod support;

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Result;
use auth_service::model::{RoleAction, RoleChangeEntry, User, UserAttributes};
use auth_service::store::{
    DeletedFilter, PgRefreshTokenStore, PgRoleChangeLog, PgUserStore, RefreshTokenRecord,
    RefreshTokenStore, RoleChangeLog, SoftDeleteOutcome, StoreError, UserStore,
};
use auth_service::Stores;
use axum::http::{Method, StatusCode};
use chrono::{Duration, Utc};
use serde_json::json;
use sqlx::PgPool;
use support::{TestApp, TestDatabase, PASSWORD};
use uuid::Uuid;

fn user(email: &str, roles: &[&str]) -> User {
    let now = Utc::now();
    User {
        id: Uuid::new_v4(),
        email: email.to_string(),
        username: None,
        password_hash: "$argon2id$v=19$m=8,t=1,p=1$c2FsdHNhbHQ$aGFzaA".to_string(),
        first_name: None,
        last_name: None,
        roles: roles.iter().map(|role| role.to_string()).collect::<BTreeSet<_>>(),
        enabled: true,
        attributes: UserAttributes::default(),
        created_at: now,
        updated_at: now,
        deleted_at: None,
    }
}

fn unique_email(prefix: &str) -> String {
    format!("{prefix}-{}@example.com", Uuid::new_v4().simple())
}

fn role_change(target: Uuid, role: &str, action: RoleAction) -> RoleChangeEntry {
    RoleChangeEntry {
        id: Uuid::new_v4(),
        target_user_id: target,
        acting_user_id: Uuid::new_v4(),
        role: role.to_string(),
        action,
        timestamp: Utc::now(),
    }
}

async fn active_admin_count(pool: &PgPool) -> Result<i64> {
    let count = sqlx::query_scalar(
        "SELECT COUNT(*) FROM users WHERE deleted_at IS NULL AND enabled AND 'ADMIN' = ANY(roles)",
    )
    .fetch_one(pool)
    .await?;
    Ok(count)
}

#[tokio::test(flavor = "multi_thread")]
#[cfg_attr(not(feature = "integration"), ignore = "enable with --features integration (requires Postgres: embedded or external)")]
async fn user_store_enforces_live_identity_uniqueness() -> Result<()> {
    let Some(db) = TestDatabase::setup().await? else {
        return Ok(());
    };
    let store = PgUserStore::new(db.pool_clone());

    let email = unique_email("pg");
    let first = user(&email, &["USER"]);
    store.insert(&first).await?;

    let duplicate = user(&email.to_uppercase(), &["USER"]);
    assert!(matches!(
        store.insert(&duplicate).await,
        Err(StoreError::DuplicateIdentity { .. })
    ));

    assert!(store.exists_by_email(&email, DeletedFilter::Exclude).await?);
    assert_eq!(
        store.soft_delete(first.id, Utc::now()).await?,
        SoftDeleteOutcome::Deleted
    );
    assert_eq!(
        store.soft_delete(first.id, Utc::now()).await?,
        SoftDeleteOutcome::AlreadyDeleted
    );
    assert!(store
        .find_by_email(&email, DeletedFilter::Exclude)
        .await?
        .is_none());
    let kept = store
        .find_by_id(first.id, DeletedFilter::Include)
        .await?
        .expect("soft-deleted row retained");
    assert!(kept.is_deleted());

    // The identity is free again once its holder is soft-deleted.
    store.insert(&duplicate).await?;

    db.teardown().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
#[cfg_attr(not(feature = "integration"), ignore = "enable with --features integration (requires Postgres: embedded or external)")]
async fn role_mutations_report_deltas_and_are_logged() -> Result<()> {
    let Some(db) = TestDatabase::setup().await? else {
        return Ok(());
    };
    let store = PgUserStore::new(db.pool_clone());
    let log = PgRoleChangeLog::new(db.pool_clone());

    let member = user(&unique_email("roles"), &["USER"]);
    store.insert(&member).await?;

    let grant = role_change(member.id, "AUDITOR", RoleAction::Add);
    let granted = store.change_role(&grant).await?;
    assert!(granted.changed);
    assert!(granted.user.has_role("AUDITOR"));
    let repeated = store
        .change_role(&role_change(member.id, "AUDITOR", RoleAction::Add))
        .await?;
    assert!(!repeated.changed);

    let entries = log.entries_for(member.id).await?;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].id, grant.id);
    assert_eq!(entries[0].action, RoleAction::Add);
    assert_eq!(entries[0].role, "AUDITOR");

    let revoked = store
        .change_role(&role_change(member.id, "AUDITOR", RoleAction::Remove))
        .await?;
    assert!(revoked.changed);
    assert_eq!(log.entries_for(member.id).await?.len(), 2);

    db.teardown().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
#[cfg_attr(not(feature = "integration"), ignore = "enable with --features integration (requires Postgres: embedded or external)")]
async fn refresh_tokens_are_consumed_once() -> Result<()> {
    let Some(db) = TestDatabase::setup().await? else {
        return Ok(());
    };
    let users = PgUserStore::new(db.pool_clone());
    let tokens = PgRefreshTokenStore::new(db.pool_clone());

    let owner = user(&unique_email("refresh"), &["USER"]);
    users.insert(&owner).await?;

    let now = Utc::now();
    let record = RefreshTokenRecord {
        token_id: Uuid::new_v4(),
        user_id: owner.id,
        token_hash: Uuid::new_v4().as_bytes().to_vec(),
        issued_at: now,
        expires_at: now + Duration::days(7),
    };
    tokens.insert(record.clone()).await?;

    let consumed = tokens.consume(&record.token_hash).await?;
    assert_eq!(consumed.map(|r| r.token_id), Some(record.token_id));
    assert!(tokens.consume(&record.token_hash).await?.is_none());

    let second = RefreshTokenRecord {
        token_id: Uuid::new_v4(),
        token_hash: Uuid::new_v4().as_bytes().to_vec(),
        ..record
    };
    tokens.insert(second).await?;
    assert_eq!(tokens.revoke_all_for_user(owner.id).await?, 1);

    db.teardown().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
#[cfg_attr(not(feature = "integration"), ignore = "enable with --features integration (requires Postgres: embedded or external)")]
async fn http_flow_runs_against_postgres() -> Result<()> {
    let Some(db) = TestDatabase::setup().await? else {
        return Ok(());
    };
    let app = TestApp::with_stores(Stores::postgres(db.pool_clone()));

    let email = unique_email("flow");
    app.register(&email).await;
    let session = app.login(&email, PASSWORD).await;

    let me = app
        .call(Method::GET, "/auth/me", Some(&session.token), None)
        .await;
    assert_eq!(me.status, StatusCode::OK);
    assert_eq!(me.body["email"], json!(email));

    let refreshed = app.refresh_with(Some(&session.cookie)).await;
    assert_eq!(refreshed.status, StatusCode::OK);
    let reused = app.refresh_with(Some(&session.cookie)).await;
    assert_eq!(reused.status, StatusCode::UNAUTHORIZED);

    db.teardown().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
#[cfg_attr(not(feature = "integration"), ignore = "enable with --features integration (requires Postgres: embedded or external)")]
async fn failed_audit_insert_rolls_back_the_role_change() -> Result<()> {
    let Some(db) = TestDatabase::setup().await? else {
        return Ok(());
    };
    let pool = db.pool_clone();
    let store = PgUserStore::new(pool.clone());
    let log = PgRoleChangeLog::new(pool.clone());

    let member = user(&unique_email("audit"), &["USER"]);
    store.insert(&member).await?;

    let constraint = format!("reject_{}", member.id.simple());
    sqlx::query(&format!(
        "ALTER TABLE role_change_log ADD CONSTRAINT {constraint} \
         CHECK (target_user_id <> '{}') NOT VALID",
        member.id
    ))
    .execute(&pool)
    .await?;

    let outcome = store
        .change_role(&role_change(member.id, "AUDITOR", RoleAction::Add))
        .await;

    sqlx::query(&format!(
        "ALTER TABLE role_change_log DROP CONSTRAINT {constraint}"
    ))
    .execute(&pool)
    .await?;

    assert!(matches!(outcome, Err(StoreError::Backend(_))));
    let stored = store
        .find_by_id(member.id, DeletedFilter::Exclude)
        .await?
        .expect("member present");
    assert!(!stored.has_role("AUDITOR"));
    assert!(log.entries_for(member.id).await?.is_empty());

    db.teardown().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
#[cfg_attr(not(feature = "integration"), ignore = "enable with --features integration (requires Postgres: embedded or external)")]
async fn last_admin_guard_ignores_disabled_admins() -> Result<()> {
    let Some(db) = TestDatabase::setup().await? else {
        return Ok(());
    };
    let pool = db.pool_clone();
    if active_admin_count(&pool).await? > 0 {
        eprintln!("Skipping last-admin store check: database already holds active admins");
        return db.teardown().await;
    }
    let store = PgUserStore::new(pool.clone());

    let active = user(&unique_email("active"), &["ADMIN", "USER"]);
    let mut dormant = user(&unique_email("dormant"), &["ADMIN", "USER"]);
    dormant.enabled = false;
    store.insert(&active).await?;
    store.insert(&dormant).await?;

    assert!(matches!(
        store
            .change_role(&role_change(active.id, "ADMIN", RoleAction::Remove))
            .await,
        Err(StoreError::LastAdmin)
    ));
    assert!(matches!(
        store.soft_delete(active.id, Utc::now()).await,
        Err(StoreError::LastAdmin)
    ));
    let mut disabling = active.clone();
    disabling.enabled = false;
    assert!(matches!(
        store.save(&disabling).await,
        Err(StoreError::LastAdmin)
    ));
    assert_eq!(active_admin_count(&pool).await?, 1);

    db.teardown().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
#[cfg_attr(not(feature = "integration"), ignore = "enable with --features integration (requires Postgres: embedded or external)")]
async fn refresh_insert_purges_expired_and_revoke_is_owner_scoped() -> Result<()> {
    let Some(db) = TestDatabase::setup().await? else {
        return Ok(());
    };
    let users = PgUserStore::new(db.pool_clone());
    let tokens = PgRefreshTokenStore::new(db.pool_clone());

    let owner = user(&unique_email("purge"), &["USER"]);
    users.insert(&owner).await?;

    let now = Utc::now();
    let stale = RefreshTokenRecord {
        token_id: Uuid::new_v4(),
        user_id: owner.id,
        token_hash: Uuid::new_v4().as_bytes().to_vec(),
        issued_at: now - Duration::days(8),
        expires_at: now - Duration::days(1),
    };
    tokens.insert(stale.clone()).await?;
    let fresh = RefreshTokenRecord {
        token_id: Uuid::new_v4(),
        token_hash: Uuid::new_v4().as_bytes().to_vec(),
        issued_at: now,
        expires_at: now + Duration::days(7),
        ..stale.clone()
    };
    tokens.insert(fresh.clone()).await?;

    assert!(tokens.consume(&stale.token_hash).await?.is_none());

    assert!(!tokens.revoke(&fresh.token_hash, Uuid::new_v4()).await?);
    assert!(tokens.revoke(&fresh.token_hash, owner.id).await?);
    assert!(!tokens.revoke(&fresh.token_hash, owner.id).await?);

    db.teardown().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[cfg_attr(not(feature = "integration"), ignore = "enable with --features integration (requires Postgres: embedded or external)")]
async fn admins_demoting_each_other_never_deadlock() -> Result<()> {
    let Some(db) = TestDatabase::setup().await? else {
        return Ok(());
    };
    let pool = db.pool_clone();
    let app = Arc::new(TestApp::with_stores(Stores::postgres(pool.clone())));
    let preexisting = active_admin_count(&pool).await?;

    for round in 0..4 {
        let first = app.admin(&unique_email(&format!("demote-a{round}"))).await;
        let second = app.admin(&unique_email(&format!("demote-b{round}"))).await;

        let demote = |actor: String, target: Uuid| {
            let app = app.clone();
            tokio::spawn(async move {
                app.call(
                    Method::DELETE,
                    &format!("/users/{target}/roles"),
                    Some(&actor),
                    Some(json!({ "role": "ADMIN" })),
                )
                .await
                .status
            })
        };
        let a = demote(first.token.clone(), second.user_id);
        let b = demote(second.token.clone(), first.user_id);
        let statuses = [a.await?, b.await?];

        assert!(
            statuses
                .iter()
                .all(|status| *status == StatusCode::OK || *status == StatusCode::BAD_REQUEST),
            "{statuses:?}"
        );
        if preexisting == 0 && round == 0 {
            assert_eq!(
                statuses.iter().filter(|s| **s == StatusCode::OK).count(),
                1,
                "{statuses:?}"
            );
        }
        assert!(active_admin_count(&pool).await? >= 1);
    }

    db.teardown().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[cfg_attr(not(feature = "integration"), ignore = "enable with --features integration (requires Postgres: embedded or external)")]
async fn admins_deleting_each_other_never_deadlock() -> Result<()> {
    let Some(db) = TestDatabase::setup().await? else {
        return Ok(());
    };
    let pool = db.pool_clone();
    let app = Arc::new(TestApp::with_stores(Stores::postgres(pool.clone())));
    let preexisting = active_admin_count(&pool).await?;

    let first = app.admin(&unique_email("delete-a")).await;
    let second = app.admin(&unique_email("delete-b")).await;

    let delete = |actor: String, target: Uuid| {
        let app = app.clone();
        tokio::spawn(async move {
            app.call(Method::DELETE, &format!("/users/{target}"), Some(&actor), None)
                .await
                .status
        })
    };
    let a = delete(first.token.clone(), second.user_id);
    let b = delete(second.token.clone(), first.user_id);
    let statuses = [a.await?, b.await?];

    assert!(
        statuses
            .iter()
            .all(|status| *status == StatusCode::NO_CONTENT || *status == StatusCode::BAD_REQUEST),
        "{statuses:?}"
    );
    if preexisting == 0 {
        assert_eq!(
            statuses
                .iter()
                .filter(|s| **s == StatusCode::NO_CONTENT)
                .count(),
            1,
            "{statuses:?}"
        );
    }
    assert!(active_admin_count(&pool).await? >= 1);

    db.teardown().await?;
    Ok(())
}
