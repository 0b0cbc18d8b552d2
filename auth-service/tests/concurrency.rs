mod support;

use std::sync::Arc;

use axum::http::{Method, StatusCode};
use serde_json::json;
use support::{TestApp, PASSWORD};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_registrations_of_one_email_yield_a_single_account() {
    let app = Arc::new(TestApp::new());

    let mut handles = Vec::new();
    for i in 0..16 {
        let app = app.clone();
        handles.push(tokio::spawn(async move {
            // Mixed case on purpose: identities compare case-insensitively.
            let email = if i % 2 == 0 {
                "race@example.com"
            } else {
                "RACE@example.com"
            };
            app.call(
                Method::POST,
                "/users",
                None,
                Some(json!({ "email": email, "password": PASSWORD })),
            )
            .await
            .status
        }));
    }

    let mut created = 0;
    let mut conflicts = 0;
    for handle in handles {
        match handle.await.expect("task") {
            StatusCode::CREATED => created += 1,
            StatusCode::CONFLICT => conflicts += 1,
            other => panic!("unexpected status {other}"),
        }
    }
    assert_eq!(created, 1);
    assert_eq!(conflicts, 15);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_grants_of_one_role_are_logged_once() {
    let app = Arc::new(TestApp::new());
    let admin = app.admin("root@example.com").await;
    let member = app.register_and_login("target@example.com").await;
    let uri = format!("/users/{}/roles", member.user_id);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let app = app.clone();
        let uri = uri.clone();
        let token = admin.token.clone();
        handles.push(tokio::spawn(async move {
            app.call(
                Method::POST,
                &uri,
                Some(&token),
                Some(json!({ "role": "AUDITOR" })),
            )
            .await
            .status
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.expect("task"), StatusCode::OK);
    }

    let history = app
        .call(
            Method::GET,
            &format!("/users/{}/role-changes", member.user_id),
            Some(&admin.token),
            None,
        )
        .await;
    assert_eq!(history.body.as_array().expect("entries").len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_admins_demoting_each_other_leave_one_admin() {
    let app = Arc::new(TestApp::new());
    let first = app.admin("first@example.com").await;
    let second = app.admin("second@example.com").await;

    let a = {
        let app = app.clone();
        let token = first.token.clone();
        let uri = format!("/users/{}/roles", second.user_id);
        tokio::spawn(async move {
            app.call(Method::DELETE, &uri, Some(&token), Some(json!({ "role": "ADMIN" })))
                .await
                .status
        })
    };
    let b = {
        let app = app.clone();
        let token = second.token.clone();
        let uri = format!("/users/{}/roles", first.user_id);
        tokio::spawn(async move {
            app.call(Method::DELETE, &uri, Some(&token), Some(json!({ "role": "ADMIN" })))
                .await
                .status
        })
    };

    let statuses = [a.await.expect("task"), b.await.expect("task")];
    assert_eq!(
        statuses.iter().filter(|s| **s == StatusCode::OK).count(),
        1,
        "{statuses:?}"
    );
    assert!(statuses.contains(&StatusCode::BAD_REQUEST));

    let admins = app
        .state
        .users
        .list(
            &auth_service::authorization::Identity::new(first.user_id, vec!["ADMIN".into()]),
            Default::default(),
        )
        .await
        .expect("list")
        .into_iter()
        .filter(|user| user.is_admin())
        .count();
    assert_eq!(admins, 1);
}
