use httptest::matchers::{all_of, contains, key, request, url_decoded};
use httptest::responders::status_code;
use httptest::{Expectation, Server};
use secrecy::SecretString;
use serde_json::json;
use tempfile::tempdir;

use parcelapp_data::{AddOptions, AppConfig, ComplaintStatus, ParcelApp, SubmitOutcome};

const SKIP: AddOptions = AddOptions {
    skip_background_submit: true,
};

fn remote_config(server: &Server) -> AppConfig {
    AppConfig {
        remote_url: Some(server.url_str("/")),
        remote_api_key: Some(SecretString::from("anon-key".to_string())),
        remote_timeout_secs: 5,
        ..AppConfig::default()
    }
}

#[tokio::test]
async fn insert_then_update_uses_backend_id_from_location() {
    let server = Server::run();
    server.expect(
        Expectation::matching(all_of!(
            request::method_path("POST", "/rest/v1/complaints"),
            request::headers(contains(key("apikey"))),
            request::headers(contains(key("authorization"))),
            request::headers(contains(key("prefer")))
        ))
        .times(1)
        .respond_with(
            status_code(201).append_header("Location", "/rest/v1/complaints?id=eq.remote-9"),
        ),
    );
    server.expect(
        Expectation::matching(all_of!(
            request::method_path("PATCH", "/rest/v1/complaints"),
            request::query(url_decoded(contains(("id", "eq.remote-9"))))
        ))
        .times(1)
        .respond_with(status_code(204)),
    );

    let dir = tempdir().unwrap();
    let app = ParcelApp::initialize(remote_config(&server), dir.path()).unwrap();
    let complaints = app.complaints();

    let id = complaints
        .add_complaint(json!({"parcel_number": "0522010200001", "motif": "bornage"}), SKIP)
        .unwrap();
    let outcome = complaints.try_remote_submit(&id).await;
    assert_eq!(
        outcome,
        SubmitOutcome::Sent {
            backend_id: Some("remote-9".into())
        }
    );

    complaints
        .update_complaint(&id, json!({"parcel_number": "0522010200001", "motif": "limites"}), SKIP)
        .unwrap();
    assert!(complaints.try_remote_submit(&id).await.is_sent());

    let stored = complaints.get_complaint(&id).unwrap();
    assert!(stored.sent_remote);
    assert_eq!(stored.status, ComplaintStatus::Validated);
    assert_eq!(stored.backend_id.as_deref(), Some("remote-9"));
    app.shutdown().await;
}

#[tokio::test]
async fn conflict_on_insert_counts_as_sent() {
    let server = Server::run();
    server.expect(
        Expectation::matching(request::method_path("POST", "/rest/v1/complaints"))
            .times(1)
            .respond_with(status_code(409).body(r#"{"code":"23505"}"#)),
    );

    let dir = tempdir().unwrap();
    let app = ParcelApp::initialize(remote_config(&server), dir.path()).unwrap();
    let id = app
        .complaints()
        .add_complaint(json!({"parcel_number": "0522010200002"}), SKIP)
        .unwrap();

    let outcome = app.complaints().try_remote_submit(&id).await;
    assert_eq!(outcome, SubmitOutcome::Sent { backend_id: Some(id.clone()) });
    let stored = app.complaints().get_complaint(&id).unwrap();
    assert!(stored.sent_remote);
    assert!(stored.remote_response.unwrap().starts_with("409"));
}

#[tokio::test]
async fn rejected_requests_leave_the_complaint_pending() {
    let server = Server::run();
    server.expect(
        Expectation::matching(request::method_path("POST", "/rest/v1/complaints"))
            .times(2)
            .respond_with(status_code(401).body("new row violates row-level security policy")),
    );

    let dir = tempdir().unwrap();
    let app = ParcelApp::initialize(remote_config(&server), dir.path()).unwrap();
    let id = app
        .complaints()
        .add_complaint(json!({"parcel_number": "0522010200003"}), SKIP)
        .unwrap();

    let outcome = app.complaints().try_remote_submit(&id).await;
    assert!(matches!(outcome, SubmitOutcome::Failed { .. }));
    let stored = app.complaints().get_complaint(&id).unwrap();
    assert!(!stored.sent_remote);
    assert_eq!(stored.status, ComplaintStatus::Pending);
    assert!(stored
        .remote_response
        .unwrap()
        .contains("row-level security"));

    let summary = app.complaints().retry_unsent_complaints().await;
    assert_eq!(summary.attempted, 1);
    assert_eq!(summary.failed, 1);
}

#[tokio::test]
async fn background_worker_submits_new_complaints() {
    let server = Server::run();
    server.expect(
        Expectation::matching(request::method_path("POST", "/rest/v1/complaints"))
            .times(1)
            .respond_with(status_code(201)),
    );

    let dir = tempdir().unwrap();
    let app = ParcelApp::initialize(remote_config(&server), dir.path()).unwrap();
    assert!(app.start_background_sync());
    assert!(app.health().background_sync);

    let id = app
        .complaints()
        .add_complaint(json!({"parcel_number": "0522010200004"}), AddOptions::default())
        .unwrap();
    let mut sent = false;
    for _ in 0..100 {
        if app.complaints().get_complaint(&id).map_or(false, |c| c.sent_remote) {
            sent = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert!(sent);
    app.shutdown().await;
}

#[tokio::test]
async fn unopenable_database_routes_complaints_to_the_fallback_file() {
    let dir = tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("blocked.db")).unwrap();
    let config = AppConfig {
        database_file_name: "blocked.db".into(),
        ..AppConfig::default()
    };
    let app = ParcelApp::initialize(config, dir.path()).unwrap();
    assert!(!app.database_available());
    assert!(!app.start_background_sync());

    let id = app
        .complaints()
        .add_complaint(json!({"parcel_number": "0522010200005"}), AddOptions::default())
        .unwrap();
    assert_eq!(app.complaints().count_complaints(), 1);
    assert_eq!(
        app.complaints().get_complaint(&id).unwrap().parcel_number.as_deref(),
        Some("0522010200005")
    );
    assert!(dir.path().join("complaints_fallback.json").exists());
    assert_eq!(
        app.complaints().try_remote_submit(&id).await,
        SubmitOutcome::NotConfigured
    );
    assert!(app.repository().stats().is_err());
    assert!(app.search().search("0522", Default::default()).rows.is_empty());
}
