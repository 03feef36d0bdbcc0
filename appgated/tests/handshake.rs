mod common;

use appgate_protocol::session::{mint_app_session_token, mint_privileged_session_token};
use appgate_protocol::ErrorCode;
use chrono::Duration;
use common::*;
use serde_json::json;

fn connect_line(app: &str, instance: &str, token: &str) -> String {
    json!({ "appIdentifier": app, "instanceId": instance, "token": token }).to_string()
}

fn gallery_token() -> String {
    mint_app_session_token(GALLERY_PRIVATE, "gallery", Duration::minutes(5)).unwrap()
}

async fn rejected(h: &Harness, line: &str) -> ErrorCode {
    match h.gateway.accept(line).await {
        Ok((caller, _)) => panic!("handshake unexpectedly accepted {caller:?}"),
        Err(err) => err.code(),
    }
}

#[tokio::test]
async fn privileged_app_signs_with_core_secret() {
    let h = harness().await;
    let token = mint_privileged_session_token(CORE_SECRET, "core", Duration::minutes(5)).unwrap();

    let (caller, response) = h
        .gateway
        .accept(&connect_line("core", "pool-1", &token))
        .await
        .unwrap();
    assert!(caller.privileged);
    assert_eq!(response.handler_id, "core:pool-1");
    assert_eq!(response.daemon_version, appgated::DAEMON_VERSION);
}

#[tokio::test]
async fn apps_sign_with_their_own_key() {
    let h = harness().await;
    let (caller, response) = h
        .gateway
        .accept(&connect_line("gallery", "ui", &gallery_token()))
        .await
        .unwrap();
    assert!(!caller.privileged);
    assert_eq!(response.handler_id, "gallery:ui");
}

#[tokio::test]
async fn foreign_keys_and_secrets_are_refused() {
    let h = harness().await;

    let rogue = mint_app_session_token(ROGUE_PRIVATE, "gallery", Duration::minutes(5)).unwrap();
    assert_eq!(
        rejected(&h, &connect_line("gallery", "ui", &rogue)).await,
        ErrorCode::Unauthorized
    );

    // An HS256 token is never accepted for an app that registered a key.
    let shared =
        mint_privileged_session_token(CORE_SECRET, "gallery", Duration::minutes(5)).unwrap();
    assert_eq!(
        rejected(&h, &connect_line("gallery", "ui", &shared)).await,
        ErrorCode::Unauthorized
    );

    // Signed by gallery, presented as core.
    assert_eq!(
        rejected(&h, &connect_line("core", "ui", &gallery_token())).await,
        ErrorCode::Unauthorized
    );
}

#[tokio::test]
async fn expired_session_tokens_are_refused() {
    let h = harness().await;
    let stale = mint_app_session_token(GALLERY_PRIVATE, "gallery", Duration::hours(-2)).unwrap();
    assert_eq!(
        rejected(&h, &connect_line("gallery", "ui", &stale)).await,
        ErrorCode::Unauthorized
    );
}

#[tokio::test]
async fn unknown_apps_and_bad_instances_are_refused() {
    let h = harness().await;
    assert_eq!(
        rejected(&h, &connect_line("ghost", "ui", &gallery_token())).await,
        ErrorCode::NotFound
    );
    assert_eq!(
        rejected(&h, &connect_line("gallery", "a:b", &gallery_token())).await,
        ErrorCode::BadRequest
    );
    assert_eq!(rejected(&h, "not json").await, ErrorCode::BadRequest);
}

#[tokio::test]
async fn pinned_app_version_must_match() {
    let mut config = config();
    config.daemon.expected_app_version = Some("2.0.0".into());
    let h = harness_with(config).await;

    let mut request = json!({
        "appIdentifier": "gallery",
        "instanceId": "ui",
        "token": gallery_token(),
        "version": "1.9.0"
    });
    assert_eq!(
        rejected(&h, &request.to_string()).await,
        ErrorCode::BadRequest
    );

    request["version"] = json!("2.0.0");
    assert!(h.gateway.accept(&request.to_string()).await.is_ok());
}

#[tokio::test]
async fn apps_without_a_public_key_cannot_connect() {
    let h = harness().await;
    let token = mint_app_session_token(GALLERY_PRIVATE, "notes", Duration::minutes(5)).unwrap();
    assert_eq!(
        rejected(&h, &connect_line("notes", "ui", &token)).await,
        ErrorCode::Unauthorized
    );
}

#[tokio::test]
async fn non_json_lines_after_handshake_get_an_error_frame() {
    let h = harness().await;
    let response = h.gateway.handle_line(&gallery("ui"), "{oops").await;
    assert!(response.id.is_none());
    assert_eq!(response.error.unwrap().code, ErrorCode::BadRequest);
}
