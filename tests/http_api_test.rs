//! HTTP surface tests against an in-memory state.
//!
//! Run: cargo test --test http_api_test

mod common;

use actix_web::{http::StatusCode, test, web, App};
use common::{TestApp, ADA, BEN, CY};
use edu_chat_service::{middleware::guards::USER_ID_HEADER, routes};
use serde_json::{json, Value};

macro_rules! init_app {
    ($state:expr) => {
        test::init_service(
            App::new()
                .app_data(web::Data::new($state.clone()))
                .configure(routes::configure),
        )
        .await
    };
}

fn as_user(req: test::TestRequest, user: i64) -> test::TestRequest {
    req.insert_header((USER_ID_HEADER, user.to_string()))
}

#[actix_web::test]
async fn requests_without_identity_are_rejected() {
    let fixture = TestApp::new();
    let app = init_app!(fixture.state);

    let resp = test::call_service(
        &app,
        test::TestRequest::get().uri("/chat/conversations").to_request(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["code"], "UNAUTHORIZED");
}

#[actix_web::test]
async fn private_message_reaches_the_peer_and_shows_in_history() {
    let fixture = TestApp::new();
    let app = init_app!(fixture.state);
    let (_, mut ben_rx) = fixture.state.registry.register(BEN).await;

    let req = as_user(test::TestRequest::post().uri("/chat/privates"), ADA)
        .set_json(json!({ "targetUserId": BEN }))
        .to_request();
    let conv: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(conv["type"], "private");
    assert_eq!(conv["name"], "Ben");
    let conv_id = conv["id"].as_str().unwrap_or_default().to_string();

    let req = as_user(
        test::TestRequest::post().uri(&format!("/chat/conversations/{conv_id}/messages")),
        ADA,
    )
    .set_json(json!({ "type": "text", "content": "see you in class", "clientMsgId": "c-7" }))
    .to_request();
    let sent: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(sent["content"], "see you in class");
    assert_eq!(sent["senderId"], ADA);

    let frame = ben_rx.try_recv().unwrap();
    let event: Value = serde_json::from_str(&frame).unwrap();
    assert_eq!(event["type"], "NEW_MESSAGE");
    assert_eq!(event["data"]["clientMsgId"], "c-7");

    let req = as_user(
        test::TestRequest::get().uri(&format!("/chat/conversations/{conv_id}/messages")),
        BEN,
    )
    .to_request();
    let history: Value = test::call_and_read_body_json(&app, req).await;
    let first = &history[0];
    assert_eq!(first["content"], "see you in class");
    assert_eq!(first["isRead"], true);
    assert_eq!(first["canRevoke"], false);

    let req = as_user(
        test::TestRequest::get().uri(&format!("/chat/conversations/{conv_id}/messages")),
        CY,
    )
    .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
}

#[actix_web::test]
async fn malformed_conversation_id_is_not_a_server_error() {
    let fixture = TestApp::new();
    let app = init_app!(fixture.state);

    let req = as_user(
        test::TestRequest::get().uri("/chat/conversations/not-a-uuid/messages"),
        ADA,
    )
    .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_client_error());
}

#[actix_web::test]
async fn friend_request_accept_is_terminal() {
    let fixture = TestApp::new();
    let app = init_app!(fixture.state);

    let req = as_user(test::TestRequest::post().uri("/chat/friend-requests"), ADA)
        .set_json(json!({ "receiverId": BEN, "message": "study group?" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let created: Value = test::read_body_json(resp).await;
    let request_id = created["id"].as_str().unwrap_or_default().to_string();
    assert_eq!(created["status"], "pending");

    let uri = format!("/chat/friend-requests/{request_id}");
    let req = as_user(test::TestRequest::put().uri(&uri), ADA)
        .set_json(json!({ "action": "accept" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let req = as_user(test::TestRequest::put().uri(&uri), BEN)
        .set_json(json!({ "action": "accept" }))
        .to_request();
    let accepted: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(accepted["status"], "accepted");

    let req = as_user(test::TestRequest::put().uri(&uri), BEN)
        .set_json(json!({ "action": "reject" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::CONFLICT);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["code"], "ALREADY_HANDLED");

    let req = as_user(test::TestRequest::get().uri("/chat/friends"), ADA).to_request();
    let friends: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(friends[0]["id"], BEN);
    assert_eq!(friends[0]["isOnline"], false);
}

#[actix_web::test]
async fn group_permissions_are_enforced() {
    let fixture = TestApp::new();
    let app = init_app!(fixture.state);

    let req = as_user(test::TestRequest::post().uri("/chat/groups"), ADA)
        .set_json(json!({ "name": "Debate club", "memberIds": [BEN, CY] }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let group: Value = test::read_body_json(resp).await;
    let group_id = group["id"].as_str().unwrap_or_default().to_string();

    let req = as_user(
        test::TestRequest::post().uri(&format!("/chat/conversations/{group_id}/leave")),
        ADA,
    )
    .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::CONFLICT);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["code"], "ADMIN_MUST_TRANSFER_OR_DISBAND");

    let req = as_user(
        test::TestRequest::delete().uri(&format!("/chat/conversations/{group_id}/members/{CY}")),
        BEN,
    )
    .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let req = as_user(
        test::TestRequest::get().uri(&format!("/chat/conversations/{group_id}/members?page=1&limit=2")),
        BEN,
    )
    .to_request();
    let members: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(members["total"], 3);
    assert_eq!(members["items"].as_array().map(Vec::len), Some(2));
}
