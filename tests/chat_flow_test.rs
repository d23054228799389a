//! Service-level flows across messaging, groups and read receipts.
//!
//! Run: cargo test --test chat_flow_test

mod common;

use common::{TestApp, ADA, BEN, CY, DEE};
use edu_chat_service::{
    error::AppError,
    models::{MemberRole, MessageKind, Page, UserId},
    services::{
        group_service::CreateGroup,
        messaging::{HistoryQuery, SendMessage},
    },
    websocket::{ChatEvent, Recipients},
};
use std::time::Duration;
use uuid::Uuid;

fn text(content: &str, client_msg_id: Option<&str>) -> SendMessage {
    SendMessage {
        kind: MessageKind::Text,
        content: content.into(),
        client_msg_id: client_msg_id.map(str::to_string),
    }
}

async fn private_chat(app: &TestApp, a: UserId, b: UserId) -> Uuid {
    app.state
        .messaging
        .get_or_create_private_chat(a, b)
        .await
        .unwrap()
        .id
}

async fn send(app: &TestApp, sender: UserId, conv: Uuid, content: &str) -> Uuid {
    app.state
        .messaging
        .send_message(sender, conv, text(content, None))
        .await
        .unwrap()
        .value
        .id
}

#[tokio::test]
async fn revoke_is_allowed_until_the_window_closes() {
    let app = TestApp::new();
    let conv = private_chat(&app, ADA, BEN).await;

    let early = send(&app, ADA, conv, "typo").await;
    app.clock.advance_seconds(119);
    let revoked = app
        .state
        .messaging
        .revoke_message(ADA, early)
        .await
        .unwrap();
    assert!(revoked.value.is_revoked);
    assert_eq!(revoked.notifications.len(), 1);

    let late = send(&app, ADA, conv, "too late").await;
    app.clock.advance_seconds(121);
    assert_eq!(
        app.state.messaging.revoke_message(ADA, late).await.unwrap_err(),
        AppError::RevokeWindowExpired { window_secs: 120 }
    );
}

#[tokio::test]
async fn only_the_sender_can_revoke() {
    let app = TestApp::new();
    let conv = private_chat(&app, ADA, BEN).await;
    let msg = send(&app, ADA, conv, "mine").await;

    assert_eq!(
        app.state.messaging.revoke_message(BEN, msg).await.unwrap_err(),
        AppError::PermissionDenied
    );
}

#[tokio::test]
async fn resending_a_client_message_id_returns_the_stored_message() {
    let app = TestApp::new();
    let conv = private_chat(&app, ADA, BEN).await;

    let first = app
        .state
        .messaging
        .send_message(ADA, conv, text("hello", Some("c-1")))
        .await
        .unwrap();
    app.clock.advance_seconds(3);
    let retry = app
        .state
        .messaging
        .send_message(ADA, conv, text("hello", Some("c-1")))
        .await
        .unwrap();

    assert_eq!(first.value.id, retry.value.id);
    assert_eq!(first.notifications.len(), 1);
    assert!(retry.notifications.is_empty());

    let history = app
        .state
        .messaging
        .get_history(BEN, conv, HistoryQuery::default())
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
}

#[tokio::test]
async fn private_chat_is_shared_in_either_direction() {
    let app = TestApp::new();
    let forward = private_chat(&app, ADA, BEN).await;
    let backward = private_chat(&app, BEN, ADA).await;
    assert_eq!(forward, backward);

    let view = app
        .state
        .messaging
        .get_or_create_private_chat(BEN, ADA)
        .await
        .unwrap();
    assert_eq!(view.name, "Ada");
    assert_eq!(view.peer_id, Some(ADA));
}

#[tokio::test]
async fn outsiders_cannot_read_or_write() {
    let app = TestApp::new();
    let conv = private_chat(&app, ADA, BEN).await;

    assert_eq!(
        app.state
            .messaging
            .send_message(CY, conv, text("hi", None))
            .await
            .unwrap_err(),
        AppError::NotMember
    );
    assert_eq!(
        app.state
            .messaging
            .get_history(CY, conv, HistoryQuery::default())
            .await
            .unwrap_err(),
        AppError::NotMember
    );
}

#[tokio::test]
async fn read_pointer_never_moves_backwards() {
    let app = TestApp::new();
    let conv = private_chat(&app, ADA, BEN).await;
    let first = send(&app, ADA, conv, "one").await;
    app.clock.advance_seconds(1);
    let second = send(&app, ADA, conv, "two").await;

    let moved = app
        .state
        .messaging
        .mark_as_read(BEN, conv, second)
        .await
        .unwrap();
    assert!(moved.value);
    assert_eq!(moved.notifications[0].recipients, Recipients::Users(vec![ADA]));

    let back = app
        .state
        .messaging
        .mark_as_read(BEN, conv, first)
        .await
        .unwrap();
    assert!(!back.value);
    assert!(back.notifications.is_empty());

    let history = app
        .state
        .messaging
        .get_history(ADA, conv, HistoryQuery::default())
        .await
        .unwrap();
    assert!(history.iter().all(|m| m.read_count == 1 && m.is_read));
}

#[tokio::test]
async fn group_lifecycle_with_receipts_and_handover() {
    let app = TestApp::new();
    let created = app
        .state
        .groups
        .create_group(
            ADA,
            CreateGroup {
                name: "Physics 101".into(),
                member_ids: vec![BEN, CY],
            },
        )
        .await
        .unwrap();
    let conv = created.value.id;
    assert_eq!(created.notifications.len(), 1);

    app.clock.advance_seconds(1);
    let hi = app
        .state
        .messaging
        .send_message(ADA, conv, text("hi", Some("m1")))
        .await
        .unwrap()
        .value;

    app.clock.advance_seconds(1);
    let read = app
        .state
        .messaging
        .mark_as_read(BEN, conv, hi.id)
        .await
        .unwrap();
    assert!(read.value);

    let history = app
        .state
        .messaging
        .get_history(ADA, conv, HistoryQuery::default())
        .await
        .unwrap();
    let view = history
        .iter()
        .find(|m| m.message.id == hi.id)
        .unwrap_or_else(|| panic!("sent message missing from history"));
    assert_eq!(view.read_count, 1);
    assert!(view.is_read);
    assert!(view.can_revoke);
    assert_eq!(history[0].message.kind, MessageKind::System);
    assert_eq!(history[0].message.content, "Ada created the group");

    app.state
        .groups
        .transfer_admin(ADA, conv, BEN)
        .await
        .unwrap();
    let left = app.state.groups.leave_group(ADA, conv).await.unwrap();
    assert!(!left.notifications.is_empty());

    let members = app
        .state
        .groups
        .get_members(BEN, conv, None, Page::default())
        .await
        .unwrap();
    let mut ids: Vec<UserId> = members.items.iter().map(|m| m.user_id).collect();
    ids.sort_unstable();
    assert_eq!(ids, vec![BEN, CY]);
    let admins: Vec<UserId> = members
        .items
        .iter()
        .filter(|m| m.role == MemberRole::Admin)
        .map(|m| m.user_id)
        .collect();
    assert_eq!(admins, vec![BEN]);

    let history = app
        .state
        .messaging
        .get_history(BEN, conv, HistoryQuery::default())
        .await
        .unwrap();
    assert_eq!(
        history.last().map(|m| m.message.content.as_str()),
        Some("Ada left the group")
    );
}

#[tokio::test]
async fn admin_must_hand_over_before_leaving() {
    let app = TestApp::new();
    let conv = app
        .state
        .groups
        .create_group(
            ADA,
            CreateGroup {
                name: "Chemistry".into(),
                member_ids: vec![BEN],
            },
        )
        .await
        .unwrap()
        .value
        .id;

    assert_eq!(
        app.state.groups.leave_group(ADA, conv).await.unwrap_err(),
        AppError::AdminMustTransferOrDisband
    );
}

#[tokio::test]
async fn context_is_clipped_at_conversation_edges() {
    let app = TestApp::new();
    let conv = private_chat(&app, ADA, BEN).await;
    let mut ids = Vec::new();
    for i in 0..5 {
        ids.push(send(&app, ADA, conv, &format!("line {i}")).await);
        app.clock.advance_seconds(1);
    }

    let head = app
        .state
        .messaging
        .get_message_context(BEN, ids[0], Some(4))
        .await
        .unwrap();
    assert_eq!(
        head.iter().map(|m| m.message.id).collect::<Vec<_>>(),
        vec![ids[0], ids[1], ids[2]]
    );

    let tail = app
        .state
        .messaging
        .get_message_context(BEN, ids[4], Some(4))
        .await
        .unwrap();
    assert_eq!(
        tail.iter().map(|m| m.message.id).collect::<Vec<_>>(),
        vec![ids[3], ids[4]]
    );
}

async fn six_lines(app: &TestApp, conv: Uuid) -> Vec<Uuid> {
    let mut ids = Vec::new();
    for i in 0..6 {
        ids.push(send(app, ADA, conv, &format!("Msg{i}")).await);
        app.clock.advance_seconds(1);
    }
    ids
}

async fn history(app: &TestApp, viewer: UserId, conv: Uuid, query: HistoryQuery) -> Vec<String> {
    app.state
        .messaging
        .get_history(viewer, conv, query)
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.message.content)
        .collect()
}

#[tokio::test]
async fn history_cursors_page_around_a_message() {
    let app = TestApp::new();
    let conv = private_chat(&app, ADA, BEN).await;
    let ids = six_lines(&app, conv).await;

    let before = HistoryQuery {
        before_id: Some(ids[4]),
        limit: Some(2),
        ..Default::default()
    };
    assert_eq!(history(&app, BEN, conv, before).await, vec!["Msg2", "Msg3"]);

    let after = HistoryQuery {
        after_id: Some(ids[1]),
        limit: Some(2),
        ..Default::default()
    };
    assert_eq!(history(&app, BEN, conv, after).await, vec!["Msg2", "Msg3"]);

    let seq_of_msg3 = app
        .state
        .messaging
        .get_history(BEN, conv, HistoryQuery::default())
        .await
        .unwrap()[3]
        .message
        .seq;
    let gap = HistoryQuery {
        after_seq: Some(seq_of_msg3),
        ..Default::default()
    };
    assert_eq!(history(&app, BEN, conv, gap).await, vec!["Msg4", "Msg5"]);
}

#[tokio::test]
async fn history_offset_counts_from_the_newest_end() {
    let app = TestApp::new();
    let conv = private_chat(&app, ADA, BEN).await;
    six_lines(&app, conv).await;

    let newest = HistoryQuery {
        limit: Some(2),
        ..Default::default()
    };
    assert_eq!(history(&app, BEN, conv, newest).await, vec!["Msg4", "Msg5"]);

    let skipped = HistoryQuery {
        limit: Some(2),
        offset: 1,
        ..Default::default()
    };
    assert_eq!(history(&app, BEN, conv, skipped).await, vec!["Msg3", "Msg4"]);

    let past_the_start = HistoryQuery {
        limit: Some(2),
        offset: 10,
        ..Default::default()
    };
    assert!(history(&app, BEN, conv, past_the_start).await.is_empty());
}

#[tokio::test]
async fn history_query_ignores_case_and_skips_revoked_messages() {
    let app = TestApp::new();
    let conv = private_chat(&app, ADA, BEN).await;
    let ids = six_lines(&app, conv).await;

    let one = HistoryQuery {
        query: Some("mSG3".into()),
        ..Default::default()
    };
    assert_eq!(history(&app, BEN, conv, one).await, vec!["Msg3"]);

    app.state.messaging.revoke_message(ADA, ids[5]).await.unwrap();

    let revoked = HistoryQuery {
        query: Some("msg5".into()),
        ..Default::default()
    };
    assert!(history(&app, BEN, conv, revoked).await.is_empty());

    let all = HistoryQuery {
        query: Some("MSG".into()),
        ..Default::default()
    };
    assert_eq!(history(&app, BEN, conv, all).await.len(), 5);

    // without a query the revoked message stays in the timeline
    assert_eq!(history(&app, BEN, conv, HistoryQuery::default()).await.len(), 6);
}

#[tokio::test(start_paused = true)]
async fn friends_and_group_peers_see_presence_changes() {
    let app = TestApp::new();
    let request = app
        .state
        .friendships
        .send_friend_request(ADA, BEN, "")
        .await
        .unwrap();
    app.state
        .friendships
        .handle_friend_request(request.id, BEN, true)
        .await
        .unwrap();
    app.state
        .groups
        .create_group(
            ADA,
            CreateGroup {
                name: "Lab".into(),
                member_ids: vec![CY],
            },
        )
        .await
        .unwrap();

    let registry = &app.state.registry;
    let (_, mut ben) = registry.register(BEN).await;
    let (_, mut cy) = registry.register(CY).await;
    let (_, mut dee) = registry.register(DEE).await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    // Ben and Cy are related to each other only through Ada
    while ben.try_recv().is_ok() {}
    while cy.try_recv().is_ok() {}

    let (ada_conn, _ada) = registry.register(ADA).await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    for rx in [&mut ben, &mut cy] {
        let frame = rx.try_recv().unwrap();
        assert!(frame.contains(r#""type":"USER_STATUS""#));
        assert!(frame.contains(r#""userId":1"#));
        assert!(frame.contains(r#""status":"online""#));
    }
    assert!(dee.try_recv().is_err());

    let friends = app.state.friendships.get_friends(BEN, None).await.unwrap();
    assert!(friends[0].is_online);

    registry.unregister(ADA, ada_conn).await;
    tokio::time::sleep(Duration::from_secs(6)).await;
    for rx in [&mut ben, &mut cy] {
        let frame = rx.try_recv().unwrap();
        assert!(frame.contains(r#""status":"offline""#));
    }
    assert!(dee.try_recv().is_err());
    let friends = app.state.friendships.get_friends(BEN, None).await.unwrap();
    assert!(!friends[0].is_online);
}

#[tokio::test]
async fn disband_notifies_every_member_it_removed() {
    let app = TestApp::new();
    let conv = app
        .state
        .groups
        .create_group(
            ADA,
            CreateGroup {
                name: "Biology".into(),
                member_ids: vec![BEN, CY],
            },
        )
        .await
        .unwrap()
        .value
        .id;

    let (_, mut ben_rx) = app.state.registry.register(BEN).await;
    let (_, mut dee_rx) = app.state.registry.register(DEE).await;

    let outcome = app.state.groups.disband_group(ADA, conv).await.unwrap();
    let mut recipients = outcome.notifications[0].recipient_ids().to_vec();
    recipients.sort_unstable();
    assert_eq!(recipients, vec![ADA, BEN, CY]);
    assert_eq!(
        outcome.notifications[0].event,
        ChatEvent::GroupDisbanded {
            conversation_id: conv
        }
    );

    app.state.registry.dispatch(outcome.notifications).await;
    let frame = ben_rx.try_recv().unwrap();
    assert!(frame.contains("GROUP_DISBANDED"));
    assert!(dee_rx.try_recv().is_err());

    assert_eq!(
        app.state
            .messaging
            .get_history(BEN, conv, HistoryQuery::default())
            .await
            .unwrap_err(),
        AppError::NotFound("conversation")
    );
}

#[tokio::test]
async fn hidden_conversation_returns_with_the_next_message() {
    let app = TestApp::new();
    let conv = private_chat(&app, ADA, BEN).await;
    send(&app, ADA, conv, "first").await;

    app.clock.advance_seconds(1);
    assert!(app.state.messaging.hide_conversation(BEN, conv).await.unwrap());
    let listed = app
        .state
        .messaging
        .list_conversations(BEN, None, Page::default())
        .await
        .unwrap();
    assert_eq!(listed.total, 0);

    app.clock.advance_seconds(1);
    send(&app, ADA, conv, "second").await;
    let listed = app
        .state
        .messaging
        .list_conversations(BEN, None, Page::default())
        .await
        .unwrap();
    assert_eq!(listed.items.iter().map(|c| c.id).collect::<Vec<_>>(), vec![conv]);
}

#[tokio::test]
async fn global_search_only_covers_joined_conversations() {
    let app = TestApp::new();
    let ours = private_chat(&app, ADA, BEN).await;
    let theirs = private_chat(&app, CY, DEE).await;
    send(&app, ADA, ours, "homework due friday").await;
    send(&app, CY, theirs, "homework is easy").await;

    let hits = app
        .state
        .messaging
        .global_search(BEN, "HOMEWORK", Page::default())
        .await
        .unwrap();
    assert_eq!(hits.total, 1);
    assert_eq!(hits.items[0].message.conversation_id, ours);
    assert_eq!(hits.items[0].conversation_name, "Ada");
}
