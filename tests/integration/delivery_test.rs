// tests/integration/delivery_test.rs

//! Messages and friend events from logged-in sessions reach every live device
//! of their addressee.

use super::fixtures::{ALICE, BOB, TEST_APP, text_message};
use super::test_helpers::{RecordingRelay, TestContext, remote_snapshot};
use spinelchat::config::Config;
use spinelchat::core::BrokerError;
use spinelchat::core::protocol::{
    Body, Envelope, Event, EventBody, FriendReply, FriendRequest, Flow, MessageBody,
    PresenceChange,
};
use std::sync::Arc;

fn message_body(envelope: &Envelope) -> &MessageBody {
    match &envelope.body {
        Body::Message(m) => m,
        other => panic!("expected a message, got {:?}", other),
    }
}

#[tokio::test]
async fn test_message_is_stamped_sequenced_and_delivered() {
    let ctx = TestContext::new().await;
    let alice = ctx.connect();
    let mut bob = ctx.connect();
    ctx.login_as(&alice, TEST_APP, ALICE, "web").await;
    ctx.login_as(&bob, TEST_APP, BOB, "ios").await;

    let outcome = ctx
        .dispatcher
        .handle(
            &alice.session,
            Envelope::request(text_message("m1", BOB, "hello"), true),
        )
        .await;
    let ack = outcome.reply.expect("need_ack messages are acknowledged");
    assert_eq!(ack.flow, Flow::Response);
    let ack = message_body(&ack);
    assert_eq!(ack.id, "m1");
    assert_eq!(ack.code, 0);
    assert_eq!(ack.from, ALICE);
    assert_eq!(ack.app_id, TEST_APP);
    assert_eq!(ack.sequence, 1);
    assert_eq!(ack.conversation_id, "u:1001:1002");
    assert!(ack.server_time > 0);

    let pushed = bob.drain();
    assert_eq!(pushed.len(), 1);
    assert_eq!(pushed[0].flow, Flow::Request);
    let delivered = message_body(&pushed[0]);
    assert_eq!(delivered.id, "m1");
    assert_eq!(delivered.from, ALICE);
    assert_eq!(delivered.sequence, 1);
    assert_eq!(delivered.content, text_message("m1", BOB, "hello").content);

    let outcome = ctx
        .dispatcher
        .handle(
            &alice.session,
            Envelope::request(text_message("m2", BOB, "again"), true),
        )
        .await;
    assert_eq!(message_body(&outcome.reply.unwrap()).sequence, 2);
}

#[tokio::test]
async fn test_message_without_ack_flag_gets_no_reply() {
    let ctx = TestContext::new().await;
    let alice = ctx.connect();
    let mut bob = ctx.connect();
    ctx.login_as(&alice, TEST_APP, ALICE, "web").await;
    ctx.login_as(&bob, TEST_APP, BOB, "linux").await;

    let outcome = ctx
        .dispatcher
        .handle(
            &alice.session,
            Envelope::request(text_message("m1", BOB, "quiet"), false),
        )
        .await;

    assert!(outcome.reply.is_none());
    assert_eq!(bob.drain().len(), 1);
}

#[tokio::test]
async fn test_message_failures_are_always_reported() {
    let ctx = TestContext::new().await;
    let stranger = ctx.connect();

    let outcome = ctx
        .dispatcher
        .handle(
            &stranger.session,
            Envelope::request(text_message("m1", BOB, "hi"), false),
        )
        .await;
    let failure = outcome.reply.expect("failures are reported without need_ack");
    let failure = message_body(&failure);
    assert_eq!(failure.code, BrokerError::SessionNotFound.code().unwrap());
    assert!(failure.content.is_none());

    let alice = ctx.connect();
    ctx.login_as(&alice, TEST_APP, ALICE, "web").await;
    let mut empty = text_message("m2", BOB, "hi");
    empty.content = None;
    let outcome = ctx
        .dispatcher
        .handle(&alice.session, Envelope::request(empty, false))
        .await;
    assert_eq!(
        message_body(&outcome.reply.unwrap()).code,
        BrokerError::InvalidRequest(String::new()).code().unwrap()
    );
}

#[tokio::test]
async fn test_message_to_offline_user_is_accepted() {
    let ctx = TestContext::new().await;
    let alice = ctx.connect();
    ctx.login_as(&alice, TEST_APP, ALICE, "web").await;

    let outcome = ctx
        .dispatcher
        .handle(
            &alice.session,
            Envelope::request(text_message("m1", BOB, "anyone?"), true),
        )
        .await;
    assert_eq!(message_body(&outcome.reply.unwrap()).code, 0);
    assert_eq!(ctx.state.deliver(&text_message("m2", BOB, "x")).await.unwrap(), 0);
}

#[tokio::test]
async fn test_friend_event_is_stamped_and_routed() {
    let ctx = TestContext::new().await;
    let alice = ctx.connect();
    let mut bob = ctx.connect();
    ctx.login_as(&alice, TEST_APP, ALICE, "web").await;
    ctx.login_as(&bob, TEST_APP, BOB, "ios").await;

    let request = EventBody::new(
        "e1",
        Event::FriendAdd(FriendRequest {
            app_id: String::new(),
            from: 0,
            to: BOB,
            remark: "hi, it's alice".into(),
        }),
    );
    let outcome = ctx
        .dispatcher
        .handle(&alice.session, Envelope::request(request, true))
        .await;

    let reply = outcome.reply.expect("need_ack events are acknowledged");
    assert_eq!(reply.flow, Flow::Response);
    let pushed = bob.drain();
    assert_eq!(pushed.len(), 1);
    for envelope in [&reply, &pushed[0]] {
        match &envelope.body {
            Body::Event(e) => {
                assert_eq!(e.id, "e1");
                match &e.event {
                    Event::FriendAdd(req) => {
                        assert_eq!(req.from, ALICE);
                        assert_eq!(req.app_id, TEST_APP);
                        assert_eq!(req.to, BOB);
                    }
                    other => panic!("unexpected event {:?}", other),
                }
            }
            other => panic!("expected an event, got {:?}", other),
        }
    }

    let agree = EventBody::new(
        "e2",
        Event::FriendAddAgree(FriendReply {
            app_id: String::new(),
            from: 0,
            to: ALICE,
        }),
    );
    let outcome = ctx
        .dispatcher
        .handle(&bob.session, Envelope::request(agree, false))
        .await;
    assert!(outcome.reply.is_none());
}

#[tokio::test]
async fn test_client_sent_presence_event_is_refused() {
    let ctx = TestContext::new().await;
    let alice = ctx.connect();
    ctx.login_as(&alice, TEST_APP, ALICE, "web").await;

    let forged = EventBody::new(
        "e9",
        Event::UserLogin(PresenceChange {
            app_id: TEST_APP.into(),
            user_id: BOB,
            label: "A#1002#Mobile".into(),
            broker: "elsewhere".into(),
            at: 0,
        }),
    );
    let outcome = ctx
        .dispatcher
        .handle(&alice.session, Envelope::request(forged, false))
        .await;

    match outcome.reply.unwrap().body {
        Body::Command(body) => {
            assert_eq!(body.id, "e9");
            assert_eq!(
                body.code,
                BrokerError::NoHandlerSupport(String::new()).code().unwrap()
            );
        }
        other => panic!("expected a command failure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_inbound_responses_are_ignored() {
    let ctx = TestContext::new().await;
    let alice = ctx.connect();
    ctx.login_as(&alice, TEST_APP, ALICE, "web").await;

    let outcome = ctx
        .dispatcher
        .handle(
            &alice.session,
            Envelope::response(text_message("m1", BOB, "ack")),
        )
        .await;
    assert!(outcome.reply.is_none());
    assert!(outcome.close.is_none());
}

#[tokio::test]
async fn test_remote_devices_are_reached_through_the_relay() {
    let relay = Arc::new(RecordingRelay::default());
    let ctx = TestContext::with_collaborators(Config::default(), None, relay.clone()).await;
    let remote = remote_snapshot(TEST_APP, BOB, "ios", 91);
    let presence = &ctx.state.presence;
    presence.store_session(&remote.label, &remote).await.unwrap();
    presence
        .store_device_index(TEST_APP, BOB, &remote.label, &remote)
        .await
        .unwrap();

    let mut message = text_message("m1", BOB, "over there");
    message.app_id = TEST_APP.into();
    assert_eq!(ctx.state.deliver(&message).await.unwrap(), 1);

    let forwarded = relay.forwarded.lock();
    assert_eq!(forwarded.len(), 1);
    assert_eq!(forwarded[0].0, remote);
    assert_eq!(message_body(&forwarded[0].1).id, "m1");
}

#[tokio::test]
async fn test_without_relay_remote_devices_are_not_counted() {
    let ctx = TestContext::new().await;
    let remote = remote_snapshot(TEST_APP, BOB, "ios", 92);
    let presence = &ctx.state.presence;
    presence.store_session(&remote.label, &remote).await.unwrap();
    presence
        .store_device_index(TEST_APP, BOB, &remote.label, &remote)
        .await
        .unwrap();

    let mut message = text_message("m1", BOB, "over there");
    message.app_id = TEST_APP.into();
    assert_eq!(ctx.state.deliver(&message).await.unwrap(), 0);

    let mut group = text_message("g1", 0, "everyone");
    group.app_id = TEST_APP.into();
    group.group_id = 7;
    assert!(matches!(
        ctx.state.deliver(&group).await,
        Err(BrokerError::NoHandlerSupport(_))
    ));
}
