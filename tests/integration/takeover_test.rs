// tests/integration/takeover_test.rs

//! A device label is held by at most one session; a newer login takes it over.

use super::fixtures::{ALICE, TEST_APP};
use super::test_helpers::{RecordingRelay, TestContext, remote_snapshot};
use spinelchat::config::Config;
use spinelchat::core::presence::SessionSnapshot;
use spinelchat::core::protocol::{Body, Event, Flow};
use spinelchat::core::session::{Label, SessionPhase};
use std::sync::Arc;

async fn publish_remote(ctx: &TestContext, snapshot: &SessionSnapshot) {
    let presence = &ctx.state.presence;
    presence.store_session(&snapshot.label, snapshot).await.unwrap();
    presence
        .store_device_index(&snapshot.app_id, snapshot.user_id, &snapshot.label, snapshot)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_newer_login_takes_over_the_label() {
    let ctx = TestContext::new().await;
    let mut first = ctx.connect();
    let second = ctx.connect();

    ctx.login_as(&first, TEST_APP, ALICE, "ios").await;
    ctx.login_as(&second, TEST_APP, ALICE, "android").await;

    // Both run on mobile devices, so the second login replaced the first.
    assert!(first.session.is_closed());
    assert_eq!(first.session.phase(), SessionPhase::Closed);
    assert!(first.kill.try_recv().is_ok());
    assert_eq!(second.session.phase(), SessionPhase::LoggedIn);

    let pushed = first.drain();
    assert_eq!(pushed.len(), 1);
    assert_eq!(pushed[0].flow, Flow::Request);
    match &pushed[0].body {
        Body::Event(event) => match &event.event {
            Event::UserLogout(change) => assert_eq!(change.label, "A#1001#Mobile"),
            other => panic!("expected a logout event, got {:?}", other),
        },
        other => panic!("expected an event, got {:?}", other),
    }

    let label = Label::new(TEST_APP, ALICE, "android");
    let record = ctx
        .state
        .presence
        .load_session(&label)
        .await
        .unwrap()
        .unwrap();
    assert!(record.is_held_by(&ctx.state.broker.addr, second.session.fd()));
    assert_eq!(
        ctx.state.sessions.by_label(&label).unwrap().session.fd(),
        second.session.fd()
    );
    assert_eq!(
        ctx.state.presence.user_devices(TEST_APP, ALICE).await.unwrap().len(),
        1
    );
}

#[tokio::test]
async fn test_different_device_types_coexist() {
    let ctx = TestContext::new().await;
    let mut phone = ctx.connect();
    let desktop = ctx.connect();

    ctx.login_as(&phone, TEST_APP, ALICE, "ios").await;
    ctx.login_as(&desktop, TEST_APP, ALICE, "macos").await;

    assert!(phone.session.is_login());
    assert!(desktop.session.is_login());
    let devices = ctx.state.presence.user_devices(TEST_APP, ALICE).await.unwrap();
    assert_eq!(devices.len(), 2);

    // The phone hears about the desktop coming online.
    let pushed = phone.drain();
    assert_eq!(pushed.len(), 1);
    match &pushed[0].body {
        Body::Event(event) => match &event.event {
            Event::UserLogin(change) => {
                assert_eq!(change.label, "A#1001#Desktop");
                assert_eq!(change.user_id, ALICE);
            }
            other => panic!("expected a login event, got {:?}", other),
        },
        other => panic!("expected an event, got {:?}", other),
    }
}

#[tokio::test]
async fn test_closing_one_device_notifies_the_others() {
    let ctx = TestContext::new().await;
    let mut phone = ctx.connect();
    let desktop = ctx.connect();
    ctx.login_as(&phone, TEST_APP, ALICE, "ios").await;
    ctx.login_as(&desktop, TEST_APP, ALICE, "windows").await;
    phone.drain();

    assert!(ctx.state.close_session(&desktop.session, "test").await);
    assert!(!ctx.state.close_session(&desktop.session, "again").await);

    let pushed = phone.drain();
    assert_eq!(pushed.len(), 1);
    assert!(matches!(
        &pushed[0].body,
        Body::Event(e) if matches!(&e.event, Event::UserLogout(c) if c.label == "A#1001#Desktop")
    ));
    let devices = ctx.state.presence.user_devices(TEST_APP, ALICE).await.unwrap();
    assert_eq!(devices.len(), 1);
    assert_eq!(desktop.session.close_reason().as_deref(), Some("test"));
}

#[tokio::test]
async fn test_remote_holder_is_kicked_through_the_relay() {
    let relay = Arc::new(RecordingRelay::default());
    let ctx = TestContext::with_collaborators(Config::default(), None, relay.clone()).await;
    let remote = remote_snapshot(TEST_APP, ALICE, "ios", 77);
    publish_remote(&ctx, &remote).await;
    let conn = ctx.connect();

    ctx.login_as(&conn, TEST_APP, ALICE, "android").await;

    assert_eq!(relay.kicked.lock().clone(), vec![remote.clone()]);
    let record = ctx
        .state
        .presence
        .load_session(&remote.label)
        .await
        .unwrap()
        .unwrap();
    assert!(record.is_held_by(&ctx.state.broker.addr, conn.session.fd()));
}

#[tokio::test]
async fn test_takeover_without_relay_still_claims_the_label() {
    let ctx = TestContext::new().await;
    let remote = remote_snapshot(TEST_APP, ALICE, "web", 78);
    publish_remote(&ctx, &remote).await;
    let conn = ctx.connect();

    // The kick is refused, but the label still moves to the newer login.
    ctx.login_as(&conn, TEST_APP, ALICE, "linux").await;

    let record = ctx
        .state
        .presence
        .load_session(&remote.label)
        .await
        .unwrap()
        .unwrap();
    assert!(record.is_held_by(&ctx.state.broker.addr, conn.session.fd()));
}
