// tests/integration/session_test.rs

//! Heartbeats, presence expiry and the idle-session sweeper.

use super::fixtures::{ALICE, TEST_APP};
use super::test_helpers::TestContext;
use bytes::Bytes;
use spinelchat::config::Config;
use spinelchat::core::protocol::{Body, Envelope, Flow, HeartbeatBody};
use spinelchat::core::session::{Session, SessionPhase};
use spinelchat::core::store::{KvStore, keys};
use spinelchat::core::tasks::heartbeat_sweeper::HeartbeatSweeperTask;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::sleep;

fn short_lived_config() -> Config {
    let mut config = Config::default();
    config.session.presence_ttl = Duration::from_millis(300);
    config.session.heartbeat_timeout = Duration::from_millis(100);
    config.session.sweep_interval = Duration::from_millis(20);
    config
}

async fn heartbeat(ctx: &TestContext, session: &Arc<Session>, value: i64) -> Envelope {
    ctx.dispatcher
        .handle(session, Envelope::request(HeartbeatBody::new(value), false))
        .await
        .reply
        .expect("heartbeats are always answered")
}

#[tokio::test]
async fn test_heartbeat_is_echoed() {
    let ctx = TestContext::new().await;
    let conn = ctx.connect();

    let reply = heartbeat(&ctx, &conn.session, 42).await;

    assert_eq!(reply.flow, Flow::Response);
    assert_eq!(reply.body, Body::Heartbeat(HeartbeatBody::new(42)));
    assert_eq!(conn.session.phase(), SessionPhase::Connected);
}

#[tokio::test]
async fn test_heartbeats_keep_presence_alive() {
    let ctx = TestContext::with_config(short_lived_config()).await;
    let conn = ctx.connect();
    ctx.login_as(&conn, TEST_APP, ALICE, "ios").await;
    let label = conn.session.label().unwrap();

    for value in 0..4 {
        sleep(Duration::from_millis(150)).await;
        heartbeat(&ctx, &conn.session, value).await;
    }
    // 600ms have passed, twice the TTL.
    assert!(ctx.state.presence.load_session(&label).await.unwrap().is_some());

    sleep(Duration::from_millis(400)).await;
    assert!(ctx.state.presence.load_session(&label).await.unwrap().is_none());
}

#[tokio::test]
async fn test_heartbeat_restores_expired_presence() {
    let ctx = TestContext::with_config(short_lived_config()).await;
    let conn = ctx.connect();
    ctx.login_as(&conn, TEST_APP, ALICE, "web").await;
    let label = conn.session.label().unwrap();

    sleep(Duration::from_millis(400)).await;
    assert!(ctx.state.presence.load_session(&label).await.unwrap().is_none());

    let reply = heartbeat(&ctx, &conn.session, 1).await;
    assert!(matches!(reply.body, Body::Heartbeat(_)));

    let record = ctx.state.presence.load_session(&label).await.unwrap();
    assert!(record.is_some_and(|r| r.is_held_by(&ctx.state.broker.addr, conn.session.fd())));
    assert_eq!(
        ctx.state.presence.user_devices(TEST_APP, ALICE).await.unwrap().len(),
        1
    );
}

#[tokio::test]
async fn test_expired_presence_is_restored_only_under_the_label_lock() {
    let mut config = Config::default();
    config.lock.max_retries = 2;
    config.lock.backoff_base = Duration::from_millis(1);
    config.lock.backoff_max = Duration::from_millis(5);
    let ctx = TestContext::with_config(config).await;
    let conn = ctx.connect();
    ctx.login_as(&conn, TEST_APP, ALICE, "ios").await;
    let label = conn.session.label().unwrap();

    // The record lapsed and another node is mid-takeover of the label.
    let session_key = keys::session(TEST_APP, label.as_str());
    let lock_key = keys::label_lock(TEST_APP, label.as_str());
    assert!(ctx.store.delete(&session_key).await.unwrap());
    assert!(
        ctx.state
            .locks
            .try_acquire(&lock_key, "other-node", Duration::from_secs(10))
            .await
            .unwrap()
    );

    let reply = heartbeat(&ctx, &conn.session, 1).await;
    let Body::Command(failure) = reply.body else {
        panic!("expected a heartbeat failure, got {:?}", reply);
    };
    assert_eq!(failure.code, 1004);
    assert!(ctx.state.presence.load_session(&label).await.unwrap().is_none());
    assert_eq!(
        ctx.store.get(&lock_key).await.unwrap(),
        Some(Bytes::from_static(b"other-node"))
    );

    // Once the lock is free the next heartbeat publishes the session again.
    assert!(ctx.state.locks.release(&lock_key, "other-node").await.unwrap());
    let reply = heartbeat(&ctx, &conn.session, 2).await;
    assert_eq!(reply.body, Body::Heartbeat(HeartbeatBody::new(2)));
    let record = ctx.state.presence.load_session(&label).await.unwrap();
    assert!(record.is_some_and(|r| r.is_held_by(&ctx.state.broker.addr, conn.session.fd())));
    assert_eq!(ctx.store.get(&lock_key).await.unwrap(), None);
}

#[tokio::test]
async fn test_sweep_closes_idle_sessions_only() {
    let ctx = TestContext::with_config(short_lived_config()).await;
    let idle = ctx.connect();
    let active = ctx.connect();
    ctx.login_as(&idle, TEST_APP, ALICE, "ios").await;
    let label = idle.session.label().unwrap();

    sleep(Duration::from_millis(150)).await;
    heartbeat(&ctx, &active.session, 1).await;

    let sweeper = HeartbeatSweeperTask::new(ctx.state.clone());
    assert_eq!(sweeper.sweep_once().await, 1);

    assert_eq!(idle.session.phase(), SessionPhase::Closed);
    assert!(idle.session.close_reason().is_some());
    assert!(ctx.state.presence.load_session(&label).await.unwrap().is_none());
    assert!(ctx.state.sessions.get(idle.session.fd()).is_none());
    assert!(!active.session.is_closed());

    // Already closed sessions are not counted twice.
    assert_eq!(sweeper.sweep_once().await, 0);
}

#[tokio::test]
async fn test_sweeper_task_runs_until_shutdown() {
    let ctx = TestContext::with_config(short_lived_config()).await;
    let mut conn = ctx.connect();
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

    let task = tokio::spawn(HeartbeatSweeperTask::new(ctx.state.clone()).run(shutdown_rx));

    tokio::time::timeout(Duration::from_secs(2), conn.kill.recv())
        .await
        .expect("idle session was never swept")
        .unwrap();
    assert!(conn.session.is_closed());

    shutdown_tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .expect("sweeper ignored shutdown")
        .unwrap();
}
