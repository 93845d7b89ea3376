// tests/integration/login_test.rs

//! Login and logout driven through the dispatcher.

use super::fixtures::{ALICE, TEST_APP};
use super::test_helpers::TestContext;
use async_trait::async_trait;
use spinelchat::config::Config;
use spinelchat::core::BrokerError;
use spinelchat::core::protocol::{
    Body, BodyKind, CommandBody, CommandPayload, CommandReply, CommandRequest, Envelope, Flow,
    LoginReply, LoginRequest,
};
use spinelchat::core::session::{Label, Session, SessionPhase};
use spinelchat::core::state::{Authenticator, LogRelay};
use spinelchat::core::store::{KvStore, keys};
use std::sync::{Arc, OnceLock};

/// Accepts every signature, but closes its session while the login is in
/// flight, as a disconnect racing the login would.
#[derive(Debug, Default)]
struct ClosingAuthenticator {
    session: OnceLock<Arc<Session>>,
}

#[async_trait]
impl Authenticator for ClosingAuthenticator {
    async fn authenticate(&self, _app_id: &str, _sig: &str) -> Result<u64, BrokerError> {
        if let Some(session) = self.session.get() {
            session.begin_close("disconnected");
        }
        Ok(ALICE)
    }
}

fn command_body(envelope: Envelope) -> CommandBody {
    assert_eq!(envelope.flow, Flow::Response);
    assert_eq!(envelope.kind, BodyKind::Command);
    match envelope.body {
        Body::Command(body) => body,
        other => panic!("expected a command body, got {:?}", other),
    }
}

#[tokio::test]
async fn test_login_with_valid_signature() {
    let ctx = TestContext::new().await;
    ctx.seed_signature(TEST_APP, "S", ALICE).await;
    let conn = ctx.connect();

    let reply = command_body(ctx.login(&conn, "1", TEST_APP, "S", "ios").await);

    assert_eq!(reply.id, "1");
    assert_eq!(reply.code, 0);
    assert_eq!(
        reply.payload,
        CommandPayload::Reply(CommandReply::Login(LoginReply {
            app_id: TEST_APP.into(),
            user_id: ALICE,
        }))
    );
    assert_eq!(conn.session.phase(), SessionPhase::LoggedIn);
    assert!(conn.session.is_login());

    let label = Label::new(TEST_APP, ALICE, "ios");
    assert_eq!(label.as_str(), "A#1001#Mobile");
    let record = ctx
        .state
        .presence
        .load_session(&label)
        .await
        .unwrap()
        .expect("presence record must exist after login");
    assert!(record.is_held_by(&ctx.state.broker.addr, conn.session.fd()));

    let devices = ctx.state.presence.user_devices(TEST_APP, ALICE).await.unwrap();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].label, label);
    assert!(ctx.state.sessions.by_label(&label).is_some());
}

#[tokio::test]
async fn test_login_with_invalid_signature() {
    let ctx = TestContext::new().await;
    let conn = ctx.connect();

    let reply = command_body(ctx.login(&conn, "1", TEST_APP, "nope", "ios").await);

    assert_eq!(reply.id, "1");
    assert_eq!(reply.code, BrokerError::SessionNotFound.code().unwrap());
    assert_eq!(reply.payload, CommandPayload::Empty);
    assert!(!conn.session.is_login());
    assert_eq!(conn.session.phase(), SessionPhase::Authenticating);
}

#[tokio::test]
async fn test_login_with_unknown_os_is_rejected() {
    let ctx = TestContext::new().await;
    ctx.seed_signature(TEST_APP, "S", ALICE).await;
    let conn = ctx.connect();

    let reply = command_body(ctx.login(&conn, "7", TEST_APP, "S", "amiga").await);

    assert_eq!(
        reply.code,
        BrokerError::InvalidRequest(String::new()).code().unwrap()
    );
    assert!(reply.message.contains("amiga"));
    assert!(!conn.session.is_login());
}

#[tokio::test]
async fn test_login_without_os_is_rejected() {
    let ctx = TestContext::new().await;
    ctx.seed_signature(TEST_APP, "S", ALICE).await;
    let conn = ctx.connect();

    let reply = command_body(ctx.login(&conn, "1", TEST_APP, "S", "").await);

    assert_eq!(reply.id, "1");
    assert_eq!(
        reply.code,
        BrokerError::InvalidRequest(String::new()).code().unwrap()
    );
    assert_eq!(reply.payload, CommandPayload::Empty);
    assert_eq!(conn.session.phase(), SessionPhase::Authenticating);

    // The same signature logs in once the platform is named.
    let reply = command_body(ctx.login(&conn, "2", TEST_APP, "S", "ios").await);
    assert!(reply.is_success());
}

#[tokio::test]
async fn test_second_login_on_same_session_is_rejected() {
    let ctx = TestContext::new().await;
    let conn = ctx.connect();
    ctx.login_as(&conn, TEST_APP, ALICE, "ios").await;

    ctx.seed_signature(TEST_APP, "again", ALICE).await;
    let reply = command_body(ctx.login(&conn, "2", TEST_APP, "again", "ios").await);

    assert_eq!(
        reply.code,
        BrokerError::InvalidRequest(String::new()).code().unwrap()
    );
    assert!(conn.session.is_login());
}

#[tokio::test]
async fn test_logout_replies_then_closes() {
    let ctx = TestContext::new().await;
    let conn = ctx.connect();
    ctx.login_as(&conn, TEST_APP, ALICE, "android").await;
    let label = conn.session.label().unwrap();

    let outcome = ctx.logout(&conn, "9").await;
    let reply = command_body(outcome.reply.expect("logout must be answered"));
    assert_eq!(reply.id, "9");
    assert!(reply.is_success());
    assert!(matches!(
        reply.payload,
        CommandPayload::Reply(CommandReply::Logout(ref r)) if r.user_id == ALICE
    ));
    assert_eq!(outcome.close.as_deref(), Some("logout"));

    // The connection handler closes the session once the reply is written.
    assert!(ctx.state.close_session(&conn.session, "logout").await);
    assert_eq!(conn.session.phase(), SessionPhase::Closed);
    assert!(ctx.state.presence.load_session(&label).await.unwrap().is_none());
    assert!(ctx.state.sessions.get(conn.session.fd()).is_none());
}

#[tokio::test]
async fn test_logout_without_login() {
    let ctx = TestContext::new().await;
    let conn = ctx.connect();

    let outcome = ctx.logout(&conn, "3").await;
    let reply = command_body(outcome.reply.unwrap());

    assert_eq!(reply.code, BrokerError::SessionNotFound.code().unwrap());
    assert!(outcome.close.is_none());
}

#[tokio::test]
async fn test_command_without_request_has_no_handler() {
    let ctx = TestContext::new().await;
    let conn = ctx.connect();
    let body = CommandBody {
        id: "x".into(),
        code: 0,
        message: String::new(),
        payload: CommandPayload::Empty,
    };

    let outcome = ctx
        .dispatcher
        .handle(&conn.session, Envelope::request(body, false))
        .await;
    let reply = command_body(outcome.reply.unwrap());

    assert_eq!(reply.id, "x");
    assert_eq!(
        reply.code,
        BrokerError::NoHandlerSupport(String::new()).code().unwrap()
    );
}

#[tokio::test]
async fn test_frames_on_closed_session_are_dropped() {
    let ctx = TestContext::new().await;
    ctx.seed_signature(TEST_APP, "S", ALICE).await;
    let conn = ctx.connect();
    ctx.state.close_session(&conn.session, "test").await;

    let request = CommandBody::request(
        "1",
        CommandRequest::Login(LoginRequest {
            app_id: TEST_APP.into(),
            sig: "S".into(),
            os: "ios".into(),
        }),
    );
    let outcome = ctx
        .dispatcher
        .handle(&conn.session, Envelope::request(request, true))
        .await;

    assert!(outcome.reply.is_none());
    assert!(!conn.session.is_login());
    assert_eq!(conn.session.close_reason().as_deref(), Some("test"));
}

#[tokio::test]
async fn test_login_racing_a_close_leaves_nothing_behind() {
    let authenticator = Arc::new(ClosingAuthenticator::default());
    let shared: Arc<dyn Authenticator> = authenticator.clone();
    let ctx =
        TestContext::with_collaborators(Config::default(), Some(shared), Arc::new(LogRelay)).await;
    let conn = ctx.connect();
    authenticator.session.set(conn.session.clone()).unwrap();

    let reply = command_body(ctx.login(&conn, "1", TEST_APP, "S", "ios").await);

    assert_eq!(reply.code, BrokerError::SessionNotFound.code().unwrap());
    assert!(!conn.session.is_login());
    assert!(conn.session.identity().is_none());
    let label = Label::new(TEST_APP, ALICE, "ios");
    assert!(ctx.state.sessions.by_label(&label).is_none());
    assert!(ctx.state.presence.load_session(&label).await.unwrap().is_none());
    assert_eq!(
        ctx.store
            .get(&keys::label_lock(TEST_APP, label.as_str()))
            .await
            .unwrap(),
        None
    );
}
