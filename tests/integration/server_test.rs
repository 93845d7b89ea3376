// tests/integration/server_test.rs

//! End-to-end tests over a real TCP socket.

use super::fixtures::{ALICE, TEST_APP};
use super::test_helpers::TestContext;
use futures::{SinkExt, StreamExt};
use spinelchat::connection::ConnectionHandler;
use spinelchat::core::BrokerError;
use spinelchat::core::protocol::{
    Body, CommandBody, CommandReply, CommandRequest, Envelope, EnvelopeCodec, Flow,
    HeartbeatBody, LoginReply, LoginRequest,
};
use spinelchat::core::session::Label;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_util::codec::Framed;
use tokio_util::either::Either;

type Client = Framed<TcpStream, EnvelopeCodec>;

/// Serves connections for `ctx` on an ephemeral port until the test ends.
async fn serve(ctx: &TestContext) -> (SocketAddr, broadcast::Sender<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, _) = broadcast::channel(1);
    let state = ctx.state.clone();
    let shutdown = shutdown_tx.clone();
    tokio::spawn(async move {
        while let Ok((socket, peer)) = listener.accept().await {
            let mut handler = ConnectionHandler::new(
                Either::Left(socket),
                peer,
                state.clone(),
                state.next_conn_id(),
                shutdown.subscribe(),
            );
            tokio::spawn(async move {
                let _ = handler.run().await;
            });
        }
    });
    (addr, shutdown_tx)
}

async fn connect(addr: SocketAddr) -> Client {
    let stream = TcpStream::connect(addr).await.unwrap();
    Framed::new(stream, EnvelopeCodec::default())
}

async fn next_frame(client: &mut Client) -> Envelope {
    tokio::time::timeout(Duration::from_secs(2), client.next())
        .await
        .expect("timed out waiting for a frame")
        .expect("connection closed")
        .expect("io error")
        .expect("undecodable frame")
}

async fn send_login(client: &mut Client, sig: &str) -> CommandBody {
    let request = CommandBody::request(
        "1",
        CommandRequest::Login(LoginRequest {
            app_id: TEST_APP.into(),
            sig: sig.into(),
            os: "ios".into(),
        }),
    );
    client.send(Envelope::request(request, true)).await.unwrap();
    let reply = next_frame(client).await;
    assert_eq!(reply.flow, Flow::Response);
    match reply.body {
        Body::Command(body) => body,
        other => panic!("expected a command reply, got {:?}", other),
    }
}

#[tokio::test]
async fn test_login_over_tcp() {
    let ctx = TestContext::new().await;
    ctx.seed_signature(TEST_APP, "S", ALICE).await;
    let (addr, _shutdown) = serve(&ctx).await;
    let mut client = connect(addr).await;

    let reply = send_login(&mut client, "S").await;

    assert_eq!(reply.code, 0);
    assert_eq!(
        reply.reply(),
        Some(&CommandReply::Login(LoginReply {
            app_id: TEST_APP.into(),
            user_id: ALICE,
        }))
    );
}

#[tokio::test]
async fn test_rejected_login_over_tcp() {
    let ctx = TestContext::new().await;
    let (addr, _shutdown) = serve(&ctx).await;
    let mut client = connect(addr).await;

    let reply = send_login(&mut client, "bogus").await;

    assert_eq!(reply.code, BrokerError::SessionNotFound.code().unwrap());
    assert!(reply.reply().is_none());
}

#[tokio::test]
async fn test_garbage_frame_is_answered_and_connection_survives() {
    let ctx = TestContext::new().await;
    let (addr, _shutdown) = serve(&ctx).await;
    let mut client = connect(addr).await;

    // A well-delimited frame with an unknown flow byte.
    client
        .get_mut()
        .write_all(&[0, 0, 0, 3, 9, 1, 0])
        .await
        .unwrap();
    let reply = next_frame(&mut client).await;
    match reply.body {
        Body::Command(body) => {
            assert_eq!(body.code, BrokerError::Decode(String::new()).code().unwrap());
            assert!(body.id.is_empty());
        }
        other => panic!("expected a command failure, got {:?}", other),
    }

    client
        .send(Envelope::request(HeartbeatBody::new(7), false))
        .await
        .unwrap();
    let echo = next_frame(&mut client).await;
    assert_eq!(echo.body, Body::Heartbeat(HeartbeatBody::new(7)));
}

#[tokio::test]
async fn test_disconnect_evicts_presence() {
    let ctx = TestContext::new().await;
    ctx.seed_signature(TEST_APP, "S", ALICE).await;
    let (addr, _shutdown) = serve(&ctx).await;
    let mut client = connect(addr).await;
    assert_eq!(send_login(&mut client, "S").await.code, 0);

    let label = Label::new(TEST_APP, ALICE, "ios");
    assert!(ctx.state.presence.load_session(&label).await.unwrap().is_some());

    drop(client);

    let evicted = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if ctx.state.presence.load_session(&label).await.unwrap().is_none() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(evicted.is_ok(), "presence survived the disconnect");
    assert!(ctx.state.sessions.sessions().is_empty());
}

#[tokio::test]
async fn test_shutdown_signal_closes_connections() {
    let ctx = TestContext::new().await;
    let (addr, shutdown) = serve(&ctx).await;
    let mut client = connect(addr).await;

    // Make sure the handler is up before signalling.
    client
        .send(Envelope::request(HeartbeatBody::new(1), false))
        .await
        .unwrap();
    next_frame(&mut client).await;

    shutdown.send(()).unwrap();
    let end = tokio::time::timeout(Duration::from_secs(2), client.next())
        .await
        .expect("connection was not closed");
    assert!(end.is_none() || matches!(end, Some(Err(_))));
}
