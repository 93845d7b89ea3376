// src/core/handler/dispatcher.rs

//! The central component for routing decoded envelopes to their handlers.
//!
//! The `Dispatcher` receives an `Envelope` from the `ConnectionHandler`, checks
//! the session is still open, dispatches on the body kind and records metrics.
//! Handler errors are turned into response envelopes here; nothing a client
//! sends can make the dispatcher close its connection except a logout.

use super::actions;
use crate::core::BrokerError;
use crate::core::metrics;
use crate::core::protocol::{Body, CommandBody, Envelope, Flow};
use crate::core::session::Session;
use crate::core::state::BrokerState;
use std::sync::Arc;
use std::time::Instant;
use tracing::{Instrument, debug, info_span};

/// What the connection should do after one inbound frame.
#[derive(Debug, Default)]
pub struct Outcome {
    /// The frame to write back, if any.
    pub reply: Option<Envelope>,
    /// Set when the connection must be closed once `reply` is written.
    pub close: Option<String>,
}

impl Outcome {
    fn reply(envelope: Envelope) -> Self {
        Self {
            reply: Some(envelope),
            close: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Dispatcher {
    state: Arc<BrokerState>,
}

impl Dispatcher {
    pub fn new(state: Arc<BrokerState>) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &Arc<BrokerState> {
        &self.state
    }

    /// Handles one inbound envelope on `session`.
    pub async fn handle(&self, session: &Arc<Session>, envelope: Envelope) -> Outcome {
        // Late frames on a closing session are dropped.
        if session.is_closed() {
            debug!(
                "Dropping {} frame on closed session {}",
                envelope.kind,
                session.fd()
            );
            return Outcome::default();
        }
        // Clients acknowledging frames we pushed need no answer.
        if envelope.flow == Flow::Response {
            debug!(
                "Ignoring {} response from session {}",
                envelope.kind,
                session.fd()
            );
            return Outcome::default();
        }

        let span = info_span!(
            "frame",
            kind = %envelope.kind,
            conn.id = session.fd(),
        );

        async move {
            let start_time = Instant::now();
            metrics::FRAMES_PROCESSED_TOTAL
                .with_label_values(&[envelope.kind.as_ref()])
                .inc();

            let need_ack = envelope.need_ack;
            let outcome = match envelope.body {
                Body::Heartbeat(body) => {
                    Outcome::reply(actions::heartbeat::handle(&self.state, session, body).await)
                }
                Body::Command(body) => {
                    let (reply, close) =
                        actions::command::handle(&self.state, session, body).await;
                    Outcome {
                        reply: Some(reply),
                        close,
                    }
                }
                Body::Message(body) => Outcome {
                    reply: actions::message::handle(&self.state, session, body, need_ack).await,
                    close: None,
                },
                Body::Event(body) => Outcome {
                    reply: actions::event::handle(&self.state, session, body, need_ack).await,
                    close: None,
                },
            };

            metrics::FRAME_LATENCY_SECONDS.observe(start_time.elapsed().as_secs_f64());
            outcome
        }
        .instrument(span)
        .await
    }

    /// The response sent for a frame that could not be decoded. No correlation
    /// id is known, so the status travels in a command body with an empty id.
    pub fn decode_failure(err: &BrokerError) -> Envelope {
        CommandBody::failure(String::new(), err).wrap()
    }
}
