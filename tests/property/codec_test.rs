// tests/property/codec_test.rs

//! Property-based tests for the envelope codec
//! Tests that bodies survive the wire unchanged and that framing does not
//! depend on how the byte stream is chunked.

use bytes::BytesMut;
use proptest::prelude::*;
use spinelchat::core::protocol::{
    AudioContent, Body, CommandBody, CommandPayload, CommandReply, CommandRequest, Envelope,
    EnvelopeCodec, Event, EventBody, Flow, FriendReply, FriendRequest, HeartbeatBody,
    ImageContent, LoginReply, LoginRequest, LogoutReply, LogoutRequest, MessageBody,
    MessageContent, PresenceChange, TextContent, VideoContent, WireFormat,
};
use tokio_util::codec::{Decoder, Encoder};

fn format_strategy() -> impl Strategy<Value = WireFormat> {
    prop_oneof![Just(WireFormat::Binary), Just(WireFormat::Json)]
}

fn flow_strategy() -> impl Strategy<Value = Flow> {
    prop_oneof![Just(Flow::Request), Just(Flow::Response)]
}

fn message_strategy() -> impl Strategy<Value = Envelope> {
    (
        "[a-zA-Z0-9-]{1,36}",
        1u64..u64::MAX,
        ".{0,2000}",
        any::<bool>(),
    )
        .prop_map(|(id, to, text, need_ack)| {
            let mut body = MessageBody::new(
                id,
                "",
                to,
                MessageContent::Text(TextContent { text }),
            );
            body.sequence = to / 2;
            Envelope::request(body, need_ack)
        })
}

fn content_strategy() -> impl Strategy<Value = MessageContent> {
    prop_oneof![
        ".{0,200}".prop_map(|text| MessageContent::Text(TextContent { text })),
        (".{0,80}", any::<u32>(), any::<u32>()).prop_map(|(url, width, height)| {
            MessageContent::Image(ImageContent { url, width, height })
        }),
        (".{0,80}", any::<u32>()).prop_map(|(url, duration_secs)| {
            MessageContent::Audio(AudioContent { url, duration_secs })
        }),
        (".{0,80}", any::<u32>(), ".{0,80}").prop_map(|(url, duration_secs, cover_url)| {
            MessageContent::Video(VideoContent {
                url,
                duration_secs,
                cover_url,
            })
        }),
    ]
}

fn full_message_strategy() -> impl Strategy<Value = MessageBody> {
    (
        ("[a-zA-Z0-9-]{0,36}", "[a-z0-9:]{0,24}", ".{0,16}"),
        (any::<u64>(), any::<u64>(), any::<u64>(), any::<u64>()),
        (any::<i64>(), any::<i64>()),
        proptest::option::of(content_strategy()),
        (any::<i32>(), ".{0,40}"),
    )
        .prop_map(
            |((id, conversation, app_id), (from, to, group_id, sequence), times, content, status)| {
                let mut body = MessageBody::new(
                    id,
                    conversation,
                    to,
                    MessageContent::Text(TextContent { text: String::new() }),
                );
                body.from = from;
                body.group_id = group_id;
                body.app_id = app_id;
                body.sequence = sequence;
                (body.client_time, body.server_time) = times;
                if let Some(content) = &content {
                    body.content_type = content.content_type();
                }
                body.content = content;
                (body.code, body.reason) = status;
                body
            },
        )
}

fn command_strategy() -> impl Strategy<Value = CommandBody> {
    let payload = prop_oneof![
        Just(CommandPayload::Empty),
        (".{0,16}", ".{0,64}", "[a-z]{0,10}").prop_map(|(app_id, sig, os)| {
            CommandPayload::Request(CommandRequest::Login(LoginRequest { app_id, sig, os }))
        }),
        Just(CommandPayload::Request(CommandRequest::Logout(LogoutRequest {}))),
        (".{0,16}", any::<u64>()).prop_map(|(app_id, user_id)| {
            CommandPayload::Reply(CommandReply::Login(LoginReply { app_id, user_id }))
        }),
        (".{0,16}", any::<u64>()).prop_map(|(app_id, user_id)| {
            CommandPayload::Reply(CommandReply::Logout(LogoutReply { app_id, user_id }))
        }),
    ];
    (".{0,36}", any::<i32>(), ".{0,64}", payload).prop_map(|(id, code, message, payload)| {
        CommandBody {
            id,
            code,
            message,
            payload,
        }
    })
}

fn event_strategy() -> impl Strategy<Value = EventBody> {
    let change = (".{0,16}", any::<u64>(), ".{0,40}", ".{0,24}", any::<i64>()).prop_map(
        |(app_id, user_id, label, broker, at)| PresenceChange {
            app_id,
            user_id,
            label,
            broker,
            at,
        },
    );
    let request = (".{0,16}", any::<u64>(), any::<u64>(), ".{0,64}").prop_map(
        |(app_id, from, to, remark)| FriendRequest {
            app_id,
            from,
            to,
            remark,
        },
    );
    let reply = (".{0,16}", any::<u64>(), any::<u64>())
        .prop_map(|(app_id, from, to)| FriendReply { app_id, from, to });
    let event = prop_oneof![
        change.clone().prop_map(Event::UserLogin),
        change.prop_map(Event::UserLogout),
        request.prop_map(Event::FriendAdd),
        reply.clone().prop_map(Event::FriendAddAgree),
        reply.prop_map(Event::FriendAddReject),
    ];
    (".{0,36}", event).prop_map(|(id, event)| EventBody::new(id, event))
}

/// Any well-formed envelope: every body kind, in either direction.
fn envelope_strategy() -> impl Strategy<Value = Envelope> {
    let body = prop_oneof![
        any::<i64>().prop_map(|value| Body::Heartbeat(HeartbeatBody::new(value))),
        command_strategy().prop_map(Body::Command),
        full_message_strategy().prop_map(Body::Message),
        event_strategy().prop_map(Body::Event),
    ];
    (flow_strategy(), any::<bool>(), body)
        .prop_map(|(flow, need_ack, body)| Envelope::new(flow, need_ack, body))
}

fn decode_all(codec: &mut EnvelopeCodec, buf: &mut BytesMut, out: &mut Vec<Envelope>) {
    while let Some(item) = codec.decode(buf).unwrap() {
        out.push(item.expect("frame must decode"));
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 100,
        max_shrink_iters: 1000,
        ..ProptestConfig::default()
    })]

    #[test]
    fn test_message_roundtrip(format in format_strategy(), envelope in message_strategy()) {
        let mut codec = EnvelopeCodec::new(format, 1 << 20);
        let mut buf = BytesMut::new();
        codec.encode(envelope.clone(), &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().expect("complete frame").unwrap();
        prop_assert_eq!(decoded, envelope);
        prop_assert!(buf.is_empty());
    }

    #[test]
    fn test_any_envelope_roundtrip(format in format_strategy(), envelope in envelope_strategy()) {
        let mut codec = EnvelopeCodec::new(format, 1 << 20);
        let mut buf = BytesMut::new();
        codec.encode(envelope.clone(), &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().expect("complete frame").unwrap();
        prop_assert_eq!(decoded, envelope);
        prop_assert!(buf.is_empty());
    }

    #[test]
    fn test_heartbeat_roundtrip(format in format_strategy(), value in any::<i64>()) {
        let mut codec = EnvelopeCodec::new(format, 1 << 20);
        let envelope = Envelope::request(HeartbeatBody::new(value), false);
        let mut buf = BytesMut::new();
        codec.encode(envelope.clone(), &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().expect("complete frame").unwrap();
        prop_assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_chunking_does_not_change_frames(
        format in format_strategy(),
        envelopes in prop::collection::vec(envelope_strategy(), 1..8),
        chunk in 1usize..64,
    ) {
        let mut codec = EnvelopeCodec::new(format, 1 << 20);
        let mut wire = BytesMut::new();
        for envelope in &envelopes {
            codec.encode(envelope.clone(), &mut wire).unwrap();
        }

        let mut buf = BytesMut::new();
        let mut decoded = Vec::new();
        for piece in wire.chunks(chunk) {
            buf.extend_from_slice(piece);
            decode_all(&mut codec, &mut buf, &mut decoded);
        }

        prop_assert_eq!(decoded, envelopes);
        prop_assert!(buf.is_empty());
    }
}
