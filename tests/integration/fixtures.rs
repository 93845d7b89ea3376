// tests/integration/fixtures.rs

//! Common test fixtures and data generators

use spinelchat::core::protocol::{MessageBody, MessageContent, TextContent};

pub const TEST_APP: &str = "A";
pub const ALICE: u64 = 1001;
pub const BOB: u64 = 1002;

/// A text message from the logged-in sender to `to`.
pub fn text_message(id: &str, to: u64, text: &str) -> MessageBody {
    MessageBody::new(
        id,
        "",
        to,
        MessageContent::Text(TextContent { text: text.into() }),
    )
}
