//! Pure conversions between capability types and lapin types
//!
//! Nothing in here touches the network, so every mapping is unit tested.

use crate::transport::{CloseReason, MessageHeaders, OutboundMessage, PublishOptions, QueueOptions};
use lapin::options::{BasicPublishOptions, QueueDeclareOptions};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::BasicProperties;

/// AMQP reply code for a normal, requested close
pub const REPLY_SUCCESS: u16 = 200;

/// Reply text sent with deliberate closes
pub const REPLY_TEXT: &str = "Goodbye";

/// Map declaration flags. Never passive: the queue is created if absent.
pub fn queue_declare_options(options: QueueOptions) -> QueueDeclareOptions {
    QueueDeclareOptions {
        passive: false,
        durable: options.durable,
        exclusive: options.exclusive,
        auto_delete: options.auto_delete,
        nowait: options.no_wait,
    }
}

pub fn publish_options(options: PublishOptions) -> BasicPublishOptions {
    BasicPublishOptions {
        mandatory: options.mandatory,
        immediate: options.immediate,
    }
}

/// Application headers as an AMQP field table.
///
/// The timestamp travels as an AMQP timestamp (seconds since the epoch, UTC).
pub fn header_table(headers: &MessageHeaders) -> FieldTable {
    let mut table = FieldTable::default();
    table.insert(
        ShortString::from(MessageHeaders::INSTANCE_ID),
        AMQPValue::LongString(LongString::from(headers.instance_id.clone())),
    );
    let seconds = u64::try_from(headers.timestamp.timestamp()).unwrap_or_default();
    table.insert(
        ShortString::from(MessageHeaders::TIMESTAMP),
        AMQPValue::Timestamp(seconds),
    );
    table
}

pub fn basic_properties(message: &OutboundMessage) -> BasicProperties {
    BasicProperties::default()
        .with_content_type(ShortString::from(message.content_type.as_str()))
        .with_headers(header_table(&message.headers))
}

/// Reason attached to an unexpected close reported by lapin
pub fn close_reason(error: &lapin::Error) -> CloseReason {
    CloseReason::new(error.to_string())
}
