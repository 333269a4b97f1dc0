// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Codec
//!
//! Messages travel as UTF-8 JSON objects. Next to its own fields every
//! payload carries a `"$type"` discriminator naming the concrete message, so
//! a consumer can decode a family of messages expressed as an internally
//! tagged enum (`#[serde(tag = "$type")]`) and land on the exact variant.
//!
//! The same discriminator is also sent as the AMQP `type` property; it is
//! used when a payload arrives without the field.

use crate::errors::AmqpError;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// JSON field carrying the message discriminator.
pub const TYPE_FIELD: &str = "$type";

/// Fields shared by every message: when and under which id it was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MessageHeader {
    pub created_at: DateTime<Utc>,
    pub guid_id: Uuid,
}

impl MessageHeader {
    pub fn new() -> Self {
        MessageHeader {
            created_at: Utc::now(),
            guid_id: Uuid::new_v4(),
        }
    }
}

impl Default for MessageHeader {
    fn default() -> Self {
        MessageHeader::new()
    }
}

/// A message the bus can publish and consume.
///
/// Plain structs embed a [`MessageHeader`] (usually `#[serde(flatten)]`) and
/// name themselves through `MESSAGE_TYPE`. Message families override
/// `message_type` and `accepts` so each variant keeps its own discriminator.
pub trait QueueMessage: Serialize + DeserializeOwned + Send + Sync + 'static {
    const MESSAGE_TYPE: &'static str;

    fn header(&self) -> &MessageHeader;

    fn message_type(&self) -> &str {
        Self::MESSAGE_TYPE
    }

    /// Whether a payload with this discriminator decodes into `Self`.
    fn accepts(message_type: &str) -> bool {
        message_type == Self::MESSAGE_TYPE
    }
}

/// A message ready to be handed to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedMessage {
    pub message_type: String,
    pub message_id: String,
    pub created_at: DateTime<Utc>,
    pub body: Vec<u8>,
}

impl EncodedMessage {
    /// Seconds since the epoch, the resolution of the AMQP timestamp.
    pub fn timestamp(&self) -> u64 {
        u64::try_from(self.created_at.timestamp()).unwrap_or_default()
    }
}

pub fn encode<T: QueueMessage>(message: &T) -> Result<EncodedMessage, AmqpError> {
    let message_type = message.message_type().to_owned();

    let mut fields = match serde_json::to_value(message) {
        Ok(Value::Object(fields)) => fields,
        Ok(_) => {
            return Err(AmqpError::SerializationError(format!(
                "{message_type} must serialize to a JSON object"
            )))
        }
        Err(err) => return Err(AmqpError::SerializationError(err.to_string())),
    };

    fields.insert(TYPE_FIELD.to_owned(), Value::String(message_type.clone()));

    let body = serde_json::to_vec(&fields)
        .map_err(|err| AmqpError::SerializationError(err.to_string()))?;

    let header = message.header();
    Ok(EncodedMessage {
        message_type,
        message_id: header.guid_id.to_string(),
        created_at: header.created_at,
        body,
    })
}

/// Decodes a delivery body, falling back to `type_property` (the AMQP `type`
/// property) when the payload has no discriminator.
pub fn decode<T: QueueMessage>(body: &[u8], type_property: Option<&str>) -> Result<T, AmqpError> {
    let mut fields: Map<String, Value> = serde_json::from_slice(body)
        .map_err(|err| AmqpError::DeserializationError(err.to_string()))?;

    let found = match fields.get(TYPE_FIELD) {
        Some(Value::String(found)) => found.clone(),
        Some(_) => return Err(AmqpError::MissingMessageType),
        None => {
            let found = type_property
                .filter(|found| !found.is_empty())
                .ok_or(AmqpError::MissingMessageType)?
                .to_owned();
            fields.insert(TYPE_FIELD.to_owned(), Value::String(found.clone()));
            found
        }
    };

    if !T::accepts(&found) {
        return Err(AmqpError::UnexpectedMessageType {
            expected: T::MESSAGE_TYPE.to_owned(),
            found,
        });
    }

    serde_json::from_value(Value::Object(fields))
        .map_err(|err| AmqpError::DeserializationError(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct JobId {
        #[serde(flatten)]
        header: MessageHeader,
        job_id: u64,
    }

    impl QueueMessage for JobId {
        const MESSAGE_TYPE: &'static str = "JobId";

        fn header(&self) -> &MessageHeader {
            &self.header
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Shipped {
        #[serde(flatten)]
        header: MessageHeader,
        order: String,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Cancelled {
        #[serde(flatten)]
        header: MessageHeader,
        order: String,
        reason: String,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(tag = "$type")]
    enum OrderEvent {
        #[serde(rename = "OrderShipped")]
        Shipped(Shipped),
        #[serde(rename = "OrderCancelled")]
        Cancelled(Cancelled),
    }

    impl QueueMessage for OrderEvent {
        const MESSAGE_TYPE: &'static str = "OrderEvent";

        fn header(&self) -> &MessageHeader {
            match self {
                OrderEvent::Shipped(event) => &event.header,
                OrderEvent::Cancelled(event) => &event.header,
            }
        }

        fn message_type(&self) -> &str {
            match self {
                OrderEvent::Shipped(_) => "OrderShipped",
                OrderEvent::Cancelled(_) => "OrderCancelled",
            }
        }

        fn accepts(message_type: &str) -> bool {
            matches!(message_type, "OrderShipped" | "OrderCancelled")
        }
    }

    fn job(job_id: u64) -> JobId {
        JobId {
            header: MessageHeader::new(),
            job_id,
        }
    }

    #[test]
    fn round_trips_a_message() {
        let message = job(42);
        let encoded = encode(&message).unwrap();

        assert_eq!(encoded.message_type, "JobId");
        assert_eq!(encoded.message_id, message.header.guid_id.to_string());

        let decoded: JobId = decode(&encoded.body, None).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn writes_discriminator_and_header_fields() {
        let encoded = encode(&job(7)).unwrap();
        let json: Value = serde_json::from_slice(&encoded.body).unwrap();

        assert_eq!(json[TYPE_FIELD], "JobId");
        assert_eq!(json["job_id"], 7);
        assert!(json["CreatedAt"].is_string());
        assert!(json["GuidId"].is_string());
    }

    #[test]
    fn resolves_the_exact_variant_of_a_family() {
        let cancelled = OrderEvent::Cancelled(Cancelled {
            header: MessageHeader::new(),
            order: "A-1".to_owned(),
            reason: "out of stock".to_owned(),
        });

        let encoded = encode(&cancelled).unwrap();
        assert_eq!(encoded.message_type, "OrderCancelled");

        let decoded: OrderEvent = decode(&encoded.body, None).unwrap();
        assert_eq!(decoded, cancelled);
    }

    #[test]
    fn falls_back_to_the_type_property() {
        let message = job(3);
        let body = serde_json::to_vec(&message).unwrap();

        let decoded: JobId = decode(&body, Some("JobId")).unwrap();
        assert_eq!(decoded, message);
        assert_eq!(
            decode::<JobId>(&body, None),
            Err(AmqpError::MissingMessageType)
        );
    }

    #[test]
    fn rejects_foreign_discriminators() {
        let encoded = encode(&job(1)).unwrap();

        assert_eq!(
            decode::<OrderEvent>(&encoded.body, None),
            Err(AmqpError::UnexpectedMessageType {
                expected: "OrderEvent".to_owned(),
                found: "JobId".to_owned(),
            })
        );
    }

    #[test]
    fn rejects_malformed_payloads() {
        assert!(matches!(
            decode::<JobId>(b"not json", Some("JobId")),
            Err(AmqpError::DeserializationError(_))
        ));
        assert!(matches!(
            decode::<JobId>(br#"{"$type":"JobId","job_id":"x"}"#, None),
            Err(AmqpError::DeserializationError(_))
        ));
    }
}
