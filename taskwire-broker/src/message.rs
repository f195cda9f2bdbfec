use std::collections::BTreeMap;

use serde_json::Value;
use uuid::Uuid;

/// String-valued metadata carried next to a message body.
pub type Headers = BTreeMap<String, String>;

/// Backend-private handle needed to ack or requeue a received message.
///
/// Each adapter only accepts the variant it issued; the contents are never
/// meant to be inspected by callers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DeliveryToken {
    /// AMQP delivery tag, scoped to the channel that received it.
    Tag { channel: u16, tag: u64 },
    /// Queue-service receipt handle together with the queue it came from.
    Receipt {
        queue_url: String,
        receipt_handle: String,
    },
    /// In-memory lease held by one client session.
    Lease { session: Uuid, id: u64 },
}

/// Envelope flowing through every broker backend.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub queue: String,
    pub body: Value,
    pub headers: Headers,
    delivery_token: Option<DeliveryToken>,
}

impl Message {
    /// Build a message for publishing. The delivery token is left unset.
    pub fn new(queue: impl Into<String>, body: Value) -> Self {
        Self {
            queue: queue.into(),
            body,
            headers: Headers::new(),
            delivery_token: None,
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub(crate) fn received(queue: String, body: Value, headers: Headers, token: DeliveryToken) -> Self {
        Self {
            queue,
            body,
            headers,
            delivery_token: Some(token),
        }
    }

    pub fn delivery_token(&self) -> Option<&DeliveryToken> {
        self.delivery_token.as_ref()
    }

    /// True for messages produced by `listen`.
    pub fn is_received(&self) -> bool {
        self.delivery_token.is_some()
    }

    /// Token of a received message, or a delivery error for one built locally.
    pub fn require_token(&self) -> Result<&DeliveryToken, crate::BrokerError> {
        self.delivery_token.as_ref().ok_or_else(|| {
            crate::BrokerError::Delivery(format!(
                "message for queue {} was never received from a broker",
                self.queue
            ))
        })
    }

    /// Serialized body as sent over the wire.
    pub fn encode_body(&self) -> Result<Vec<u8>, crate::BrokerError> {
        serde_json::to_vec(&self.body).map_err(|err| crate::BrokerError::publish(&self.queue, err))
    }
}

/// A delivery as a backend hands it over, before the body is parsed.
#[derive(Debug, Clone)]
pub struct RawDelivery {
    pub queue: String,
    pub body: Vec<u8>,
    pub headers: Headers,
    pub token: DeliveryToken,
}

impl RawDelivery {
    /// Parse the body, yielding a received [`Message`].
    pub fn into_message(self) -> Result<Message, serde_json::Error> {
        let body = serde_json::from_slice(&self.body)?;
        Ok(Message::received(self.queue, body, self.headers, self.token))
    }
}
