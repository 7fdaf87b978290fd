//! Message types shared with the upper client layer
//!
//! The upper layer owns the outbound queue ([`WaitingList`]) and hands the
//! transport a shared reference to it at device registration. Every outbound
//! record carries its own completion callback, which the transport invokes
//! exactly once.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::rc::Rc;
use uuid::Uuid;

/// Payload of an IoT hub message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageContent {
    Binary(Bytes),
    Text(String),
    /// Content the upper layer could not classify; never sent
    Unknown,
}

/// Device-to-cloud or cloud-to-device message as seen by the upper layer
///
/// # Examples
/// ```
/// use iothub_amqp::protocol::IotHubMessage;
///
/// let message = IotHubMessage::text("{\"temperature\": 21.5}")
///     .with_message_id("msg-1")
///     .with_property("unit", "celsius");
/// assert_eq!(message.properties.get("unit").map(String::as_str), Some("celsius"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IotHubMessage {
    pub content: MessageContent,
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    /// Application properties, string keys to string values
    pub properties: BTreeMap<String, String>,
}

impl IotHubMessage {
    pub fn binary<B: Into<Bytes>>(payload: B) -> Self {
        Self::with_content(MessageContent::Binary(payload.into()))
    }

    pub fn text<S: Into<String>>(payload: S) -> Self {
        Self::with_content(MessageContent::Text(payload.into()))
    }

    pub fn with_content(content: MessageContent) -> Self {
        Self {
            content,
            message_id: None,
            correlation_id: None,
            properties: BTreeMap::new(),
        }
    }

    pub fn with_message_id<S: Into<String>>(mut self, message_id: S) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    pub fn with_correlation_id<S: Into<String>>(mut self, correlation_id: S) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_property<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Raw payload bytes, if the content type is known
    pub fn payload(&self) -> Option<&[u8]> {
        match &self.content {
            MessageContent::Binary(bytes) => Some(bytes),
            MessageContent::Text(text) => Some(text.as_bytes()),
            MessageContent::Unknown => None,
        }
    }
}

/// Transport-assigned identity of an outbound record, used as the AMQP
/// delivery tag so completions can be matched back to the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome reported to the per-message completion callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationResult {
    Ok,
    Error,
}

/// Per-message completion callback; captures whatever context the caller needs
pub type CompletionCallback = Box<dyn FnOnce(ConfirmationResult)>;

/// A message queued by the upper layer for sending
pub struct OutboundMessage {
    id: MessageId,
    pub message: IotHubMessage,
    on_complete: Option<CompletionCallback>,
}

impl OutboundMessage {
    pub fn new(message: IotHubMessage) -> Self {
        Self {
            id: MessageId::new(),
            message,
            on_complete: None,
        }
    }

    pub fn with_callback<F>(message: IotHubMessage, on_complete: F) -> Self
    where
        F: FnOnce(ConfirmationResult) + 'static,
    {
        Self {
            id: MessageId::new(),
            message,
            on_complete: Some(Box::new(on_complete)),
        }
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    /// Consume the record, invoking its completion callback if one was set.
    pub fn complete(self, result: ConfirmationResult) {
        if let Some(callback) = self.on_complete {
            callback(result);
        }
    }
}

impl fmt::Debug for OutboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundMessage")
            .field("id", &self.id)
            .field("message", &self.message)
            .field("has_callback", &self.on_complete.is_some())
            .finish()
    }
}

/// Upper layer's outbound queue, shared with the transport
///
/// The transport peeks at the head, moves records into its own in-progress
/// list while they are on the wire, and appends them back at the tail when a
/// send has to be retried.
#[derive(Clone, Default)]
pub struct WaitingList(Rc<RefCell<VecDeque<OutboundMessage>>>);

impl WaitingList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_back(&self, message: OutboundMessage) {
        self.0.borrow_mut().push_back(message);
    }

    /// Convenience for queueing a message and getting back its id
    pub fn enqueue(&self, message: IotHubMessage) -> MessageId {
        let outbound = OutboundMessage::new(message);
        let id = outbound.id();
        self.push_back(outbound);
        id
    }

    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.borrow().is_empty()
    }

    /// Ids in queue order
    pub fn ids(&self) -> Vec<MessageId> {
        self.0.borrow().iter().map(OutboundMessage::id).collect()
    }

    pub(crate) fn front_id(&self) -> Option<MessageId> {
        self.0.borrow().front().map(OutboundMessage::id)
    }

    pub(crate) fn remove(&self, id: MessageId) -> Option<OutboundMessage> {
        let mut queue = self.0.borrow_mut();
        let position = queue.iter().position(|m| m.id() == id)?;
        queue.remove(position)
    }
}

impl fmt::Debug for WaitingList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitingList")
            .field("len", &self.len())
            .finish()
    }
}

/// Upper layer's verdict on a received cloud-to-device message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispositionResult {
    Accepted,
    Abandoned,
    Rejected,
}

/// Whether a device still has outbound work queued or in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendStatus {
    Idle,
    Busy,
}

/// Direct method invocation delivered to the upper layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodRequest {
    pub method_name: String,
    pub payload: Bytes,
}

/// Upper layer's answer to a direct method invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodResponse {
    pub status: i32,
    pub payload: Bytes,
}

impl MethodResponse {
    pub fn new<B: Into<Bytes>>(status: i32, payload: B) -> Self {
        Self {
            status,
            payload: payload.into(),
        }
    }
}
