//! Pure conversion between upper-layer messages and AMQP messages
//!
//! Outbound messages become a single data body section with the message and
//! correlation ids in the properties section and the application properties
//! as a string map. Inbound messages must carry a data body and string-valued
//! properties, otherwise the delivery is rejected.

use crate::protocol::{DispositionResult, IotHubMessage, MessageContent};
use bytes::Bytes;
use std::collections::BTreeMap;
use thiserror::Error;

/// Rejection condition used when an inbound message cannot be converted
pub const CONVERSION_FAILURE_CONDITION: &str = "Rejected due to failure reading AMQP message";
/// Rejection description used when an inbound message cannot be converted
pub const CONVERSION_FAILURE_DESCRIPTION: &str = "Failed reading AMQP message";

const APPLICATION_REJECTED: &str = "Rejected by application";

/// Subset of AMQP primitive values the transport has to reason about
#[derive(Debug, Clone, PartialEq)]
pub enum AmqpValue {
    Null,
    Bool(bool),
    Int(i64),
    Ulong(u64),
    String(String),
    Binary(Bytes),
    Uuid(uuid::Uuid),
}

impl AmqpValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AmqpValue::String(s) => Some(s),
            _ => None,
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            AmqpValue::Null => "null",
            AmqpValue::Bool(_) => "bool",
            AmqpValue::Int(_) => "int",
            AmqpValue::Ulong(_) => "ulong",
            AmqpValue::String(_) => "string",
            AmqpValue::Binary(_) => "binary",
            AmqpValue::Uuid(_) => "uuid",
        }
    }
}

impl From<&str> for AmqpValue {
    fn from(value: &str) -> Self {
        AmqpValue::String(value.to_string())
    }
}

/// AMQP message body
#[derive(Debug, Clone, PartialEq)]
pub enum AmqpBody {
    Empty,
    /// One or more data sections
    Data(Vec<Bytes>),
    Value(AmqpValue),
    Sequence(Vec<AmqpValue>),
}

/// Properties section fields used by the transport
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AmqpProperties {
    pub message_id: Option<AmqpValue>,
    pub correlation_id: Option<AmqpValue>,
}

/// Wire-level message handed to and received from the AMQP library
#[derive(Debug, Clone, PartialEq)]
pub struct AmqpMessage {
    pub body: AmqpBody,
    pub properties: AmqpProperties,
    pub application_properties: BTreeMap<String, AmqpValue>,
}

impl AmqpMessage {
    pub fn with_data<B: Into<Bytes>>(data: B) -> Self {
        Self {
            body: AmqpBody::Data(vec![data.into()]),
            properties: AmqpProperties::default(),
            application_properties: BTreeMap::new(),
        }
    }
}

/// Delivery outcome reported back to the service for a received message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Accepted,
    Released,
    Rejected {
        condition: String,
        description: String,
    },
}

impl Disposition {
    pub fn rejected<C: Into<String>, D: Into<String>>(condition: C, description: D) -> Self {
        Disposition::Rejected {
            condition: condition.into(),
            description: description.into(),
        }
    }

    /// Disposition for a delivery that could not be converted
    pub fn conversion_failure() -> Self {
        Self::rejected(CONVERSION_FAILURE_CONDITION, CONVERSION_FAILURE_DESCRIPTION)
    }
}

impl From<DispositionResult> for Disposition {
    fn from(result: DispositionResult) -> Self {
        match result {
            DispositionResult::Accepted => Disposition::Accepted,
            DispositionResult::Abandoned => Disposition::Released,
            DispositionResult::Rejected => {
                Disposition::rejected(APPLICATION_REJECTED, APPLICATION_REJECTED)
            }
        }
    }
}

/// Message conversion errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum MessagingError {
    #[error("Cannot send a message with unknown content type")]
    UnknownContentType,
    #[error("Received message has no data body section")]
    MissingDataBody,
    #[error("Received message property '{property}' is of type {found}, expected string")]
    NonStringProperty {
        property: String,
        found: &'static str,
    },
}

/// Pure message conversion functions
pub struct MessageConverter;

impl MessageConverter {
    /// Build the wire message for an outbound upper-layer message
    pub fn to_amqp(message: &IotHubMessage) -> Result<AmqpMessage, MessagingError> {
        let data = match &message.content {
            MessageContent::Binary(bytes) => bytes.clone(),
            MessageContent::Text(text) => Bytes::copy_from_slice(text.as_bytes()),
            MessageContent::Unknown => return Err(MessagingError::UnknownContentType),
        };

        let properties = AmqpProperties {
            message_id: message.message_id.as_deref().map(AmqpValue::from),
            correlation_id: message.correlation_id.as_deref().map(AmqpValue::from),
        };

        let application_properties = message
            .properties
            .iter()
            .map(|(k, v)| (k.clone(), AmqpValue::String(v.clone())))
            .collect();

        Ok(AmqpMessage {
            body: AmqpBody::Data(vec![data]),
            properties,
            application_properties,
        })
    }

    /// Build the upper-layer message for a received wire message
    pub fn from_amqp(message: &AmqpMessage) -> Result<IotHubMessage, MessagingError> {
        let payload = match &message.body {
            AmqpBody::Data(sections) => sections
                .first()
                .cloned()
                .ok_or(MessagingError::MissingDataBody)?,
            _ => return Err(MessagingError::MissingDataBody),
        };

        let mut converted = IotHubMessage::binary(payload);
        converted.message_id =
            Self::optional_string("message-id", message.properties.message_id.as_ref())?;
        converted.correlation_id =
            Self::optional_string("correlation-id", message.properties.correlation_id.as_ref())?;

        for (key, value) in &message.application_properties {
            let value = value.as_str().ok_or_else(|| MessagingError::NonStringProperty {
                property: key.clone(),
                found: value.type_name(),
            })?;
            converted.properties.insert(key.clone(), value.to_string());
        }

        Ok(converted)
    }

    // Absent and null ids are both skipped; any other non-string is an error.
    fn optional_string(
        property: &str,
        value: Option<&AmqpValue>,
    ) -> Result<Option<String>, MessagingError> {
        match value {
            None | Some(AmqpValue::Null) => Ok(None),
            Some(AmqpValue::String(s)) => Ok(Some(s.clone())),
            Some(other) => Err(MessagingError::NonStringProperty {
                property: property.to_string(),
                found: other.type_name(),
            }),
        }
    }
}
