//! Interfaces of the external collaborators driven by the transport
//!
//! The transport never speaks TLS, SASL, CBS or AMQP framing itself. It drives
//! these collaborators through the traits below, owning every handle as a
//! `Box<dyn ...>` so that dropping the handle releases the underlying resource.
//!
//! Library callbacks are modelled as [`AmqpEvent`] values returned from
//! [`AmqpConnection::do_work`]. The transport dispatches them synchronously
//! right after the pump returns; no event handler may call back into
//! `do_work`.

use super::messaging::{AmqpMessage, AmqpValue, Disposition};
use crate::config::TransportOptions;
use crate::error::CollaboratorError;
use crate::protocol::{
    ConfirmationResult, DispositionResult, IotHubMessage, MessageId, MethodRequest, MethodResponse,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Result type for every collaborator call
pub type CollaboratorResult<T> = Result<T, CollaboratorError>;

/// Credential a device authenticates with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialType {
    SharedKey,
    SasToken,
    X509,
}

impl CredentialType {
    /// Shared keys and SAS tokens are both exchanged over CBS
    pub fn uses_cbs(self) -> bool {
        matches!(self, CredentialType::SharedKey | CredentialType::SasToken)
    }
}

/// Value passed through the option-setting facility of an I/O layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionValue {
    Bool(bool),
    Millis(u64),
    Text(String),
    Bytes(Bytes),
}

/// Snapshot of the options set on a TLS layer, replayed when it is recreated
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SavedOptions {
    options: Vec<(String, OptionValue)>,
}

impl SavedOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<N: Into<String>>(&mut self, name: N, value: OptionValue) {
        self.options.push((name.into(), value));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &OptionValue)> {
        self.options.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.options.len()
    }

    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }
}

/// Any layer that accepts named options (TLS, SASL)
pub trait XioLayer {
    fn set_option(&mut self, name: &str, value: &OptionValue) -> CollaboratorResult<()>;
}

/// TLS byte stream supplied by the [`IoTransportProvider`]
pub trait TlsIo: XioLayer {
    /// Capture the options currently applied, so they survive a rebuild
    fn retrieve_options(&self) -> CollaboratorResult<SavedOptions>;
}

/// Supplies a TLS-capable byte stream for a target host
pub trait IoTransportProvider {
    fn create_io(&self, host_fqdn: &str) -> CollaboratorResult<Box<dyn TlsIo>>;
}

impl<F> IoTransportProvider for F
where
    F: Fn(&str) -> CollaboratorResult<Box<dyn TlsIo>>,
{
    fn create_io(&self, host_fqdn: &str) -> CollaboratorResult<Box<dyn TlsIo>> {
        self(host_fqdn)
    }
}

/// SASL mechanism used for CBS authentication
pub trait SaslMechanism {
    fn name(&self) -> &str;
}

/// SASL I/O wrapping the TLS layer
pub trait SaslIo: XioLayer {}

/// Byte stream an AMQP connection is opened over
pub enum ConnectionIo<'a> {
    Tls(&'a dyn TlsIo),
    Sasl(&'a dyn SaslIo),
}

/// Factory for the SASL and connection layers of the stack
pub trait AmqpLibrary {
    fn create_sasl_mechanism(&self) -> CollaboratorResult<Box<dyn SaslMechanism>>;

    fn create_sasl_io(
        &self,
        underlying: &dyn TlsIo,
        mechanism: &dyn SaslMechanism,
    ) -> CollaboratorResult<Box<dyn SaslIo>>;

    fn create_connection(
        &self,
        io: ConnectionIo<'_>,
        host_fqdn: &str,
        container_id: &str,
    ) -> CollaboratorResult<Box<dyn AmqpConnection>>;
}

/// Shared AMQP connection
pub trait AmqpConnection {
    fn create_session(&mut self) -> CollaboratorResult<Box<dyn AmqpSession>>;

    fn set_trace(&mut self, enabled: bool);

    /// Pump I/O once and report what happened
    fn do_work(&mut self) -> Vec<AmqpEvent>;
}

/// AMQP session on the shared connection
pub trait AmqpSession {
    fn set_incoming_window(&mut self, window: u32) -> CollaboratorResult<()>;

    fn set_outgoing_window(&mut self, window: u32) -> CollaboratorResult<()>;

    fn create_cbs(&mut self) -> CollaboratorResult<Box<dyn CbsHandle>>;

    fn create_link(&mut self, spec: &LinkSpec) -> CollaboratorResult<Box<dyn AmqpLink>>;
}

/// Claims-based security handle bound to the session
pub trait CbsHandle {
    fn open(&mut self) -> CollaboratorResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    Sender,
    Receiver,
}

/// Receiver settle mode; `First` means the receiver settles dispositions itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverSettleMode {
    First,
    Second,
}

/// Parameters for a new link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSpec {
    pub name: String,
    pub role: LinkRole,
    pub source: String,
    pub target: String,
}

/// A link and the factory for its sender or receiver endpoint
pub trait AmqpLink {
    fn set_max_message_size(&mut self, size: u64) -> CollaboratorResult<()>;

    fn set_attach_properties(
        &mut self,
        properties: &BTreeMap<String, AmqpValue>,
    ) -> CollaboratorResult<()>;

    fn set_rcv_settle_mode(&mut self, mode: ReceiverSettleMode) -> CollaboratorResult<()>;

    fn create_sender(&mut self) -> CollaboratorResult<Box<dyn MessageSender>>;

    fn create_receiver(&mut self) -> CollaboratorResult<Box<dyn MessageReceiver>>;
}

/// Sending endpoint; completions are reported as [`AmqpEvent::SendComplete`]
pub trait MessageSender {
    fn open(&mut self) -> CollaboratorResult<()>;

    fn send(&mut self, message: &AmqpMessage, tag: MessageId) -> CollaboratorResult<()>;
}

/// Receiving endpoint; arrivals are reported as [`AmqpEvent::MessageReceived`]
pub trait MessageReceiver {
    fn open(&mut self) -> CollaboratorResult<()>;

    fn close(&mut self) -> CollaboratorResult<()>;

    fn settle(&mut self, delivery_id: u64, disposition: Disposition) -> CollaboratorResult<()>;
}

/// State of a message sender or receiver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Idle,
    Opening,
    Open,
    Closing,
    Error,
}

/// State of the CBS / management layer, mirrored into the connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManagementState {
    Idle,
    Opening,
    Open,
    Error,
}

/// Link-level outcome of a send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendResult {
    Ok,
    Error,
    Timeout,
    Cancelled,
}

impl From<SendResult> for ConfirmationResult {
    fn from(result: SendResult) -> Self {
        match result {
            SendResult::Ok => ConfirmationResult::Ok,
            SendResult::Error | SendResult::Timeout | SendResult::Cancelled => {
                ConfirmationResult::Error
            }
        }
    }
}

/// Notification produced by one pump of the AMQP connection
///
/// Link names are unique per connection, so they route link events to the
/// owning device. Events naming a link that no longer exists are ignored.
#[derive(Debug, Clone, PartialEq)]
pub enum AmqpEvent {
    SenderStateChanged {
        link_name: String,
        new_state: LinkState,
        previous_state: LinkState,
    },
    ReceiverStateChanged {
        link_name: String,
        new_state: LinkState,
        previous_state: LinkState,
    },
    SendComplete {
        link_name: String,
        tag: MessageId,
        result: SendResult,
    },
    MessageReceived {
        link_name: String,
        delivery_id: u64,
        message: AmqpMessage,
    },
    ManagementStateChanged {
        new_state: ManagementState,
        previous_state: ManagementState,
    },
    IoError {
        reason: String,
    },
    MethodRequest {
        device_id: String,
        request_id: String,
        request: MethodRequest,
    },
    MethodsError {
        device_id: String,
        reason: String,
    },
}

/// Authentication progress of one device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthenticationStatus {
    Idle,
    RefreshRequired,
    Ok,
    Failure,
    Timeout,
    InProgress,
}

/// Input for creating a device's authentication state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticationConfig {
    pub device_id: String,
    pub device_key: Option<String>,
    pub device_sas_token: Option<String>,
    pub iot_hub_host_fqdn: String,
    pub credential_type: CredentialType,
}

/// Per-device credential lifecycle
///
/// `cbs` is absent for X.509 devices. `options` carries the current token
/// lifetime, refresh and CBS timeout settings.
pub trait DeviceAuthentication {
    fn status(&self) -> AuthenticationStatus;

    fn credential_type(&self) -> CredentialType;

    fn authenticate(
        &mut self,
        cbs: Option<&mut (dyn CbsHandle + 'static)>,
        options: &TransportOptions,
    ) -> CollaboratorResult<()>;

    fn refresh(
        &mut self,
        cbs: Option<&mut (dyn CbsHandle + 'static)>,
        options: &TransportOptions,
    ) -> CollaboratorResult<()>;

    fn reset(&mut self) -> CollaboratorResult<()>;
}

pub trait AuthenticationFactory {
    fn create(
        &self,
        config: &AuthenticationConfig,
    ) -> CollaboratorResult<Box<dyn DeviceAuthentication>>;
}

/// Direct-method channel of one device
pub trait DeviceMethods {
    fn subscribe(&mut self, session: &mut dyn AmqpSession) -> CollaboratorResult<()>;

    /// Must be harmless when no subscription is active
    fn unsubscribe(&mut self);

    fn respond(&mut self, request_id: &str, response: &MethodResponse) -> CollaboratorResult<()>;
}

pub trait DeviceMethodsFactory {
    fn create(&self, host_fqdn: &str, device_id: &str)
        -> CollaboratorResult<Box<dyn DeviceMethods>>;
}

/// Callbacks into the upper client layer for one registered device
pub trait DeviceClient {
    fn on_message_received(&mut self, message: IotHubMessage) -> DispositionResult;

    fn on_method_invoked(&mut self, request: &MethodRequest) -> MethodResponse;
}

/// Everything the transport needs from the outside world, besides config
pub struct TransportDependencies {
    pub io_provider: Box<dyn IoTransportProvider>,
    pub amqp: Box<dyn AmqpLibrary>,
    pub authentication: Box<dyn AuthenticationFactory>,
    pub methods: Box<dyn DeviceMethodsFactory>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_result_maps_to_binary_confirmation() {
        assert_eq!(ConfirmationResult::from(SendResult::Ok), ConfirmationResult::Ok);
        for result in [SendResult::Error, SendResult::Timeout, SendResult::Cancelled] {
            assert_eq!(ConfirmationResult::from(result), ConfirmationResult::Error);
        }
    }

    #[test]
    fn test_credential_classes() {
        assert!(CredentialType::SharedKey.uses_cbs());
        assert!(CredentialType::SasToken.uses_cbs());
        assert!(!CredentialType::X509.uses_cbs());
    }

    #[test]
    fn test_saved_options_preserve_order() {
        let mut saved = SavedOptions::new();
        saved.push("TrustedCerts", OptionValue::Text("pem".to_string()));
        saved.push("logtrace", OptionValue::Bool(true));

        let names: Vec<&str> = saved.iter().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["TrustedCerts", "logtrace"]);
        assert_eq!(saved.len(), 2);
    }
}
