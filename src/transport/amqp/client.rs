//! Multiplexing AMQP transport: public API and per-tick orchestration
//!
//! One [`AmqpTransport`] owns one shared connection stack and any number of
//! registered devices. All work happens inside [`AmqpTransport::do_work`]:
//! build the stack if needed, service each device in registration order,
//! pump the connection once and dispatch whatever it reported. Any fatal
//! device error or connection fault tears everything down, and the next tick
//! rebuilds it from scratch.

use super::collaborators::{
    AmqpEvent, AuthenticationConfig, AuthenticationFactory, CredentialType, DeviceClient,
    DeviceMethodsFactory, LinkRole, OptionValue, TransportDependencies,
};
use super::connection::{ConnectionManager, OPTION_LOG_TRACE};
use super::device::{DeviceHandle, DeviceSession, DeviceStatus, DeviceWorkContext};
use super::link_naming::{DeviceAddresses, LinkCounter};
use super::retry::{ConnectionState, DeviceOutcome, RetryPlanner, TickPlan};
use crate::config::{DeviceConfig, TransportConfig, TransportOptions, RFC1035_MAX_FQDN_LENGTH};
use crate::error::{TransportError, TransportResult};
use crate::observability::{connection_span, device_span, TransportMetrics};
use crate::protocol::{SendStatus, WaitingList};
use tracing::{debug, error, info, warn};
use url::Url;

/// SAS token lifetime, as [`OptionValue::Millis`]
pub const OPTION_SAS_TOKEN_LIFETIME: &str = "sas_token_lifetime";

/// SAS token refresh interval, as [`OptionValue::Millis`]
pub const OPTION_SAS_TOKEN_REFRESH_TIME: &str = "sas_token_refresh_time";

/// CBS request timeout, as [`OptionValue::Millis`]
pub const OPTION_CBS_REQUEST_TIMEOUT: &str = "cbs_request_timeout";

/// X.509 client certificate, forwarded to the TLS layer
pub const OPTION_X509_CERT: &str = "x509certificate";

/// X.509 private key, forwarded to the TLS layer
pub const OPTION_X509_PRIVATE_KEY: &str = "x509privatekey";

/// Retry policies the upper client layer may ask for.
/// The AMQP transport always rebuilds on the next tick and accepts none of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    None,
    Immediate,
    Interval,
    LinearBackoff,
    ExponentialBackoff,
    ExponentialBackoffWithJitter,
    Random,
}

/// Multiplexing device-to-cloud AMQP transport
///
/// `devices` is declared first so every device (and its links) is dropped
/// before the shared stack it runs on.
pub struct AmqpTransport {
    devices: Vec<DeviceSession>,
    connection: ConnectionManager,
    connection_state: ConnectionState,
    preferred_credential: Option<CredentialType>,
    link_counter: LinkCounter,
    options: TransportOptions,
    next_handle: u64,
    metrics: TransportMetrics,
    authentication: Box<dyn AuthenticationFactory>,
    methods: Box<dyn DeviceMethodsFactory>,
}

impl AmqpTransport {
    /// Validate the hub configuration and allocate an idle transport.
    /// No I/O happens until the first device is registered and `do_work` runs.
    pub fn create(
        config: &TransportConfig,
        dependencies: TransportDependencies,
    ) -> TransportResult<Self> {
        if config.iot_hub_name.is_empty() {
            return Err(TransportError::invalid_config("iot_hub_name must not be empty"));
        }
        if config.iot_hub_suffix.is_empty() {
            return Err(TransportError::invalid_config("iot_hub_suffix must not be empty"));
        }
        if config
            .protocol_gateway_host_name
            .as_deref()
            .is_some_and(str::is_empty)
        {
            return Err(TransportError::invalid_config(
                "protocol_gateway_host_name must not be empty when set",
            ));
        }

        // Name, dot and suffix must fit in an RFC 1035 name
        let combined = config.iot_hub_name.len() + config.iot_hub_suffix.len();
        if combined > RFC1035_MAX_FQDN_LENGTH - 1 {
            return Err(TransportError::invalid_config(format!(
                "iot_hub_name and iot_hub_suffix together are {} bytes; at most {} allowed",
                combined,
                RFC1035_MAX_FQDN_LENGTH - 1
            )));
        }

        let host_fqdn = config.host_fqdn();
        validate_host(&host_fqdn)?;

        let TransportDependencies {
            io_provider,
            amqp,
            authentication,
            methods,
        } = dependencies;

        info!(host = %host_fqdn, "AMQP transport created");

        Ok(Self {
            devices: Vec::new(),
            connection: ConnectionManager::new(host_fqdn, io_provider, amqp),
            connection_state: ConnectionState::Idle,
            preferred_credential: None,
            link_counter: LinkCounter::default(),
            options: TransportOptions::default(),
            next_handle: 1,
            metrics: TransportMetrics::new(),
            authentication,
            methods,
        })
    }

    pub fn host_fqdn(&self) -> &str {
        self.connection.host_fqdn()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection_state
    }

    /// Credential class every registered device must share, once fixed
    pub fn preferred_credential(&self) -> Option<CredentialType> {
        self.preferred_credential
    }

    pub fn options(&self) -> &TransportOptions {
        &self.options
    }

    pub fn metrics(&self) -> &TransportMetrics {
        &self.metrics
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Registered device ids, in registration order
    pub fn device_ids(&self) -> Vec<&str> {
        self.devices.iter().map(DeviceSession::device_id).collect()
    }

    /// True while the shared stack is built
    pub fn is_connected(&self) -> bool {
        self.connection.is_established()
    }

    /// Register a device on the shared connection.
    ///
    /// Fails without changing anything if the id is empty or already taken,
    /// if both a key and a SAS token are given, or if the credential class
    /// differs from the one locked by earlier devices or X.509 options.
    pub fn register(
        &mut self,
        device: &DeviceConfig,
        client: Box<dyn DeviceClient>,
        waiting: WaitingList,
    ) -> TransportResult<DeviceHandle> {
        if device.device_id.is_empty() {
            return Err(TransportError::invalid_argument("device_id must not be empty"));
        }

        if device.device_key.is_some() && device.device_sas_token.is_some() {
            return Err(TransportError::invalid_argument(format!(
                "device '{}' has both a device key and a SAS token; provide only one",
                device.device_id
            )));
        }

        let credential_type = credential_type_of(device);
        self.check_credential_compatible(&device.device_id, credential_type)?;

        if self.find_by_id(&device.device_id).is_some() {
            return Err(TransportError::DuplicateDevice {
                device_id: device.device_id.clone(),
            });
        }

        let host_fqdn = self.connection.host_fqdn().to_string();
        let authentication = self.authentication.create(&AuthenticationConfig {
            device_id: device.device_id.clone(),
            device_key: device.device_key.clone(),
            device_sas_token: device.device_sas_token.clone(),
            iot_hub_host_fqdn: host_fqdn.clone(),
            credential_type,
        })?;
        let methods = self.methods.create(&host_fqdn, &device.device_id)?;

        if self.preferred_credential.is_none() {
            self.preferred_credential = Some(authentication.credential_type());
        }

        let handle = DeviceHandle::new(self.next_handle);
        self.next_handle += 1;

        let session = DeviceSession::new(
            handle,
            device.device_id.clone(),
            authentication.credential_type(),
            DeviceAddresses::derive(&host_fqdn, &device.device_id),
            waiting,
            authentication,
            methods,
            client,
        );
        self.devices.push(session);

        info!(
            device_id = %device.device_id,
            %handle,
            credential = ?credential_type,
            "Device registered"
        );
        Ok(handle)
    }

    /// Release a device's links, return its in-flight messages to its
    /// waiting list and drop it
    pub fn unregister(&mut self, handle: DeviceHandle) -> TransportResult<()> {
        let index = self
            .devices
            .iter()
            .position(|device| device.handle() == handle)
            .ok_or_else(|| {
                error!(%handle, "Cannot unregister a device that is not registered");
                TransportError::DeviceNotRegistered {
                    handle: handle.value(),
                }
            })?;

        let mut device = self.devices.remove(index);
        let rolled_back = device.release();
        self.metrics.messages_rolled_back(rolled_back);
        self.metrics.forget_device(device.device_id());

        info!(device_id = %device.device_id(), rolled_back, "Device unregistered");
        Ok(())
    }

    /// Enable cloud-to-device messages; the receiver is created on a later tick
    pub fn subscribe(&mut self, handle: DeviceHandle) -> TransportResult<()> {
        self.device_mut(handle)?.set_receive_enabled(true);
        Ok(())
    }

    /// Disable cloud-to-device messages; the receiver is closed on a later tick
    pub fn unsubscribe(&mut self, handle: DeviceHandle) -> TransportResult<()> {
        self.device_mut(handle)?.set_receive_enabled(false);
        Ok(())
    }

    pub fn subscribe_device_methods(&mut self, handle: DeviceHandle) -> TransportResult<()> {
        self.device_mut(handle)?.request_methods();
        Ok(())
    }

    pub fn unsubscribe_device_methods(&mut self, handle: DeviceHandle) -> TransportResult<()> {
        self.device_mut(handle)?.cancel_methods();
        Ok(())
    }

    pub fn subscribe_device_twin(&mut self, handle: DeviceHandle) -> TransportResult<()> {
        self.device_mut(handle)?;
        Err(TransportError::NotSupported {
            operation: "subscribe_device_twin",
        })
    }

    pub fn unsubscribe_device_twin(&mut self, handle: DeviceHandle) {
        debug!(%handle, "Device twin is not supported over AMQP; nothing to unsubscribe");
    }

    pub fn set_retry_policy(
        &mut self,
        policy: RetryPolicy,
        timeout_limit_secs: u64,
    ) -> TransportResult<()> {
        warn!(?policy, timeout_limit_secs, "Retry policies are not supported over AMQP");
        Err(TransportError::NotSupported {
            operation: "set_retry_policy",
        })
    }

    /// `Busy` while the device has waiting or in-progress messages
    pub fn send_status(&self, handle: DeviceHandle) -> TransportResult<SendStatus> {
        Ok(self.device(handle)?.send_status())
    }

    pub fn device_status(&self, handle: DeviceHandle) -> TransportResult<DeviceStatus> {
        Ok(self.device(handle)?.status())
    }

    /// Set a transport option.
    ///
    /// Token and CBS timings are stored and used on the next authentication
    /// cycle. `logtrace` applies to the live stack and every future one. X.509
    /// options lock the credential class and, like every other name, are
    /// forwarded to the TLS layer.
    pub fn set_option(&mut self, name: &str, value: OptionValue) -> TransportResult<()> {
        match name {
            OPTION_SAS_TOKEN_LIFETIME => {
                self.options.sas_token_lifetime_ms = expect_millis(name, &value)?;
            }
            OPTION_SAS_TOKEN_REFRESH_TIME => {
                self.options.sas_token_refresh_time_ms = expect_millis(name, &value)?;
            }
            OPTION_CBS_REQUEST_TIMEOUT => {
                self.options.cbs_request_timeout_ms = expect_millis(name, &value)?;
            }
            OPTION_LOG_TRACE => {
                let OptionValue::Bool(enabled) = value else {
                    return Err(TransportError::invalid_argument(format!(
                        "option '{name}' expects a boolean"
                    )));
                };
                self.connection.set_trace(enabled)?;
                debug!(enabled, "Trace logging updated");
            }
            _ => {
                if name == OPTION_X509_CERT || name == OPTION_X509_PRIVATE_KEY {
                    self.lock_x509(name)?;
                }

                if let Err(e) = self.connection.set_tls_option(name, &value) {
                    error!(option = name, "TLS layer rejected option: {}", e);
                    return Err(TransportError::option_rejected(name, e.to_string()));
                }
            }
        }

        Ok(())
    }

    /// Advance the transport by one tick. Failures are absorbed into the
    /// retry state machine; nothing is reported to the caller.
    pub fn do_work(&mut self) {
        let plan = RetryPlanner::plan_tick(
            self.devices.len(),
            self.connection_state,
            self.connection.is_established(),
        );

        let span = connection_span!(host = %self.connection.host_fqdn());
        let _entered = span.enter();

        match plan {
            TickPlan::Skip => return,
            TickPlan::Retry => {
                self.retry_connection();
                return;
            }
            TickPlan::Establish => {
                if !self.establish_connection() {
                    self.retry_connection();
                    return;
                }
            }
            TickPlan::Service => {}
        }

        if self.service_devices() {
            self.retry_connection();
            return;
        }

        let events = self.connection.pump();
        for event in events {
            self.dispatch_event(event);
        }
    }

    fn establish_connection(&mut self) -> bool {
        let Some(credential_type) = self.preferred_credential else {
            error!("No credential type established; cannot connect");
            return false;
        };

        self.metrics.connection_attempt();
        match self.connection.establish(credential_type) {
            Ok(()) => {
                self.metrics.connection_established();
                true
            }
            Err(_) => {
                self.metrics.connection_failed();
                false
            }
        }
    }

    /// Run every device once. Returns true if any device failed fatally;
    /// the remaining devices are still serviced.
    fn service_devices(&mut self) -> bool {
        let mut ctx = DeviceWorkContext {
            connection: &mut self.connection,
            link_counter: &mut self.link_counter,
            options: &self.options,
            metrics: &self.metrics,
        };

        let outcomes: Vec<DeviceOutcome> = self
            .devices
            .iter_mut()
            .map(|device| {
                let span = device_span!(device_id = %device.device_id());
                let _entered = span.enter();
                device.do_work(&mut ctx)
            })
            .collect();

        RetryPlanner::requires_retry(outcomes)
    }

    /// Reset every device and tear down the shared stack; the next tick
    /// starts from nothing.
    fn retry_connection(&mut self) {
        warn!(
            devices = self.devices.len(),
            "Resetting AMQP connection and every device link"
        );

        let rolled_back: usize = self
            .devices
            .iter_mut()
            .map(DeviceSession::prepare_for_retry)
            .sum();
        self.metrics.messages_rolled_back(rolled_back);

        self.connection.teardown();
        self.set_connection_state(ConnectionState::Idle);
        self.metrics.connection_retry();
    }

    fn set_connection_state(&mut self, state: ConnectionState) {
        RetryPlanner::log_state_transition(self.connection_state, state);
        self.connection_state = state;
    }

    fn dispatch_event(&mut self, event: AmqpEvent) {
        let trace = self.connection.trace_enabled();

        match event {
            AmqpEvent::SenderStateChanged {
                link_name,
                new_state,
                previous_state,
            } => {
                let escalate = self
                    .find_by_link(&link_name, LinkRole::Sender)
                    .is_some_and(|device| {
                        device.on_sender_state_changed(&link_name, new_state, previous_state, trace)
                    });
                if escalate {
                    self.set_connection_state(ConnectionState::Error);
                }
            }
            AmqpEvent::ReceiverStateChanged {
                link_name,
                new_state,
                previous_state,
            } => {
                let escalate = self
                    .find_by_link(&link_name, LinkRole::Receiver)
                    .is_some_and(|device| {
                        device.on_receiver_state_changed(
                            &link_name,
                            new_state,
                            previous_state,
                            trace,
                        )
                    });
                if escalate {
                    self.set_connection_state(ConnectionState::Error);
                }
            }
            AmqpEvent::SendComplete {
                link_name,
                tag,
                result,
            } => {
                let metrics = &self.metrics;
                match self
                    .devices
                    .iter_mut()
                    .find(|d| d.owns_link(&link_name) == Some(LinkRole::Sender))
                {
                    Some(device) => device.on_send_complete(&link_name, tag, result, metrics),
                    None => debug!(link = %link_name, message_id = %tag, "Ignoring completion for unknown link"),
                }
            }
            AmqpEvent::MessageReceived {
                link_name,
                delivery_id,
                message,
            } => {
                let metrics = &self.metrics;
                match self
                    .devices
                    .iter_mut()
                    .find(|d| d.owns_link(&link_name) == Some(LinkRole::Receiver))
                {
                    Some(device) => {
                        device.on_message_received(&link_name, delivery_id, &message, metrics)
                    }
                    None => debug!(link = %link_name, delivery_id, "Ignoring delivery for unknown link"),
                }
            }
            AmqpEvent::ManagementStateChanged {
                new_state,
                previous_state,
            } => {
                debug!(?previous_state, ?new_state, "CBS state changed");
                self.set_connection_state(ConnectionState::from(new_state));
            }
            AmqpEvent::IoError { reason } => {
                error!(reason = %reason, "AMQP connection I/O error");
                self.set_connection_state(ConnectionState::Error);
            }
            AmqpEvent::MethodRequest {
                device_id,
                request_id,
                request,
            } => match self.devices.iter_mut().find(|d| d.device_id() == device_id) {
                Some(device) => {
                    self.metrics.method_request();
                    device.on_method_request(&request_id, &request);
                }
                None => warn!(device_id = %device_id, method = %request.method_name, "Method request for unknown device"),
            },
            AmqpEvent::MethodsError { device_id, reason } => {
                error!(device_id = %device_id, reason = %reason, "Device methods error");
            }
        }
    }

    fn check_credential_compatible(
        &self,
        device_id: &str,
        credential_type: CredentialType,
    ) -> TransportResult<()> {
        let Some(preferred) = self.preferred_credential else {
            return Ok(());
        };

        if preferred.uses_cbs() != credential_type.uses_cbs() {
            error!(
                device_id,
                preferred = ?preferred,
                requested = ?credential_type,
                "Device credential type is incompatible with this transport"
            );
            return Err(TransportError::incompatible_credentials(format!(
                "device '{device_id}' uses {credential_type:?} but the transport is locked to {preferred:?}"
            )));
        }

        Ok(())
    }

    fn lock_x509(&mut self, name: &str) -> TransportResult<()> {
        match self.preferred_credential {
            None => {
                self.preferred_credential = Some(CredentialType::X509);
                Ok(())
            }
            Some(CredentialType::X509) => Ok(()),
            Some(other) => {
                error!(option = name, preferred = ?other, "X.509 option on a transport locked to another credential type");
                Err(TransportError::option_rejected(
                    name,
                    format!("transport is locked to {other:?} credentials"),
                ))
            }
        }
    }

    fn device(&self, handle: DeviceHandle) -> TransportResult<&DeviceSession> {
        self.devices
            .iter()
            .find(|device| device.handle() == handle)
            .ok_or(TransportError::DeviceNotRegistered {
                handle: handle.value(),
            })
    }

    fn device_mut(&mut self, handle: DeviceHandle) -> TransportResult<&mut DeviceSession> {
        self.devices
            .iter_mut()
            .find(|device| device.handle() == handle)
            .ok_or(TransportError::DeviceNotRegistered {
                handle: handle.value(),
            })
    }

    fn find_by_id(&self, device_id: &str) -> Option<&DeviceSession> {
        self.devices.iter().find(|d| d.device_id() == device_id)
    }

    fn find_by_link(&mut self, link_name: &str, role: LinkRole) -> Option<&mut DeviceSession> {
        self.devices
            .iter_mut()
            .find(|d| d.owns_link(link_name) == Some(role))
    }
}

impl Drop for AmqpTransport {
    fn drop(&mut self) {
        for mut device in self.devices.drain(..) {
            device.release();
        }
        self.connection.teardown();
        debug!("AMQP transport destroyed");
    }
}

fn credential_type_of(device: &DeviceConfig) -> CredentialType {
    match (&device.device_key, &device.device_sas_token) {
        (Some(_), _) => CredentialType::SharedKey,
        (None, Some(_)) => CredentialType::SasToken,
        (None, None) => CredentialType::X509,
    }
}

fn expect_millis(name: &str, value: &OptionValue) -> TransportResult<u64> {
    match value {
        OptionValue::Millis(ms) => Ok(*ms),
        other => Err(TransportError::invalid_argument(format!(
            "option '{name}' expects milliseconds, got {other:?}"
        ))),
    }
}

fn validate_host(host_fqdn: &str) -> TransportResult<()> {
    let url = Url::parse(&format!("amqps://{host_fqdn}")).map_err(|e| {
        TransportError::invalid_config(format!("'{host_fqdn}' is not a valid host name: {e}"))
    })?;

    match url.host_str() {
        Some(host) if !host.is_empty() => Ok(()),
        _ => Err(TransportError::invalid_config(format!(
            "'{host_fqdn}' does not name a host"
        ))),
    }
}
