//! In-memory fakes for every collaborator the transport drives
//!
//! All fakes share one [`MockWorld`], which records every call, counts live
//! handles, can be told to fail any operation, and plays the part of the AMQP
//! library when the connection is pumped: authentication in progress becomes
//! `Ok`, newly opened links report `Open`, and sent messages are confirmed.

use crate::config::TransportOptions;
use crate::error::CollaboratorError;
use crate::protocol::{
    ConfirmationResult, DispositionResult, IotHubMessage, MessageId, MethodRequest,
    MethodResponse, OutboundMessage,
};
use crate::transport::amqp::collaborators::{
    AmqpConnection, AmqpEvent, AmqpLibrary, AmqpLink, AmqpSession, AuthenticationConfig,
    AuthenticationFactory, AuthenticationStatus, CbsHandle, CollaboratorResult, ConnectionIo,
    CredentialType, DeviceAuthentication, DeviceClient, DeviceMethods, DeviceMethodsFactory,
    IoTransportProvider, LinkRole, LinkSpec, LinkState, ManagementState, MessageReceiver,
    MessageSender, OptionValue, ReceiverSettleMode, SaslIo, SaslMechanism, SavedOptions,
    SendResult, TlsIo, TransportDependencies, XioLayer,
};
use crate::transport::amqp::connection::OPTION_LOG_TRACE;
use crate::transport::amqp::messaging::{AmqpBody, AmqpMessage, AmqpValue, Disposition};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::rc::Rc;

#[derive(Default)]
struct WorldState {
    calls: Vec<String>,
    failures: HashSet<String>,
    live: HashMap<&'static str, i64>,
    auth_status: HashMap<String, AuthenticationStatus>,
    last_auth_options: Option<TransportOptions>,
    incoming_window: Option<u32>,
    outgoing_window: Option<u32>,
    connection_io: Option<&'static str>,
    connection_trace: Option<bool>,
    sasl_trace: Option<bool>,
    cbs_opened: bool,
    management_announced: bool,
    link_names: Vec<String>,
    attach_properties: BTreeMap<String, String>,
    settle_mode: Option<ReceiverSettleMode>,
    pending_opens: Vec<(String, LinkRole)>,
    pending_sends: Vec<(String, MessageId)>,
    sent_payloads: Vec<Vec<u8>>,
    injected: VecDeque<AmqpEvent>,
    manual_mode: ManualMode,
    client_disposition: Option<DispositionResult>,
    received_payloads: Vec<Vec<u8>>,
    settlements: Vec<(u64, Disposition)>,
    method_responses: Vec<(String, String, i32)>,
}

/// Automatic reactions the fake library can be told to hold back
#[derive(Default)]
struct ManualMode {
    completions: bool,
    link_opens: bool,
    authentication: bool,
}

/// Shared, single-threaded state behind every fake
#[derive(Clone, Default)]
pub struct MockWorld {
    state: Rc<RefCell<WorldState>>,
}

impl MockWorld {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fakes for every collaborator, all bound to this world
    pub fn dependencies(&self) -> TransportDependencies {
        TransportDependencies {
            io_provider: Box::new(MockIoProvider::new(self)),
            amqp: Box::new(MockAmqpLibrary::new(self)),
            authentication: Box::new(MockAuthenticationFactory::new(self)),
            methods: Box::new(MockMethodsFactory::new(self)),
        }
    }

    /// Record a call and fail it if either `operation` or
    /// `operation:target` was registered with [`MockWorld::fail_on`]
    fn invoke(&self, operation: &'static str, target: Option<&str>) -> CollaboratorResult<()> {
        let name = match target {
            Some(target) => format!("{operation}:{target}"),
            None => operation.to_string(),
        };

        let mut state = self.state.borrow_mut();
        let fails = state.failures.contains(operation) || state.failures.contains(&name);
        state.calls.push(name);

        if fails {
            Err(CollaboratorError::new(operation, "injected failure"))
        } else {
            Ok(())
        }
    }

    fn acquire(&self, kind: &'static str) {
        *self.state.borrow_mut().live.entry(kind).or_insert(0) += 1;
    }

    fn release(&self, kind: &'static str) {
        *self.state.borrow_mut().live.entry(kind).or_insert(0) -= 1;
    }

    /// Make every matching call fail until [`MockWorld::clear_failures`]
    pub fn fail_on(&self, operation: &str) {
        self.state
            .borrow_mut()
            .failures
            .insert(operation.to_string());
    }

    pub fn clear_failures(&self) {
        self.state.borrow_mut().failures.clear();
    }

    pub fn called(&self, operation: &str) -> bool {
        self.count(operation) > 0
    }

    pub fn count(&self, operation: &str) -> usize {
        self.state
            .borrow()
            .calls
            .iter()
            .filter(|call| call.as_str() == operation)
            .count()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.borrow().calls.clone()
    }

    /// Number of handles of `kind` currently alive
    pub fn live(&self, kind: &str) -> i64 {
        self.state.borrow().live.get(kind).copied().unwrap_or(0)
    }

    pub fn set_auth_status(&self, device_id: &str, status: AuthenticationStatus) {
        self.state
            .borrow_mut()
            .auth_status
            .insert(device_id.to_string(), status);
    }

    pub fn auth_status(&self, device_id: &str) -> AuthenticationStatus {
        self.state
            .borrow()
            .auth_status
            .get(device_id)
            .copied()
            .unwrap_or(AuthenticationStatus::Idle)
    }

    /// Options passed to the most recent authenticate or refresh call
    pub fn last_auth_options(&self) -> Option<TransportOptions> {
        self.state.borrow().last_auth_options
    }

    pub fn last_window_sizes(&self) -> Option<(u32, u32)> {
        let state = self.state.borrow();
        state.incoming_window.zip(state.outgoing_window)
    }

    /// "sasl" or "tls": what the last connection was opened over
    pub fn connection_io(&self) -> Option<&'static str> {
        self.state.borrow().connection_io
    }

    pub fn connection_trace(&self) -> Option<bool> {
        self.state.borrow().connection_trace
    }

    pub fn sasl_trace(&self) -> Option<bool> {
        self.state.borrow().sasl_trace
    }

    /// Every link name ever created, in creation order
    pub fn link_names(&self) -> Vec<String> {
        self.state.borrow().link_names.clone()
    }

    pub fn attach_property(&self, name: &str) -> Option<String> {
        self.state.borrow().attach_properties.get(name).cloned()
    }

    pub fn settle_mode(&self) -> Option<ReceiverSettleMode> {
        self.state.borrow().settle_mode
    }

    pub fn sent_payloads(&self) -> Vec<Vec<u8>> {
        self.state.borrow().sent_payloads.clone()
    }

    /// Queue an event for the next connection pump
    pub fn inject_event(&self, event: AmqpEvent) {
        self.state.borrow_mut().injected.push_back(event);
    }

    /// Stop (or resume) confirming sent messages on pump
    pub fn set_auto_complete(&self, enabled: bool) {
        self.state.borrow_mut().manual_mode.completions = !enabled;
    }

    /// Stop (or resume) reporting new links as open on pump
    pub fn set_auto_open(&self, enabled: bool) {
        self.state.borrow_mut().manual_mode.link_opens = !enabled;
    }

    /// Stop (or resume) finishing in-progress authentication on pump
    pub fn set_auto_authenticate(&self, enabled: bool) {
        self.state.borrow_mut().manual_mode.authentication = !enabled;
    }

    /// Messages sent but not yet confirmed, as `(link, tag)`
    pub fn unconfirmed(&self) -> Vec<(String, MessageId)> {
        self.state.borrow().pending_sends.clone()
    }

    /// What [`MockDeviceClient`] answers for received messages
    pub fn set_client_disposition(&self, disposition: DispositionResult) {
        self.state.borrow_mut().client_disposition = Some(disposition);
    }

    pub fn received_payloads(&self) -> Vec<Vec<u8>> {
        self.state.borrow().received_payloads.clone()
    }

    pub fn settlements(&self) -> Vec<(u64, Disposition)> {
        self.state.borrow().settlements.clone()
    }

    /// `(device_id, request_id, status)` for every method response sent
    pub fn method_responses(&self) -> Vec<(String, String, i32)> {
        self.state.borrow().method_responses.clone()
    }

    pub fn completion_log(&self) -> CompletionLog {
        CompletionLog::default()
    }

    /// What the fake library reports on one pump
    fn pump(&self) -> Vec<AmqpEvent> {
        let mut state = self.state.borrow_mut();
        state.calls.push("connection_do_work".to_string());
        let mut events = Vec::new();

        if state.cbs_opened && !state.management_announced {
            state.management_announced = true;
            events.push(AmqpEvent::ManagementStateChanged {
                new_state: ManagementState::Open,
                previous_state: ManagementState::Opening,
            });
        }

        if !state.manual_mode.authentication {
            for status in state.auth_status.values_mut() {
                if *status == AuthenticationStatus::InProgress {
                    *status = AuthenticationStatus::Ok;
                }
            }
        }

        if !state.manual_mode.link_opens {
            for (link_name, role) in std::mem::take(&mut state.pending_opens) {
                for (previous_state, new_state) in [
                    (LinkState::Idle, LinkState::Opening),
                    (LinkState::Opening, LinkState::Open),
                ] {
                    let link_name = link_name.clone();
                    events.push(match role {
                        LinkRole::Sender => AmqpEvent::SenderStateChanged {
                            link_name,
                            new_state,
                            previous_state,
                        },
                        LinkRole::Receiver => AmqpEvent::ReceiverStateChanged {
                            link_name,
                            new_state,
                            previous_state,
                        },
                    });
                }
            }
        }

        if !state.manual_mode.completions {
            for (link_name, tag) in std::mem::take(&mut state.pending_sends) {
                events.push(AmqpEvent::SendComplete {
                    link_name,
                    tag,
                    result: SendResult::Ok,
                });
            }
        }

        events.extend(state.injected.drain(..));
        events
    }
}

/// Records the results delivered to completion callbacks
#[derive(Clone, Default)]
pub struct CompletionLog {
    results: Rc<RefCell<Vec<ConfirmationResult>>>,
}

impl CompletionLog {
    /// Wrap a message so its completion lands in this log
    pub fn tracked(&self, message: IotHubMessage) -> OutboundMessage {
        let results = Rc::clone(&self.results);
        OutboundMessage::with_callback(message, move |result| {
            results.borrow_mut().push(result);
        })
    }

    pub fn results(&self) -> Vec<ConfirmationResult> {
        self.results.borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.results.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.borrow().is_empty()
    }
}

fn payload_of(message: &AmqpMessage) -> Vec<u8> {
    match &message.body {
        AmqpBody::Data(sections) => sections.iter().flat_map(|s| s.iter().copied()).collect(),
        _ => Vec::new(),
    }
}

// I/O layers

pub struct MockIoProvider {
    world: MockWorld,
}

impl MockIoProvider {
    pub fn new(world: &MockWorld) -> Self {
        Self {
            world: world.clone(),
        }
    }
}

impl IoTransportProvider for MockIoProvider {
    fn create_io(&self, _host_fqdn: &str) -> CollaboratorResult<Box<dyn TlsIo>> {
        self.world.invoke("tls_create", None)?;
        self.world.acquire("tls_io");
        Ok(Box::new(MockTlsIo {
            world: self.world.clone(),
            options: Vec::new(),
        }))
    }
}

pub struct MockTlsIo {
    world: MockWorld,
    options: Vec<(String, OptionValue)>,
}

impl XioLayer for MockTlsIo {
    fn set_option(&mut self, name: &str, value: &OptionValue) -> CollaboratorResult<()> {
        self.world.invoke("tls_set_option", Some(name))?;
        self.options.retain(|(existing, _)| existing != name);
        self.options.push((name.to_string(), value.clone()));
        Ok(())
    }
}

impl TlsIo for MockTlsIo {
    fn retrieve_options(&self) -> CollaboratorResult<SavedOptions> {
        self.world.invoke("tls_retrieve_options", None)?;
        let mut saved = SavedOptions::new();
        for (name, value) in &self.options {
            saved.push(name.as_str(), value.clone());
        }
        Ok(saved)
    }
}

impl Drop for MockTlsIo {
    fn drop(&mut self) {
        self.world.release("tls_io");
    }
}

pub struct MockSaslMechanism {
    world: MockWorld,
}

impl SaslMechanism for MockSaslMechanism {
    fn name(&self) -> &str {
        "MSSBCBS"
    }
}

impl Drop for MockSaslMechanism {
    fn drop(&mut self) {
        self.world.release("sasl_mechanism");
    }
}

pub struct MockSaslIo {
    world: MockWorld,
}

impl XioLayer for MockSaslIo {
    fn set_option(&mut self, name: &str, value: &OptionValue) -> CollaboratorResult<()> {
        self.world.invoke("sasl_set_option", Some(name))?;
        if let (OPTION_LOG_TRACE, OptionValue::Bool(enabled)) = (name, value) {
            self.world.state.borrow_mut().sasl_trace = Some(*enabled);
        }
        Ok(())
    }
}

impl SaslIo for MockSaslIo {}

impl Drop for MockSaslIo {
    fn drop(&mut self) {
        self.world.release("sasl_io");
    }
}

// AMQP library

pub struct MockAmqpLibrary {
    world: MockWorld,
}

impl MockAmqpLibrary {
    pub fn new(world: &MockWorld) -> Self {
        Self {
            world: world.clone(),
        }
    }
}

impl AmqpLibrary for MockAmqpLibrary {
    fn create_sasl_mechanism(&self) -> CollaboratorResult<Box<dyn SaslMechanism>> {
        self.world.invoke("sasl_mechanism_create", None)?;
        self.world.acquire("sasl_mechanism");
        Ok(Box::new(MockSaslMechanism {
            world: self.world.clone(),
        }))
    }

    fn create_sasl_io(
        &self,
        _underlying: &dyn TlsIo,
        _mechanism: &dyn SaslMechanism,
    ) -> CollaboratorResult<Box<dyn SaslIo>> {
        self.world.invoke("sasl_io_create", None)?;
        self.world.acquire("sasl_io");
        Ok(Box::new(MockSaslIo {
            world: self.world.clone(),
        }))
    }

    fn create_connection(
        &self,
        io: ConnectionIo<'_>,
        _host_fqdn: &str,
        _container_id: &str,
    ) -> CollaboratorResult<Box<dyn AmqpConnection>> {
        self.world.invoke("connection_create", None)?;
        self.world.acquire("connection");
        {
            let mut state = self.world.state.borrow_mut();
            state.connection_io = Some(match io {
                ConnectionIo::Sasl(_) => "sasl",
                ConnectionIo::Tls(_) => "tls",
            });
            state.cbs_opened = false;
            state.management_announced = false;
        }
        Ok(Box::new(MockConnection {
            world: self.world.clone(),
        }))
    }
}

pub struct MockConnection {
    world: MockWorld,
}

impl AmqpConnection for MockConnection {
    fn create_session(&mut self) -> CollaboratorResult<Box<dyn AmqpSession>> {
        self.world.invoke("session_create", None)?;
        self.world.acquire("session");
        Ok(Box::new(MockSession {
            world: self.world.clone(),
        }))
    }

    fn set_trace(&mut self, enabled: bool) {
        self.world.state.borrow_mut().connection_trace = Some(enabled);
    }

    fn do_work(&mut self) -> Vec<AmqpEvent> {
        self.world.pump()
    }
}

impl Drop for MockConnection {
    fn drop(&mut self) {
        {
            // Nothing on a dead connection ever completes
            let mut state = self.world.state.borrow_mut();
            state.pending_opens.clear();
            state.pending_sends.clear();
        }
        self.world.release("connection");
    }
}

pub struct MockSession {
    world: MockWorld,
}

impl AmqpSession for MockSession {
    fn set_incoming_window(&mut self, window: u32) -> CollaboratorResult<()> {
        self.world.invoke("session_set_incoming_window", None)?;
        self.world.state.borrow_mut().incoming_window = Some(window);
        Ok(())
    }

    fn set_outgoing_window(&mut self, window: u32) -> CollaboratorResult<()> {
        self.world.invoke("session_set_outgoing_window", None)?;
        self.world.state.borrow_mut().outgoing_window = Some(window);
        Ok(())
    }

    fn create_cbs(&mut self) -> CollaboratorResult<Box<dyn CbsHandle>> {
        self.world.invoke("cbs_create", None)?;
        self.world.acquire("cbs");
        Ok(Box::new(MockCbs {
            world: self.world.clone(),
        }))
    }

    fn create_link(&mut self, spec: &LinkSpec) -> CollaboratorResult<Box<dyn AmqpLink>> {
        self.world.invoke("link_create", Some(&spec.name))?;
        self.world.acquire("link");
        self.world
            .state
            .borrow_mut()
            .link_names
            .push(spec.name.clone());
        Ok(Box::new(MockLink {
            world: self.world.clone(),
            name: spec.name.clone(),
        }))
    }
}

impl Drop for MockSession {
    fn drop(&mut self) {
        self.world.release("session");
    }
}

pub struct MockCbs {
    world: MockWorld,
}

impl CbsHandle for MockCbs {
    fn open(&mut self) -> CollaboratorResult<()> {
        self.world.invoke("cbs_open", None)?;
        self.world.state.borrow_mut().cbs_opened = true;
        Ok(())
    }
}

impl Drop for MockCbs {
    fn drop(&mut self) {
        self.world.release("cbs");
    }
}

pub struct MockLink {
    world: MockWorld,
    name: String,
}

impl AmqpLink for MockLink {
    fn set_max_message_size(&mut self, _size: u64) -> CollaboratorResult<()> {
        self.world.invoke("link_set_max_message_size", None)
    }

    fn set_attach_properties(
        &mut self,
        properties: &BTreeMap<String, AmqpValue>,
    ) -> CollaboratorResult<()> {
        self.world.invoke("link_set_attach_properties", None)?;
        let mut state = self.world.state.borrow_mut();
        for (name, value) in properties {
            if let Some(text) = value.as_str() {
                state
                    .attach_properties
                    .insert(name.clone(), text.to_string());
            }
        }
        Ok(())
    }

    fn set_rcv_settle_mode(&mut self, mode: ReceiverSettleMode) -> CollaboratorResult<()> {
        self.world.invoke("link_set_rcv_settle_mode", None)?;
        self.world.state.borrow_mut().settle_mode = Some(mode);
        Ok(())
    }

    fn create_sender(&mut self) -> CollaboratorResult<Box<dyn MessageSender>> {
        self.world.invoke("sender_create", None)?;
        self.world.acquire("sender");
        Ok(Box::new(MockSender {
            world: self.world.clone(),
            link_name: self.name.clone(),
        }))
    }

    fn create_receiver(&mut self) -> CollaboratorResult<Box<dyn MessageReceiver>> {
        self.world.invoke("receiver_create", None)?;
        self.world.acquire("receiver");
        Ok(Box::new(MockReceiver {
            world: self.world.clone(),
            link_name: self.name.clone(),
        }))
    }
}

impl Drop for MockLink {
    fn drop(&mut self) {
        self.world.release("link");
    }
}

pub struct MockSender {
    world: MockWorld,
    link_name: String,
}

impl MessageSender for MockSender {
    fn open(&mut self) -> CollaboratorResult<()> {
        self.world.invoke("sender_open", None)?;
        self.world
            .state
            .borrow_mut()
            .pending_opens
            .push((self.link_name.clone(), LinkRole::Sender));
        Ok(())
    }

    fn send(&mut self, message: &AmqpMessage, tag: MessageId) -> CollaboratorResult<()> {
        self.world.invoke("sender_send", None)?;
        let mut state = self.world.state.borrow_mut();
        state.sent_payloads.push(payload_of(message));
        state.pending_sends.push((self.link_name.clone(), tag));
        Ok(())
    }
}

impl Drop for MockSender {
    fn drop(&mut self) {
        self.world.release("sender");
    }
}

pub struct MockReceiver {
    world: MockWorld,
    link_name: String,
}

impl MessageReceiver for MockReceiver {
    fn open(&mut self) -> CollaboratorResult<()> {
        self.world.invoke("receiver_open", None)?;
        self.world
            .state
            .borrow_mut()
            .pending_opens
            .push((self.link_name.clone(), LinkRole::Receiver));
        Ok(())
    }

    fn close(&mut self) -> CollaboratorResult<()> {
        self.world.invoke("receiver_close", None)
    }

    fn settle(&mut self, delivery_id: u64, disposition: Disposition) -> CollaboratorResult<()> {
        self.world.invoke("receiver_settle", None)?;
        self.world
            .state
            .borrow_mut()
            .settlements
            .push((delivery_id, disposition));
        Ok(())
    }
}

impl Drop for MockReceiver {
    fn drop(&mut self) {
        self.world.release("receiver");
    }
}

// Per-device collaborators

pub struct MockAuthenticationFactory {
    world: MockWorld,
}

impl MockAuthenticationFactory {
    pub fn new(world: &MockWorld) -> Self {
        Self {
            world: world.clone(),
        }
    }
}

impl AuthenticationFactory for MockAuthenticationFactory {
    fn create(
        &self,
        config: &AuthenticationConfig,
    ) -> CollaboratorResult<Box<dyn DeviceAuthentication>> {
        self.world
            .invoke("authentication_create", Some(&config.device_id))?;
        self.world
            .set_auth_status(&config.device_id, AuthenticationStatus::Idle);
        self.world.acquire("authentication");
        Ok(Box::new(MockAuthentication {
            world: self.world.clone(),
            device_id: config.device_id.clone(),
            credential_type: config.credential_type,
        }))
    }
}

/// Authentication whose status lives in the world, keyed by device id
pub struct MockAuthentication {
    world: MockWorld,
    device_id: String,
    credential_type: CredentialType,
}

impl MockAuthentication {
    fn start(
        &mut self,
        operation: &'static str,
        cbs: Option<&mut (dyn CbsHandle + 'static)>,
        options: &TransportOptions,
    ) -> CollaboratorResult<()> {
        self.world.invoke(operation, Some(&self.device_id))?;
        if self.credential_type.uses_cbs() && cbs.is_none() {
            return Err(CollaboratorError::new(operation, "no CBS handle"));
        }
        self.world.state.borrow_mut().last_auth_options = Some(*options);
        self.world
            .set_auth_status(&self.device_id, AuthenticationStatus::InProgress);
        Ok(())
    }
}

impl DeviceAuthentication for MockAuthentication {
    fn status(&self) -> AuthenticationStatus {
        self.world.auth_status(&self.device_id)
    }

    fn credential_type(&self) -> CredentialType {
        self.credential_type
    }

    fn authenticate(
        &mut self,
        cbs: Option<&mut (dyn CbsHandle + 'static)>,
        options: &TransportOptions,
    ) -> CollaboratorResult<()> {
        self.start("authenticate", cbs, options)
    }

    fn refresh(
        &mut self,
        cbs: Option<&mut (dyn CbsHandle + 'static)>,
        options: &TransportOptions,
    ) -> CollaboratorResult<()> {
        self.start("refresh", cbs, options)
    }

    fn reset(&mut self) -> CollaboratorResult<()> {
        self.world
            .invoke("authentication_reset", Some(&self.device_id))?;
        self.world
            .set_auth_status(&self.device_id, AuthenticationStatus::Idle);
        Ok(())
    }
}

impl Drop for MockAuthentication {
    fn drop(&mut self) {
        self.world.release("authentication");
    }
}

pub struct MockMethodsFactory {
    world: MockWorld,
}

impl MockMethodsFactory {
    pub fn new(world: &MockWorld) -> Self {
        Self {
            world: world.clone(),
        }
    }
}

impl DeviceMethodsFactory for MockMethodsFactory {
    fn create(
        &self,
        _host_fqdn: &str,
        device_id: &str,
    ) -> CollaboratorResult<Box<dyn DeviceMethods>> {
        self.world.invoke("methods_create", Some(device_id))?;
        Ok(Box::new(MockMethods {
            world: self.world.clone(),
            device_id: device_id.to_string(),
        }))
    }
}

pub struct MockMethods {
    world: MockWorld,
    device_id: String,
}

impl DeviceMethods for MockMethods {
    fn subscribe(&mut self, _session: &mut dyn AmqpSession) -> CollaboratorResult<()> {
        self.world
            .invoke("methods_subscribe", Some(&self.device_id))
    }

    fn unsubscribe(&mut self) {
        // Unsubscribing cannot fail; the call is only recorded
        let _ = self
            .world
            .invoke("methods_unsubscribe", Some(&self.device_id));
    }

    fn respond(&mut self, request_id: &str, response: &MethodResponse) -> CollaboratorResult<()> {
        self.world
            .invoke("methods_respond", Some(&self.device_id))?;
        self.world.state.borrow_mut().method_responses.push((
            self.device_id.clone(),
            request_id.to_string(),
            response.status,
        ));
        Ok(())
    }
}

/// Upper-layer client: records received payloads and answers every method with 200
pub struct MockDeviceClient {
    world: MockWorld,
}

impl MockDeviceClient {
    pub fn new(world: &MockWorld) -> Self {
        Self {
            world: world.clone(),
        }
    }
}

impl DeviceClient for MockDeviceClient {
    fn on_message_received(&mut self, message: IotHubMessage) -> DispositionResult {
        let mut state = self.world.state.borrow_mut();
        state
            .received_payloads
            .push(message.payload().map(<[u8]>::to_vec).unwrap_or_default());
        state
            .client_disposition
            .unwrap_or(DispositionResult::Accepted)
    }

    fn on_method_invoked(&mut self, request: &MethodRequest) -> MethodResponse {
        MethodResponse::new(200, request.payload.clone())
    }
}
