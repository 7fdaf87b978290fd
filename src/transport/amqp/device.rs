//! Per-device session: authentication, links, method subscription and queues
//!
//! A session is serviced once per tick by the orchestrator. It never touches
//! the shared stack beyond reading the session and CBS handles it needs to
//! create links and authenticate.

use super::collaborators::{
    AmqpLink, AuthenticationStatus, CollaboratorResult, CredentialType, DeviceAuthentication,
    DeviceClient, DeviceMethods, LinkRole, LinkSpec, LinkState, MessageReceiver, MessageSender,
    ReceiverSettleMode, SendResult,
};
use super::connection::ConnectionManager;
use super::event_queue::EventQueue;
use super::link_naming::{
    create_link_name, create_source_name, create_target_name, DeviceAddresses, LinkCounter,
    RECEIVER_LINK_TAG, SENDER_LINK_TAG,
};
use super::messaging::{AmqpMessage, AmqpValue, Disposition, MessageConverter};
use super::retry::{AuthenticationAction, DeviceOutcome, RetryPlanner};
use crate::config::TransportOptions;
use crate::error::CollaboratorError;
use crate::observability::TransportMetrics;
use crate::protocol::{ConfirmationResult, MessageId, MethodRequest, SendStatus, WaitingList};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, error, info, warn};

/// Max message size of device-to-cloud links
pub const SENDER_MAX_MESSAGE_SIZE: u64 = u64::MAX;

/// Max message size of cloud-to-device links
pub const RECEIVER_MAX_MESSAGE_SIZE: u64 = 65536;

/// Attach property announcing the client version
pub const CLIENT_VERSION_PROPERTY: &str = "com.microsoft:client-version";

/// Value of [`CLIENT_VERSION_PROPERTY`]
pub fn client_version() -> String {
    format!("iothubclient/{}", env!("CARGO_PKG_VERSION"))
}

fn attach_properties() -> BTreeMap<String, AmqpValue> {
    let mut properties = BTreeMap::new();
    properties.insert(
        CLIENT_VERSION_PROPERTY.to_string(),
        AmqpValue::String(client_version()),
    );
    properties
}

/// Opaque handle returned by device registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceHandle(u64);

impl DeviceHandle {
    pub(crate) fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "device#{}", self.0)
    }
}

/// Direct-method subscription flags
///
/// `requested` is set by the API; `active` once the subscribe call has been
/// made on the current connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodSubscription {
    pub requested: bool,
    pub active: bool,
}

/// Link plus its sender or receiver. The endpoint is dropped before the link.
struct ActiveLink<E: ?Sized> {
    name: String,
    state: LinkState,
    endpoint: Box<E>,
    _link: Box<dyn AmqpLink>,
}

/// Shared state a device needs while it is serviced
pub struct DeviceWorkContext<'a> {
    pub connection: &'a mut ConnectionManager,
    pub link_counter: &'a mut LinkCounter,
    pub options: &'a TransportOptions,
    pub metrics: &'a TransportMetrics,
}

/// Diagnostic view of one device
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceStatus {
    pub device_id: String,
    pub credential_type: CredentialType,
    pub authentication: AuthenticationStatus,
    pub sender_link: Option<String>,
    pub sender_state: Option<LinkState>,
    pub receiver_link: Option<String>,
    pub receiver_state: Option<LinkState>,
    pub receive_enabled: bool,
    pub methods: MethodSubscription,
    pub waiting: usize,
    pub in_progress: usize,
    pub send_status: SendStatus,
}

pub struct DeviceSession {
    handle: DeviceHandle,
    device_id: String,
    credential_type: CredentialType,
    addresses: DeviceAddresses,
    sender: Option<ActiveLink<dyn MessageSender>>,
    receiver: Option<ActiveLink<dyn MessageReceiver>>,
    receive_enabled: bool,
    method_subscription: MethodSubscription,
    events: EventQueue,
    methods: Box<dyn DeviceMethods>,
    authentication: Box<dyn DeviceAuthentication>,
    client: Box<dyn DeviceClient>,
}

impl DeviceSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        handle: DeviceHandle,
        device_id: String,
        credential_type: CredentialType,
        addresses: DeviceAddresses,
        waiting: WaitingList,
        authentication: Box<dyn DeviceAuthentication>,
        methods: Box<dyn DeviceMethods>,
        client: Box<dyn DeviceClient>,
    ) -> Self {
        Self {
            handle,
            device_id,
            credential_type,
            addresses,
            sender: None,
            receiver: None,
            receive_enabled: false,
            method_subscription: MethodSubscription::default(),
            events: EventQueue::new(waiting),
            methods,
            authentication,
            client,
        }
    }

    pub fn handle(&self) -> DeviceHandle {
        self.handle
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn send_status(&self) -> SendStatus {
        self.events.send_status()
    }

    pub fn set_receive_enabled(&mut self, enabled: bool) {
        self.receive_enabled = enabled;
    }

    pub fn request_methods(&mut self) {
        self.method_subscription.requested = true;
    }

    /// Clear the method subscription, unsubscribing right away if active
    pub fn cancel_methods(&mut self) {
        self.method_subscription.requested = false;
        if self.method_subscription.active {
            self.methods.unsubscribe();
            self.method_subscription.active = false;
        }
    }

    pub fn status(&self) -> DeviceStatus {
        DeviceStatus {
            device_id: self.device_id.clone(),
            credential_type: self.credential_type,
            authentication: self.authentication.status(),
            sender_link: self.sender.as_ref().map(|s| s.name.clone()),
            sender_state: self.sender.as_ref().map(|s| s.state),
            receiver_link: self.receiver.as_ref().map(|r| r.name.clone()),
            receiver_state: self.receiver.as_ref().map(|r| r.state),
            receive_enabled: self.receive_enabled,
            methods: self.method_subscription,
            waiting: self.events.waiting_len(),
            in_progress: self.events.in_progress_len(),
            send_status: self.events.send_status(),
        }
    }

    /// Advance this device by one tick
    pub fn do_work(&mut self, ctx: &mut DeviceWorkContext<'_>) -> DeviceOutcome {
        let status = self.authentication.status();

        match RetryPlanner::authentication_action(status) {
            AuthenticationAction::Authenticate => {
                match self
                    .authentication
                    .authenticate(ctx.connection.cbs_mut(), ctx.options)
                {
                    Ok(()) => DeviceOutcome::Ok,
                    Err(e) => {
                        error!(device_id = %self.device_id, "Failed authenticating device: {}", e);
                        DeviceOutcome::RetryableError
                    }
                }
            }
            AuthenticationAction::Refresh => {
                match self
                    .authentication
                    .refresh(ctx.connection.cbs_mut(), ctx.options)
                {
                    Ok(()) => DeviceOutcome::Ok,
                    Err(e) => {
                        error!(device_id = %self.device_id, "Failed refreshing device authentication: {}", e);
                        DeviceOutcome::RetryableError
                    }
                }
            }
            AuthenticationAction::ServiceLinks => self.service_links(ctx),
            AuthenticationAction::Fail(status) => {
                error!(device_id = %self.device_id, ?status, "Device authentication failed");
                DeviceOutcome::FatalError
            }
            AuthenticationAction::Wait => DeviceOutcome::Ok,
        }
    }

    fn service_links(&mut self, ctx: &mut DeviceWorkContext<'_>) -> DeviceOutcome {
        let mut outcome = DeviceOutcome::Ok;

        if self.method_subscription.requested && !self.method_subscription.active {
            self.subscribe_methods(ctx.connection);
        }

        if self.receive_enabled && self.receiver.is_none() {
            if let Err(e) = self.create_receiver(ctx) {
                error!(device_id = %self.device_id, "Failed creating message receiver: {}", e);
                outcome = DeviceOutcome::FatalError;
            }
        } else if !self.receive_enabled && self.receiver.is_some() {
            if let Err(e) = self.close_receiver() {
                error!(device_id = %self.device_id, "Failed destroying message receiver: {}", e);
            }
        }

        if self.sender.is_none() {
            if let Err(e) = self.create_sender(ctx) {
                error!(device_id = %self.device_id, "Failed creating event sender: {}", e);
                outcome = DeviceOutcome::FatalError;
            }
        } else if self.sender_state() == Some(LinkState::Open) {
            if let Err(e) = self.send_pending_events(ctx.metrics) {
                error!(device_id = %self.device_id, "Failed sending events: {}", e);
                outcome = DeviceOutcome::FatalError;
            }
        }

        outcome
    }

    // Subscribe failures are logged and retried on the next tick.
    fn subscribe_methods(&mut self, connection: &mut ConnectionManager) {
        let Some(session) = connection.session_mut() else {
            warn!(device_id = %self.device_id, "No AMQP session to subscribe for methods on");
            return;
        };

        match self.methods.subscribe(session) {
            Ok(()) => {
                info!(device_id = %self.device_id, "Subscribed for device methods");
                self.method_subscription.active = true;
            }
            Err(e) => error!(device_id = %self.device_id, "Cannot subscribe for methods: {}", e),
        }
    }

    fn sender_state(&self) -> Option<LinkState> {
        self.sender.as_ref().map(|s| s.state)
    }

    fn create_sender(&mut self, ctx: &mut DeviceWorkContext<'_>) -> CollaboratorResult<()> {
        let link_name = create_link_name(
            &self.device_id,
            SENDER_LINK_TAG,
            ctx.link_counter.next_index(),
        );
        let spec = LinkSpec {
            source: create_source_name(&link_name),
            target: self.addresses.target_address.clone(),
            name: link_name,
            role: LinkRole::Sender,
        };

        let session = ctx
            .connection
            .session_mut()
            .ok_or_else(|| CollaboratorError::new("link_create", "no AMQP session"))?;
        let mut link = session.create_link(&spec)?;
        link.set_max_message_size(SENDER_MAX_MESSAGE_SIZE)?;
        if let Err(e) = link.set_attach_properties(&attach_properties()) {
            warn!(device_id = %self.device_id, "Failed setting sender link attach properties: {}", e);
        }

        let mut sender = link.create_sender()?;
        sender.open()?;

        debug!(device_id = %self.device_id, link = %spec.name, "Event sender created");
        self.sender = Some(ActiveLink {
            name: spec.name,
            state: LinkState::Idle,
            endpoint: sender,
            _link: link,
        });
        Ok(())
    }

    fn create_receiver(&mut self, ctx: &mut DeviceWorkContext<'_>) -> CollaboratorResult<()> {
        let link_name = create_link_name(
            &self.device_id,
            RECEIVER_LINK_TAG,
            ctx.link_counter.next_index(),
        );
        let spec = LinkSpec {
            source: self.addresses.receive_address.clone(),
            target: create_target_name(&link_name),
            name: link_name,
            role: LinkRole::Receiver,
        };

        let session = ctx
            .connection
            .session_mut()
            .ok_or_else(|| CollaboratorError::new("link_create", "no AMQP session"))?;
        let mut link = session.create_link(&spec)?;
        link.set_rcv_settle_mode(ReceiverSettleMode::First)?;
        link.set_max_message_size(RECEIVER_MAX_MESSAGE_SIZE)?;
        if let Err(e) = link.set_attach_properties(&attach_properties()) {
            warn!(device_id = %self.device_id, "Failed setting receiver link attach properties: {}", e);
        }

        let mut receiver = link.create_receiver()?;
        receiver.open()?;

        debug!(device_id = %self.device_id, link = %spec.name, "Message receiver created");
        self.receiver = Some(ActiveLink {
            name: spec.name,
            state: LinkState::Idle,
            endpoint: receiver,
            _link: link,
        });
        Ok(())
    }

    /// Close and drop the receiver. If the close fails the receiver is kept
    /// and the close is attempted again next tick.
    fn close_receiver(&mut self) -> CollaboratorResult<()> {
        if let Some(receiver) = self.receiver.as_mut() {
            receiver.endpoint.close()?;
        }
        self.receiver = None;
        Ok(())
    }

    /// Drop the receiver even if closing it fails
    fn destroy_receiver(&mut self) {
        if let Some(mut receiver) = self.receiver.take() {
            if let Err(e) = receiver.endpoint.close() {
                warn!(device_id = %self.device_id, "Failed closing message receiver: {}", e);
            }
        }
    }

    fn destroy_sender(&mut self) {
        self.sender = None;
    }

    /// Drain the waiting list through the sender.
    ///
    /// A message that cannot be converted is completed with an error and the
    /// drain continues. A send failure rolls the message back and stops.
    fn send_pending_events(&mut self, metrics: &TransportMetrics) -> CollaboratorResult<()> {
        while let Some(id) = self.events.next_waiting() {
            if !self.events.track_in_progress(id) {
                break;
            }

            let converted = match self.events.in_progress(id) {
                Some(outbound) => MessageConverter::to_amqp(&outbound.message),
                None => break,
            };

            match converted {
                Ok(message) => {
                    if let Err(e) = self.send_one(&message, id) {
                        self.events.rollback_one(id);
                        metrics.messages_rolled_back(1);
                        return Err(e);
                    }
                    metrics.message_sent(&self.device_id);
                }
                Err(e) => {
                    error!(device_id = %self.device_id, message_id = %id, "Failed converting message: {}", e);
                    if let Some(outbound) = self.events.complete_in_progress(id) {
                        metrics.message_failed(&self.device_id);
                        outbound.complete(ConfirmationResult::Error);
                    }
                }
            }
        }

        Ok(())
    }

    fn send_one(&mut self, message: &AmqpMessage, id: MessageId) -> CollaboratorResult<()> {
        let sender = self
            .sender
            .as_mut()
            .ok_or_else(|| CollaboratorError::new("messagesender_send", "no event sender"))?;
        sender.endpoint.send(message, id)
    }

    /// Reset everything that belongs to the current connection.
    /// Returns the number of messages rolled back to the waiting list.
    pub fn prepare_for_retry(&mut self) -> usize {
        if let Err(e) = self.authentication.reset() {
            error!(device_id = %self.device_id, "Failed resetting device authentication: {}", e);
        }

        // `requested` survives so methods are subscribed again after the rebuild
        self.methods.unsubscribe();
        self.method_subscription.active = false;

        self.destroy_receiver();
        self.destroy_sender();
        self.events.rollback_all()
    }

    /// Release links and return in-flight messages to the waiting list.
    /// Called right before the session is dropped on unregister.
    pub fn release(&mut self) -> usize {
        self.cancel_methods();
        self.destroy_receiver();
        self.destroy_sender();
        self.events.rollback_all()
    }

    /// Which of this device's links, if any, carries `link_name`
    pub fn owns_link(&self, link_name: &str) -> Option<LinkRole> {
        if self.sender.as_ref().is_some_and(|s| s.name == link_name) {
            Some(LinkRole::Sender)
        } else if self.receiver.as_ref().is_some_and(|r| r.name == link_name) {
            Some(LinkRole::Receiver)
        } else {
            None
        }
    }

    /// Record a sender state change. Returns true if the connection must be retried.
    pub fn on_sender_state_changed(
        &mut self,
        link_name: &str,
        new_state: LinkState,
        previous_state: LinkState,
        trace: bool,
    ) -> bool {
        let Some(sender) = self.sender.as_mut().filter(|s| s.name == link_name) else {
            return false;
        };

        log_link_transition(&self.device_id, "Event sender", previous_state, new_state, trace);
        sender.state = new_state;
        RetryPlanner::link_fault_escalates(new_state, previous_state)
    }

    /// Record a receiver state change. Returns true if the connection must be retried.
    pub fn on_receiver_state_changed(
        &mut self,
        link_name: &str,
        new_state: LinkState,
        previous_state: LinkState,
        trace: bool,
    ) -> bool {
        let Some(receiver) = self.receiver.as_mut().filter(|r| r.name == link_name) else {
            return false;
        };

        log_link_transition(&self.device_id, "Message receiver", previous_state, new_state, trace);
        receiver.state = new_state;
        RetryPlanner::link_fault_escalates(new_state, previous_state)
    }

    /// Complete an in-progress message. Completions for a sender that no
    /// longer exists, or for messages no longer in progress, are ignored.
    pub fn on_send_complete(
        &mut self,
        link_name: &str,
        tag: MessageId,
        result: SendResult,
        metrics: &TransportMetrics,
    ) {
        if self.owns_link(link_name) != Some(LinkRole::Sender) {
            debug!(device_id = %self.device_id, link = link_name, "Ignoring completion from stale sender");
            return;
        }

        let Some(outbound) = self.events.complete_in_progress(tag) else {
            debug!(device_id = %self.device_id, message_id = %tag, "Ignoring completion for message not in progress");
            return;
        };

        let confirmation = ConfirmationResult::from(result);
        match confirmation {
            ConfirmationResult::Ok => metrics.message_confirmed(&self.device_id),
            ConfirmationResult::Error => metrics.message_failed(&self.device_id),
        }
        outbound.complete(confirmation);
    }

    /// Hand a received message to the upper layer and settle the delivery
    pub fn on_message_received(
        &mut self,
        link_name: &str,
        delivery_id: u64,
        message: &AmqpMessage,
        metrics: &TransportMetrics,
    ) {
        if self.owns_link(link_name) != Some(LinkRole::Receiver) {
            debug!(device_id = %self.device_id, link = link_name, "Ignoring delivery on stale receiver");
            return;
        }

        let disposition = match MessageConverter::from_amqp(message) {
            Ok(converted) => {
                metrics.message_received(&self.device_id);
                Disposition::from(self.client.on_message_received(converted))
            }
            Err(e) => {
                error!(device_id = %self.device_id, "Failed reading AMQP message: {}", e);
                metrics.message_rejected();
                Disposition::conversion_failure()
            }
        };

        if let Some(receiver) = self.receiver.as_mut() {
            if let Err(e) = receiver.endpoint.settle(delivery_id, disposition) {
                error!(device_id = %self.device_id, delivery_id, "Failed settling delivery: {}", e);
            }
        }
    }

    /// Invoke the upper layer's method handler and send its response
    pub fn on_method_request(&mut self, request_id: &str, request: &MethodRequest) {
        let response = self.client.on_method_invoked(request);
        if let Err(e) = self.methods.respond(request_id, &response) {
            error!(
                device_id = %self.device_id,
                method = %request.method_name,
                "Failed responding to method request: {}", e
            );
        }
    }

    #[cfg(test)]
    pub(crate) fn in_progress_ids(&self) -> Vec<MessageId> {
        self.events.in_progress_ids()
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        self.release();
    }
}

fn log_link_transition(
    device_id: &str,
    what: &str,
    previous_state: LinkState,
    new_state: LinkState,
    trace: bool,
) {
    if trace {
        info!(device_id, "{} state changed [{:?} -> {:?}]", what, previous_state, new_state);
    } else {
        debug!(device_id, "{} state changed [{:?} -> {:?}]", what, previous_state, new_state);
    }
}
