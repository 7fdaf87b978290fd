//! End-to-end behaviour of the public transport API
//!
//! Registration rules, option handling, send status and the message path,
//! exercised through `AmqpTransport` over the in-memory collaborators.


use iothub_amqp::protocol::{ConfirmationResult, DispositionResult, MethodRequest, SendStatus};
use iothub_amqp::testing::{MockAmqpLibrary, MockDeviceClient, MockIoProvider, MockWorld};
use iothub_amqp::transport::amqp::messaging::{AmqpMessage, Disposition};
use iothub_amqp::transport::amqp::{
    AmqpEvent, AuthenticationStatus, ConnectionManager, CredentialType, LinkState,
};
use iothub_amqp::{
    AmqpTransport, ConnectionState, DeviceConfig, DeviceHandle, OptionValue, TransportConfig,
    TransportError, WaitingList,
};
use test_helpers::Fleet;

#[test]
fn test_host_fqdn_from_hub_name_and_suffix() {
    let fleet = Fleet::new();
    assert_eq!(fleet.transport.host_fqdn(), "servername.domainname");
}

#[test]
fn test_gateway_host_overrides_hub_name() {
    let world = MockWorld::new();
    let config = TransportConfig::new("servername", "domainname").with_gateway("edge.local");
    let transport = AmqpTransport::create(&config, world.dependencies()).unwrap();
    assert_eq!(transport.host_fqdn(), "edge.local");
}

#[test]
fn test_register_rejects_key_and_token_together() {
    let mut fleet = Fleet::new();
    let device = DeviceConfig {
        device_id: "both".to_string(),
        device_key: Some("key".to_string()),
        device_sas_token: Some("SharedAccessSignature sr=x&sig=y".to_string()),
    };

    let result = fleet.transport.register(
        &device,
        Box::new(MockDeviceClient::new(&fleet.world)),
        WaitingList::new(),
    );

    assert!(matches!(result, Err(TransportError::InvalidArgument { .. })));
    assert_eq!(fleet.transport.device_count(), 0);
    assert_eq!(fleet.transport.preferred_credential(), None);
}

#[test]
fn test_register_rejects_duplicate_device_id() {
    let mut fleet = Fleet::new();
    fleet.register_key("dup");

    let result = fleet.transport.register(
        &DeviceConfig::with_key("dup", "other"),
        Box::new(MockDeviceClient::new(&fleet.world)),
        WaitingList::new(),
    );

    assert!(matches!(result, Err(TransportError::DuplicateDevice { .. })));
    assert_eq!(fleet.transport.device_count(), 1);
}

#[test]
fn test_register_rejects_empty_device_id() {
    let mut fleet = Fleet::new();
    let result = fleet.transport.register(
        &DeviceConfig::with_key("", "key"),
        Box::new(MockDeviceClient::new(&fleet.world)),
        WaitingList::new(),
    );
    assert!(result.unwrap_err().is_validation());
}

#[test]
fn test_unregister_unknown_handle_fails_and_changes_nothing() {
    let mut fleet = Fleet::new();
    let registered = fleet.register_key("a");
    fleet.transport.unregister(registered.handle).unwrap();
    fleet.register_key("b");

    let result = fleet.transport.unregister(registered.handle);

    assert!(matches!(result, Err(TransportError::DeviceNotRegistered { .. })));
    assert_eq!(fleet.transport.device_ids(), vec!["b"]);
}

#[test]
fn test_mismatched_credential_class_never_registers() {
    let mut fleet = Fleet::new();
    fleet.register(DeviceConfig::x509("cert-device"));
    assert_eq!(fleet.transport.preferred_credential(), Some(CredentialType::X509));

    for device in [
        DeviceConfig::with_key("keyed", "key"),
        DeviceConfig::with_sas_token("tokened", "token"),
    ] {
        let result = fleet.transport.register(
            &device,
            Box::new(MockDeviceClient::new(&fleet.world)),
            WaitingList::new(),
        );
        assert!(matches!(
            result,
            Err(TransportError::IncompatibleCredentials { .. })
        ));
    }

    assert_eq!(fleet.transport.device_ids(), vec!["cert-device"]);
}

#[test]
fn test_x509_fleet_connects_without_sasl() {
    let mut fleet = Fleet::new();
    fleet.register(DeviceConfig::x509("cert-device"));

    fleet.tick(1);

    assert!(fleet.transport.is_connected());
    assert_eq!(fleet.world.connection_io(), Some("tls"));
    assert!(!fleet.world.called("sasl_mechanism_create"));
    assert!(!fleet.world.called("cbs_create"));
}

#[test]
fn test_x509_connection_passes_trace_to_tls_layer() {
    let mut fleet = Fleet::new();
    fleet
        .transport
        .set_option("logtrace", OptionValue::Bool(true))
        .unwrap();
    fleet.register(DeviceConfig::x509("cert-device"));

    fleet.tick(1);

    assert!(fleet.transport.is_connected());
    assert_eq!(fleet.world.count("tls_set_option:logtrace"), 1);
    assert_eq!(fleet.world.connection_trace(), Some(true));
}

#[test]
fn test_messages_wait_for_authentication_and_open_sender() {
    let mut fleet = Fleet::new();
    let a = fleet.register_key("a");
    a.send("early");
    fleet.world.set_auto_authenticate(false);
    fleet.world.set_auto_open(false);

    fleet.tick(3);
    let status = fleet.transport.device_status(a.handle).unwrap();
    assert_eq!(status.authentication, AuthenticationStatus::InProgress);
    assert!(status.sender_link.is_none());
    assert_eq!(a.waiting.len(), 1);

    fleet.world.set_auto_authenticate(true);
    fleet.tick(3);
    let status = fleet.transport.device_status(a.handle).unwrap();
    assert!(status.sender_link.is_some());
    assert_ne!(status.sender_state, Some(LinkState::Open));
    assert_eq!(a.waiting.len(), 1);
    assert!(fleet.world.sent_payloads().is_empty());

    fleet.world.set_auto_open(true);
    fleet.tick(2);
    assert_eq!(a.completions.results(), vec![ConfirmationResult::Ok]);
    assert_eq!(fleet.world.sent_payloads(), vec![b"early".to_vec()]);
}

#[test]
fn test_logtrace_applies_to_live_and_future_connections() {
    let mut fleet = Fleet::new();
    fleet.register_key("a");
    fleet.tick(1);
    assert_eq!(fleet.world.connection_trace(), Some(false));

    fleet
        .transport
        .set_option("logtrace", OptionValue::Bool(true))
        .unwrap();
    assert_eq!(fleet.world.connection_trace(), Some(true));
    assert_eq!(fleet.world.sasl_trace(), Some(true));

    // Force a rebuild and check the new stack starts traced
    fleet.world.inject_event(AmqpEvent::IoError {
        reason: "reset by peer".to_string(),
    });
    fleet.tick(3);

    assert_eq!(fleet.world.count("connection_create"), 2);
    assert_eq!(fleet.world.connection_trace(), Some(true));
    assert_eq!(fleet.world.sasl_trace(), Some(true));
}

#[test]
fn test_logtrace_fails_when_sasl_rejects_it() {
    let mut fleet = Fleet::new();
    fleet.register_key("a");
    fleet.tick(1);

    fleet.world.fail_on("sasl_set_option");
    let result = fleet
        .transport
        .set_option("logtrace", OptionValue::Bool(true));

    assert!(matches!(result, Err(TransportError::Collaborator(_))));
}

#[test]
fn test_timing_options_reach_authentication() {
    let mut fleet = Fleet::new();
    fleet.register_key("a");
    fleet
        .transport
        .set_option("sas_token_lifetime", OptionValue::Millis(120_000))
        .unwrap();
    fleet
        .transport
        .set_option("cbs_request_timeout", OptionValue::Millis(10_000))
        .unwrap();

    fleet.tick(1);

    let options = fleet.world.last_auth_options().unwrap();
    assert_eq!(options.sas_token_lifetime_ms, 120_000);
    assert_eq!(options.cbs_request_timeout_ms, 10_000);
}

#[test]
fn test_messages_flow_in_order_and_complete_once() {
    let mut fleet = Fleet::new();
    let device = fleet.register_key("a");
    for payload in ["1", "2", "3"] {
        device.send(payload);
    }
    assert_eq!(
        fleet.transport.send_status(device.handle).unwrap(),
        SendStatus::Busy
    );

    fleet.connect();

    assert_eq!(
        fleet.world.sent_payloads(),
        vec![b"1".to_vec(), b"2".to_vec(), b"3".to_vec()]
    );
    assert_eq!(device.completions.results(), vec![ConfirmationResult::Ok; 3]);
    assert_eq!(
        fleet.transport.send_status(device.handle).unwrap(),
        SendStatus::Idle
    );

    let snapshot = fleet.transport.metrics().snapshot();
    assert_eq!(snapshot.messages.sent, 3);
    assert_eq!(snapshot.messages.confirmed, 3);
    assert_eq!(snapshot.devices["a"].confirmed, 3);
}

#[test]
fn test_devices_are_serviced_in_registration_order() {
    let mut fleet = Fleet::new();
    let first = fleet.register_key("first");
    let second = fleet.register_key("second");
    second.send("from-second");
    first.send("from-first");

    fleet.connect();

    assert_eq!(
        fleet.world.sent_payloads(),
        vec![b"from-first".to_vec(), b"from-second".to_vec()]
    );
    let links = fleet.world.link_names();
    assert_eq!(links, vec!["link-first-sender-0", "link-second-sender-1"]);
}

#[test]
fn test_failed_send_completion_reports_error() {
    let mut fleet = Fleet::new();
    let device = fleet.register_key("a");
    fleet.world.set_auto_complete(false);
    device.send("x");
    fleet.connect();

    let (link_name, tag) = fleet.world.unconfirmed().remove(0);
    fleet.world.inject_event(AmqpEvent::SendComplete {
        link_name,
        tag,
        result: iothub_amqp::transport::amqp::collaborators::SendResult::Timeout,
    });
    fleet.tick(1);

    assert_eq!(device.completions.results(), vec![ConfirmationResult::Error]);
    assert_eq!(fleet.transport.metrics().snapshot().messages.failed, 1);
}

#[test]
fn test_cloud_to_device_messages_after_subscribe() {
    let mut fleet = Fleet::new();
    let device = fleet.register_key("a");
    fleet.transport.subscribe(device.handle).unwrap();
    fleet.connect();

    let status = fleet.transport.device_status(device.handle).unwrap();
    assert_eq!(
        status.receiver_state,
        Some(iothub_amqp::transport::amqp::LinkState::Open)
    );

    fleet.world.set_client_disposition(DispositionResult::Rejected);
    fleet.world.inject_event(AmqpEvent::MessageReceived {
        link_name: status.receiver_link.unwrap(),
        delivery_id: 42,
        message: AmqpMessage::with_data(&b"hello device"[..]),
    });
    fleet.tick(1);

    assert_eq!(fleet.world.received_payloads(), vec![b"hello device".to_vec()]);
    let settlements = fleet.world.settlements();
    assert_eq!(settlements.len(), 1);
    assert_eq!(settlements[0].0, 42);
    assert!(matches!(settlements[0].1, Disposition::Rejected { .. }));

    fleet.transport.unsubscribe(device.handle).unwrap();
    fleet.tick(1);
    assert!(fleet
        .transport
        .device_status(device.handle)
        .unwrap()
        .receiver_link
        .is_none());
}

#[test]
fn test_method_requests_are_answered() {
    let mut fleet = Fleet::new();
    let device = fleet.register_key("a");
    fleet.transport.subscribe_device_methods(device.handle).unwrap();
    fleet.connect();

    fleet.world.inject_event(AmqpEvent::MethodRequest {
        device_id: "a".to_string(),
        request_id: "r1".to_string(),
        request: MethodRequest {
            method_name: "reboot".to_string(),
            payload: bytes::Bytes::from_static(b"{}"),
        },
    });
    fleet.tick(1);

    assert_eq!(
        fleet.world.method_responses(),
        vec![("a".to_string(), "r1".to_string(), 200)]
    );
    assert_eq!(fleet.transport.metrics().snapshot().messages.method_requests, 1);
}

#[test]
fn test_method_subscription_once_per_authentication_cycle() {
    let mut fleet = Fleet::new();
    let device = fleet.register_key("a");
    fleet.transport.subscribe_device_methods(device.handle).unwrap();

    fleet.tick(10);
    assert_eq!(fleet.world.count("methods_subscribe:a"), 1);

    fleet.world.inject_event(AmqpEvent::IoError {
        reason: "drop".to_string(),
    });
    fleet.tick(10);
    assert_eq!(fleet.world.count("methods_subscribe:a"), 2);
    assert_eq!(fleet.world.count("methods_unsubscribe:a"), 1);

    fleet.transport.unsubscribe_device_methods(device.handle).unwrap();
    assert_eq!(fleet.world.count("methods_unsubscribe:a"), 2);
    fleet.tick(5);
    assert_eq!(fleet.world.count("methods_subscribe:a"), 2);
}

#[test]
fn test_management_state_mirrors_connection_state() {
    let mut fleet = Fleet::new();
    fleet.register_key("a");
    assert_eq!(fleet.transport.connection_state(), ConnectionState::Idle);

    fleet.tick(1);
    assert_eq!(fleet.transport.connection_state(), ConnectionState::Open);
}

#[test]
fn test_connection_teardown_is_idempotent() {
    let world = MockWorld::new();
    let mut manager = ConnectionManager::new(
        "servername.domainname".to_string(),
        Box::new(MockIoProvider::new(&world)),
        Box::new(MockAmqpLibrary::new(&world)),
    );

    manager.teardown();
    assert!(manager.is_torn_down());

    world.fail_on("cbs_open");
    assert!(manager.establish(CredentialType::SharedKey).is_err());
    manager.teardown();
    manager.teardown();

    assert!(manager.is_torn_down());
    for kind in ["tls_io", "sasl_mechanism", "sasl_io", "connection", "session", "cbs"] {
        assert_eq!(world.live(kind), 0, "{kind} leaked");
    }
}

#[test]
fn test_unsupported_operations_fail() {
    let mut fleet = Fleet::new();
    let device = fleet.register_key("a");

    let error = fleet
        .transport
        .subscribe_device_twin(device.handle)
        .unwrap_err();
    assert!(matches!(error, TransportError::NotSupported { .. }));

    let stale: DeviceHandle = device.handle;
    fleet.transport.unregister(stale).unwrap();
    assert!(matches!(
        fleet.transport.subscribe_device_twin(stale),
        Err(TransportError::DeviceNotRegistered { .. })
    ));
    assert!(fleet.transport.subscribe(stale).is_err());
}
