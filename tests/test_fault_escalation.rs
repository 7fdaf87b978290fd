//! Connection-wide retry tests
//!
//! A fault anywhere (I/O, CBS, one device's link, one device's
//! authentication) resets every device and rebuilds the shared stack.


use iothub_amqp::protocol::ConfirmationResult;
use iothub_amqp::transport::amqp::collaborators::ManagementState;
use iothub_amqp::transport::amqp::{AmqpEvent, AuthenticationStatus, LinkState};
use iothub_amqp::{ConnectionState, OptionValue};
use test_helpers::Fleet;

#[test]
fn test_sender_error_on_one_device_rebuilds_every_device() {
    let mut fleet = Fleet::new();
    let a = fleet.register_key("a");
    let b = fleet.register_key("b");
    fleet.transport.subscribe(b.handle).unwrap();
    fleet.connect();

    let sender_a = fleet
        .transport
        .device_status(a.handle)
        .unwrap()
        .sender_link
        .unwrap();
    fleet.world.inject_event(AmqpEvent::SenderStateChanged {
        link_name: sender_a,
        new_state: LinkState::Error,
        previous_state: LinkState::Open,
    });

    // Error is flagged during this tick's pump, acted on in the next
    fleet.tick(1);
    assert_eq!(fleet.transport.connection_state(), ConnectionState::Error);
    fleet.tick(1);

    for handle in [a.handle, b.handle] {
        let status = fleet.transport.device_status(handle).unwrap();
        assert!(status.sender_link.is_none());
        assert!(status.receiver_link.is_none());
        assert_eq!(status.authentication, AuthenticationStatus::Idle);
    }
    assert!(!fleet.transport.is_connected());
    assert_eq!(fleet.world.live("sender"), 0);
    assert_eq!(fleet.world.live("receiver"), 0);
    assert_eq!(fleet.world.live("connection"), 0);

    fleet.connect();
    assert_eq!(fleet.world.count("connection_create"), 2);
    let status = fleet.transport.device_status(b.handle).unwrap();
    assert_eq!(status.sender_state, Some(LinkState::Open));
    assert_eq!(status.receiver_state, Some(LinkState::Open));
}

#[test]
fn test_repeated_error_notification_escalates_once() {
    let mut fleet = Fleet::new();
    let a = fleet.register_key("a");
    fleet.connect();
    let link = fleet
        .transport
        .device_status(a.handle)
        .unwrap()
        .sender_link
        .unwrap();

    fleet.world.inject_event(AmqpEvent::SenderStateChanged {
        link_name: link,
        new_state: LinkState::Error,
        previous_state: LinkState::Error,
    });
    fleet.tick(2);

    assert!(fleet.transport.is_connected());
    assert_eq!(fleet.transport.metrics().snapshot().connection.connection_retries, 0);
}

#[test]
fn test_receiver_error_escalates() {
    let mut fleet = Fleet::new();
    let a = fleet.register_key("a");
    fleet.transport.subscribe(a.handle).unwrap();
    fleet.connect();
    let link = fleet
        .transport
        .device_status(a.handle)
        .unwrap()
        .receiver_link
        .unwrap();

    fleet.world.inject_event(AmqpEvent::ReceiverStateChanged {
        link_name: link,
        new_state: LinkState::Error,
        previous_state: LinkState::Open,
    });
    fleet.tick(1);

    assert_eq!(fleet.transport.connection_state(), ConnectionState::Error);
}

#[test]
fn test_cbs_error_escalates() {
    let mut fleet = Fleet::new();
    fleet.register_key("a");
    fleet.connect();

    fleet.world.inject_event(AmqpEvent::ManagementStateChanged {
        new_state: ManagementState::Error,
        previous_state: ManagementState::Open,
    });
    fleet.tick(2);

    assert!(!fleet.transport.is_connected());
    assert_eq!(fleet.transport.connection_state(), ConnectionState::Idle);
}

#[test]
fn test_stale_link_events_after_retry_are_ignored() {
    let mut fleet = Fleet::new();
    let a = fleet.register_key("a");
    fleet.connect();
    let old_link = fleet
        .transport
        .device_status(a.handle)
        .unwrap()
        .sender_link
        .unwrap();

    fleet.world.inject_event(AmqpEvent::IoError {
        reason: "reset".to_string(),
    });
    fleet.tick(2);
    fleet.connect();

    let new_link = fleet
        .transport
        .device_status(a.handle)
        .unwrap()
        .sender_link
        .unwrap();
    assert_ne!(old_link, new_link);

    fleet.world.inject_event(AmqpEvent::SenderStateChanged {
        link_name: old_link,
        new_state: LinkState::Error,
        previous_state: LinkState::Open,
    });
    fleet.tick(2);

    assert!(fleet.transport.is_connected());
    assert_ne!(fleet.transport.connection_state(), ConnectionState::Error);
}

#[test]
fn test_in_flight_messages_survive_retry_and_are_resent() {
    let mut fleet = Fleet::new();
    let a = fleet.register_key("a");
    fleet.world.set_auto_complete(false);
    a.send("1");
    a.send("2");
    fleet.connect();
    assert!(a.waiting.is_empty());

    fleet.world.inject_event(AmqpEvent::IoError {
        reason: "reset".to_string(),
    });
    fleet.tick(1);
    assert_eq!(fleet.transport.connection_state(), ConnectionState::Error);

    a.send("3");
    fleet.tick(1);

    // In-flight messages go back behind the one already waiting
    assert_eq!(a.waiting.len(), 3);
    assert!(a.completions.is_empty());
    assert_eq!(fleet.transport.metrics().snapshot().messages.rolled_back, 2);

    fleet.world.set_auto_complete(true);
    fleet.connect();

    assert_eq!(a.completions.results(), vec![ConfirmationResult::Ok; 3]);
    let sent = fleet.world.sent_payloads();
    assert_eq!(
        &sent[sent.len() - 3..],
        &[b"3".to_vec(), b"1".to_vec(), b"2".to_vec()]
    );
}

#[test]
fn test_authentication_timeout_on_one_device_resets_all() {
    let mut fleet = Fleet::new();
    fleet.register_key("a");
    fleet.register_key("b");
    fleet.connect();

    fleet.world.set_auth_status("b", AuthenticationStatus::Timeout);
    fleet.tick(1);

    assert!(!fleet.transport.is_connected());
    assert_eq!(fleet.world.count("authentication_reset:a"), 1);
    assert_eq!(fleet.world.count("authentication_reset:b"), 1);
}

#[test]
fn test_authenticate_call_failure_is_not_escalated() {
    let mut fleet = Fleet::new();
    fleet.register_key("a");
    fleet.world.fail_on("authenticate:a");

    fleet.tick(3);

    assert!(fleet.transport.is_connected());
    assert_eq!(fleet.world.count("authenticate:a"), 3);
    assert_eq!(fleet.transport.metrics().snapshot().connection.connection_retries, 0);
}

#[test]
fn test_link_creation_failure_escalates() {
    let mut fleet = Fleet::new();
    fleet.register_key("a");
    fleet.tick(1);

    fleet.world.fail_on("link_create");
    fleet.tick(1);

    assert!(!fleet.transport.is_connected());
    assert_eq!(fleet.transport.metrics().snapshot().connection.connection_retries, 1);
}

#[test]
fn test_tls_options_survive_rebuild() {
    let mut fleet = Fleet::new();
    fleet.register_key("a");
    fleet
        .transport
        .set_option("TrustedCerts", OptionValue::Text("-----BEGIN CERT-----".to_string()))
        .unwrap();
    fleet.connect();

    fleet.world.inject_event(AmqpEvent::IoError {
        reason: "reset".to_string(),
    });
    fleet.tick(3);

    assert_eq!(fleet.world.count("tls_create"), 2);
    assert_eq!(fleet.world.count("tls_set_option:TrustedCerts"), 2);
}

#[test]
fn test_persistent_connection_failure_keeps_retrying_quietly() {
    let mut fleet = Fleet::new();
    let a = fleet.register_key("a");
    a.send("queued");
    fleet.world.fail_on("connection_create");

    fleet.tick(5);

    let snapshot = fleet.transport.metrics().snapshot();
    assert_eq!(snapshot.connection.connection_attempts, 5);
    assert_eq!(snapshot.connection.connection_failures, 5);
    assert_eq!(a.waiting.len(), 1);

    fleet.world.clear_failures();
    fleet.connect();
    assert_eq!(a.completions.results(), vec![ConfirmationResult::Ok]);
}

#[test]
fn test_flapping_link_escalates_every_time_it_reenters_error() {
    let mut fleet = Fleet::new();
    let a = fleet.register_key("a");

    for expected_retries in 1..=2 {
        fleet.connect();
        let link = fleet
            .transport
            .device_status(a.handle)
            .unwrap()
            .sender_link
            .unwrap();

        // Error, recovered, error again: all reported in one pump
        for (previous_state, new_state) in [
            (LinkState::Open, LinkState::Error),
            (LinkState::Error, LinkState::Open),
            (LinkState::Open, LinkState::Error),
        ] {
            fleet.world.inject_event(AmqpEvent::SenderStateChanged {
                link_name: link.clone(),
                new_state,
                previous_state,
            });
        }
        fleet.tick(2);

        assert!(!fleet.transport.is_connected());
        assert_eq!(
            fleet.transport.metrics().snapshot().connection.connection_retries,
            expected_retries
        );
    }
}
