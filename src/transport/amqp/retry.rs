//! Pure tick planning and connection-retry decisions
//!
//! Everything here is side-effect free apart from logging: the orchestrator
//! asks what to do, then does it.

use super::collaborators::{AuthenticationStatus, LinkState, ManagementState};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Health of the shared AMQP stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Opening,
    Open,
    Error,
}

impl From<ManagementState> for ConnectionState {
    fn from(state: ManagementState) -> Self {
        match state {
            ManagementState::Idle => ConnectionState::Idle,
            ManagementState::Opening => ConnectionState::Opening,
            ManagementState::Open => ConnectionState::Open,
            ManagementState::Error => ConnectionState::Error,
        }
    }
}

/// What the orchestrator does at the start of a tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickPlan {
    /// No devices registered
    Skip,
    /// The connection is faulted; tear down and rebuild
    Retry,
    /// No shared stack yet; build it, then service devices
    Establish,
    /// Stack is up; service devices
    Service,
}

/// Per-device result of one tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeviceOutcome {
    Ok,
    /// Skipped this tick, retried automatically next tick
    RetryableError,
    /// Escalates to a connection-wide retry
    FatalError,
}

/// What a device does this tick given its authentication status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthenticationAction {
    Authenticate,
    Refresh,
    ServiceLinks,
    Fail(AuthenticationStatus),
    Wait,
}

/// Pure retry decision logic
pub struct RetryPlanner;

impl RetryPlanner {
    /// Decide how to start a tick (pure function)
    pub fn plan_tick(
        device_count: usize,
        connection_state: ConnectionState,
        stack_present: bool,
    ) -> TickPlan {
        if device_count == 0 {
            return TickPlan::Skip;
        }

        if connection_state == ConnectionState::Error {
            return TickPlan::Retry;
        }

        if stack_present {
            TickPlan::Service
        } else {
            TickPlan::Establish
        }
    }

    /// Map an authentication status to the device's next action (pure function)
    pub fn authentication_action(status: AuthenticationStatus) -> AuthenticationAction {
        match status {
            AuthenticationStatus::Idle => AuthenticationAction::Authenticate,
            AuthenticationStatus::RefreshRequired => AuthenticationAction::Refresh,
            AuthenticationStatus::Ok => AuthenticationAction::ServiceLinks,
            AuthenticationStatus::Failure | AuthenticationStatus::Timeout => {
                AuthenticationAction::Fail(status)
            }
            AuthenticationStatus::InProgress => AuthenticationAction::Wait,
        }
    }

    /// Whether a link state transition escalates to a connection-wide retry.
    /// Only a change into `Error` counts; repeated error notifications do not.
    pub fn link_fault_escalates(new_state: LinkState, previous_state: LinkState) -> bool {
        new_state != previous_state && new_state == LinkState::Error
    }

    /// Whether any device outcome forces a connection retry (pure function)
    pub fn requires_retry<I>(outcomes: I) -> bool
    where
        I: IntoIterator<Item = DeviceOutcome>,
    {
        outcomes
            .into_iter()
            .any(|outcome| outcome == DeviceOutcome::FatalError)
    }

    /// Log a connection state transition
    pub fn log_state_transition(from: ConnectionState, to: ConnectionState) {
        match (from, to) {
            (a, b) if a == b => {}
            (_, ConnectionState::Error) => warn!("AMQP connection faulted ({:?} -> Error)", from),
            (_, ConnectionState::Open) => info!("AMQP connection open"),
            (ConnectionState::Error, ConnectionState::Idle) => {
                info!("AMQP connection reset; it will be rebuilt on the next tick")
            }
            _ => debug!("AMQP connection state: {:?} -> {:?}", from, to),
        }
    }
}
