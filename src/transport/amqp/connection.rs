//! Shared connection stack: TLS, SASL, AMQP connection, session and CBS
//!
//! The stack is built in one pass and torn down in one pass. A failure at any
//! step tears down whatever was built so far. The TLS layer is the only piece
//! that may exist on its own, because options can be forwarded to it before
//! the first connection attempt.

use super::collaborators::{
    AmqpConnection, AmqpEvent, AmqpLibrary, AmqpSession, CbsHandle, CollaboratorResult,
    ConnectionIo, CredentialType, IoTransportProvider, OptionValue, SaslIo, SaslMechanism,
    SavedOptions, TlsIo, XioLayer,
};
use crate::error::CollaboratorError;
use tracing::{debug, error, info, warn};

/// Container id announced on every new connection
pub const DEFAULT_CONTAINER_ID: &str = "default_container_id";

/// Incoming window applied to every new session
pub const DEFAULT_INCOMING_WINDOW_SIZE: u32 = u32::MAX;

/// Outgoing window applied to every new session
pub const DEFAULT_OUTGOING_WINDOW_SIZE: u32 = 100;

/// Name of the trace option understood by the I/O layers
pub const OPTION_LOG_TRACE: &str = "logtrace";

/// Owner of the shared stack
///
/// Fields are declared in teardown order: each component is dropped before
/// the layer it runs on.
pub struct ConnectionManager {
    host_fqdn: String,
    cbs: Option<Box<dyn CbsHandle>>,
    session: Option<Box<dyn AmqpSession>>,
    connection: Option<Box<dyn AmqpConnection>>,
    sasl_io: Option<Box<dyn SaslIo>>,
    sasl_mechanism: Option<Box<dyn SaslMechanism>>,
    tls_io: Option<Box<dyn TlsIo>>,
    saved_tls_options: Option<SavedOptions>,
    trace_enabled: bool,
    io_provider: Box<dyn IoTransportProvider>,
    amqp: Box<dyn AmqpLibrary>,
}

impl ConnectionManager {
    pub fn new(
        host_fqdn: String,
        io_provider: Box<dyn IoTransportProvider>,
        amqp: Box<dyn AmqpLibrary>,
    ) -> Self {
        Self {
            host_fqdn,
            cbs: None,
            session: None,
            connection: None,
            sasl_io: None,
            sasl_mechanism: None,
            tls_io: None,
            saved_tls_options: None,
            trace_enabled: false,
            io_provider,
            amqp,
        }
    }

    pub fn host_fqdn(&self) -> &str {
        &self.host_fqdn
    }

    /// True once a connection exists; devices can then be serviced
    pub fn is_established(&self) -> bool {
        self.connection.is_some()
    }

    pub fn trace_enabled(&self) -> bool {
        self.trace_enabled
    }

    pub fn saved_tls_options(&self) -> Option<&SavedOptions> {
        self.saved_tls_options.as_ref()
    }

    pub fn session_mut(&mut self) -> Option<&mut (dyn AmqpSession + 'static)> {
        self.session.as_deref_mut()
    }

    pub fn cbs_mut(&mut self) -> Option<&mut (dyn CbsHandle + 'static)> {
        self.cbs.as_deref_mut()
    }

    /// Build the full stack for the given credential type.
    /// On failure, whatever was built is torn down again.
    pub fn establish(&mut self, credential_type: CredentialType) -> CollaboratorResult<()> {
        info!(
            host = %self.host_fqdn,
            credential = ?credential_type,
            "Establishing AMQP connection"
        );

        match self.build_stack(credential_type) {
            Ok(()) => {
                info!(host = %self.host_fqdn, "AMQP connection stack created");
                Ok(())
            }
            Err(e) => {
                error!(host = %self.host_fqdn, "Failed to establish AMQP connection: {}", e);
                self.teardown();
                Err(e)
            }
        }
    }

    fn build_stack(&mut self, credential_type: CredentialType) -> CollaboratorResult<()> {
        self.ensure_tls_io()?;

        let trace = self.trace_enabled;
        let host = self.host_fqdn.clone();

        if credential_type.uses_cbs() {
            let mechanism = self.amqp.create_sasl_mechanism()?;
            let sasl_mechanism: &dyn SaslMechanism = &**self.sasl_mechanism.insert(mechanism);

            let tls = self
                .tls_io
                .as_deref()
                .ok_or_else(|| CollaboratorError::new("saslclientio_create", "no TLS layer"))?;
            let sasl_io = self.amqp.create_sasl_io(tls, sasl_mechanism)?;
            let sasl_io = self.sasl_io.insert(sasl_io);

            if let Err(e) = sasl_io.set_option(OPTION_LOG_TRACE, &OptionValue::Bool(trace)) {
                warn!("Failed to set trace on the SASL layer: {}", e);
            }

            let connection =
                self.amqp
                    .create_connection(ConnectionIo::Sasl(&**sasl_io), &host, DEFAULT_CONTAINER_ID)?;
            self.connection = Some(connection);
        } else {
            let tls = self
                .tls_io
                .as_deref_mut()
                .ok_or_else(|| CollaboratorError::new("connection_create", "no TLS layer"))?;

            if let Err(e) = tls.set_option(OPTION_LOG_TRACE, &OptionValue::Bool(trace)) {
                warn!("Failed to set trace on the TLS layer: {}", e);
            }

            let connection =
                self.amqp
                    .create_connection(ConnectionIo::Tls(&*tls), &host, DEFAULT_CONTAINER_ID)?;
            self.connection = Some(connection);
        }

        let connection = self
            .connection
            .as_deref_mut()
            .ok_or_else(|| CollaboratorError::new("connection_create", "connection missing"))?;
        connection.set_trace(trace);

        let session = self.session.insert(connection.create_session()?);
        Self::apply_session_windows(&mut **session);

        if credential_type.uses_cbs() {
            let cbs = self.cbs.insert(session.create_cbs()?);
            cbs.open()?;
        }

        Ok(())
    }

    // Window failures are logged only; the session stays usable with library defaults.
    fn apply_session_windows(session: &mut dyn AmqpSession) {
        if let Err(e) = session.set_incoming_window(DEFAULT_INCOMING_WINDOW_SIZE) {
            warn!("Failed to set the AMQP incoming window size: {}", e);
        }
        if let Err(e) = session.set_outgoing_window(DEFAULT_OUTGOING_WINDOW_SIZE) {
            warn!("Failed to set the AMQP outgoing window size: {}", e);
        }
    }

    /// Create the TLS layer if absent and replay any saved options into it.
    fn ensure_tls_io(&mut self) -> CollaboratorResult<&mut (dyn TlsIo + 'static)> {
        if self.tls_io.is_none() {
            let mut tls = self.io_provider.create_io(&self.host_fqdn)?;

            if let Some(saved) = &self.saved_tls_options {
                debug!(count = saved.len(), "Replaying saved TLS options");
                let replayed = saved
                    .iter()
                    .try_for_each(|(name, value)| tls.set_option(name, value));

                // Saved options are kept until a replay succeeds
                match replayed {
                    Ok(()) => self.saved_tls_options = None,
                    Err(e) => warn!("Unable to replay saved options to the TLS layer: {}", e),
                }
            }
            self.tls_io = Some(tls);
        }

        self.tls_io
            .as_deref_mut()
            .ok_or_else(|| CollaboratorError::new("xio_create", "TLS layer missing"))
    }

    /// Destroy every component in dependency order. Safe to call repeatedly
    /// and on a partially built stack.
    pub fn teardown(&mut self) {
        self.cbs = None;
        self.session = None;
        self.connection = None;
        self.sasl_io = None;
        self.sasl_mechanism = None;

        if let Some(tls) = self.tls_io.take() {
            match tls.retrieve_options() {
                Ok(options) => self.saved_tls_options = Some(options),
                Err(e) => {
                    warn!("Failed to save TLS options before teardown, defaults will be used: {}", e);
                    self.saved_tls_options = None;
                }
            }
        }
    }

    /// True when no component of the stack exists
    pub fn is_torn_down(&self) -> bool {
        self.cbs.is_none()
            && self.session.is_none()
            && self.connection.is_none()
            && self.sasl_io.is_none()
            && self.sasl_mechanism.is_none()
            && self.tls_io.is_none()
    }

    /// Turn tracing on or off for the live stack and every future one
    pub fn set_trace(&mut self, enabled: bool) -> CollaboratorResult<()> {
        self.trace_enabled = enabled;

        if let Some(connection) = self.connection.as_deref_mut() {
            connection.set_trace(enabled);
        }

        if let Some(sasl_io) = self.sasl_io.as_deref_mut() {
            sasl_io.set_option(OPTION_LOG_TRACE, &OptionValue::Bool(enabled))?;
        }

        Ok(())
    }

    /// Forward an option to the TLS layer, creating it first if needed
    pub fn set_tls_option(&mut self, name: &str, value: &OptionValue) -> CollaboratorResult<()> {
        let tls = self.ensure_tls_io()?;
        tls.set_option(name, value)
    }

    /// Pump the connection once
    pub fn pump(&mut self) -> Vec<AmqpEvent> {
        match self.connection.as_deref_mut() {
            Some(connection) => connection.do_work(),
            None => Vec::new(),
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::{MockAmqpLibrary, MockIoProvider, MockWorld};

    fn manager(world: &MockWorld) -> ConnectionManager {
        ConnectionManager::new(
            "hub.example.net".to_string(),
            Box::new(MockIoProvider::new(world)),
            Box::new(MockAmqpLibrary::new(world)),
        )
    }

    #[test]
    fn test_establish_sas_builds_full_stack() {
        let world = MockWorld::new();
        let mut manager = manager(&world);

        manager.establish(CredentialType::SharedKey).unwrap();

        assert!(manager.is_established());
        assert!(manager.cbs_mut().is_some());
        assert!(world.called("sasl_mechanism_create"));
        assert!(world.called("cbs_open"));
        assert_eq!(world.count("session_set_incoming_window"), 1);
        assert_eq!(world.last_window_sizes(), Some((u32::MAX, 100)));
    }

    #[test]
    fn test_establish_x509_skips_sasl_and_cbs() {
        let world = MockWorld::new();
        let mut manager = manager(&world);

        manager.establish(CredentialType::X509).unwrap();

        assert!(manager.is_established());
        assert!(manager.cbs_mut().is_none());
        assert!(!world.called("sasl_mechanism_create"));
        assert!(!world.called("cbs_create"));
        assert_eq!(world.count("tls_set_option:logtrace"), 1);
    }

    #[test]
    fn test_x509_trace_failure_is_not_fatal() {
        let world = MockWorld::new();
        world.fail_on("tls_set_option");
        let mut manager = manager(&world);

        manager.establish(CredentialType::X509).unwrap();

        assert!(manager.is_established());
        assert!(world.called("connection_create"));
    }

    #[test]
    fn test_failed_establish_leaves_nothing_behind() {
        let world = MockWorld::new();
        world.fail_on("session_create");
        let mut manager = manager(&world);

        assert!(manager.establish(CredentialType::SasToken).is_err());
        assert!(manager.is_torn_down());
        assert_eq!(world.live("connection"), 0);
        assert_eq!(world.live("tls_io"), 0);
    }

    #[test]
    fn test_teardown_is_idempotent() {
        let world = MockWorld::new();
        let mut manager = manager(&world);

        manager.teardown();
        manager.teardown();
        assert!(manager.is_torn_down());

        manager.establish(CredentialType::SharedKey).unwrap();
        manager.teardown();
        manager.teardown();
        assert!(manager.is_torn_down());
        assert_eq!(world.live("cbs"), 0);
    }

    #[test]
    fn test_teardown_saves_and_establish_replays_tls_options() {
        let world = MockWorld::new();
        let mut manager = manager(&world);

        manager
            .set_tls_option("TrustedCerts", &OptionValue::Text("pem".to_string()))
            .unwrap();
        manager.teardown();
        assert_eq!(manager.saved_tls_options().map(SavedOptions::len), Some(1));

        manager.establish(CredentialType::SharedKey).unwrap();
        assert!(manager.saved_tls_options().is_none());
        assert_eq!(world.count("tls_set_option:TrustedCerts"), 2);
    }

    #[test]
    fn test_failed_option_capture_is_not_fatal() {
        let world = MockWorld::new();
        world.fail_on("tls_retrieve_options");
        let mut manager = manager(&world);

        manager.establish(CredentialType::SharedKey).unwrap();
        manager.teardown();

        assert!(manager.is_torn_down());
        assert!(manager.saved_tls_options().is_none());
    }

    #[test]
    fn test_set_trace_reaches_live_connection_and_sasl() {
        let world = MockWorld::new();
        let mut manager = manager(&world);
        manager.establish(CredentialType::SharedKey).unwrap();

        manager.set_trace(true).unwrap();

        assert!(manager.trace_enabled());
        assert_eq!(world.connection_trace(), Some(true));
        assert_eq!(world.sasl_trace(), Some(true));
    }
}
