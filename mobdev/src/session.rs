//! Service sessions: a handshaken connection to one named device service.
//!
//! Reaching a service takes three steps: resolve its descriptor through
//! lockdown, connect to the port, then enable TLS if the descriptor asks
//! for it. [`StartServiceError`] records which step failed. The session
//! owns its connection exclusively and releases it exactly once.

use std::time::Duration;

use mobdev_proto::afc::Packet;
use mobdev_proto::codec::Format;
use plist::{Dictionary, Value};
use tracing::debug;

use crate::device::{Connector, Device};
use crate::lockdown::{LockdownClient, LockdownError, ServiceResolver};
use crate::transport::{Closer, Connection};
use crate::{Error, Result};

/// Default label sent to lockdown.
pub const DEFAULT_LABEL: &str = "mobdev";

/// Options shared by all service clients.
#[derive(Debug, Clone)]
#[must_use]
pub struct ServiceOptions {
    /// Caller label sent to lockdown and the service.
    pub(crate) label: String,
    /// Present the pair record's escrow bag when starting the service.
    pub(crate) escrow_bag: bool,
    /// Receive timeout for request/response exchanges.
    pub(crate) timeout: Option<Duration>,
    /// Poll interval of background status and capture loops.
    pub(crate) poll_interval: Duration,
    /// Overall bound on a long-running command; `None` waits forever.
    pub(crate) command_timeout: Option<Duration>,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            label: DEFAULT_LABEL.to_owned(),
            escrow_bag: false,
            timeout: Some(Duration::from_secs(30)),
            poll_interval: Duration::from_millis(100),
            command_timeout: None,
        }
    }
}

impl ServiceOptions {
    /// Options with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the caller label.
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Presents the escrow bag when starting the service.
    pub const fn escrow_bag(mut self, on: bool) -> Self {
        self.escrow_bag = on;
        self
    }

    /// Sets the receive timeout; `None` blocks.
    pub const fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the background loop poll interval.
    pub const fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Bounds long-running commands.
    pub const fn command_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Caller label.
    pub fn label_str(&self) -> &str {
        &self.label
    }

    /// Receive timeout.
    pub const fn receive_timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

/// Handshake failure, by step.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum StartServiceError {
    /// Lockdown could not start the service (absent, prohibited, locked).
    #[error("starting {service} failed")]
    Lockdown {
        /// Service name.
        service: String,
        /// Lockdown failure.
        #[source]
        source: LockdownError,
    },

    /// Connecting to the service port failed.
    #[error("connecting to {service} on port {port} failed")]
    Connect {
        /// Service name.
        service: String,
        /// Service port.
        port: u16,
        /// Transport failure.
        #[source]
        source: Error,
    },

    /// The TLS upgrade failed.
    #[error("TLS setup for {service} failed")]
    Tls {
        /// Service name.
        service: String,
        /// Transport failure.
        #[source]
        source: Error,
    },
}

/// Lifecycle of a session's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Active,
    /// The connection moved to a derived client; only `close` is allowed.
    HandedOff,
    Closed,
}

/// An established channel to one device service.
#[derive(Debug)]
pub struct ServiceSession {
    service: String,
    conn: Option<Connection>,
    state: State,
    options: ServiceOptions,
}

impl ServiceSession {
    /// Performs the handshake for `service`.
    pub fn start(
        device: &impl Connector,
        resolver: &mut impl ServiceResolver,
        service: &str,
        options: &ServiceOptions,
    ) -> std::result::Result<Self, StartServiceError> {
        let descriptor = resolver
            .start_service(service, options.escrow_bag)
            .map_err(|source| StartServiceError::Lockdown {
                service: service.to_owned(),
                source,
            })?;

        let mut conn =
            device
                .connect(descriptor.port)
                .map_err(|source| StartServiceError::Connect {
                    service: service.to_owned(),
                    port: descriptor.port,
                    source,
                })?;

        if descriptor.uses_ssl {
            let tls = resolver
                .tls_identity()
                .ok_or_else(|| Error::Ssl("no TLS identity; start a lockdown session first".into()))
                .and_then(|identity| conn.enable_tls(identity));
            if let Err(source) = tls {
                if let Err(e) = conn.disconnect() {
                    debug!(error = %e, "disconnect after failed TLS");
                }
                return Err(StartServiceError::Tls {
                    service: service.to_owned(),
                    source,
                });
            }
        }

        debug!(service, port = descriptor.port, tls = descriptor.uses_ssl, "service session established");
        Ok(Self::from_connection(service, conn, options.clone()))
    }

    /// Wraps a connection that already speaks `service`.
    pub fn from_connection(service: &str, conn: Connection, options: ServiceOptions) -> Self {
        Self {
            service: service.to_owned(),
            conn: Some(conn),
            state: State::Active,
            options,
        }
    }

    /// Service name.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Options the session was started with.
    pub const fn options(&self) -> &ServiceOptions {
        &self.options
    }

    /// Whether the session can carry traffic.
    pub const fn is_active(&self) -> bool {
        matches!(self.state, State::Active)
    }

    /// Whether the connection was handed to a derived client.
    pub const fn is_handed_off(&self) -> bool {
        matches!(self.state, State::HandedOff)
    }

    /// The live connection.
    pub fn connection(&mut self) -> Result<&mut Connection> {
        match self.state {
            State::Active => self.conn.as_mut().ok_or(Error::Closed),
            State::HandedOff => Err(Error::HandedOff),
            State::Closed => Err(Error::Closed),
        }
    }

    /// Sends a plist message in the session's default encoding (XML).
    pub fn send_plist(&mut self, message: &Value) -> Result<()> {
        self.connection()?.send_plist(message, Format::Xml)
    }

    /// Sends a plist message as a binary plist.
    pub fn send_binary_plist(&mut self, message: &Value) -> Result<()> {
        self.connection()?.send_plist(message, Format::Binary)
    }

    /// Receives one plist dictionary.
    pub fn receive_plist(&mut self, timeout: Option<Duration>) -> Result<Dictionary> {
        self.connection()?.receive_plist(timeout)
    }

    /// Receives one plist of any top-level type.
    pub fn receive_plist_value(&mut self, timeout: Option<Duration>) -> Result<Value> {
        self.connection()?.receive_plist_value(timeout)
    }

    /// Sends one AFC packet.
    pub fn send_packet(&mut self, packet: &Packet) -> Result<()> {
        self.connection()?.send_packet(packet)
    }

    /// Receives one AFC packet.
    pub fn receive_packet(&mut self, timeout: Option<Duration>) -> Result<Packet> {
        self.connection()?.receive_packet(timeout)
    }

    /// Receives raw bytes.
    pub fn receive(&mut self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize> {
        self.connection()?.receive(buf, timeout)
    }

    /// Handle for shutting the connection down from another thread.
    pub fn closer(&mut self) -> Result<Closer> {
        self.connection()?.closer()
    }

    /// Moves the connection to a derived client.
    ///
    /// Afterwards the session only accepts [`close`](Self::close); every
    /// other operation fails with [`Error::HandedOff`].
    pub fn hand_off(&mut self) -> Result<Connection> {
        self.connection()?;
        let conn = self.conn.take().ok_or(Error::Closed)?;
        self.state = State::HandedOff;
        debug!(service = %self.service, "connection handed off");
        Ok(conn)
    }

    /// Releases the connection. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        self.state = State::Closed;
        match self.conn.take() {
            Some(mut conn) => {
                debug!(service = %self.service, "closing session");
                conn.disconnect()
            }
            None => Ok(()),
        }
    }
}

impl Drop for ServiceSession {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            debug!(service = %self.service, error = %e, "closing session on drop");
        }
    }
}

/// A protocol client reachable through the service handshake.
pub trait DeviceService: Sized {
    /// Lockdown name of the service.
    const SERVICE_NAME: &'static str;

    /// Error type of the protocol.
    type Error: From<StartServiceError>;

    /// Wraps an established session.
    fn from_session(session: ServiceSession) -> std::result::Result<Self, Self::Error>;

    /// Starts the service through `resolver` and wraps the session.
    fn start(
        device: &impl Connector,
        resolver: &mut impl ServiceResolver,
        options: &ServiceOptions,
    ) -> std::result::Result<Self, Self::Error> {
        let session = ServiceSession::start(device, resolver, Self::SERVICE_NAME, options)?;
        Self::from_session(session)
    }

    /// Opens a lockdown session on `device` and starts the service.
    fn connect(device: &Device, options: &ServiceOptions) -> std::result::Result<Self, Self::Error> {
        let mut lockdown =
            LockdownClient::connect_with_handshake(device, &options.label).map_err(|source| {
                StartServiceError::Lockdown {
                    service: Self::SERVICE_NAME.to_owned(),
                    source,
                }
            })?;
        Self::start(device, &mut lockdown, options)
    }
}
