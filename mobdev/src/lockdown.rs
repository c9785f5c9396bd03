//! Lockdown: the device's service broker.
//!
//! Every other service is reached through `StartService`, which returns
//! the port to connect to and whether the connection must be TLS-wrapped.
//! Most requests besides `QueryType` need a session started with the
//! host's pair record.

use std::time::Duration;

use mobdev_proto::codec::Format;
use mobdev_proto::message::{DictExt, Request};
use plist::{Dictionary, Value};
use tracing::{debug, warn};

use crate::device::{Connector, Device};
use crate::pair_record::PairRecord;
use crate::transport::{Connection, TlsIdentity};

/// Lockdown service port.
pub const LOCKDOWN_PORT: u16 = 62078;

/// Value of `Type` in a `QueryType` reply from a real lockdown daemon.
const LOCKDOWN_TYPE: &str = "com.apple.mobile.lockdown";

/// Bound on each lockdown round trip.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Lockdown result codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
#[repr(i32)]
pub enum LockdownCode {
    /// Bad argument rejected before sending.
    InvalidArg = -1,
    /// Invalid client configuration.
    InvalidConf = -2,
    /// Message could not be encoded or decoded.
    PlistError = -3,
    /// Pairing with the device failed.
    PairingFailed = -4,
    /// TLS session failed.
    SslError = -5,
    /// Reply is not the expected dictionary.
    DictError = -6,
    /// No reply within the receive timeout.
    ReceiveTimeout = -7,
    /// Transport or multiplexer failure.
    MuxError = -8,
    /// Operation needs a session.
    NoRunningSession = -9,
    /// Reply does not answer the request.
    InvalidResponse = -10,
    /// Requested key is missing.
    MissingKey = -11,
    /// Value is missing.
    MissingValue = -12,
    /// Reading this value is not allowed.
    GetProhibited = -13,
    /// Writing this value is not allowed.
    SetProhibited = -14,
    /// Removing this value is not allowed.
    RemoveProhibited = -15,
    /// Value cannot be changed.
    ImmutableValue = -16,
    /// Device is locked with a passcode.
    PasswordProtected = -17,
    /// User declined the trust dialog.
    UserDeniedPairing = -18,
    /// Trust dialog still showing.
    PairingDialogResponsePending = -19,
    /// Host ID missing.
    MissingHostId = -20,
    /// Host ID not known to the device.
    InvalidHostId = -21,
    /// A session is already running.
    SessionActive = -22,
    /// No session is running.
    SessionInactive = -23,
    /// Session ID missing.
    MissingSessionId = -24,
    /// Session ID not recognized.
    InvalidSessionId = -25,
    /// Service name missing.
    MissingService = -26,
    /// No such service.
    InvalidService = -27,
    /// Too many connections to the service.
    ServiceLimit = -28,
    /// No pair record for the device.
    MissingPairRecord = -29,
    /// Pair record could not be saved.
    SavePairRecordFailed = -30,
    /// Pair record rejected.
    InvalidPairRecord = -31,
    /// Activation record rejected.
    InvalidActivationRecord = -32,
    /// Device is not activated.
    MissingActivationRecord = -33,
    /// Service not allowed on this device.
    ServiceProhibited = -34,
    /// Escrow bag needed while locked.
    EscrowLocked = -35,
    /// Pairing not allowed over this connection.
    PairingProhibitedOverThisConnection = -36,
    /// Blocked by Find My.
    FmipProtected = -37,
    /// Blocked by a configuration profile.
    McProtected = -38,
    /// Configuration profile challenge required.
    McChallengeRequired = -39,
    /// Device error with no known mapping.
    UnknownError = -256,
}

/// Device error names and the codes they map to.
const DEVICE_ERRORS: &[(&str, LockdownCode)] = &[
    ("InvalidResponse", LockdownCode::InvalidResponse),
    ("MissingKey", LockdownCode::MissingKey),
    ("MissingValue", LockdownCode::MissingValue),
    ("GetProhibited", LockdownCode::GetProhibited),
    ("SetProhibited", LockdownCode::SetProhibited),
    ("RemoveProhibited", LockdownCode::RemoveProhibited),
    ("ImmutableValue", LockdownCode::ImmutableValue),
    ("PasswordProtected", LockdownCode::PasswordProtected),
    ("UserDeniedPairing", LockdownCode::UserDeniedPairing),
    ("PairingDialogResponsePending", LockdownCode::PairingDialogResponsePending),
    ("MissingHostID", LockdownCode::MissingHostId),
    ("InvalidHostID", LockdownCode::InvalidHostId),
    ("SessionActive", LockdownCode::SessionActive),
    ("SessionInactive", LockdownCode::SessionInactive),
    ("MissingSessionID", LockdownCode::MissingSessionId),
    ("InvalidSessionID", LockdownCode::InvalidSessionId),
    ("MissingService", LockdownCode::MissingService),
    ("InvalidService", LockdownCode::InvalidService),
    ("ServiceLimit", LockdownCode::ServiceLimit),
    ("MissingPairRecord", LockdownCode::MissingPairRecord),
    ("SavePairRecordFailed", LockdownCode::SavePairRecordFailed),
    ("InvalidPairRecord", LockdownCode::InvalidPairRecord),
    ("InvalidActivationRecord", LockdownCode::InvalidActivationRecord),
    ("MissingActivationRecord", LockdownCode::MissingActivationRecord),
    ("ServiceProhibited", LockdownCode::ServiceProhibited),
    ("EscrowLocked", LockdownCode::EscrowLocked),
    (
        "PairingProhibitedOverThisConnection",
        LockdownCode::PairingProhibitedOverThisConnection,
    ),
    ("FMiPProtected", LockdownCode::FmipProtected),
    ("MCProtected", LockdownCode::McProtected),
    ("MCChallengeRequired", LockdownCode::McChallengeRequired),
];

impl LockdownCode {
    /// Maps a device error name; unknown names become [`LockdownCode::UnknownError`].
    pub fn from_device_name(name: &str) -> Self {
        DEVICE_ERRORS
            .iter()
            .find(|(n, _)| *n == name)
            .map_or(Self::UnknownError, |(_, code)| *code)
    }

    /// Numeric value.
    pub const fn code(self) -> i32 {
        self as i32
    }
}

/// Errors from lockdown requests.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum LockdownError {
    /// A caller-supplied argument was rejected locally.
    #[error("invalid argument: {0}")]
    InvalidArg(&'static str),

    /// The pair record cannot be used.
    #[error("invalid pairing configuration: {0}")]
    InvalidConf(String),

    /// A reply could not be decoded.
    #[error("malformed lockdown message: {0}")]
    Plist(String),

    /// The request needs a session and none is running.
    #[error("no running session")]
    NoRunningSession,

    /// A reply lacked an expected field.
    #[error("unexpected lockdown reply: {0}")]
    InvalidResponse(String),

    /// The device refused the request.
    #[error("lockdown refused {request}: {name}")]
    Device {
        /// Mapped local code.
        code: LockdownCode,
        /// Request that failed.
        request: String,
        /// Raw error name reported by the device.
        name: String,
    },

    /// TLS could not be set up for the session.
    #[error("lockdown TLS")]
    Ssl(#[source] crate::Error),

    /// The connection failed or timed out.
    #[error(transparent)]
    Transport(crate::Error),
}

impl LockdownError {
    /// Numeric code in the lockdown taxonomy.
    pub const fn code(&self) -> LockdownCode {
        match self {
            Self::InvalidArg(_) => LockdownCode::InvalidArg,
            Self::InvalidConf(_) => LockdownCode::InvalidConf,
            Self::Plist(_) => LockdownCode::PlistError,
            Self::NoRunningSession => LockdownCode::NoRunningSession,
            Self::InvalidResponse(_) => LockdownCode::InvalidResponse,
            Self::Device { code, .. } => *code,
            Self::Ssl(_) => LockdownCode::SslError,
            Self::Transport(crate::Error::Timeout) => LockdownCode::ReceiveTimeout,
            Self::Transport(_) => LockdownCode::MuxError,
        }
    }
}

impl From<crate::Error> for LockdownError {
    fn from(err: crate::Error) -> Self {
        match err {
            crate::Error::Malformed(msg) => Self::Plist(msg),
            crate::Error::InvalidArg(msg) => Self::InvalidArg(msg),
            other => Self::Transport(other),
        }
    }
}

/// Where a started service listens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub struct ServiceDescriptor {
    /// Device port.
    pub port: u16,
    /// Whether the connection must be TLS-wrapped.
    pub uses_ssl: bool,
}

impl ServiceDescriptor {
    /// Creates a descriptor.
    pub const fn new(port: u16, uses_ssl: bool) -> Self {
        Self { port, uses_ssl }
    }
}

/// Resolves service names to descriptors.
///
/// [`LockdownClient`] is the real resolver; sessions only need this
/// trait.
pub trait ServiceResolver {
    /// Starts `service`, optionally presenting the escrow bag.
    fn start_service(
        &mut self,
        service: &str,
        escrow_bag: bool,
    ) -> Result<ServiceDescriptor, LockdownError>;

    /// Identity for services that require TLS.
    fn tls_identity(&self) -> Option<&TlsIdentity>;
}

/// A connection to the lockdown daemon.
#[derive(Debug)]
pub struct LockdownClient {
    conn: Connection,
    label: String,
    session_id: Option<String>,
    record: Option<PairRecord>,
    identity: Option<TlsIdentity>,
}

impl LockdownClient {
    /// Connects and checks the daemon type, without a session.
    pub fn connect(device: &impl Connector, label: &str) -> Result<Self, LockdownError> {
        let conn = device.connect(LOCKDOWN_PORT)?;
        let mut client = Self::from_connection(conn, label);
        let kind = client.query_type()?;
        if kind != LOCKDOWN_TYPE {
            warn!(kind, "unexpected lockdown type");
        }
        Ok(client)
    }

    /// Connects and starts a session with `record`.
    pub fn connect_with_record(
        device: &impl Connector,
        record: PairRecord,
        label: &str,
    ) -> Result<Self, LockdownError> {
        let mut client = Self::connect(device, label)?;
        client.start_session(record)?;
        Ok(client)
    }

    /// Connects to `device` and starts a session with its pair record.
    pub fn connect_with_handshake(device: &Device, label: &str) -> Result<Self, LockdownError> {
        let record = device
            .pair_record()
            .map_err(|e| LockdownError::InvalidConf(e.to_string()))?;
        Self::connect_with_record(device, record, label)
    }

    /// Wraps an existing connection to the lockdown port.
    pub fn from_connection(conn: Connection, label: &str) -> Self {
        Self {
            conn,
            label: label.to_owned(),
            session_id: None,
            record: None,
            identity: None,
        }
    }

    /// Label sent with every request.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Identifier of the running session.
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Sends one request and returns the checked reply.
    fn request(&mut self, name: &str, body: Request) -> Result<Dictionary, LockdownError> {
        let message = body
            .with("Request", name)
            .with("Label", self.label.as_str())
            .into_value();
        self.conn.send_plist(&message, Format::Xml)?;
        let reply = self.conn.receive_plist(Some(REQUEST_TIMEOUT))?;

        if let Some(error) = reply.string("Error") {
            debug!(request = name, error, "lockdown request refused");
            return Err(LockdownError::Device {
                code: LockdownCode::from_device_name(error),
                request: name.to_owned(),
                name: error.to_owned(),
            });
        }
        match reply.string("Request") {
            Some(echo) if echo != name => Err(LockdownError::InvalidResponse(format!(
                "reply to {echo} while waiting for {name}"
            ))),
            _ => Ok(reply),
        }
    }

    /// Returns the daemon type, `com.apple.mobile.lockdown` on devices.
    pub fn query_type(&mut self) -> Result<String, LockdownError> {
        let reply = self.request("QueryType", Request::new())?;
        reply
            .string("Type")
            .map(str::to_owned)
            .ok_or_else(|| LockdownError::InvalidResponse("QueryType without Type".into()))
    }

    /// Reads a value; `None` domain/key selects the whole domain/root.
    pub fn get_value(
        &mut self,
        domain: Option<&str>,
        key: Option<&str>,
    ) -> Result<Value, LockdownError> {
        let mut reply = self.request(
            "GetValue",
            Request::new().with_opt("Domain", domain).with_opt("Key", key),
        )?;
        reply
            .remove("Value")
            .ok_or_else(|| LockdownError::InvalidResponse("GetValue without Value".into()))
    }

    /// Writes a value.
    pub fn set_value(
        &mut self,
        domain: Option<&str>,
        key: &str,
        value: Value,
    ) -> Result<(), LockdownError> {
        if key.is_empty() {
            return Err(LockdownError::InvalidArg("empty key"));
        }
        self.request(
            "SetValue",
            Request::new()
                .with_opt("Domain", domain)
                .with("Key", key)
                .with("Value", value),
        )
        .map(drop)
    }

    /// Removes a value.
    pub fn remove_value(&mut self, domain: Option<&str>, key: &str) -> Result<(), LockdownError> {
        if key.is_empty() {
            return Err(LockdownError::InvalidArg("empty key"));
        }
        self.request(
            "RemoveValue",
            Request::new().with_opt("Domain", domain).with("Key", key),
        )
        .map(drop)
    }

    /// User-visible device name.
    pub fn device_name(&mut self) -> Result<String, LockdownError> {
        self.string_value("DeviceName")
    }

    /// Device UDID as lockdown reports it.
    pub fn device_udid(&mut self) -> Result<String, LockdownError> {
        self.string_value("UniqueDeviceID")
    }

    fn string_value(&mut self, key: &'static str) -> Result<String, LockdownError> {
        match self.get_value(None, Some(key))? {
            Value::String(s) => Ok(s),
            _ => Err(LockdownError::InvalidResponse(format!("{key} is not a string"))),
        }
    }

    /// Starts a session, switching to TLS when the device asks for it.
    pub fn start_session(&mut self, record: PairRecord) -> Result<(), LockdownError> {
        if self.session_id.is_some() {
            self.stop_session()?;
        }
        let reply = self.request(
            "StartSession",
            Request::new()
                .with("HostID", record.host_id.as_str())
                .with_opt("SystemBUID", record.system_buid.as_deref()),
        )?;
        let session_id = reply
            .string("SessionID")
            .ok_or_else(|| LockdownError::InvalidResponse("StartSession without SessionID".into()))?
            .to_owned();

        if reply.boolean("EnableSessionSSL").unwrap_or(false) {
            let identity = record
                .tls_identity()
                .map_err(|e| LockdownError::InvalidConf(e.to_string()))?;
            self.conn.enable_tls(&identity).map_err(LockdownError::Ssl)?;
            self.identity = Some(identity);
        } else {
            self.identity = record
                .tls_identity()
                .inspect_err(|e| debug!(error = %e, "pair record has no usable TLS identity"))
                .ok();
        }
        debug!(session = %session_id, tls = self.conn.is_tls(), "lockdown session started");
        self.session_id = Some(session_id);
        self.record = Some(record);
        Ok(())
    }

    /// Stops the running session and drops TLS.
    pub fn stop_session(&mut self) -> Result<(), LockdownError> {
        let session_id = self.session_id.take().ok_or(LockdownError::NoRunningSession)?;
        let result = self.request(
            "StopSession",
            Request::new().with("SessionID", session_id.as_str()),
        );
        self.conn.disable_tls(false)?;
        debug!(session = %session_id, "lockdown session stopped");
        result.map(drop)
    }

    /// Closes the client, stopping any session first. Idempotent.
    pub fn close(&mut self) -> Result<(), LockdownError> {
        if self.session_id.is_some() && self.conn.is_connected() {
            if let Err(e) = self.stop_session() {
                debug!(error = %e, "StopSession on close");
            }
        }
        self.conn.disconnect()?;
        Ok(())
    }
}

impl ServiceResolver for LockdownClient {
    fn start_service(
        &mut self,
        service: &str,
        escrow_bag: bool,
    ) -> Result<ServiceDescriptor, LockdownError> {
        if service.is_empty() {
            return Err(LockdownError::InvalidArg("empty service name"));
        }
        if self.session_id.is_none() {
            return Err(LockdownError::NoRunningSession);
        }
        let bag = if escrow_bag {
            let bag = self
                .record
                .as_ref()
                .and_then(|r| r.escrow_bag.as_ref())
                .ok_or_else(|| LockdownError::InvalidConf("pair record has no escrow bag".into()))?;
            let bytes: &[u8] = bag.as_ref();
            Some(bytes.to_vec())
        } else {
            None
        };

        let mut body = Request::new().with("Service", service);
        if let Some(bag) = bag {
            body = body.with_data("EscrowBag", bag);
        }
        let reply = self.request("StartService", body)?;
        let port = reply
            .uint("Port")
            .and_then(|p| u16::try_from(p).ok())
            .filter(|p| *p != 0)
            .ok_or_else(|| LockdownError::InvalidResponse("StartService without Port".into()))?;
        let uses_ssl = reply.boolean("EnableServiceSSL").unwrap_or(false);
        debug!(service, port, uses_ssl, "service started");
        Ok(ServiceDescriptor { port, uses_ssl })
    }

    fn tls_identity(&self) -> Option<&TlsIdentity> {
        self.identity.as_ref()
    }
}

impl Drop for LockdownClient {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            debug!(error = %e, "closing lockdown client");
        }
    }
}

#[cfg(all(test, unix))]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::os::unix::net::UnixStream;
    use std::thread;

    use mobdev_proto::codec;

    use super::*;

    fn client() -> (LockdownClient, UnixStream) {
        let (a, b) = UnixStream::pair().unwrap();
        let conn = Connection::from_socket("udid", LOCKDOWN_PORT, Box::new(a));
        (LockdownClient::from_connection(conn, "tests"), b)
    }

    fn reply(peer: &mut UnixStream, body: Request) {
        codec::encode(peer, &body.into_value(), Format::Xml).unwrap();
    }

    #[test]
    fn query_type_sends_label() {
        let (mut client, mut peer) = client();
        let device = thread::spawn(move || {
            let req = codec::decode_dict(&mut peer).unwrap();
            assert_eq!(req.string("Request"), Some("QueryType"));
            assert_eq!(req.string("Label"), Some("tests"));
            reply(
                &mut peer,
                Request::new()
                    .with("Request", "QueryType")
                    .with("Type", LOCKDOWN_TYPE),
            );
            peer
        });
        assert_eq!(client.query_type().unwrap(), LOCKDOWN_TYPE);
        drop(device.join().unwrap());
    }

    #[test]
    fn device_errors_keep_their_name() {
        let (mut client, mut peer) = client();
        let device = thread::spawn(move || {
            codec::decode_dict(&mut peer).unwrap();
            reply(
                &mut peer,
                Request::new()
                    .with("Request", "GetValue")
                    .with("Error", "PasswordProtected"),
            );
            codec::decode_dict(&mut peer).unwrap();
            reply(
                &mut peer,
                Request::new()
                    .with("Request", "GetValue")
                    .with("Error", "SomethingNew"),
            );
            peer
        });

        let err = client.get_value(None, Some("DeviceName")).unwrap_err();
        assert_eq!(err.code(), LockdownCode::PasswordProtected);
        assert_eq!(err.code().code(), -17);

        let err = client.get_value(None, Some("DeviceName")).unwrap_err();
        assert_eq!(err.code(), LockdownCode::UnknownError);
        assert!(matches!(err, LockdownError::Device { ref name, .. } if name == "SomethingNew"));
        drop(device.join().unwrap());
    }

    #[test]
    fn start_service_requires_session() {
        let (mut client, _peer) = client();
        assert!(matches!(
            client.start_service("com.apple.afc", false),
            Err(LockdownError::NoRunningSession)
        ));
        assert!(matches!(
            client.start_service("", false),
            Err(LockdownError::InvalidArg(_))
        ));
    }

    #[test]
    fn stop_without_session() {
        let (mut client, _peer) = client();
        assert!(matches!(
            client.stop_session(),
            Err(LockdownError::NoRunningSession)
        ));
        client.close().unwrap();
        client.close().unwrap();
    }

    #[test]
    fn plaintext_session_then_service_with_escrow() {
        let (mut client, mut peer) = client();
        let device = thread::spawn(move || {
            let req = codec::decode_dict(&mut peer).unwrap();
            assert_eq!(req.string("Request"), Some("StartSession"));
            assert_eq!(req.string("HostID"), Some("HOST-1234"));
            assert_eq!(req.string("SystemBUID"), Some("BUID-5678"));
            reply(
                &mut peer,
                Request::new()
                    .with("Request", "StartSession")
                    .with("SessionID", "S1")
                    .with("EnableSessionSSL", false),
            );

            let req = codec::decode_dict(&mut peer).unwrap();
            assert_eq!(req.string("Service"), Some("com.apple.mobile.house_arrest"));
            assert_eq!(req.data("EscrowBag"), Some(&[1u8, 2, 3][..]));
            reply(
                &mut peer,
                Request::new()
                    .with("Request", "StartService")
                    .with("Port", 50123u64)
                    .with("EnableServiceSSL", true),
            );

            let req = codec::decode_dict(&mut peer).unwrap();
            assert_eq!(req.string("Request"), Some("StopSession"));
            assert_eq!(req.string("SessionID"), Some("S1"));
            reply(&mut peer, Request::new().with("Request", "StopSession"));
            peer
        });

        let record = PairRecord::from_bytes(&crate::pair_record::tests::sample_record_bytes(true))
            .unwrap();
        client.start_session(record).unwrap();
        assert_eq!(client.session_id(), Some("S1"));
        let descriptor = client
            .start_service("com.apple.mobile.house_arrest", true)
            .unwrap();
        assert_eq!(descriptor, ServiceDescriptor::new(50123, true));
        client.stop_session().unwrap();
        assert!(client.session_id().is_none());
        drop(device.join().unwrap());
    }

    #[test]
    fn name_table_matches_codes() {
        assert_eq!(
            LockdownCode::from_device_name("InvalidService").code(),
            -27
        );
        assert_eq!(LockdownCode::from_device_name("EscrowLocked").code(), -35);
        assert_eq!(LockdownCode::from_device_name("").code(), -256);
    }
}
