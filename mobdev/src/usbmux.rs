//! Client for the usbmuxd multiplexer daemon.
//!
//! Each request opens a fresh connection to the daemon, sends one
//! plist message and reads the reply with the matching tag. `Connect`
//! turns that connection into a tunnel to a device port; `Listen`
//! turns it into an event stream.

use std::net::{IpAddr, TcpStream};
#[cfg(unix)]
use std::os::unix::net::UnixStream;
#[cfg(unix)]
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use mobdev_proto::message::{DictExt, Request};
use mobdev_proto::mux::{self, DeviceProperties, MuxResult};
use plist::{Dictionary, Value};
use tracing::{debug, trace};

use crate::pair_record::PairRecord;
use crate::transport::{Connection, Socket};
use crate::{Error, Result};

/// Environment variable overriding the daemon address.
pub const ENV_SOCKET_ADDRESS: &str = "USBMUXD_SOCKET_ADDRESS";

/// Default daemon socket on Unix.
#[cfg(unix)]
const DEFAULT_SOCKET: &str = "/var/run/usbmuxd";

const PROG_NAME: &str = "mobdev";
const CLIENT_VERSION: &str = concat!("mobdev-", env!("CARGO_PKG_VERSION"));
const LIBUSBMUX_VERSION: u64 = 3;

/// Bound on waiting for a daemon reply.
const REPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// Tags are unique per process so replies can be told apart.
static NEXT_TAG: AtomicU32 = AtomicU32::new(1);

/// Where the multiplexer daemon listens.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum MuxAddress {
    /// Unix domain socket.
    #[cfg(unix)]
    Unix(PathBuf),
    /// TCP `host:port`.
    Tcp(String),
}

impl Default for MuxAddress {
    fn default() -> Self {
        #[cfg(unix)]
        {
            Self::Unix(PathBuf::from(DEFAULT_SOCKET))
        }
        #[cfg(not(unix))]
        {
            Self::Tcp(format!("127.0.0.1:{}", mux::DEFAULT_TCP_PORT))
        }
    }
}

impl MuxAddress {
    /// Reads `USBMUXD_SOCKET_ADDRESS`, falling back to the platform default.
    pub fn from_env() -> Self {
        std::env::var(ENV_SOCKET_ADDRESS)
            .ok()
            .filter(|s| !s.is_empty())
            .map_or_else(Self::default, |s| Self::parse(&s))
    }

    /// Parses `UNIX:/path` or `host:port`.
    pub fn parse(s: &str) -> Self {
        #[cfg(unix)]
        if let Some(path) = s.strip_prefix("UNIX:") {
            return Self::Unix(PathBuf::from(path));
        }
        Self::Tcp(s.to_owned())
    }

    fn connect(&self) -> Result<Box<dyn Socket>> {
        let socket: Box<dyn Socket> = match self {
            #[cfg(unix)]
            Self::Unix(path) => Box::new(
                UnixStream::connect(path)
                    .map_err(|e| Error::Mux(format!("{}: {e}", path.display())))?,
            ),
            Self::Tcp(addr) => Box::new(
                TcpStream::connect(addr.as_str()).map_err(|e| Error::Mux(format!("{addr}: {e}")))?,
            ),
        };
        Ok(socket)
    }
}

/// How a device is attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ConnectionType {
    /// Local bus (USB).
    Usb,
    /// Wi-Fi / network.
    Network,
}

impl ConnectionType {
    fn parse(s: &str) -> Result<Self> {
        match s {
            "USB" => Ok(Self::Usb),
            "Network" => Ok(Self::Network),
            other => Err(Error::Mux(format!("unknown connection type {other}"))),
        }
    }
}

/// An attached device as reported by the multiplexer.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct DeviceInfo {
    /// Unique device identifier.
    pub udid: String,
    /// How the device is attached.
    pub connection_type: ConnectionType,
    /// Multiplexer-assigned device id.
    pub mux_id: u32,
    /// IP address of a network device, when known.
    pub network_address: Option<IpAddr>,
}

impl DeviceInfo {
    /// Parses an `Attached` record's `Properties`.
    pub(crate) fn from_properties(value: &Value) -> Result<Self> {
        let props = DeviceProperties::from_value(value)
            .map_err(|e| Error::Malformed(format!("device properties: {e}")))?;
        Ok(Self {
            connection_type: ConnectionType::parse(&props.connection_type)?,
            network_address: props
                .network_address
                .as_ref()
                .and_then(|raw| mux::parse_network_address(raw.as_ref())),
            udid: props.serial_number,
            mux_id: props.device_id,
        })
    }
}

/// Client for the multiplexer daemon.
#[derive(Debug, Clone, Default)]
pub struct Muxer {
    address: MuxAddress,
}

impl Muxer {
    /// Client for the daemon named by the environment.
    pub fn new() -> Self {
        Self::with_address(MuxAddress::from_env())
    }

    /// Client for a specific daemon address.
    pub const fn with_address(address: MuxAddress) -> Self {
        Self { address }
    }

    /// Daemon address.
    pub const fn address(&self) -> &MuxAddress {
        &self.address
    }

    fn open(&self) -> Result<MuxChannel> {
        Ok(MuxChannel {
            conn: Connection::from_socket("usbmuxd", 0, self.address.connect()?),
        })
    }

    /// Lists attached devices.
    pub fn list_devices(&self) -> Result<Vec<DeviceInfo>> {
        let reply = self.open()?.request("ListDevices", Request::new())?;
        let list = reply
            .array("DeviceList")
            .ok_or_else(|| Error::Malformed("ListDevices reply without DeviceList".into()))?;
        let devices = list
            .iter()
            .filter_map(Value::as_dictionary)
            .filter_map(|entry| entry.get("Properties"))
            .map(DeviceInfo::from_properties)
            .collect::<Result<Vec<_>>>()?;
        debug!(count = devices.len(), "listed devices");
        Ok(devices)
    }

    /// Opens a tunnel to `port` on device `mux_id`.
    pub fn connect(&self, mux_id: u32, port: u16) -> Result<Connection> {
        if port == 0 {
            return Err(Error::InvalidArg("port must be non-zero"));
        }
        let mut channel = self.open()?;
        // Port goes out in network byte order, read back as a host integer.
        let wire_port = u16::from_ne_bytes(port.to_be_bytes());
        let reply = channel.request(
            "Connect",
            Request::new()
                .with("DeviceID", u64::from(mux_id))
                .with("PortNumber", u64::from(wire_port)),
        )?;
        check_result(&reply)?;
        debug!(mux_id, port, "tunnel established");
        Ok(channel.conn)
    }

    /// Reads the pair record the daemon stores for `udid`.
    pub fn read_pair_record(&self, udid: &str) -> Result<PairRecord> {
        if udid.is_empty() {
            return Err(Error::InvalidArg("empty UDID"));
        }
        let reply = self
            .open()?
            .request("ReadPairRecord", Request::new().with("PairRecordID", udid))?;
        match reply.data("PairRecordData") {
            Some(data) => PairRecord::from_bytes(data),
            None => {
                check_result(&reply)?;
                Err(Error::Malformed("ReadPairRecord reply without data".into()))
            }
        }
    }

    /// Reads the daemon's system BUID.
    pub fn read_buid(&self) -> Result<String> {
        let reply = self.open()?.request("ReadBUID", Request::new())?;
        match reply.string("BUID") {
            Some(buid) => Ok(buid.to_owned()),
            None => {
                check_result(&reply)?;
                Err(Error::Malformed("ReadBUID reply without BUID".into()))
            }
        }
    }

    /// Subscribes to attach/detach events on a dedicated connection.
    pub(crate) fn listen(&self) -> Result<MuxChannel> {
        let mut channel = self.open()?;
        let reply = channel.request("Listen", Request::new())?;
        check_result(&reply)?;
        Ok(channel)
    }
}

/// One connection to the daemon.
#[derive(Debug)]
pub(crate) struct MuxChannel {
    conn: Connection,
}

impl MuxChannel {
    /// Sends a request and waits for the reply carrying the same tag.
    fn request(&mut self, message_type: &str, body: Request) -> Result<Dictionary> {
        let tag = NEXT_TAG.fetch_add(1, Ordering::Relaxed);
        let message = body
            .with("MessageType", message_type)
            .with("ClientVersionString", CLIENT_VERSION)
            .with("ProgName", PROG_NAME)
            .with("kLibUSBMuxVersion", LIBUSBMUX_VERSION);
        let packet = mux::to_packet(tag, &message.into_value())?;
        self.conn.send_all(&packet)?;
        loop {
            let (reply_tag, reply) = self.conn.receive_mux(Some(REPLY_TIMEOUT))?;
            if reply_tag == tag {
                return Ok(reply);
            }
            trace!(reply_tag, tag, "skipping unrelated multiplexer message");
        }
    }

    /// Reads the next unsolicited message (events after `Listen`).
    pub(crate) fn next_message(&mut self, timeout: Option<Duration>) -> Result<Dictionary> {
        self.conn.receive_mux(timeout).map(|(_, dict)| dict)
    }

    /// Handle for unblocking a pending [`next_message`](Self::next_message).
    pub(crate) fn closer(&self) -> Result<crate::transport::Closer> {
        self.conn.closer()
    }
}

/// Interprets a `Result` reply.
fn check_result(reply: &Dictionary) -> Result<()> {
    if reply.string("MessageType") != Some("Result") {
        return Err(Error::Malformed("expected a Result message".into()));
    }
    let number = reply
        .uint("Number")
        .ok_or_else(|| Error::Malformed("Result without Number".into()))?;
    match MuxResult::from_code(number) {
        MuxResult::Ok => Ok(()),
        MuxResult::BadDevice => Err(Error::NoDevice("device not attached".into())),
        MuxResult::ConnectionRefused => Err(Error::Mux("connection refused by device".into())),
        MuxResult::BadVersion => Err(Error::Mux("protocol version mismatch".into())),
        MuxResult::BadCommand => Err(Error::Mux("bad command".into())),
        _ => Err(Error::Mux(format!("request failed with result {number}"))),
    }
}

#[cfg(all(test, unix))]
#[allow(clippy::unwrap_used)]
pub(crate) mod tests {
    use std::io::Write;
    use std::os::unix::net::UnixListener;
    use std::thread::{self, JoinHandle};

    use super::*;

    /// Answers one request with a reply plus raw bytes sent right after it.
    pub(crate) type Handler = Box<dyn FnMut(&Dictionary) -> (Dictionary, Vec<u8>) + Send>;

    pub(crate) fn handler(
        f: impl FnMut(&Dictionary) -> (Dictionary, Vec<u8>) + Send + 'static,
    ) -> Handler {
        Box::new(f)
    }

    /// Runs a fake daemon answering one connection per handler, in order.
    pub(crate) fn fake_daemon(handlers: Vec<Handler>) -> (Muxer, tempfile::TempDir, JoinHandle<()>) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("usbmuxd");
        let listener = UnixListener::bind(&path).unwrap();
        let handle = thread::spawn(move || {
            for mut respond in handlers {
                let (mut stream, _) = listener.accept().unwrap();
                let (tag, request) = mux::decode(&mut stream).unwrap();
                let (reply, trailing) = respond(&request);
                mux::encode(&mut stream, tag, &Value::Dictionary(reply)).unwrap();
                if stream.write_all(&trailing).is_err() {
                    continue;
                }
                // Keep tunnels open until the client hangs up.
                let mut sink = Vec::new();
                let _ = std::io::Read::read_to_end(&mut stream, &mut sink);
            }
        });
        (Muxer::with_address(MuxAddress::Unix(path)), dir, handle)
    }

    /// An unsolicited message as the daemon frames it.
    pub(crate) fn event(message: Value) -> Vec<u8> {
        mux::to_packet(0, &message).unwrap()
    }

    pub(crate) fn result(number: u64) -> Dictionary {
        Request::new()
            .with("MessageType", "Result")
            .with("Number", number)
            .into_dict()
    }

    pub(crate) fn attached(udid: &str, id: u64, kind: &str) -> Value {
        let props = Request::new()
            .with("SerialNumber", udid)
            .with("ConnectionType", kind)
            .with("DeviceID", id)
            .into_value();
        Request::new()
            .with("MessageType", "Attached")
            .with("DeviceID", id)
            .with("Properties", props)
            .into_value()
    }

    #[test]
    fn list_devices_parses_entries() {
        let (muxer, _dir, daemon) = fake_daemon(vec![handler(|req| {
            assert_eq!(req.string("MessageType"), Some("ListDevices"));
            assert_eq!(req.string("ProgName"), Some("mobdev"));
            let list = vec![attached("AAA", 1, "USB"), attached("BBB", 2, "Network")];
            (Request::new().with("DeviceList", list).into_dict(), Vec::new())
        })]);
        let devices = muxer.list_devices().unwrap();
        daemon.join().unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].udid, "AAA");
        assert_eq!(devices[0].connection_type, ConnectionType::Usb);
        assert_eq!(devices[1].mux_id, 2);
        assert_eq!(devices[1].connection_type, ConnectionType::Network);
    }

    #[test]
    fn connect_sends_port_in_network_order() {
        let (muxer, _dir, daemon) = fake_daemon(vec![handler(|req| {
            assert_eq!(req.string("MessageType"), Some("Connect"));
            assert_eq!(req.uint("DeviceID"), Some(7));
            let wire = u16::try_from(req.uint("PortNumber").unwrap()).unwrap();
            assert_eq!(u16::from_be_bytes(wire.to_ne_bytes()), 62078);
            (result(0), b"hello".to_vec())
        })]);
        let mut conn = muxer.connect(7, 62078).unwrap();
        let mut buf = [0u8; 5];
        let mut got = 0;
        while got < buf.len() {
            got += conn
                .receive(&mut buf[got..], Some(Duration::from_secs(2)))
                .unwrap();
        }
        assert_eq!(&buf, b"hello");
        conn.disconnect().unwrap();
        daemon.join().unwrap();
    }

    #[test]
    fn refused_connect_is_mux_error() {
        let (muxer, _dir, daemon) = fake_daemon(vec![handler(|_| (result(3), Vec::new()))]);
        let err = muxer.connect(1, 1234).unwrap_err();
        daemon.join().unwrap();
        assert!(matches!(err, Error::Mux(_)));
    }

    #[test]
    fn bad_device_is_no_device() {
        let (muxer, _dir, daemon) = fake_daemon(vec![handler(|_| (result(2), Vec::new()))]);
        let err = muxer.connect(9, 1234).unwrap_err();
        daemon.join().unwrap();
        assert!(matches!(err, Error::NoDevice(_)));
    }

    #[test]
    fn zero_port_never_reaches_daemon() {
        let muxer = Muxer::with_address(MuxAddress::Unix(PathBuf::from("/nonexistent/usbmuxd")));
        assert!(matches!(muxer.connect(1, 0), Err(Error::InvalidArg(_))));
    }

    #[test]
    fn read_buid() {
        let (muxer, _dir, daemon) = fake_daemon(vec![handler(|req| {
            assert_eq!(req.string("MessageType"), Some("ReadBUID"));
            (Request::new().with("BUID", "BUID-1").into_dict(), Vec::new())
        })]);
        assert_eq!(muxer.read_buid().unwrap(), "BUID-1");
        daemon.join().unwrap();
    }

    #[test]
    fn address_parsing() {
        assert_eq!(
            MuxAddress::parse("UNIX:/tmp/mux"),
            MuxAddress::Unix(PathBuf::from("/tmp/mux"))
        );
        assert_eq!(
            MuxAddress::parse("127.0.0.1:27015"),
            MuxAddress::Tcp("127.0.0.1:27015".into())
        );
    }
}
