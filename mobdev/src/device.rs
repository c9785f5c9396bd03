//! Device handles: resolved identity plus the means to open connections.

use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use tracing::debug;

use crate::pair_record::PairRecord;
use crate::transport::Connection;
use crate::usbmux::{ConnectionType, DeviceInfo, Muxer};
use crate::{Error, Result};

/// Bound on direct TCP connects to network devices.
const NETWORK_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Opens connections to ports on one device.
///
/// [`Device`] implements this through the multiplexer; service sessions
/// only depend on the trait, so alternative transports and test doubles
/// can stand in.
pub trait Connector {
    /// UDID of the device.
    fn udid(&self) -> &str;

    /// Opens a connection to `port`.
    fn connect(&self, port: u16) -> Result<Connection>;
}

/// Which attachments [`Device::lookup`] considers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[non_exhaustive]
pub enum LookupOptions {
    /// USB-attached devices only.
    #[default]
    Usb,
    /// Network-attached devices only.
    Network,
    /// Either; USB wins when a device is attached both ways.
    Any,
    /// Either; network wins when a device is attached both ways.
    PreferNetwork,
}

impl LookupOptions {
    const fn accepts(self, kind: ConnectionType) -> bool {
        match self {
            Self::Usb => matches!(kind, ConnectionType::Usb),
            Self::Network => matches!(kind, ConnectionType::Network),
            Self::Any | Self::PreferNetwork => true,
        }
    }

    const fn preferred(self) -> ConnectionType {
        match self {
            Self::Network | Self::PreferNetwork => ConnectionType::Network,
            Self::Usb | Self::Any => ConnectionType::Usb,
        }
    }
}

/// A resolved device.
#[derive(Debug, Clone)]
pub struct Device {
    info: DeviceInfo,
    muxer: Muxer,
}

impl Device {
    /// Resolves the USB device `udid` through the default multiplexer.
    pub fn new(udid: &str) -> Result<Self> {
        Self::lookup(Some(udid), LookupOptions::default())
    }

    /// Resolves `udid`, or the first matching device when `None`.
    pub fn lookup(udid: Option<&str>, options: LookupOptions) -> Result<Self> {
        Self::lookup_with(Muxer::new(), udid, options)
    }

    /// Like [`Device::lookup`] through a specific multiplexer.
    pub fn lookup_with(muxer: Muxer, udid: Option<&str>, options: LookupOptions) -> Result<Self> {
        if udid.is_some_and(str::is_empty) {
            return Err(Error::InvalidArg("empty UDID"));
        }
        let candidates: Vec<DeviceInfo> = muxer
            .list_devices()?
            .into_iter()
            .filter(|d| options.accepts(d.connection_type))
            .filter(|d| udid.is_none_or(|u| d.udid == u))
            .collect();

        let chosen = match udid {
            Some(_) => candidates
                .iter()
                .find(|d| d.connection_type == options.preferred())
                .or_else(|| candidates.first()),
            None => candidates.first(),
        }
        .cloned()
        .ok_or_else(|| Error::NoDevice(udid.unwrap_or("any").to_owned()))?;

        debug!(udid = %chosen.udid, kind = ?chosen.connection_type, "device resolved");
        Ok(Self::from_info(chosen, muxer))
    }

    /// Wraps an already-listed device.
    pub const fn from_info(info: DeviceInfo, muxer: Muxer) -> Self {
        Self { info, muxer }
    }

    /// Lists attached devices through the default multiplexer.
    pub fn list() -> Result<Vec<DeviceInfo>> {
        Muxer::new().list_devices()
    }

    /// Device identity as reported by the multiplexer.
    pub const fn info(&self) -> &DeviceInfo {
        &self.info
    }

    /// How the device is attached.
    pub const fn connection_type(&self) -> ConnectionType {
        self.info.connection_type
    }

    /// Multiplexer-assigned numeric handle.
    pub const fn handle(&self) -> u32 {
        self.info.mux_id
    }

    /// Pair record from the multiplexer, falling back to disk.
    pub fn pair_record(&self) -> Result<PairRecord> {
        self.muxer.read_pair_record(&self.info.udid).or_else(|e| {
            debug!(udid = %self.info.udid, error = %e, "pair record not served by multiplexer");
            PairRecord::find(&self.info.udid)
        })
    }

    /// System BUID of the host, as the multiplexer reports it.
    pub fn system_buid(&self) -> Result<String> {
        self.muxer.read_buid()
    }
}

impl Connector for Device {
    fn udid(&self) -> &str {
        &self.info.udid
    }

    fn connect(&self, port: u16) -> Result<Connection> {
        if port == 0 {
            return Err(Error::InvalidArg("port must be non-zero"));
        }
        let conn = match (self.info.connection_type, self.info.network_address) {
            (ConnectionType::Network, Some(ip)) => {
                let stream =
                    TcpStream::connect_timeout(&SocketAddr::new(ip, port), NETWORK_CONNECT_TIMEOUT)?;
                stream.set_nodelay(true)?;
                Connection::from_socket(self.info.udid.as_str(), port, Box::new(stream))
            }
            _ => self
                .muxer
                .connect(self.info.mux_id, port)?
                .retarget(&self.info.udid, port),
        };
        debug!(udid = %self.info.udid, port, "connected");
        Ok(conn)
    }
}

#[cfg(all(test, unix))]
#[allow(clippy::unwrap_used)]
mod tests {
    use mobdev_proto::message::{DictExt, Request};

    use super::*;
    use crate::usbmux::tests::{attached, fake_daemon, handler, result};

    fn listing(entries: Vec<plist::Value>) -> crate::usbmux::tests::Handler {
        handler(move |req| {
            assert_eq!(req.string("MessageType"), Some("ListDevices"));
            (
                Request::new().with("DeviceList", entries.clone()).into_dict(),
                Vec::new(),
            )
        })
    }

    #[test]
    fn lookup_prefers_requested_attachment() {
        let entries = vec![attached("AAA", 1, "USB"), attached("AAA", 2, "Network")];
        let (muxer, _dir, daemon) = fake_daemon(vec![
            listing(entries.clone()),
            listing(entries),
        ]);

        let usb = Device::lookup_with(muxer.clone(), Some("AAA"), LookupOptions::Any).unwrap();
        assert_eq!(usb.handle(), 1);
        let net =
            Device::lookup_with(muxer, Some("AAA"), LookupOptions::PreferNetwork).unwrap();
        assert_eq!(net.handle(), 2);
        daemon.join().unwrap();
    }

    #[test]
    fn lookup_filters_by_attachment() {
        let (muxer, _dir, daemon) =
            fake_daemon(vec![listing(vec![attached("NET", 4, "Network")])]);
        let err = Device::lookup_with(muxer, None, LookupOptions::Usb).unwrap_err();
        assert!(matches!(err, Error::NoDevice(_)));
        daemon.join().unwrap();
    }

    #[test]
    fn connect_goes_through_multiplexer() {
        let (muxer, _dir, daemon) = fake_daemon(vec![
            listing(vec![attached("AAA", 5, "USB")]),
            handler(|req| {
                assert_eq!(req.string("MessageType"), Some("Connect"));
                assert_eq!(req.uint("DeviceID"), Some(5));
                (result(0), Vec::new())
            }),
        ]);
        let device = Device::lookup_with(muxer, Some("AAA"), LookupOptions::Usb).unwrap();
        let mut conn = device.connect(62078).unwrap();
        assert_eq!(conn.udid(), "AAA");
        assert_eq!(conn.port(), 62078);
        conn.disconnect().unwrap();
        daemon.join().unwrap();
        assert!(matches!(device.connect(0), Err(Error::InvalidArg(_))));
    }
}
