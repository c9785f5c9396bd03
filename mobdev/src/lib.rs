//! Protocol clients for locked-down iOS device services.
//!
//! `mobdev` finds devices through the usbmuxd multiplexer, opens the
//! lockdown service broker, and turns each started service into a typed
//! client: file access over AFC, app management through the installation
//! proxy, container access through house arrest, the syslog and file
//! relays, SpringBoard services and screenshots.
//!
//! # Quick start
//!
//! ```no_run
//! use mobdev::afc::AfcClient;
//! use mobdev::{Device, DeviceService, LookupOptions, ServiceOptions};
//!
//! let device = Device::lookup(None, LookupOptions::default())?;
//! let afc = AfcClient::connect(&device, &ServiceOptions::new())?;
//! for name in afc.read_directory("/")? {
//!     println!("{name}");
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! # Logging
//!
//! Everything is traced through [`tracing`]; install a subscriber to see
//! it. [`set_debug_level`] above zero also traces every plist payload and
//! AFC packet header.

pub mod afc;
mod debug;
mod device;
mod error;
pub mod events;
pub mod file_relay;
pub mod house_arrest;
pub mod instproxy;
pub mod lockdown;
mod pair_record;
pub mod screenshot;
mod session;
pub mod springboard;
pub mod syslog_relay;
mod transport;
mod usbmux;

pub use debug::{debug_level, set_debug_level};
pub use device::{Connector, Device, LookupOptions};
pub use error::{Error, Result};
pub use events::{DeviceEvent, EventKind};
pub use lockdown::{LockdownClient, ServiceDescriptor, ServiceResolver};
pub use pair_record::{ENV_LOCKDOWN_DIR, PairRecord};
pub use session::{
    DEFAULT_LABEL, DeviceService, ServiceOptions, ServiceSession, StartServiceError,
};
pub use transport::{Closer, Connection, Socket, TlsIdentity};
pub use usbmux::{ConnectionType, DeviceInfo, ENV_SOCKET_ADDRESS, MuxAddress, Muxer};
