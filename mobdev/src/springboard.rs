//! SpringBoard services: icons, wallpaper and interface orientation.

use mobdev_proto::{DictExt, Request};
use plist::{Dictionary, Value};

use crate::session::{DeviceService, ServiceSession, StartServiceError};

/// SpringBoard services result codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
#[repr(i32)]
pub enum SpringboardCode {
    /// Bad argument rejected before sending.
    InvalidArg = -1,
    /// Message could not be encoded or decoded.
    PlistError = -2,
    /// Connection to the service failed or was closed.
    ConnFailed = -3,
    /// Device error with no known mapping.
    UnknownError = -256,
}

/// Errors from SpringBoard services.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum SpringboardError {
    /// A caller-supplied argument was rejected locally.
    #[error("invalid argument: {0}")]
    InvalidArg(&'static str),

    /// A reply lacked the expected field or could not be decoded.
    #[error("malformed reply: {0}")]
    Plist(String),

    /// The connection failed.
    #[error("connection failed")]
    ConnFailed(#[source] crate::Error),

    /// The service could not be started.
    #[error(transparent)]
    Start(#[from] StartServiceError),
}

impl SpringboardError {
    /// Numeric code in the SpringBoard services taxonomy.
    pub const fn code(&self) -> SpringboardCode {
        match self {
            Self::InvalidArg(_) => SpringboardCode::InvalidArg,
            Self::Plist(_) => SpringboardCode::PlistError,
            Self::ConnFailed(_) | Self::Start(_) => SpringboardCode::ConnFailed,
        }
    }
}

impl From<crate::Error> for SpringboardError {
    fn from(err: crate::Error) -> Self {
        match err {
            crate::Error::Malformed(msg) => Self::Plist(msg),
            crate::Error::InvalidArg(msg) => Self::InvalidArg(msg),
            other => Self::ConnFailed(other),
        }
    }
}

/// Orientation of the home screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum InterfaceOrientation {
    /// Not reported or out of range.
    Unknown,
    /// Home button at the bottom.
    Portrait,
    /// Home button at the top.
    PortraitUpsideDown,
    /// Home button on the left.
    LandscapeRight,
    /// Home button on the right.
    LandscapeLeft,
}

impl InterfaceOrientation {
    /// Maps the wire value; out-of-range values are `Unknown`.
    pub const fn from_code(code: u64) -> Self {
        match code {
            1 => Self::Portrait,
            2 => Self::PortraitUpsideDown,
            3 => Self::LandscapeRight,
            4 => Self::LandscapeLeft,
            _ => Self::Unknown,
        }
    }
}

/// SpringBoard services client.
#[derive(Debug)]
pub struct Springboard {
    /// Underlying session.
    session: ServiceSession,
}

impl DeviceService for Springboard {
    const SERVICE_NAME: &'static str = "com.apple.springboardservices";
    type Error = SpringboardError;

    fn from_session(session: ServiceSession) -> Result<Self, SpringboardError> {
        Ok(Self { session })
    }
}

impl Springboard {
    /// Sends one command and reads the reply.
    fn call(&mut self, request: Request) -> Result<Value, SpringboardError> {
        self.session.send_binary_plist(&request.into_value())?;
        let timeout = self.session.options().receive_timeout();
        Ok(self.session.receive_plist_value(timeout)?)
    }

    /// Calls a command whose reply is a dictionary.
    fn call_dict(&mut self, request: Request) -> Result<Dictionary, SpringboardError> {
        match self.call(request)? {
            Value::Dictionary(dict) => Ok(dict),
            _ => Err(SpringboardError::Plist("expected a dictionary".into())),
        }
    }

    /// PNG data of an app icon.
    pub fn icon_png(&mut self, bundle_id: &str) -> Result<Vec<u8>, SpringboardError> {
        if bundle_id.is_empty() {
            return Err(SpringboardError::InvalidArg("empty bundle id"));
        }
        let reply = self.call_dict(
            Request::new()
                .with("command", "getIconPNGData")
                .with("bundleId", bundle_id),
        )?;
        png(&reply)
    }

    /// PNG data of the home screen wallpaper.
    pub fn home_screen_wallpaper_png(&mut self) -> Result<Vec<u8>, SpringboardError> {
        let reply =
            self.call_dict(Request::new().with("command", "getHomeScreenWallpaperPNGData"))?;
        png(&reply)
    }

    /// Current interface orientation.
    pub fn interface_orientation(&mut self) -> Result<InterfaceOrientation, SpringboardError> {
        let reply = self.call_dict(Request::new().with("command", "getInterfaceOrientation"))?;
        let code = reply
            .uint("interfaceOrientation")
            .ok_or_else(|| SpringboardError::Plist("missing interfaceOrientation".into()))?;
        Ok(InterfaceOrientation::from_code(code))
    }

    /// Home screen layout.
    pub fn icon_state(&mut self, format_version: Option<&str>) -> Result<Value, SpringboardError> {
        self.call(
            Request::new()
                .with("command", "getIconState")
                .with_opt("formatVersion", format_version),
        )
    }

    /// Replaces the home screen layout. The device sends no reply.
    pub fn set_icon_state(&mut self, state: Value) -> Result<(), SpringboardError> {
        let request = Request::new()
            .with("command", "setIconState")
            .with("iconState", state);
        Ok(self.session.send_binary_plist(&request.into_value())?)
    }

    /// Closes the client.
    pub fn close(&mut self) -> Result<(), SpringboardError> {
        Ok(self.session.close()?)
    }
}

/// Extracts `pngData`.
fn png(reply: &Dictionary) -> Result<Vec<u8>, SpringboardError> {
    reply
        .data("pngData")
        .map(<[u8]>::to_vec)
        .ok_or_else(|| SpringboardError::Plist("missing pngData".into()))
}

#[cfg(all(test, unix))]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::thread;

    use mobdev_proto::{Format, decode_dict, encode};

    use super::*;
    use crate::session::tests::session_pair;

    #[test]
    fn icon_orientation_and_wallpaper() {
        let (session, mut peer) = session_pair(Springboard::SERVICE_NAME);
        let mut sb = Springboard::from_session(session).unwrap();
        let device = thread::spawn(move || {
            let mut seen = Vec::new();
            for reply in [
                Request::new().with_data("pngData", b"\x89PNG icon".to_vec()),
                Request::new().with("interfaceOrientation", 3u64),
                Request::new().with_data("pngData", b"\x89PNG wall".to_vec()),
                Request::new(),
            ] {
                seen.push(decode_dict(&mut peer).unwrap());
                encode(&mut peer, &reply.into_value(), Format::Binary).unwrap();
            }
            seen
        });

        assert_eq!(sb.icon_png("com.apple.Maps").unwrap(), b"\x89PNG icon");
        assert_eq!(
            sb.interface_orientation().unwrap(),
            InterfaceOrientation::LandscapeRight
        );
        assert_eq!(sb.home_screen_wallpaper_png().unwrap(), b"\x89PNG wall");
        assert_eq!(sb.icon_png("com.x").unwrap_err().code(), SpringboardCode::PlistError);

        let seen = device.join().unwrap();
        assert_eq!(seen[0].string("command"), Some("getIconPNGData"));
        assert_eq!(seen[0].string("bundleId"), Some("com.apple.Maps"));
        assert_eq!(seen[1].string("command"), Some("getInterfaceOrientation"));
    }

    #[test]
    fn orientation_codes() {
        assert_eq!(InterfaceOrientation::from_code(1), InterfaceOrientation::Portrait);
        assert_eq!(InterfaceOrientation::from_code(9), InterfaceOrientation::Unknown);
    }
}
