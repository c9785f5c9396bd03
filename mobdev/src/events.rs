//! Process-wide device event subscription.
//!
//! At most one subscription is active at a time. [`subscribe`] replaces
//! any existing one (its listener thread is stopped first) and
//! [`unsubscribe`] clears it. The callback runs on the listener thread.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mobdev_proto::message::DictExt;
use plist::Dictionary;
use tracing::{debug, warn};

use crate::transport::Closer;
use crate::usbmux::{ConnectionType, DeviceInfo, Muxer};
use crate::{Error, Result};

/// How often the listener checks for cancellation.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Kind of device event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum EventKind {
    /// A device was attached.
    Add = 1,
    /// A device was detached.
    Remove = 2,
    /// A device completed pairing.
    Paired = 3,
}

/// A device attach, detach or pairing event.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct DeviceEvent {
    /// What happened.
    pub kind: EventKind,
    /// UDID of the device.
    pub udid: String,
    /// How the device is (or was) attached.
    pub connection_type: ConnectionType,
}

/// The active listener.
struct Subscription {
    cancel: Arc<AtomicBool>,
    closer: Closer,
    thread: JoinHandle<()>,
}

impl Subscription {
    fn stop(self) {
        self.cancel.store(true, Ordering::Release);
        self.closer.close();
        if self.thread.join().is_err() {
            warn!("device event listener panicked");
        }
    }
}

static ACTIVE: Mutex<Option<Subscription>> = Mutex::new(None);

/// Subscribes to device events through the default multiplexer.
pub fn subscribe<F>(callback: F) -> Result<()>
where
    F: FnMut(&DeviceEvent) + Send + 'static,
{
    subscribe_with(&Muxer::new(), callback)
}

/// Subscribes to device events through `muxer`, replacing any active subscription.
pub fn subscribe_with<F>(muxer: &Muxer, mut callback: F) -> Result<()>
where
    F: FnMut(&DeviceEvent) + Send + 'static,
{
    let mut active = ACTIVE.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(old) = active.take() {
        debug!("replacing device event subscription");
        old.stop();
    }

    let mut channel = muxer.listen()?;
    let closer = channel.closer()?;
    let cancel = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancel);
    let thread = thread::Builder::new()
        .name("mobdev-events".into())
        .spawn(move || {
            let mut tracker = Tracker::default();
            while !flag.load(Ordering::Acquire) {
                match channel.next_message(Some(POLL_INTERVAL)) {
                    Ok(message) => {
                        if let Some(event) = tracker.event(&message) {
                            callback(&event);
                        }
                    }
                    Err(Error::Timeout) => {}
                    Err(e) => {
                        if !flag.load(Ordering::Acquire) {
                            warn!(error = %e, "device event listener stopped");
                        }
                        break;
                    }
                }
            }
        })?;

    *active = Some(Subscription {
        cancel,
        closer,
        thread,
    });
    debug!("subscribed to device events");
    Ok(())
}

/// Stops the active subscription, if any.
pub fn unsubscribe() -> Result<()> {
    let taken = ACTIVE.lock().unwrap_or_else(PoisonError::into_inner).take();
    if let Some(sub) = taken {
        sub.stop();
        debug!("unsubscribed from device events");
    }
    Ok(())
}

/// Whether a subscription is active.
pub fn is_subscribed() -> bool {
    ACTIVE
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .is_some()
}

/// Maps multiplexer device ids to the devices seen attaching.
///
/// Detach and pairing messages carry only the id.
#[derive(Default)]
struct Tracker {
    known: HashMap<u64, DeviceInfo>,
}

impl Tracker {
    fn event(&mut self, message: &Dictionary) -> Option<DeviceEvent> {
        let id = message.uint("DeviceID")?;
        match message.string("MessageType")? {
            "Attached" => {
                let info = DeviceInfo::from_properties(message.get("Properties")?)
                    .inspect_err(|e| warn!(error = %e, "bad Attached event"))
                    .ok()?;
                let event = DeviceEvent {
                    kind: EventKind::Add,
                    udid: info.udid.clone(),
                    connection_type: info.connection_type,
                };
                self.known.insert(id, info);
                Some(event)
            }
            "Detached" => self.known.remove(&id).map(|info| DeviceEvent {
                kind: EventKind::Remove,
                udid: info.udid,
                connection_type: info.connection_type,
            }),
            "Paired" => self.known.get(&id).map(|info| DeviceEvent {
                kind: EventKind::Paired,
                udid: info.udid.clone(),
                connection_type: info.connection_type,
            }),
            _ => None,
        }
    }
}
