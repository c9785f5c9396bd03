//! Command submission and the status loop.
//!
//! A command is one plist message; the device answers with a stream of
//! status messages ending in either `Status = Complete` or an `Error` key.
//! Only one command runs per client at a time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use plist::{Dictionary, Value};
use tracing::{debug, trace};

use super::InstProxyError;
use super::options::ClientOptions;
use super::status::Status;
use crate::session::ServiceSession;

/// A command ready to be submitted.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    /// Value of the `Command` key.
    name: &'static str,
    /// Full message.
    dict: Dictionary,
}

impl Command {
    /// Command `name` with `options` as its `ClientOptions`.
    fn new(name: &'static str, options: &ClientOptions) -> Self {
        let mut dict = Dictionary::new();
        dict.insert("Command".into(), name.into());
        if !options.is_empty() {
            dict.insert(
                "ClientOptions".into(),
                Value::Dictionary(options.as_dict().clone()),
            );
        }
        Self { name, dict }
    }

    /// Adds a top-level argument.
    fn arg(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.dict.insert(key.to_owned(), value.into());
        self
    }

    /// Lists installed apps.
    pub fn browse(options: &ClientOptions) -> Self {
        Self::new("Browse", options)
    }

    /// Looks up apps; restrict with [`ClientOptions::bundle_ids`].
    pub fn lookup(options: &ClientOptions) -> Self {
        Self::new("Lookup", options)
    }

    /// Installs the package at `package_path` (a path on the device).
    pub fn install(package_path: &str, options: &ClientOptions) -> Self {
        Self::new("Install", options).arg("PackagePath", package_path)
    }

    /// Upgrades an app from the package at `package_path`.
    pub fn upgrade(package_path: &str, options: &ClientOptions) -> Self {
        Self::new("Upgrade", options).arg("PackagePath", package_path)
    }

    /// Removes an app.
    pub fn uninstall(bundle_id: &str, options: &ClientOptions) -> Self {
        Self::new("Uninstall", options).arg("ApplicationIdentifier", bundle_id)
    }

    /// Lists archived apps.
    pub fn lookup_archives(options: &ClientOptions) -> Self {
        Self::new("LookupArchives", options)
    }

    /// Archives an app.
    pub fn archive(bundle_id: &str, options: &ClientOptions) -> Self {
        Self::new("Archive", options).arg("ApplicationIdentifier", bundle_id)
    }

    /// Restores an archived app.
    pub fn restore(bundle_id: &str, options: &ClientOptions) -> Self {
        Self::new("Restore", options).arg("ApplicationIdentifier", bundle_id)
    }

    /// Deletes an app archive.
    pub fn remove_archive(bundle_id: &str, options: &ClientOptions) -> Self {
        Self::new("RemoveArchive", options).arg("ApplicationIdentifier", bundle_id)
    }

    /// Checks device capabilities.
    pub fn check_capabilities_match(capabilities: &[&str], options: &ClientOptions) -> Self {
        Self::new("CheckCapabilitiesMatch", options).arg(
            "Capabilities",
            mobdev_proto::message::string_array(capabilities.iter().copied()),
        )
    }

    /// Value of the `Command` key.
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Borrows the message.
    pub const fn as_dict(&self) -> &Dictionary {
        &self.dict
    }
}

/// State shared between the client and its background worker.
#[derive(Debug)]
pub(super) struct Shared {
    /// Session carrying commands and statuses.
    pub(super) session: Mutex<ServiceSession>,
    /// Set while a command is in flight.
    busy: AtomicBool,
    /// Set by `close` to stop the status loop.
    pub(super) cancel: AtomicBool,
}

impl Shared {
    /// Wraps a session.
    pub(super) const fn new(session: ServiceSession) -> Self {
        Self {
            session: Mutex::new(session),
            busy: AtomicBool::new(false),
            cancel: AtomicBool::new(false),
        }
    }

    /// Locks the session.
    pub(super) fn session(&self) -> MutexGuard<'_, ServiceSession> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether a command is in flight.
    pub(super) fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Holds the busy flag; released on drop.
#[derive(Debug)]
pub(super) struct BusyGuard(Arc<Shared>);

impl BusyGuard {
    /// Marks the client busy, failing fast if it already is.
    pub(super) fn acquire(shared: &Arc<Shared>) -> Result<Self, InstProxyError> {
        shared
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| InstProxyError::OpInProgress)?;
        Ok(Self(Arc::clone(shared)))
    }

    /// Shared state the guard protects.
    pub(super) fn shared(&self) -> &Shared {
        &self.0
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.busy.store(false, Ordering::Release);
    }
}

/// Sends `command` and feeds every status to `on_status` until a terminal one.
pub(super) fn run(
    shared: &Shared,
    command: &Command,
    on_status: &mut dyn FnMut(&Status),
) -> Result<(), InstProxyError> {
    let mut session = shared.session();
    let poll = session.options().poll_interval;
    let deadline = session
        .options()
        .command_timeout
        .map(|limit| Instant::now() + limit);

    debug!(command = command.name, "submitting command");
    session.send_plist(&Value::Dictionary(command.dict.clone()))?;

    loop {
        if shared.cancel.load(Ordering::Acquire) {
            return Err(InstProxyError::ConnFailed(crate::Error::Closed));
        }
        let dict = match session.receive_plist(Some(poll)) {
            Ok(dict) => dict,
            Err(crate::Error::Timeout) => {
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    return Err(InstProxyError::ReceiveTimeout);
                }
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        let status = Status::new(command.name, dict);
        trace!(command = command.name, status = ?status.name(), percent = status.percent(), "status");
        if shared.cancel.load(Ordering::Acquire) {
            return Err(InstProxyError::ConnFailed(crate::Error::Closed));
        }
        on_status(&status);

        if let Some(err) = status.error() {
            debug!(command = command.name, error = %err, "command failed");
            return Err(InstProxyError::Device(err));
        }
        if status.is_complete() {
            debug!(command = command.name, "command complete");
            return Ok(());
        }
    }
}
