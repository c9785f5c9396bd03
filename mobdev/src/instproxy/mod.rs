//! Installation proxy: install, upgrade, browse and archive apps.
//!
//! Every command either blocks the caller until its terminal status
//! ([`InstallationProxy::execute`] and the typed helpers) or runs on a
//! single background thread that reports each status to a callback
//! ([`InstallationProxy::submit`]).

mod engine;
mod error;
mod options;
mod status;

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use mobdev_proto::DictExt;
use plist::{Dictionary, Value};
use tracing::debug;

pub use self::engine::Command;
pub use self::error::{InstProxyCode, InstProxyError, StatusError};
pub use self::options::{ApplicationType, ClientOptions};
pub use self::status::{CurrentList, Status};

use self::engine::{BusyGuard, Shared, run};
use crate::session::{DeviceService, ServiceSession};
use crate::transport::Closer;

/// Result of a command running in the background.
type Worker = JoinHandle<Result<(), InstProxyError>>;

/// Installation proxy client.
#[derive(Debug)]
pub struct InstallationProxy {
    /// Session and flags shared with the worker.
    shared: Arc<Shared>,
    /// Unblocks a command stuck in a receive.
    closer: Mutex<Option<Closer>>,
    /// Background command, if one was submitted.
    worker: Mutex<Option<Worker>>,
}

impl DeviceService for InstallationProxy {
    const SERVICE_NAME: &'static str = "com.apple.mobile.installation_proxy";
    type Error = InstProxyError;

    fn from_session(session: ServiceSession) -> Result<Self, InstProxyError> {
        Ok(Self::new(session))
    }
}

impl InstallationProxy {
    /// Wraps an established session.
    pub fn new(mut session: ServiceSession) -> Self {
        let closer = session.closer().ok();
        Self {
            shared: Arc::new(Shared::new(session)),
            closer: Mutex::new(closer),
            worker: Mutex::new(None),
        }
    }

    /// Whether a command is in flight.
    pub fn is_busy(&self) -> bool {
        self.shared.is_busy()
    }

    /// Runs `command` on the calling thread, passing each status to `on_status`.
    pub fn execute(
        &self,
        command: &Command,
        mut on_status: impl FnMut(&Status),
    ) -> Result<(), InstProxyError> {
        let guard = BusyGuard::acquire(&self.shared)?;
        run(guard.shared(), command, &mut on_status)
    }

    /// Runs `command` on a background thread.
    ///
    /// `on_status` sees every status in receipt order, the terminal one
    /// included. A second submission while this one runs fails with
    /// [`InstProxyError::OpInProgress`]. Collect the outcome with
    /// [`wait`](Self::wait).
    pub fn submit(
        &self,
        command: Command,
        mut on_status: impl FnMut(&Status) + Send + 'static,
    ) -> Result<(), InstProxyError> {
        let guard = BusyGuard::acquire(&self.shared)?;
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(done) = worker.take() {
            match done.join() {
                Ok(Err(e)) => debug!(error = %e, "unclaimed background command failed"),
                Ok(Ok(())) => {}
                Err(_) => debug!("background command panicked"),
            }
        }
        let spawned = thread::Builder::new()
            .name(format!("instproxy-{}", command.name()))
            .spawn(move || {
                let result = run(guard.shared(), &command, &mut on_status);
                drop(guard);
                result
            })
            .map_err(|e| InstProxyError::ConnFailed(e.into()))?;
        *worker = Some(spawned);
        Ok(())
    }

    /// Waits for the background command and returns its outcome.
    ///
    /// Returns `Ok` when nothing was submitted.
    pub fn wait(&self) -> Result<(), InstProxyError> {
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match handle {
            Some(handle) => handle
                .join()
                .unwrap_or(Err(InstProxyError::ConnFailed(crate::Error::Closed))),
            None => Ok(()),
        }
    }

    /// Runs `command` and keeps only the terminal status.
    fn execute_collect(&self, command: &Command) -> Result<Status, InstProxyError> {
        let mut last = None;
        self.execute(command, |status| last = Some(status.clone()))?;
        last.ok_or(InstProxyError::Plist("command ended without a status".into()))
    }

    /// Installed apps, one dictionary per app.
    pub fn browse(&self, options: &ClientOptions) -> Result<Vec<Dictionary>, InstProxyError> {
        let mut apps = Vec::new();
        self.execute(&Command::browse(options), |status| {
            if let Some(batch) = status.current_list() {
                apps.extend(batch.list.iter().filter_map(Value::as_dictionary).cloned());
            }
        })?;
        Ok(apps)
    }

    /// Apps keyed by bundle identifier.
    pub fn lookup(
        &self,
        bundle_ids: &[&str],
        options: &ClientOptions,
    ) -> Result<Dictionary, InstProxyError> {
        let options = if bundle_ids.is_empty() {
            options.clone()
        } else {
            options.clone().bundle_ids(bundle_ids.iter().copied())
        };
        self.lookup_result(&Command::lookup(&options))
    }

    /// Archived apps keyed by bundle identifier.
    pub fn lookup_archives(&self, options: &ClientOptions) -> Result<Dictionary, InstProxyError> {
        self.lookup_result(&Command::lookup_archives(options))
    }

    /// Runs a lookup-style command and extracts `LookupResult`.
    fn lookup_result(&self, command: &Command) -> Result<Dictionary, InstProxyError> {
        let mut result = None;
        self.execute(command, |status| {
            if let Some(found) = status.as_dict().dict("LookupResult") {
                result = Some(found.clone());
            }
        })?;
        result.ok_or(InstProxyError::MissingAttribute("LookupResult"))
    }

    /// Installs a package already copied to the device.
    pub fn install(&self, package_path: &str, options: &ClientOptions) -> Result<(), InstProxyError> {
        check_arg(package_path)?;
        self.execute_collect(&Command::install(package_path, options))
            .map(drop)
    }

    /// Upgrades an app from a package already copied to the device.
    pub fn upgrade(&self, package_path: &str, options: &ClientOptions) -> Result<(), InstProxyError> {
        check_arg(package_path)?;
        self.execute_collect(&Command::upgrade(package_path, options))
            .map(drop)
    }

    /// Removes an app.
    pub fn uninstall(&self, bundle_id: &str, options: &ClientOptions) -> Result<(), InstProxyError> {
        check_arg(bundle_id)?;
        self.execute_collect(&Command::uninstall(bundle_id, options))
            .map(drop)
    }

    /// Archives an app.
    pub fn archive(&self, bundle_id: &str, options: &ClientOptions) -> Result<(), InstProxyError> {
        check_arg(bundle_id)?;
        self.execute_collect(&Command::archive(bundle_id, options))
            .map(drop)
    }

    /// Restores an archived app.
    pub fn restore(&self, bundle_id: &str, options: &ClientOptions) -> Result<(), InstProxyError> {
        check_arg(bundle_id)?;
        self.execute_collect(&Command::restore(bundle_id, options))
            .map(drop)
    }

    /// Deletes an app archive.
    pub fn remove_archive(
        &self,
        bundle_id: &str,
        options: &ClientOptions,
    ) -> Result<(), InstProxyError> {
        check_arg(bundle_id)?;
        self.execute_collect(&Command::remove_archive(bundle_id, options))
            .map(drop)
    }

    /// Checks which of `capabilities` the device has.
    pub fn check_capabilities_match(
        &self,
        capabilities: &[&str],
        options: &ClientOptions,
    ) -> Result<Value, InstProxyError> {
        if capabilities.is_empty() {
            return Err(InstProxyError::InvalidArg("no capabilities"));
        }
        let status =
            self.execute_collect(&Command::check_capabilities_match(capabilities, options))?;
        status
            .as_dict()
            .get("LookupResult")
            .cloned()
            .ok_or(InstProxyError::MissingAttribute("LookupResult"))
    }

    /// Path of an app's executable on the device.
    pub fn path_for_bundle_id(&self, bundle_id: &str) -> Result<String, InstProxyError> {
        check_arg(bundle_id)?;
        let options = ClientOptions::new().return_attributes([
            "CFBundleIdentifier",
            "CFBundleExecutable",
            "Path",
        ]);
        let apps = self.lookup(&[bundle_id], &options)?;
        let app = apps
            .dict(bundle_id)
            .ok_or(InstProxyError::MissingAttribute("app entry"))?;
        let path = app
            .string("Path")
            .ok_or(InstProxyError::MissingAttribute("Path"))?;
        let exe = app
            .string("CFBundleExecutable")
            .ok_or(InstProxyError::MissingAttribute("CFBundleExecutable"))?;
        Ok(format!("{path}/{exe}"))
    }

    /// Stops any background command and closes the session. Safe to call repeatedly.
    ///
    /// Must not be called from a status callback.
    pub fn close(&self) -> Result<(), InstProxyError> {
        self.shared.cancel.store(true, Ordering::Release);
        let closer = self.closer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(socket) = closer.as_ref() {
            socket.close();
        }
        drop(closer);
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = worker {
            match handle.join() {
                Ok(Err(e)) => debug!(error = %e, "background command ended by close"),
                Ok(Ok(())) => {}
                Err(_) => debug!("background command panicked"),
            }
        }
        Ok(self.shared.session().close()?)
    }
}

impl Drop for InstallationProxy {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            debug!(error = %e, "closing installation proxy on drop");
        }
    }
}

/// Rejects empty identifiers and paths.
fn check_arg(value: &str) -> Result<(), InstProxyError> {
    if value.is_empty() {
        return Err(InstProxyError::InvalidArg("empty argument"));
    }
    Ok(())
}
