//! Process-wide debug level.
//!
//! At level 0 the library emits only its regular `tracing` events. Any
//! higher level additionally traces every plist payload and AFC packet
//! header crossing a connection.

use std::sync::atomic::{AtomicU8, Ordering};

/// Current level; shared by all connections in the process.
static LEVEL: AtomicU8 = AtomicU8::new(0);

/// Sets the process-wide debug level.
pub fn set_debug_level(level: u8) {
    LEVEL.store(level, Ordering::Relaxed);
}

/// Returns the process-wide debug level.
pub fn debug_level() -> u8 {
    LEVEL.load(Ordering::Relaxed)
}

/// Whether payload tracing is on.
pub(crate) fn payloads() -> bool {
    debug_level() > 0
}
