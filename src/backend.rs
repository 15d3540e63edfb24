//! Backend contract
//!
//! A backend is the passive half of a plugin process: a bundle of named
//! operations plus the state they act on. The runner constructs it, owns it
//! exclusively for the process lifetime, and drives it from the dispatch
//! loop.

use crate::dispatch::{DomainError, OpTable};

/// Reserved method name that arms the cleanup obligation for the session.
pub const STARTUP_METHOD: &str = "startup";

/// Reserved method name that disarms the obligation and ends the session.
pub const SHUTDOWN_METHOD: &str = "shutdown";

/// A backend served by the runner.
///
/// The reserved methods [`STARTUP_METHOD`] and [`SHUTDOWN_METHOD`] are
/// ordinary entries in the operation table; a backend that wants a working
/// session must register both. The wire `shutdown` operation typically
/// delegates to [`Backend::shutdown`].
pub trait Backend: Sized + 'static {
    /// Construct the backend. Runs exactly once per process, before any
    /// request is read. The failure detail is relayed to the peer in the
    /// construction-error notification.
    fn create() -> anyhow::Result<Self>;

    /// Contribute the named operations this backend exposes.
    fn operations(ops: &mut OpTable<Self>);

    /// Release whatever `startup` acquired.
    ///
    /// Called directly, bypassing the channel, when a session with an armed
    /// startup obligation ends without a graceful `shutdown`. Must be safe
    /// to call on its own, independent of the wire operation of the same
    /// name.
    fn shutdown(&mut self) -> Result<(), DomainError>;
}
