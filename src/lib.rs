//! plugbay - Serve a passive backend over a local plugin channel
//!
//! A plugin process is handed an already-connected socket descriptor by its
//! supervisor and is expected to answer framed JSON requests on it, one at
//! a time, until the peer ends the session. This crate is the runner side
//! of that contract: it adopts the descriptor, constructs the backend,
//! dispatches each request to an explicitly registered operation, and sees
//! the session through graceful shutdown, peer disconnect, and faults.
//!
//! # Example
//!
//! ```no_run
//! use plugbay::{Backend, DomainError, OpTable};
//! use std::process::ExitCode;
//!
//! struct Sim {
//!     started: bool,
//! }
//!
//! impl Backend for Sim {
//!     fn create() -> anyhow::Result<Self> {
//!         Ok(Sim { started: false })
//!     }
//!
//!     fn operations(ops: &mut OpTable<Self>) {
//!         ops.register("startup", |sim: &mut Sim, (): ()| {
//!             sim.started = true;
//!             Ok(())
//!         });
//!         ops.register("shutdown", |sim: &mut Sim, (): ()| {
//!             sim.started = false;
//!             Ok(())
//!         });
//!     }
//!
//!     fn shutdown(&mut self) -> Result<(), DomainError> {
//!         self.started = false;
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> ExitCode {
//!     let args: Vec<String> = std::env::args().collect();
//!     plugbay::serve::<Sim>(&args).into()
//! }
//! ```

pub mod backend;
pub mod diag;
pub mod dispatch;
pub mod message;
pub mod runner;
pub mod transport;


pub use backend::{Backend, SHUTDOWN_METHOD, STARTUP_METHOD};
pub use diag::{DiagnosticsSink, LogSink, MemorySink};
pub use dispatch::{DomainError, OpError, OpTable};
pub use message::{codes, ErrorBody, Request, Response};
pub use runner::{
    serve, serve_with, ConstructionError, ExitStatus, Lifecycle, RunOutcome, Runner,
    StandaloneEntry,
};
pub use transport::{Channel, FramedChannel, TransportError};
