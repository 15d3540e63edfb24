//! The runner
//!
//! Owns construction, the dispatch loop, and lifecycle handling for one
//! plugin process. The loop is synchronous and serves exactly one request
//! at a time; reading the next request blocks until the peer sends one or
//! goes away. Termination is a value ([`RunOutcome`]) handed back to a thin
//! entry point ([`serve_with`]) that maps it to a process exit status; the
//! loop itself never exits the process.

use crate::backend::{Backend, SHUTDOWN_METHOD, STARTUP_METHOD};
use crate::diag::{DiagnosticsSink, LogSink};
use crate::dispatch::{OpError, OpTable};
use crate::message::{codes, sentinel_id, MalformedRequest, Request};
use crate::transport::{Channel, FramedChannel, TransportError};
use serde_json::Value;
use std::any::Any;
use std::os::fd::RawFd;
use std::panic::{self, AssertUnwindSafe};
use std::process::ExitCode;

/// Session lifecycle, advanced by the loop and consulted at teardown.
///
/// `Uninitialized` is the phase before the backend exists; a constructed
/// runner starts at `AwaitingStartup`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Uninitialized,
    AwaitingStartup,
    Active,
    GracefulShutdown,
    ForcedTeardown,
    Terminated,
}

impl Lifecycle {
    /// Whether an armed `startup` is still awaiting its `shutdown`.
    pub fn cleanup_pending(self) -> bool {
        matches!(self, Lifecycle::Active)
    }
}

/// How a completed run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The peer asked for `shutdown`; the loop closed the channel itself.
    Graceful,
    /// The peer went away (or a fault ended the loop) with no cleanup
    /// obligation pending.
    Disconnected,
    /// The loop ended abnormally while a `startup` obligation was pending;
    /// the backend's cleanup ran.
    ForcedCleanup,
    /// The standalone entry point ran instead of the dispatch loop.
    Standalone,
}

/// Process exit statuses of the argument/exit contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Normal,
    /// No channel descriptor and no standalone entry point.
    BadArguments,
    /// Backend construction failed, or forced cleanup ran after an
    /// abnormal loop exit.
    Failure,
}

impl ExitStatus {
    pub fn code(self) -> u8 {
        match self {
            ExitStatus::Normal => 0,
            ExitStatus::BadArguments => 1,
            ExitStatus::Failure => 2,
        }
    }
}

impl From<RunOutcome> for ExitStatus {
    fn from(outcome: RunOutcome) -> Self {
        match outcome {
            RunOutcome::Graceful | RunOutcome::Disconnected | RunOutcome::Standalone => {
                ExitStatus::Normal
            }
            RunOutcome::ForcedCleanup => ExitStatus::Failure,
        }
    }
}

impl From<ExitStatus> for ExitCode {
    fn from(status: ExitStatus) -> Self {
        ExitCode::from(status.code())
    }
}

/// Backend construction failed. The peer was notified over the channel if
/// a notification could still be written.
#[derive(Debug, thiserror::Error)]
#[error("backend failed to initialize: {0}")]
pub struct ConstructionError(pub anyhow::Error);

/// Development entry point used when no channel descriptor is given.
pub type StandaloneEntry = Box<dyn FnOnce() -> anyhow::Result<()>>;

enum LoopEnd {
    Graceful,
    Disconnect,
    Fault,
}

/// Serves one backend over one channel until the session ends.
pub struct Runner<B: Backend, C: Channel> {
    channel: C,
    backend: B,
    ops: OpTable<B>,
    state: Lifecycle,
    last_id: Value,
    diag: Box<dyn DiagnosticsSink + Send>,
}

impl<B: Backend, C: Channel> Runner<B, C> {
    /// Construct the backend and bind it to the channel, reporting through
    /// the default [`LogSink`].
    pub fn new(channel: C) -> Result<Self, ConstructionError> {
        Self::with_sink(channel, Box::new(LogSink))
    }

    /// Construct the backend and bind it to the channel.
    ///
    /// On construction failure the peer gets one courtesy error response
    /// with the sentinel id, since no request exists to correlate with.
    pub fn with_sink(
        mut channel: C,
        diag: Box<dyn DiagnosticsSink + Send>,
    ) -> Result<Self, ConstructionError> {
        let mut ops = OpTable::new();
        B::operations(&mut ops);

        let backend = match B::create() {
            Ok(backend) => backend,
            Err(source) => {
                diag.failure(&format!("backend failed to initialize: {source:#}"));
                let _ = channel.send_error(
                    &sentinel_id(),
                    codes::CONSTRUCTION_ERROR,
                    &format!("Error initializing backend: {source:#}"),
                    None,
                );
                return Err(ConstructionError(source));
            }
        };

        Ok(Self {
            channel,
            backend,
            ops,
            state: Lifecycle::AwaitingStartup,
            last_id: sentinel_id(),
            diag,
        })
    }

    /// Bind an already-constructed backend to the channel.
    ///
    /// For embedding and tests. The runner still takes exclusive ownership
    /// of the backend; only the construction step is skipped.
    pub fn from_parts(channel: C, backend: B, diag: Box<dyn DiagnosticsSink + Send>) -> Self {
        let mut ops = OpTable::new();
        B::operations(&mut ops);
        Self {
            channel,
            backend,
            ops,
            state: Lifecycle::AwaitingStartup,
            last_id: sentinel_id(),
            diag,
        }
    }

    /// Current lifecycle state.
    pub fn lifecycle(&self) -> Lifecycle {
        self.state
    }

    /// Serve requests until the session ends.
    ///
    /// Consumes the runner; the outcome tells the entry point how to exit.
    /// If the loop ends abnormally while a `startup` obligation is armed,
    /// the backend's cleanup runs here, directly, before the outcome is
    /// returned.
    pub fn run(mut self) -> RunOutcome {
        match self.dispatch_loop() {
            LoopEnd::Graceful => {
                self.state = Lifecycle::Terminated;
                RunOutcome::Graceful
            }
            LoopEnd::Disconnect | LoopEnd::Fault => {
                if self.state.cleanup_pending() {
                    self.state = Lifecycle::ForcedTeardown;
                    if let Err(err) = self.backend.shutdown() {
                        self.diag.failure(&format!("forced cleanup failed: {err}"));
                    }
                    self.state = Lifecycle::Terminated;
                    RunOutcome::ForcedCleanup
                } else {
                    self.state = Lifecycle::Terminated;
                    RunOutcome::Disconnected
                }
            }
        }
    }

    fn dispatch_loop(&mut self) -> LoopEnd {
        loop {
            let raw = match self.channel.recv() {
                Ok(value) => value,
                Err(TransportError::Closed) => {
                    self.diag.notice("peer disconnected, ending session");
                    return LoopEnd::Disconnect;
                }
                Err(TransportError::Malformed(detail)) => {
                    self.diag.failure(&format!("unreadable request: {detail}"));
                    let id = self.last_id.clone();
                    if let Err(err) = self.channel.send_error(&id, codes::PARSE_ERROR, &detail, None)
                    {
                        return self.fault(format!("channel write failed: {err}"));
                    }
                    continue;
                }
                Err(err) => return self.fault(format!("channel read failed: {err}")),
            };

            let request = match Request::from_value(raw) {
                Ok(request) => request,
                Err(MalformedRequest { id, detail }) => {
                    self.diag.failure(&format!("malformed request: {detail}"));
                    let id = id.unwrap_or_else(|| self.last_id.clone());
                    if let Err(err) = self.channel.send_error(&id, codes::PARSE_ERROR, &detail, None)
                    {
                        return self.fault(format!("channel write failed: {err}"));
                    }
                    continue;
                }
            };
            self.last_id = request.id.clone();

            // Capability check first; an unknown method is never invoked.
            if !self.ops.supports(&request.method) {
                if let Err(err) = self.channel.send_error(
                    &request.id,
                    codes::NO_SUPPORT,
                    "Unsupported operation",
                    None,
                ) {
                    return self.fault(format!("channel write failed: {err}"));
                }
                continue;
            }

            let invoked = panic::catch_unwind(AssertUnwindSafe(|| {
                self.ops
                    .invoke(&mut self.backend, &request.method, request.params.as_ref())
            }));

            let outcome = match invoked {
                Ok(outcome) => outcome,
                Err(payload) => {
                    return self.fault(format!(
                        "operation {} panicked: {}",
                        request.method,
                        panic_message(payload.as_ref())
                    ));
                }
            };

            match outcome {
                Ok(result) => {
                    if let Err(err) = self.channel.send_success(&request.id, result) {
                        return self.fault(format!("channel write failed: {err}"));
                    }
                    // Obligations are recorded only once the response is on
                    // the wire.
                    if request.method == STARTUP_METHOD {
                        self.state = Lifecycle::Active;
                    }
                    if request.method == SHUTDOWN_METHOD {
                        self.state = Lifecycle::GracefulShutdown;
                        if let Err(err) = self.channel.close() {
                            self.diag.failure(&format!("channel close failed: {err}"));
                        }
                        return LoopEnd::Graceful;
                    }
                }
                Err(OpError::Domain(domain)) => {
                    // Backend-raised errors are protocol traffic, not
                    // diagnostics; forwarded verbatim.
                    if let Err(err) = self.channel.send_error(
                        &request.id,
                        domain.code,
                        &domain.message,
                        domain.data,
                    ) {
                        return self.fault(format!("channel write failed: {err}"));
                    }
                }
                Err(OpError::Params(detail)) => {
                    self.diag.failure(&format!(
                        "parameter mismatch for {}: {detail}",
                        request.method
                    ));
                    if let Err(err) =
                        self.channel
                            .send_error(&request.id, codes::PARSE_ERROR, &detail, None)
                    {
                        return self.fault(format!("channel write failed: {err}"));
                    }
                }
                Err(OpError::Internal(err)) => {
                    return self.fault(format!("operation {} faulted: {err:#}", request.method));
                }
            }
        }
    }

    /// Terminal fault handling: log the full detail, then make one
    /// best-effort attempt to tell the peer. The notification failing must
    /// not mask the original fault, so its result is discarded.
    fn fault(&mut self, detail: String) -> LoopEnd {
        self.diag.failure(&detail);
        let id = self.last_id.clone();
        let _ = self.channel.send_error(
            &id,
            codes::PLUGIN_FAULT,
            "Unhandled fault in backend",
            Some(Value::String(detail)),
        );
        LoopEnd::Fault
    }
}

/// Resolve the channel from the argument vector, construct the backend,
/// and serve until the session ends, reporting through [`LogSink`].
///
/// The accepted argument shape is exactly two tokens with the second
/// parsing as a base-10 channel descriptor. Anything else runs the
/// standalone entry point when one is supplied (the dispatch loop is then
/// a no-op), or prints a usage diagnostic and returns
/// [`ExitStatus::BadArguments`].
///
/// Returns the exit status; the caller performs the actual process exit:
///
/// ```no_run
/// use std::process::ExitCode;
/// # struct MyBackend;
/// # impl plugbay::Backend for MyBackend {
/// #     fn create() -> anyhow::Result<Self> { Ok(MyBackend) }
/// #     fn operations(_ops: &mut plugbay::OpTable<Self>) {}
/// #     fn shutdown(&mut self) -> Result<(), plugbay::DomainError> { Ok(()) }
/// # }
/// fn main() -> ExitCode {
///     let args: Vec<String> = std::env::args().collect();
///     plugbay::serve::<MyBackend>(&args).into()
/// }
/// ```
pub fn serve<B: Backend>(args: &[String]) -> ExitStatus {
    serve_with::<B>(args, None)
}

/// [`serve`] with an optional standalone entry point.
pub fn serve_with<B: Backend>(args: &[String], standalone: Option<StandaloneEntry>) -> ExitStatus {
    match parse_descriptor(args) {
        Some(fd) => {
            let channel = FramedChannel::from_descriptor(fd);
            match Runner::<B, _>::new(channel) {
                Ok(runner) => runner.run().into(),
                Err(_) => ExitStatus::Failure,
            }
        }
        None => match standalone {
            Some(entry) => match entry() {
                Ok(()) => RunOutcome::Standalone.into(),
                Err(err) => {
                    LogSink.failure(&format!("standalone entry failed: {err:#}"));
                    ExitStatus::Failure
                }
            },
            None => {
                let name = args.first().map(String::as_str).unwrap_or("plugin");
                eprintln!("usage: {name} <channel descriptor>");
                ExitStatus::BadArguments
            }
        },
    }
}

fn parse_descriptor(args: &[String]) -> Option<RawFd> {
    if args.len() != 2 {
        return None;
    }
    args[1].parse::<RawFd>().ok()
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("opaque panic payload")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cleanup_is_pending_only_while_active() {
        assert!(Lifecycle::Active.cleanup_pending());
        for state in [
            Lifecycle::Uninitialized,
            Lifecycle::AwaitingStartup,
            Lifecycle::GracefulShutdown,
            Lifecycle::ForcedTeardown,
            Lifecycle::Terminated,
        ] {
            assert!(!state.cleanup_pending(), "{state:?}");
        }
    }

    #[test]
    fn outcomes_map_to_the_exit_contract() {
        assert_eq!(ExitStatus::from(RunOutcome::Graceful), ExitStatus::Normal);
        assert_eq!(
            ExitStatus::from(RunOutcome::Disconnected),
            ExitStatus::Normal
        );
        assert_eq!(
            ExitStatus::from(RunOutcome::Standalone),
            ExitStatus::Normal
        );
        assert_eq!(
            ExitStatus::from(RunOutcome::ForcedCleanup),
            ExitStatus::Failure
        );

        assert_eq!(ExitStatus::Normal.code(), 0);
        assert_eq!(ExitStatus::BadArguments.code(), 1);
        assert_eq!(ExitStatus::Failure.code(), 2);
    }

    #[test]
    fn descriptor_parsing_accepts_only_two_numeric_tokens() {
        let owned = |items: &[&str]| -> Vec<String> {
            items.iter().map(|s| s.to_string()).collect()
        };
        assert_eq!(parse_descriptor(&owned(&["plug", "7"])), Some(7));
        assert_eq!(parse_descriptor(&owned(&["plug"])), None);
        assert_eq!(parse_descriptor(&owned(&["plug", "seven"])), None);
        assert_eq!(parse_descriptor(&owned(&["plug", "7", "8"])), None);
        assert_eq!(parse_descriptor(&owned(&["plug", "7.5"])), None);
    }

    #[test]
    fn panic_payloads_render_as_text() {
        let boxed: Box<dyn Any + Send> = Box::new("static str panic");
        assert_eq!(panic_message(boxed.as_ref()), "static str panic");

        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned panic"));
        assert_eq!(panic_message(boxed.as_ref()), "owned panic");

        let boxed: Box<dyn Any + Send> = Box::new(17u32);
        assert_eq!(panic_message(boxed.as_ref()), "opaque panic payload");
    }
}
