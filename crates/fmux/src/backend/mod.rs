//! Completion backend implementations
//!
//! Two backends share one internal contract: arm a request's control
//! blocks (`submit`), best-effort abort them (`cancel`), and block until
//! one completion or wake-up arrives (`wait_one`).
//!
//! - **POSIX AIO**: `aio_read`/`aio_write` with signal-notified
//!   completions, waited on through `aio_suspend`.
//! - **IOCP**: overlapped `ReadFile`/`WriteFile` against a per-service
//!   completion port.
//!
//! The variants are mutually exclusive per platform, so the selection seam
//! is the `PlatformBackend` alias rather than a trait object. Nothing
//! platform-shaped leaks past this module.

#[cfg(windows)]
pub(crate) mod iocp;
#[cfg(unix)]
pub(crate) mod posix_aio;

#[cfg(windows)]
pub(crate) use iocp::IocpBackend as PlatformBackend;
#[cfg(unix)]
pub(crate) use posix_aio::PosixAioBackend as PlatformBackend;

/// Outcome of one blocking wait on the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Wait {
    /// A request ran to completion and its hook was dispatched
    Completed,
    /// Woken without delivering a completion; the caller re-checks posts
    /// and the deadline before waiting again
    Woken,
    /// The allotted wait time elapsed
    TimedOut,
}
