//! Asynchronous file I/O multiplexer.
//!
//! A per-thread service that owns a set of in-flight operations against
//! regular files, drives them to completion on the host kernel's AIO
//! facility, and accepts callables posted from any thread into the
//! owner's run loop.
//!
//! # Backend hierarchy
//!
//! ```text
//! POSIX:
//!   PosixAioBackend — aio_read/aio_write, aio_suspend wait,
//!                     signal-interrupted wake-ups
//!
//! Windows:
//!   IocpBackend     — overlapped ReadFile/WriteFile against one
//!                     completion port per service, user-packet wake-ups
//! ```
//!
//! # Quick start
//!
//! ```no_run
//! use fmux::{AsyncFile, IoService, OpenMode};
//!
//! # fn main() -> fmux::Result<()> {
//! let service = IoService::new()?;
//! let file = AsyncFile::open(&service, "data.bin", OpenMode::Read)?;
//!
//! let done = std::rc::Rc::new(std::cell::Cell::new(false));
//! let seen = done.clone();
//! file.begin_read(0, vec![vec![0u8; 4096]], move |outcome| {
//!     let transfer = outcome.expect("read failed");
//!     println!("read {} bytes", transfer.total());
//!     seen.set(true);
//! })?;
//!
//! while !done.get() {
//!     service.run()?;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Threading model
//!
//! Only the thread that constructed a service may drain it; everything a
//! completion hook or posted callable does happens on that thread. Other
//! threads interact solely through [`IoService::post`], which wakes the
//! owner out of its kernel wait when needed.

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

mod backend;
mod deadline;
mod error;
mod file;
mod request;
mod service;
#[cfg(unix)]
mod signal;

pub use deadline::Deadline;
pub use error::{FmuxError, Result};
pub use file::{AsyncFile, OpenMode};
pub use request::{IoRequest, Transfer};
pub use service::IoService;
#[cfg(unix)]
pub use signal::{interruption_signal, set_interruption_signal};

/// Commonly used types.
pub mod prelude {
    pub use crate::{AsyncFile, Deadline, FmuxError, IoRequest, IoService, OpenMode, Result, Transfer};
}
