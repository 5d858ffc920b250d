//! Windows IOCP completion backend
//!
//! One completion port per service; file handles are associated with it
//! at open time. Each scatter buffer of a request is issued as one
//! overlapped `ReadFile`/`WriteFile`, and `wait_one` dequeues a single
//! packet with `GetQueuedCompletionStatus`. Cross-thread wake-ups arrive
//! as user packets carrying a sentinel completion key.

#![allow(clippy::cast_possible_truncation)]
#![allow(non_snake_case)]

use std::collections::HashMap;
use std::ffi::c_void;
use std::os::windows::io::AsRawHandle;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::backend::Wait;
use crate::deadline::millis_for;
use crate::error::{FmuxError, Result};
use crate::request::{OpKind, RequestState};
use crate::service::IoService;

type Handle = *mut c_void;
type Bool = i32;

const INVALID_HANDLE_VALUE: Handle = usize::MAX as Handle;
const INFINITE: u32 = 0xFFFF_FFFF;
const ERROR_IO_PENDING: u32 = 997;
const ERROR_OPERATION_ABORTED: u32 = 995;
const ERROR_HANDLE_EOF: u32 = 38;
const WAIT_TIMEOUT: u32 = 258;

/// Completion key for file handles bound to the port.
const FILE_KEY: usize = 0;
/// Completion key of the cross-thread wake packet.
const WAKE_KEY: usize = 1;

/// Minimal OVERLAPPED layout; the spare `h_event` slot is left null so
/// completion delivery goes through the port only.
#[repr(C)]
pub(crate) struct Overlapped {
    internal: usize,
    internal_high: usize,
    offset: u32,
    offset_high: u32,
    h_event: Handle,
}

extern "system" {
    fn CreateIoCompletionPort(
        file_handle: Handle,
        existing_port: Handle,
        completion_key: usize,
        concurrent_threads: u32,
    ) -> Handle;

    fn GetQueuedCompletionStatus(
        port: Handle,
        bytes_transferred: *mut u32,
        completion_key: *mut usize,
        overlapped: *mut *mut Overlapped,
        milliseconds: u32,
    ) -> Bool;

    fn PostQueuedCompletionStatus(
        port: Handle,
        bytes_transferred: u32,
        completion_key: usize,
        overlapped: *mut Overlapped,
    ) -> Bool;

    fn ReadFile(
        handle: Handle,
        buffer: *mut c_void,
        bytes_to_read: u32,
        bytes_read: *mut u32,
        overlapped: *mut Overlapped,
    ) -> Bool;

    fn WriteFile(
        handle: Handle,
        buffer: *const c_void,
        bytes_to_write: u32,
        bytes_written: *mut u32,
        overlapped: *mut Overlapped,
    ) -> Bool;

    fn CancelIoEx(handle: Handle, overlapped: *mut Overlapped) -> Bool;

    fn CloseHandle(handle: Handle) -> Bool;

    fn GetLastError() -> u32;
}

struct PortHandle(Handle);

// SAFETY: a completion port handle is a kernel object reference; posting
// to it is documented as thread-safe, and dequeueing is owner-confined.
unsafe impl Send for PortHandle {}
unsafe impl Sync for PortHandle {}

struct Entry {
    state: Arc<RequestState>,
    sub: usize,
}

/// Per-service IOCP state
pub(crate) struct IocpBackend {
    port: PortHandle,
    /// Keyed by the address of the sub-operation's OVERLAPPED.
    registry: Mutex<HashMap<usize, Entry>>,
}

impl IocpBackend {
    pub(crate) fn new() -> Result<Self> {
        // SAFETY: creating a fresh port; no handles involved yet.
        let port =
            unsafe { CreateIoCompletionPort(INVALID_HANDLE_VALUE, std::ptr::null_mut(), 0, 1) };
        if port.is_null() {
            return Err(FmuxError::exhausted("CreateIoCompletionPort failed"));
        }
        Ok(Self {
            port: PortHandle(port),
            registry: Mutex::new(HashMap::new()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<usize, Entry>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Associates a freshly opened overlapped file handle with the port.
    pub(crate) fn attach(&self, file: &std::fs::File) -> Result<()> {
        let raw = file.as_raw_handle().cast::<c_void>();
        // SAFETY: raw is a live handle owned by `file`.
        let bound = unsafe { CreateIoCompletionPort(raw, self.port.0, FILE_KEY, 0) };
        if bound.is_null() {
            return Err(FmuxError::last_os("CreateIoCompletionPort"));
        }
        Ok(())
    }

    /// Posts the sentinel wake packet. Callable from any thread.
    pub(crate) fn post_wake(&self) {
        // SAFETY: posting a user packet with no payload.
        let rc =
            unsafe { PostQueuedCompletionStatus(self.port.0, 0, WAKE_KEY, std::ptr::null_mut()) };
        if rc == 0 {
            tracing::warn!("PostQueuedCompletionStatus wake failed");
        }
    }

    /// Issues every sub-operation of `state` and registers the issued
    /// ones. Mirrors the POSIX backend's partial-failure contract: a
    /// first-block refusal fails the submission outright, a later one is
    /// deferred to the completion hook.
    pub(crate) fn submit(&self, _svc: &IoService, state: &Arc<RequestState>) -> Result<()> {
        let n = state.block_count();
        let raw = state.file.as_raw_handle().cast::<c_void>();
        let op_name = match state.op {
            OpKind::Read => "ReadFile",
            OpKind::Write => "WriteFile",
        };

        let mut issued = 0usize;
        let mut deferred: Option<FmuxError> = None;
        for i in 0..n {
            let ovl = state.block_ptr(i);
            let (buf, len) = state.buffer_parts(i);
            let at = state.sub_offset(i);
            // SAFETY: ovl points into the request's pinned block slice.
            unsafe {
                (*ovl).offset = at as u32;
                (*ovl).offset_high = (at >> 32) as u32;
            }
            // SAFETY: buffer and OVERLAPPED stay pinned inside the request
            // state until the packet is dequeued.
            let rc = unsafe {
                match state.op {
                    OpKind::Read => {
                        ReadFile(raw, buf.cast(), len as u32, std::ptr::null_mut(), ovl)
                    }
                    OpKind::Write => {
                        WriteFile(raw, buf.cast(), len as u32, std::ptr::null_mut(), ovl)
                    }
                }
            };
            // SAFETY: immediate thread-local error query.
            let last = unsafe { GetLastError() };
            if rc == 0 && last != ERROR_IO_PENDING {
                let err = FmuxError::os(op_name, last as i32);
                if issued == 0 {
                    return Err(err);
                }
                deferred = Some(err);
                break;
            }
            issued += 1;
        }

        if let Some(err) = deferred {
            tracing::warn!(op = op_name, issued, "partial submission, cancelling");
            state.record_failure(err);
            for i in 0..issued {
                // SAFETY: block i was issued above and is still pinned.
                unsafe { CancelIoEx(raw, state.block_ptr(i)) };
            }
        }

        state.set_pending(issued);
        let mut reg = self.lock();
        for i in 0..issued {
            reg.insert(
                state.block_ptr(i) as usize,
                Entry {
                    state: Arc::clone(state),
                    sub: i,
                },
            );
        }
        drop(reg);
        tracing::debug!(op = op_name, blocks = issued, offset = state.offset, "submitted");
        Ok(())
    }

    /// Best-effort abort of every still-registered block of `state`.
    pub(crate) fn cancel(&self, state: &Arc<RequestState>) {
        let reg = self.lock();
        let raw = state.file.as_raw_handle().cast::<c_void>();
        for (&addr, entry) in reg.iter() {
            if Arc::ptr_eq(&entry.state, state) {
                // SAFETY: the OVERLAPPED at addr is registered, hence
                // still pinned; the outcome arrives as a normal packet.
                unsafe { CancelIoEx(raw, addr as *mut Overlapped) };
            }
        }
        tracing::debug!(offset = state.offset, "cancel requested");
    }

    /// Dequeues one packet, waiting up to `remaining`.
    pub(crate) fn wait_one(&self, svc: &IoService, remaining: Option<Duration>) -> Result<Wait> {
        let millis = remaining.map_or(INFINITE, millis_for);

        let mut bytes: u32 = 0;
        let mut key: usize = 0;
        let mut ovl: *mut Overlapped = std::ptr::null_mut();
        // SAFETY: all three out-pointers reference live locals.
        let rc = unsafe {
            GetQueuedCompletionStatus(self.port.0, &mut bytes, &mut key, &mut ovl, millis)
        };

        if rc != 0 {
            if key == WAKE_KEY {
                return Ok(Wait::Woken);
            }
            return self.deliver(svc, ovl, Ok(bytes as usize));
        }

        // SAFETY: immediate thread-local error query.
        let err = unsafe { GetLastError() };
        if ovl.is_null() {
            return match err {
                WAIT_TIMEOUT => Ok(Wait::TimedOut),
                e => Err(FmuxError::os("GetQueuedCompletionStatus", e as i32)),
            };
        }
        // A packet for a failed operation.
        let sub_result = match err {
            ERROR_OPERATION_ABORTED => Err(FmuxError::Cancelled),
            // Reading past the end of file completes with zero bytes.
            ERROR_HANDLE_EOF => Ok(0),
            e => Err(FmuxError::os("overlapped I/O", e as i32)),
        };
        self.deliver(svc, ovl, sub_result)
    }

    /// Routes a dequeued packet to its request; fires the hook when the
    /// request's last sub-operation is in.
    fn deliver(&self, svc: &IoService, ovl: *mut Overlapped, sub_result: Result<usize>) -> Result<Wait> {
        let entry = self.lock().remove(&(ovl as usize));
        let Some(entry) = entry else {
            // A packet for something we no longer track; treat as a wake.
            tracing::warn!("completion packet without a registered request");
            return Ok(Wait::Woken);
        };
        if entry.state.sub_complete(entry.sub, sub_result) {
            svc.complete_request(&entry.state);
            return Ok(Wait::Completed);
        }
        Ok(Wait::Woken)
    }
}

impl Drop for IocpBackend {
    fn drop(&mut self) {
        // SAFETY: the port handle is owned by this backend.
        unsafe { CloseHandle(self.port.0) };
    }
}
