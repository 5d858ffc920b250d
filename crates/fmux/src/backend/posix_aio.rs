//! POSIX AIO completion backend
//!
//! Each scatter buffer of a request is armed as one `aiocb`. Armed blocks
//! are tracked in a per-service registry vector whose raw pointers feed
//! `aio_suspend` directly. Completion notification is a no-op signal whose
//! only effect is interrupting the suspend; the owner then scans the
//! registry in order, harvests the first finished block with
//! `aio_return`, and fires the request hook once its last block is in.
//!
//! The suspend is taken in bounded slices. A wake that lands in the gap
//! between the pending-post check and the suspend call is therefore
//! observed at the next slice boundary instead of being lost.

// AIO control blocks force C-sized integer casts throughout.
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::backend::Wait;
use crate::deadline::timespec_for;
use crate::error::{FmuxError, Result};
use crate::request::{OpKind, RequestState};
use crate::service::IoService;
use crate::signal;

/// Upper bound on a single `aio_suspend` slice.
const MAX_WAIT_SLICE: Duration = Duration::from_millis(50);

/// Raw `aiocb` pointer as stored in the suspend vector.
#[repr(transparent)]
#[derive(Clone, Copy)]
struct AiocbPtr(*mut libc::aiocb);

// SAFETY: the pointer targets a control block pinned inside an
// `Arc<RequestState>` held by the same registry entry; it is only
// dereferenced by the owning thread.
unsafe impl Send for AiocbPtr {}

struct Entry {
    state: Arc<RequestState>,
    sub: usize,
}

#[derive(Default)]
struct Registry {
    /// Parallel to `entries`; consumed by `aio_suspend` as-is.
    aiocbs: Vec<AiocbPtr>,
    entries: Vec<Entry>,
}

/// Per-service POSIX AIO state
pub(crate) struct PosixAioBackend {
    registry: Mutex<Registry>,
    submitted_any: AtomicBool,
    kqueues: AtomicBool,
}

impl PosixAioBackend {
    pub(crate) fn new() -> Result<Self> {
        Ok(Self {
            registry: Mutex::new(Registry::default()),
            submitted_any: AtomicBool::new(false),
            // BSD kqueue support is reserved; nothing ever turns it on.
            kqueues: AtomicBool::new(false),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// True if this service drives completions through BSD kqueues
    pub(crate) fn using_kqueues(&self) -> bool {
        self.kqueues.load(Ordering::Relaxed)
    }

    /// Force kqueues off. Must run before any I/O has been submitted.
    pub(crate) fn disable_kqueues(&self) -> Result<()> {
        if self.submitted_any.load(Ordering::Acquire) {
            return Err(FmuxError::invalid_state(
                "kqueues cannot be disabled after I/O was submitted",
            ));
        }
        self.kqueues.store(false, Ordering::Release);
        Ok(())
    }

    /// Arms every control block of `state` and registers the armed ones.
    ///
    /// If the very first block is refused the whole submission fails and
    /// nothing is registered. A later refusal cancels the blocks already
    /// armed and surfaces the error through the completion hook instead,
    /// so the at-most-once hook contract holds for anything the kernel saw.
    pub(crate) fn submit(&self, svc: &IoService, state: &Arc<RequestState>) -> Result<()> {
        let n = state.block_count();
        let sig = signal::interruption_signal();
        let fd = state.file.as_raw_fd();
        let op_name = match state.op {
            OpKind::Read => "aio_read",
            OpKind::Write => "aio_write",
        };

        let mut armed = 0usize;
        let mut deferred: Option<FmuxError> = None;
        for i in 0..n {
            let cbp = state.block_ptr(i);
            let (buf, len) = state.buffer_parts(i);
            // SAFETY: cbp points into the request's pinned block slice and
            // buf into a buffer owned by the same request state.
            unsafe {
                (*cbp).aio_fildes = fd;
                (*cbp).aio_buf = buf.cast::<libc::c_void>();
                (*cbp).aio_nbytes = len;
                (*cbp).aio_offset = state.sub_offset(i) as libc::off_t;
                if sig != 0 {
                    (*cbp).aio_sigevent.sigev_notify = libc::SIGEV_SIGNAL;
                    (*cbp).aio_sigevent.sigev_signo = sig;
                    (*cbp).aio_sigevent.sigev_value = libc::sigval {
                        sival_ptr: (svc as *const IoService).cast_mut().cast(),
                    };
                } else {
                    (*cbp).aio_sigevent.sigev_notify = libc::SIGEV_NONE;
                }
            }
            // SAFETY: the block is fully initialised and pinned until the
            // completion is harvested.
            let rc = unsafe {
                match state.op {
                    OpKind::Read => libc::aio_read(cbp),
                    OpKind::Write => libc::aio_write(cbp),
                }
            };
            if rc != 0 {
                let err = FmuxError::last_os(op_name);
                if armed == 0 {
                    return Err(err);
                }
                deferred = Some(err);
                break;
            }
            armed += 1;
        }

        if let Some(err) = deferred {
            tracing::warn!(op = op_name, armed, "partial submission, cancelling");
            state.record_failure(err);
            for i in 0..armed {
                // SAFETY: block i was armed above and is still pinned.
                unsafe { libc::aio_cancel(fd, state.block_ptr(i)) };
            }
        }

        state.set_pending(armed);
        let mut reg = self.lock();
        for i in 0..armed {
            reg.aiocbs.push(AiocbPtr(state.block_ptr(i)));
            reg.entries.push(Entry {
                state: Arc::clone(state),
                sub: i,
            });
        }
        drop(reg);
        self.submitted_any.store(true, Ordering::Release);
        tracing::debug!(op = op_name, blocks = armed, offset = state.offset, "submitted");
        Ok(())
    }

    /// Best-effort abort of every still-registered block of `state`.
    pub(crate) fn cancel(&self, state: &Arc<RequestState>) {
        let reg = self.lock();
        let fd = state.file.as_raw_fd();
        for (ptr, entry) in reg.aiocbs.iter().zip(&reg.entries) {
            if Arc::ptr_eq(&entry.state, state) {
                // SAFETY: the block is registered, hence still pinned.
                // Whatever aio_cancel reports, the outcome is delivered
                // through the normal harvest path.
                unsafe { libc::aio_cancel(fd, ptr.0) };
            }
        }
        tracing::debug!(offset = state.offset, "cancel requested");
    }

    /// Blocks for up to `remaining` (clamped to one slice) and dispatches
    /// at most one request completion.
    pub(crate) fn wait_one(&self, svc: &IoService, remaining: Option<Duration>) -> Result<Wait> {
        // Completions may have landed while user code was running.
        if self.harvest(svc)? {
            return Ok(Wait::Completed);
        }

        let slice = remaining.map_or(MAX_WAIT_SLICE, |r| r.min(MAX_WAIT_SLICE));
        let ts = timespec_for(slice);
        let sig = signal::interruption_signal();

        let reg = self.lock();
        if reg.aiocbs.is_empty() {
            drop(reg);
            // Nothing in flight: stand in for the empty suspend set with
            // an interruptible sleep of the same slice.
            let rc = {
                let _unblocked = match sig {
                    0 => None,
                    s => Some(signal::UnblockGuard::new(s)?),
                };
                // SAFETY: ts is a valid timespec; the remainder output is
                // not requested.
                unsafe { libc::nanosleep(&ts, std::ptr::null_mut()) }
            };
            if rc == 0 {
                return Ok(Wait::TimedOut);
            }
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            return match errno {
                libc::EINTR => Ok(Wait::Woken),
                _ => Err(FmuxError::os("nanosleep", errno)),
            };
        }

        let rc = {
            let list = reg.aiocbs.as_ptr().cast::<*const libc::aiocb>();
            let len = reg.aiocbs.len() as libc::c_int;
            let _unblocked = match sig {
                0 => None,
                s => Some(signal::UnblockGuard::new(s)?),
            };
            // SAFETY: the list pointers stay valid for the duration of the
            // call; only the owning thread (blocked right here) mutates
            // the registry.
            unsafe { libc::aio_suspend(list, len, &ts) }
        };
        drop(reg);

        if rc == 0 {
            return if self.harvest(svc)? {
                Ok(Wait::Completed)
            } else {
                Ok(Wait::Woken)
            };
        }
        let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
        match errno {
            libc::EINTR => Ok(Wait::Woken),
            libc::EAGAIN => Ok(Wait::TimedOut),
            _ => Err(FmuxError::os("aio_suspend", errno)),
        }
    }

    /// Scans the registry in order and consumes finished blocks until a
    /// request completes or none are left. Returns whether a hook fired.
    fn harvest(&self, svc: &IoService) -> Result<bool> {
        loop {
            let harvested = {
                let mut reg = self.lock();
                let mut found = None;
                for (k, ptr) in reg.aiocbs.iter().enumerate() {
                    // SAFETY: registered blocks are pinned and armed.
                    let err = unsafe { libc::aio_error(ptr.0.cast_const()) };
                    if err != libc::EINPROGRESS {
                        found = Some((k, err));
                        break;
                    }
                }
                let Some((k, err)) = found else {
                    return Ok(false);
                };
                let ptr = reg.aiocbs.remove(k);
                let entry = reg.entries.remove(k);
                // SAFETY: harvesting a block exactly once after aio_error
                // reported it finished.
                let ret = unsafe { libc::aio_return(ptr.0) };
                (entry, err, ret)
            };

            let (entry, err, ret) = harvested;
            let sub_result = match err {
                0 => Ok(ret as usize),
                libc::ECANCELED => Err(FmuxError::Cancelled),
                e => Err(FmuxError::os(
                    match entry.state.op {
                        OpKind::Read => "aio_read",
                        OpKind::Write => "aio_write",
                    },
                    e,
                )),
            };
            if entry.state.sub_complete(entry.sub, sub_result) {
                svc.complete_request(&entry.state);
                return Ok(true);
            }
            // A sub-operation of a wider request finished; keep scanning.
        }
    }
}
