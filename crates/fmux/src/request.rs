//! In-flight request state
//!
//! A submitted operation is backed by one [`RequestState`] shared between
//! the caller-facing [`IoRequest`] token and the service's backend
//! registry. The state owns everything the kernel touches for the duration
//! of the operation: one control block per scatter buffer, the buffers
//! themselves, and the completion hook. The shared `Arc` keeps all of it
//! at a stable address until the completion has been observed, even if the
//! caller drops its token early.
//!
//! All interior mutation happens on the owning thread; the service's
//! thread checks are the synchronization story here, not locks.

use std::cell::{Cell, UnsafeCell};
use std::fs::File;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{FmuxError, Result};
use crate::service::IoService;

#[cfg(unix)]
pub(crate) type ControlBlock = libc::aiocb;
#[cfg(windows)]
pub(crate) type ControlBlock = crate::backend::iocp::Overlapped;

/// Completion hook invoked exactly once on the owning thread.
pub(crate) type Hook = Box<dyn FnOnce(Result<Transfer>)>;

/// Direction of a submitted operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpKind {
    Read,
    Write,
}

/// The outcome of a completed scatter/gather operation.
///
/// Returns the buffers that were lent to the kernel together with the
/// number of bytes transferred into (or out of) each one.
#[derive(Debug)]
pub struct Transfer {
    /// The scatter/gather buffers, in submission order
    pub buffers: Vec<Vec<u8>>,
    /// Bytes transferred per buffer
    pub bytes: Vec<usize>,
}

impl Transfer {
    /// Total bytes transferred across all buffers
    #[must_use]
    pub fn total(&self) -> usize {
        self.bytes.iter().sum()
    }
}

/// Shared state of one in-flight operation.
///
/// Pinned for the kernel's benefit: the control blocks and buffers live
/// inside this allocation and the backend registry holds an `Arc` until
/// the last sub-operation completes.
pub(crate) struct RequestState {
    pub(crate) op: OpKind,
    pub(crate) file: Arc<File>,
    pub(crate) offset: u64,
    blocks: UnsafeCell<Box<[ControlBlock]>>,
    buffers: UnsafeCell<Option<Vec<Vec<u8>>>>,
    hook: UnsafeCell<Option<Hook>>,
    transferred: UnsafeCell<Box<[usize]>>,
    failed: UnsafeCell<Option<FmuxError>>,
    pending: Cell<usize>,
    done: AtomicBool,
}

// SAFETY: the UnsafeCell and Cell fields are read and written only by the
// service's owning thread (enforced by the thread checks on every
// submission, wait and cancel path). The Arc crosses into the backend
// registry, which lives inside the service and is likewise owner-driven.
unsafe impl Send for RequestState {}
unsafe impl Sync for RequestState {}

impl RequestState {
    pub(crate) fn new(
        file: Arc<File>,
        op: OpKind,
        offset: u64,
        buffers: Vec<Vec<u8>>,
        hook: Hook,
    ) -> Arc<Self> {
        let n = buffers.len();
        // SAFETY: both aiocb and OVERLAPPED are C structs for which the
        // all-zero pattern is the documented "not yet armed" state.
        let blocks: Box<[ControlBlock]> =
            (0..n).map(|_| unsafe { std::mem::zeroed() }).collect();
        Arc::new(Self {
            op,
            file,
            offset,
            blocks: UnsafeCell::new(blocks),
            buffers: UnsafeCell::new(Some(buffers)),
            hook: UnsafeCell::new(Some(hook)),
            transferred: UnsafeCell::new(vec![0usize; n].into_boxed_slice()),
            failed: UnsafeCell::new(None),
            pending: Cell::new(0),
            done: AtomicBool::new(false),
        })
    }

    /// Number of scatter/gather sub-operations
    pub(crate) fn block_count(&self) -> usize {
        // SAFETY: length is immutable after construction.
        unsafe { (&*self.blocks.get()).len() }
    }

    /// Raw pointer to sub-operation `i`'s control block. Stable for the
    /// lifetime of the `Arc`.
    pub(crate) fn block_ptr(&self, i: usize) -> *mut ControlBlock {
        // SAFETY: the boxed slice is never reallocated after construction.
        unsafe { (*self.blocks.get()).as_mut_ptr().add(i) }
    }

    /// Pointer and length of scatter buffer `i`.
    ///
    /// Owner thread only, and only while the buffers have not yet been
    /// handed back through the hook.
    pub(crate) fn buffer_parts(&self, i: usize) -> (*mut u8, usize) {
        // SAFETY: owner-confined access; buffers are present until
        // completion by the registry's liveness invariant.
        let bufs = unsafe { (*self.buffers.get()).as_mut().expect("buffers taken early") };
        (bufs[i].as_mut_ptr(), bufs[i].len())
    }

    /// Byte offset in the file at which sub-operation `i` starts.
    pub(crate) fn sub_offset(&self, i: usize) -> u64 {
        // SAFETY: owner-confined read.
        let bufs = unsafe { (*self.buffers.get()).as_ref().expect("buffers taken early") };
        let skipped: usize = bufs[..i].iter().map(Vec::len).sum();
        self.offset + skipped as u64
    }

    pub(crate) fn set_pending(&self, n: usize) {
        self.pending.set(n);
    }

    /// Records a failure without consuming a pending slot. First failure
    /// wins; later sub-errors are absorbed.
    pub(crate) fn record_failure(&self, e: FmuxError) {
        // SAFETY: owner-confined write.
        let failed = unsafe { &mut *self.failed.get() };
        if failed.is_none() {
            *failed = Some(e);
        }
    }

    /// Records the outcome of one sub-operation and reports whether the
    /// whole request just finished.
    pub(crate) fn sub_complete(&self, i: usize, result: Result<usize>) -> bool {
        match result {
            Ok(bytes) => {
                // SAFETY: owner-confined write to a fixed-size slot.
                unsafe { (*self.transferred.get())[i] = bytes };
            }
            Err(e) => self.record_failure(e),
        }
        let left = self.pending.get() - 1;
        self.pending.set(left);
        left == 0
    }

    /// Takes the hook and the packaged result. Called once, after the last
    /// sub-operation completed.
    pub(crate) fn take_completion(&self) -> (Hook, Result<Transfer>) {
        self.done.store(true, Ordering::Release);
        // SAFETY: owner-confined, single call guarded by sub_complete
        // returning true exactly once.
        let hook = unsafe { (*self.hook.get()).take().expect("completion taken twice") };
        let failed = unsafe { (*self.failed.get()).take() };
        let result = match failed {
            Some(e) => Err(e),
            None => {
                let buffers = unsafe { (*self.buffers.get()).take().expect("buffers taken twice") };
                let bytes = unsafe { (*self.transferred.get()).to_vec() };
                Ok(Transfer { buffers, bytes })
            }
        };
        (hook, result)
    }

    pub(crate) fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }
}

/// Handle to a submitted operation.
///
/// Dropping the token does not cancel or abandon the operation; the
/// completion hook still runs when the kernel finishes. Explicit
/// best-effort cancellation is available through [`IoRequest::cancel`].
pub struct IoRequest<'s> {
    service: &'s IoService,
    state: Arc<RequestState>,
    // Owner-thread token: the request state is not synchronized.
    _not_send: PhantomData<*const ()>,
}

impl<'s> IoRequest<'s> {
    pub(crate) fn new(service: &'s IoService, state: Arc<RequestState>) -> Self {
        Self {
            service,
            state,
            _not_send: PhantomData,
        }
    }

    /// True once the completion hook has run
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.state.is_done()
    }

    /// Requests cancellation of the operation.
    ///
    /// Best-effort: the kernel may have already finished or may refuse.
    /// Either way the completion hook fires exactly once, with
    /// [`FmuxError::Cancelled`] if cancellation won the race.
    ///
    /// # Errors
    ///
    /// Returns [`FmuxError::WrongThread`] when called from a thread other
    /// than the service owner.
    pub fn cancel(&self) -> Result<()> {
        self.service.cancel_request(&self.state)
    }
}

impl std::fmt::Debug for IoRequest<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoRequest")
            .field("op", &self.state.op)
            .field("offset", &self.state.offset)
            .field("done", &self.state.is_done())
            .finish()
    }
}
