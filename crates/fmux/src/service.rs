//! The per-thread multiplexer service
//!
//! An [`IoService`] is bound to the thread that constructs it. Only that
//! thread may drain it: completions are dispatched and posts executed
//! exclusively from `run`/`run_until` on the owner. Any thread may hand
//! work to the owner through [`IoService::post`].
//!
//! One `run_until` call is one tick: it drains at most one post, or waits
//! for at most one I/O completion, within the given deadline. Callers that
//! want to drain to quiescence call it in a loop until it reports no more
//! work.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use std::time::Instant;

use crate::backend::{PlatformBackend, Wait};
use crate::deadline::Deadline;
use crate::error::{FmuxError, Result};
use crate::request::RequestState;
#[cfg(unix)]
use crate::signal;

/// A one-shot callable handed to the owning thread.
type Post = Box<dyn FnOnce(&IoService) + Send + 'static>;

/// Decrements the work counter when dropped, so a panicking post or hook
/// still leaves the accounting consistent.
struct WorkGuard<'a>(&'a IoService);

impl Drop for WorkGuard<'_> {
    fn drop(&mut self) {
        self.0.work_queued.fetch_sub(1, Ordering::AcqRel);
    }
}

/// An asynchronous file I/O multiplexer owned by a single thread.
///
/// The service captures the constructing thread's identity. In-flight
/// kernel control blocks point back at the service, so its address must
/// stay stable while anything is attached to it; the borrow a handle or
/// request takes on the service enforces exactly that.
pub struct IoService {
    owner: ThreadId,
    #[cfg(unix)]
    owner_pthread: libc::pthread_t,
    posts: Mutex<VecDeque<Post>>,
    work_queued: AtomicUsize,
    /// True while the owner is (or is about to be) blocked in the backend
    /// wait and therefore must be woken for new work.
    need_signal: AtomicBool,
    backend: PlatformBackend,
}

impl IoService {
    /// Creates a service owned by the calling thread.
    ///
    /// On POSIX this installs the process-wide interruption signal handler
    /// if none is installed yet, and masks the signal on the calling
    /// thread so that only the backend wait observes it.
    ///
    /// # Errors
    ///
    /// Returns [`FmuxError::Exhausted`] when the signal handler or the
    /// completion port cannot be set up.
    pub fn new() -> Result<Self> {
        #[cfg(unix)]
        {
            let sig = signal::ensure_installed()?;
            signal::block_on_current_thread(sig)?;
        }
        let backend = PlatformBackend::new()?;
        let service = Self {
            owner: thread::current().id(),
            #[cfg(unix)]
            // SAFETY: identifying the calling thread; always valid here.
            owner_pthread: unsafe { libc::pthread_self() },
            posts: Mutex::new(VecDeque::new()),
            work_queued: AtomicUsize::new(0),
            need_signal: AtomicBool::new(false),
            backend,
        };
        tracing::debug!(owner = ?service.owner, "i/o service created");
        Ok(service)
    }

    /// Runs the service until it handled one unit of work or ran out.
    ///
    /// Equivalent to `run_until(Deadline::never())`.
    ///
    /// # Errors
    ///
    /// See [`IoService::run_until`]; `TimedOut` cannot occur.
    pub fn run(&self) -> Result<bool> {
        self.run_until(Deadline::never())
    }

    /// Runs the service for at most one unit of work within `deadline`.
    ///
    /// Returns `Ok(true)` after dispatching one post or one I/O
    /// completion, and `Ok(false)` when no work is outstanding.
    /// With a finite deadline and no work handled in time, waits the
    /// deadline out and reports [`FmuxError::TimedOut`].
    ///
    /// # Errors
    ///
    /// [`FmuxError::WrongThread`] from a non-owning thread (nothing is
    /// mutated), [`FmuxError::TimedOut`] on expiry, and any OS error the
    /// backend wait surfaces.
    pub fn run_until(&self, deadline: Deadline) -> Result<bool> {
        self.ensure_owner()?;
        let started = Instant::now();
        loop {
            let remaining = deadline.remaining(started)?;

            if self.work_queued.load(Ordering::Acquire) == 0 {
                if deadline.is_never() {
                    return Ok(false);
                }
                // Finite deadline on an idle service: wait it out, picking
                // up work that arrives in the meantime.
            } else if self.dispatch_one_post() {
                return Ok(true);
            }

            self.need_signal.store(true, Ordering::SeqCst);
            // A post enqueued between the drain above and here would
            // otherwise sleep a full slice.
            if self.has_pending_post() {
                self.need_signal.store(false, Ordering::SeqCst);
                continue;
            }
            let wait = self.backend.wait_one(self, remaining);
            self.need_signal.store(false, Ordering::SeqCst);

            match wait? {
                Wait::Completed => return Ok(true),
                // Re-check posts and the deadline, then wait again.
                Wait::Woken | Wait::TimedOut => {}
            }
        }
    }

    /// Schedules `f` to run on the owning thread at its next tick.
    ///
    /// The only thread-safe entry point of the service: any thread may
    /// post. Never blocks on running callables; if the owner is parked in
    /// a backend wait it is woken exactly once.
    pub fn post<F>(&self, f: F)
    where
        F: FnOnce(&IoService) + Send + 'static,
    {
        self.work_queued.fetch_add(1, Ordering::Release);
        self.posts_lock().push_back(Box::new(f));
        if self.need_signal.swap(false, Ordering::AcqRel) {
            self.wake();
        }
    }

    /// Outstanding units of work: pending posts plus in-flight I/Os.
    #[must_use]
    pub fn outstanding_work(&self) -> usize {
        self.work_queued.load(Ordering::Acquire)
    }

    /// True if this service drives completions through BSD kqueues.
    ///
    /// The kqueue path is reserved; this currently always reports `false`.
    #[cfg(unix)]
    #[must_use]
    pub fn using_kqueues(&self) -> bool {
        self.backend.using_kqueues()
    }

    /// Forces BSD kqueues off for this service.
    ///
    /// # Errors
    ///
    /// Returns [`FmuxError::InvalidState`] once any I/O has been
    /// submitted.
    #[cfg(unix)]
    pub fn disable_kqueues(&self) -> Result<()> {
        self.backend.disable_kqueues()
    }

    fn ensure_owner(&self) -> Result<()> {
        if thread::current().id() == self.owner {
            Ok(())
        } else {
            Err(FmuxError::WrongThread)
        }
    }

    fn posts_lock(&self) -> MutexGuard<'_, VecDeque<Post>> {
        self.posts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn has_pending_post(&self) -> bool {
        !self.posts_lock().is_empty()
    }

    /// Pops and runs the front post, if any. The lock is released before
    /// the callable runs, so callables may themselves post.
    fn dispatch_one_post(&self) -> bool {
        let Some(f) = self.posts_lock().pop_front() else {
            return false;
        };
        let _work = WorkGuard(self);
        f(self);
        true
    }

    /// Binds a freshly opened file to this service. On Windows this
    /// associates the handle with the completion port; on POSIX the
    /// attachment is purely logical.
    pub(crate) fn attach_file(&self, file: &std::fs::File) -> Result<()> {
        #[cfg(windows)]
        self.backend.attach(file)?;
        #[cfg(unix)]
        let _ = file;
        Ok(())
    }

    /// Registers a request with the backend. Owner thread only.
    pub(crate) fn submit(&self, state: &Arc<RequestState>) -> Result<()> {
        self.ensure_owner()?;
        self.work_queued.fetch_add(1, Ordering::Release);
        if let Err(e) = self.backend.submit(self, state) {
            self.work_queued.fetch_sub(1, Ordering::AcqRel);
            return Err(e);
        }
        Ok(())
    }

    /// Best-effort cancellation of a submitted request.
    pub(crate) fn cancel_request(&self, state: &Arc<RequestState>) -> Result<()> {
        self.ensure_owner()?;
        self.backend.cancel(state);
        Ok(())
    }

    /// Called by the backend when a request's last sub-operation is in.
    /// Fires the hook with the work counter already settled.
    pub(crate) fn complete_request(&self, state: &Arc<RequestState>) {
        let (hook, result) = state.take_completion();
        tracing::debug!(
            offset = state.offset,
            ok = result.is_ok(),
            "completion dispatched"
        );
        let _work = WorkGuard(self);
        hook(result);
    }

    /// Wakes the owner out of its backend wait. Callable from any thread.
    fn wake(&self) {
        #[cfg(unix)]
        signal::kick(self.owner_pthread, signal::interruption_signal());
        #[cfg(windows)]
        self.backend.post_wake();
    }
}

impl std::fmt::Debug for IoService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoService")
            .field("owner", &self.owner)
            .field("outstanding_work", &self.outstanding_work())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_service_has_no_work() {
        let svc = IoService::new().expect("service");
        assert_eq!(svc.outstanding_work(), 0);
        assert!(!svc.run().expect("run"));
    }

    #[test]
    fn test_post_runs_on_owner() {
        let svc = IoService::new().expect("service");
        let hit = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let cross = Arc::clone(&hit);
        thread::scope(|s| {
            let svc = &svc;
            s.spawn(move || {
                svc.post(move |_| {
                    cross.fetch_add(1, Ordering::SeqCst);
                });
            });
        });
        assert_eq!(svc.outstanding_work(), 1);
        assert!(svc.run().expect("tick"));
        assert!(!svc.run().expect("drained"));
        assert_eq!(hit.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reentrant_post_lands_on_next_tick() {
        let svc = IoService::new().expect("service");
        let order = Arc::new(Mutex::new(Vec::new()));
        let outer = Arc::clone(&order);
        svc.post(move |s| {
            outer.lock().unwrap().push(1);
            let inner = Arc::clone(&outer);
            s.post(move |_| {
                inner.lock().unwrap().push(2);
            });
        });
        assert!(svc.run().expect("outer post"));
        assert!(svc.run().expect("inner post"));
        assert!(!svc.run().expect("drained"));
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_run_from_foreign_thread_is_refused() {
        let svc = IoService::new().expect("service");
        thread::scope(|s| {
            let handle = s.spawn(|| svc.run());
            let err = handle.join().expect("join").unwrap_err();
            assert!(matches!(err, FmuxError::WrongThread));
        });
    }
}
