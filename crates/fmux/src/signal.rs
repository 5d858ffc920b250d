//! Interruption signal management
//!
//! On POSIX the run loop is woken out of `aio_suspend` by a process-global
//! signal. The handler is installed once, does nothing (its only effect is
//! `EINTR` in the blocked thread), and the previous disposition is saved so
//! it can be restored. Multiple services in one process share the signal;
//! each targets its own owner with `pthread_kill`.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Mutex;

use crate::error::{FmuxError, Result};

/// Signal currently carrying wake-ups. 0 means no handler installed.
static INSTALLED_SIGNAL: AtomicI32 = AtomicI32::new(0);

/// Disposition that was in place before we installed ours.
static PREVIOUS: Mutex<Option<Saved>> = Mutex::new(None);

struct Saved {
    signo: i32,
    action: libc::sigaction,
}

// libc::sigaction is plain data (handler address, mask, flags).
unsafe impl Send for Saved {}

/// The handler's only job is interrupting `aio_suspend`. It must stay
/// async-signal-safe: no allocation, no locks, no service state.
extern "C" fn wake_handler(_sig: libc::c_int) {}

/// Returns the signal used for interrupting `run_until`, or 0 if no
/// handler is installed.
#[must_use]
pub fn interruption_signal() -> i32 {
    INSTALLED_SIGNAL.load(Ordering::Acquire)
}

/// Sets the signal used for interrupting `run_until`, returning the former
/// setting.
///
/// Special values: `0` uninstalls the handler and restores the previous
/// disposition; `-1` picks the first free real-time signal between
/// `SIGRTMIN` and `SIGRTMAX`, falling back to `SIGUSR1` where real-time
/// signals are unavailable. Changing the signal while services have I/O in
/// flight leaves those completions notifying a signal nobody listens to.
///
/// # Errors
///
/// Returns [`FmuxError::Exhausted`] if the handler cannot be installed.
pub fn set_interruption_signal(sig: i32) -> Result<i32> {
    let former = INSTALLED_SIGNAL.load(Ordering::Acquire);

    if sig == 0 {
        let mut prev = PREVIOUS.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(saved) = prev.take() {
            // SAFETY: restoring a disposition previously returned by sigaction.
            let rc = unsafe { libc::sigaction(saved.signo, &saved.action, std::ptr::null_mut()) };
            if rc != 0 {
                return Err(FmuxError::last_os("sigaction"));
            }
        }
        INSTALLED_SIGNAL.store(0, Ordering::Release);
        tracing::debug!("interruption signal handler uninstalled");
        return Ok(former);
    }

    let chosen = if sig == -1 {
        first_free_rt_signal().unwrap_or(libc::SIGUSR1)
    } else {
        sig
    };

    // SAFETY: zeroed sigaction is a valid all-default template.
    let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
    action.sa_sigaction = wake_handler as extern "C" fn(libc::c_int) as libc::sighandler_t;
    // SAFETY: sa_mask is a plain sigset_t owned by us.
    unsafe { libc::sigemptyset(&mut action.sa_mask) };
    action.sa_flags = 0;

    let mut old: libc::sigaction = unsafe { std::mem::zeroed() };
    // SAFETY: both pointers reference live, writable sigaction structs.
    let rc = unsafe { libc::sigaction(chosen, &action, &mut old) };
    if rc != 0 {
        return Err(FmuxError::exhausted(format!(
            "cannot install handler for signal {chosen}"
        )));
    }

    let mut prev = PREVIOUS.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    if prev.is_none() {
        *prev = Some(Saved {
            signo: chosen,
            action: old,
        });
    }
    INSTALLED_SIGNAL.store(chosen, Ordering::Release);
    tracing::info!(signal = chosen, "interruption signal handler installed");
    Ok(former)
}

/// Installs the handler if nothing is installed yet and returns the signal
/// in use.
pub(crate) fn ensure_installed() -> Result<i32> {
    let current = interruption_signal();
    if current != 0 {
        return Ok(current);
    }
    set_interruption_signal(-1)?;
    Ok(interruption_signal())
}

/// First signal in `SIGRTMIN..=SIGRTMAX` whose disposition is still the
/// default.
fn first_free_rt_signal() -> Option<i32> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        for sig in libc::SIGRTMIN()..=libc::SIGRTMAX() {
            let mut old: libc::sigaction = unsafe { std::mem::zeroed() };
            // SAFETY: query-only sigaction with a null new disposition.
            let rc = unsafe { libc::sigaction(sig, std::ptr::null(), &mut old) };
            if rc == 0 && old.sa_sigaction == libc::SIG_DFL {
                return Some(sig);
            }
        }
        None
    }
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    {
        None
    }
}

/// Masks `sig` on the calling thread. The owning thread holds the signal
/// blocked at all times except across `aio_suspend`.
pub(crate) fn block_on_current_thread(sig: i32) -> Result<()> {
    mask_on_current_thread(sig, libc::SIG_BLOCK, "pthread_sigmask(SIG_BLOCK)")
}

fn mask_on_current_thread(sig: i32, how: libc::c_int, call: &'static str) -> Result<()> {
    // SAFETY: set is initialised by sigemptyset before use.
    let mut set: libc::sigset_t = unsafe { std::mem::zeroed() };
    unsafe {
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, sig);
    }
    // SAFETY: set is initialised; old mask output is not requested.
    let rc = unsafe { libc::pthread_sigmask(how, &set, std::ptr::null_mut()) };
    if rc != 0 {
        return Err(FmuxError::os(call, rc));
    }
    Ok(())
}

/// Unmasks the interruption signal for the lifetime of the guard, so that
/// only the enclosed blocking call observes pending wake-ups.
pub(crate) struct UnblockGuard {
    sig: i32,
}

impl UnblockGuard {
    pub(crate) fn new(sig: i32) -> Result<Self> {
        mask_on_current_thread(sig, libc::SIG_UNBLOCK, "pthread_sigmask(SIG_UNBLOCK)")?;
        Ok(Self { sig })
    }
}

impl Drop for UnblockGuard {
    fn drop(&mut self) {
        let _ = mask_on_current_thread(self.sig, libc::SIG_BLOCK, "pthread_sigmask(SIG_BLOCK)");
    }
}

/// Delivers the interruption signal to `thread`.
pub(crate) fn kick(thread: libc::pthread_t, sig: i32) {
    if sig == 0 {
        return;
    }
    // SAFETY: thread is a pthread_t captured at service construction; a
    // stale id is caught by pthread_kill returning ESRCH, which we ignore.
    let rc = unsafe { libc::pthread_kill(thread, sig) };
    if rc != 0 && rc != libc::ESRCH {
        tracing::warn!(errno = rc, "pthread_kill wake failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_choose_and_uninstall() {
        let former = set_interruption_signal(-1).expect("install");
        let chosen = interruption_signal();
        assert_ne!(chosen, 0);

        // Re-install with an explicit signal returns the current one.
        let back = set_interruption_signal(chosen).expect("reinstall");
        assert_eq!(back, chosen);

        let last = set_interruption_signal(0).expect("uninstall");
        assert_eq!(last, chosen);
        assert_eq!(interruption_signal(), 0);

        // Leave the process in the installed state other tests expect.
        if former != 0 {
            set_interruption_signal(former).expect("restore");
        }
    }
}
