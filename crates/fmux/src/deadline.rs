//! Deadline arithmetic for the run loop
//!
//! A [`Deadline`] bounds one `run_until` call. It is either `never`, a
//! relative duration measured against the steady clock from the moment the
//! call starts, or an absolute wall-clock point. Conversion into the
//! platform wait primitives (a `timespec` on POSIX, whole milliseconds on
//! Windows) rounds up so a wait never returns early by more than the clock
//! resolution.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::error::{FmuxError, Result};

const NANOS_PER_SEC: u32 = 1_000_000_000;

/// A time bound for [`IoService::run_until`](crate::IoService::run_until)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline(Repr);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Repr {
    Never,
    Relative(Duration),
    Absolute(SystemTime),
}

impl Deadline {
    /// The distinguished "no deadline" value
    #[must_use]
    pub const fn never() -> Self {
        Self(Repr::Never)
    }

    /// A deadline measured from the start of the `run_until` call
    #[must_use]
    pub const fn relative(d: Duration) -> Self {
        Self(Repr::Relative(d))
    }

    /// An absolute wall-clock deadline
    #[must_use]
    pub const fn absolute(at: SystemTime) -> Self {
        Self(Repr::Absolute(at))
    }

    /// Build a deadline from its wire encoding.
    ///
    /// Absolute deadlines are interpreted as seconds and nanoseconds since
    /// the Unix epoch.
    ///
    /// # Errors
    ///
    /// Returns [`FmuxError::InvalidDeadline`] if `nanoseconds` is not a
    /// sub-second count.
    pub fn from_parts(is_relative: bool, seconds: u64, nanoseconds: u32) -> Result<Self> {
        if nanoseconds >= NANOS_PER_SEC {
            return Err(FmuxError::invalid_deadline(format!(
                "nanoseconds {nanoseconds} not below 10^9"
            )));
        }
        let d = Duration::new(seconds, nanoseconds);
        Ok(if is_relative {
            Self::relative(d)
        } else {
            Self::absolute(UNIX_EPOCH + d)
        })
    }

    /// True for the `never` sentinel
    #[must_use]
    pub const fn is_never(&self) -> bool {
        matches!(self.0, Repr::Never)
    }

    /// Time left before this deadline, measured against `started`.
    ///
    /// `None` means no bound. Expiry reports [`FmuxError::TimedOut`]
    /// carrying the elapsed wait.
    pub(crate) fn remaining(&self, started: Instant) -> Result<Option<Duration>> {
        match self.0 {
            Repr::Never => Ok(None),
            Repr::Relative(d) => {
                let elapsed = started.elapsed();
                if elapsed >= d {
                    Err(FmuxError::timed_out(elapsed))
                } else {
                    Ok(Some(d - elapsed))
                }
            }
            Repr::Absolute(at) => match at.duration_since(SystemTime::now()) {
                Ok(left) => Ok(Some(left)),
                Err(_) => Err(FmuxError::timed_out(started.elapsed())),
            },
        }
    }
}

impl Default for Deadline {
    fn default() -> Self {
        Self::never()
    }
}

/// Convert a remaining duration into a `timespec` for `aio_suspend`.
#[cfg(unix)]
#[allow(clippy::cast_possible_wrap, clippy::cast_lossless)]
pub(crate) fn timespec_for(left: Duration) -> libc::timespec {
    libc::timespec {
        tv_sec: left.as_secs() as libc::time_t,
        tv_nsec: left.subsec_nanos() as libc::c_long,
    }
}

/// Convert a remaining duration into whole milliseconds, rounding up.
#[cfg(windows)]
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn millis_for(left: Duration) -> u32 {
    let ms = left.as_millis();
    let ms = if left.subsec_nanos() % 1_000_000 != 0 {
        ms + 1
    } else {
        ms
    };
    ms.min(u128::from(u32::MAX - 1)) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_never_has_no_bound() {
        let d = Deadline::never();
        assert!(d.is_never());
        assert_eq!(d.remaining(Instant::now()).unwrap(), None);
    }

    #[test]
    fn test_from_parts_rejects_overflowing_nanos() {
        let err = Deadline::from_parts(true, 0, NANOS_PER_SEC).unwrap_err();
        assert!(matches!(err, FmuxError::InvalidDeadline { .. }));
        assert!(Deadline::from_parts(true, 0, NANOS_PER_SEC - 1).is_ok());
    }

    #[test]
    fn test_relative_counts_down_from_start() {
        let d = Deadline::relative(Duration::from_secs(10));
        let left = d.remaining(Instant::now()).unwrap().unwrap();
        assert!(left <= Duration::from_secs(10));
        assert!(left > Duration::from_secs(9));
    }

    #[test]
    fn test_expired_relative_reports_timeout() {
        let d = Deadline::relative(Duration::from_millis(1));
        let started = Instant::now() - Duration::from_millis(50);
        let err = d.remaining(started).unwrap_err();
        assert!(err.is_timed_out());
    }

    #[test]
    fn test_absolute_in_the_past_reports_timeout() {
        let d = Deadline::absolute(SystemTime::now() - Duration::from_secs(1));
        let err = d.remaining(Instant::now()).unwrap_err();
        assert!(err.is_timed_out());
    }

    #[cfg(unix)]
    #[test]
    fn test_timespec_conversion() {
        let ts = timespec_for(Duration::new(2, 500_000_000));
        assert_eq!(ts.tv_sec, 2);
        assert_eq!(ts.tv_nsec, 500_000_000);
    }
}
