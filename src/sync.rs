#![allow(unsafe_code)]
//! Process-shared, robust mutex living inside a mapped trace file.
//!
//! Producers in different processes append to the same ring buffer, so the
//! lock has to live in the shared mapping itself. On Linux this is a pthread
//! mutex configured as process-shared, robust and error-checking:
//!
//! - a lock attempt gives up after two seconds instead of hanging forever
//!   behind a stuck producer;
//! - when the previous owner died while holding the lock, the next locker gets
//!   `EOWNERDEAD`, marks the mutex consistent and carries on. The protected
//!   ring buffer may then contain a half-written entry, which readers skip
//!   thanks to the entry checksums.
//!
//! Other platforms fall back to a process-local lock.

use std::time::Duration;

use crate::error::{TraceError, TraceResult};

/// Bytes reserved for the mutex in the ring buffer section.
pub const MUTEX_REGION_SIZE: usize = 64;

/// How long a producer waits for the lock.
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(2);

#[cfg(target_os = "linux")]
const _: () = assert!(
    std::mem::size_of::<libc::pthread_mutex_t>() <= MUTEX_REGION_SIZE,
    "pthread_mutex_t must fit the reserved mutex region"
);

/// Handle to a mutex stored in shared memory.
///
/// The handle does not own the memory; whoever creates it guarantees that the
/// mapping outlives it.
#[derive(Debug)]
pub struct RobustMutex {
    #[cfg(target_os = "linux")]
    raw: *mut libc::pthread_mutex_t,
    #[cfg(not(target_os = "linux"))]
    _raw: *mut u8,
}

// SAFETY: the pthread mutex is designed to be shared between threads and
// processes; the pointer stays valid for the lifetime of the handle (see the
// constructors' contracts).
unsafe impl Send for RobustMutex {}

// SAFETY: all operations on the pointee go through pthread calls that are
// themselves thread-safe.
unsafe impl Sync for RobustMutex {}

/// Releases the lock on drop.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct RobustGuard<'a> {
    #[cfg(target_os = "linux")]
    mutex: &'a RobustMutex,
    #[cfg(not(target_os = "linux"))]
    _guard: parking_lot::MutexGuard<'a, ()>,
    recovered: bool,
}

impl RobustGuard<'_> {
    /// The previous owner died while holding the lock.
    pub fn recovered(&self) -> bool {
        self.recovered
    }
}

#[cfg(not(target_os = "linux"))]
static FALLBACK: parking_lot::Mutex<()> = parking_lot::const_mutex(());

#[cfg(target_os = "linux")]
impl RobustMutex {
    /// Initialize a fresh mutex in `MUTEX_REGION_SIZE` bytes at `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for writes of [`MUTEX_REGION_SIZE`] bytes, 8-byte
    /// aligned, not in use by any other process, and outlive the handle.
    pub unsafe fn init(ptr: *mut u8) -> TraceResult<Self> {
        std::ptr::write_bytes(ptr, 0, MUTEX_REGION_SIZE);
        let raw = ptr.cast::<libc::pthread_mutex_t>();

        let mut attr: libc::pthread_mutexattr_t = std::mem::zeroed();
        check(libc::pthread_mutexattr_init(&mut attr), "mutexattr_init")?;
        let configured = check(
            libc::pthread_mutexattr_settype(&mut attr, libc::PTHREAD_MUTEX_ERRORCHECK),
            "mutexattr_settype",
        )
        .and_then(|()| {
            check(
                libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED),
                "mutexattr_setpshared",
            )
        })
        .and_then(|()| {
            check(
                libc::pthread_mutexattr_setrobust(&mut attr, libc::PTHREAD_MUTEX_ROBUST),
                "mutexattr_setrobust",
            )
        })
        .and_then(|()| check(libc::pthread_mutex_init(raw, &attr), "mutex_init"));
        libc::pthread_mutexattr_destroy(&mut attr);
        configured?;

        Ok(Self { raw })
    }

    /// Attach to a mutex initialized earlier, possibly by another process.
    ///
    /// # Safety
    ///
    /// `ptr` must point to a mutex created by [`RobustMutex::init`] and
    /// outlive the handle.
    pub unsafe fn attach(ptr: *mut u8) -> Self {
        Self {
            raw: ptr.cast::<libc::pthread_mutex_t>(),
        }
    }

    /// Lock, waiting at most [`LOCK_TIMEOUT`].
    pub fn lock(&self) -> TraceResult<RobustGuard<'_>> {
        let deadline = deadline_after(LOCK_TIMEOUT)?;
        // SAFETY: `raw` points to an initialized mutex (constructor contract).
        let rc = unsafe { libc::pthread_mutex_timedlock(self.raw, &deadline) };
        match rc {
            0 => Ok(RobustGuard {
                mutex: self,
                recovered: false,
            }),
            libc::EOWNERDEAD => {
                tracing::warn!("previous ring buffer lock owner died, recovering the lock");
                // SAFETY: we own the mutex after EOWNERDEAD.
                let rc = unsafe { libc::pthread_mutex_consistent(self.raw) };
                if rc != 0 {
                    // SAFETY: still owned by us.
                    unsafe { libc::pthread_mutex_unlock(self.raw) };
                    return Err(lock_error("mutex_consistent", rc));
                }
                Ok(RobustGuard {
                    mutex: self,
                    recovered: true,
                })
            }
            libc::ETIMEDOUT => Err(TraceError::Lock(format!(
                "timed out after {:?} waiting for the ring buffer lock",
                LOCK_TIMEOUT
            ))),
            libc::EDEADLK => Err(TraceError::Lock(
                "ring buffer lock is already held by this thread".into(),
            )),
            other => Err(lock_error("mutex_timedlock", other)),
        }
    }
}

#[cfg(target_os = "linux")]
impl Drop for RobustGuard<'_> {
    fn drop(&mut self) {
        // SAFETY: the guard only exists while this thread holds the lock.
        unsafe { libc::pthread_mutex_unlock(self.mutex.raw) };
    }
}

#[cfg(target_os = "linux")]
fn deadline_after(timeout: Duration) -> TraceResult<libc::timespec> {
    let mut now = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `now` is a valid out-pointer.
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) };
    if rc != 0 {
        return Err(TraceError::Io(std::io::Error::last_os_error()));
    }
    let mut nanos = now.tv_nsec as i64 + i64::from(timeout.subsec_nanos());
    let mut secs = now.tv_sec as i64 + timeout.as_secs() as i64;
    if nanos >= 1_000_000_000 {
        nanos -= 1_000_000_000;
        secs += 1;
    }
    Ok(libc::timespec {
        tv_sec: secs as libc::time_t,
        tv_nsec: nanos as libc::c_long,
    })
}

#[cfg(target_os = "linux")]
fn check(rc: libc::c_int, what: &str) -> TraceResult<()> {
    if rc == 0 {
        Ok(())
    } else {
        Err(lock_error(what, rc))
    }
}

#[cfg(target_os = "linux")]
fn lock_error(what: &str, rc: libc::c_int) -> TraceError {
    TraceError::Lock(format!(
        "pthread_{what} failed: {}",
        std::io::Error::from_raw_os_error(rc)
    ))
}

#[cfg(not(target_os = "linux"))]
impl RobustMutex {
    /// Initialize a fresh mutex at `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for writes of [`MUTEX_REGION_SIZE`] bytes and
    /// outlive the handle.
    pub unsafe fn init(ptr: *mut u8) -> TraceResult<Self> {
        std::ptr::write_bytes(ptr, 0, MUTEX_REGION_SIZE);
        Ok(Self { _raw: ptr })
    }

    /// Attach to a mutex initialized earlier.
    ///
    /// # Safety
    ///
    /// `ptr` must outlive the handle.
    pub unsafe fn attach(ptr: *mut u8) -> Self {
        Self { _raw: ptr }
    }

    /// Lock, waiting at most [`LOCK_TIMEOUT`]. Only excludes threads of this
    /// process.
    pub fn lock(&self) -> TraceResult<RobustGuard<'_>> {
        let guard = FALLBACK.try_lock_for(LOCK_TIMEOUT).ok_or_else(|| {
            TraceError::Lock(format!(
                "timed out after {:?} waiting for the ring buffer lock",
                LOCK_TIMEOUT
            ))
        })?;
        Ok(RobustGuard {
            _guard: guard,
            recovered: false,
        })
    }
}
