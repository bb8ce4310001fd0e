//! Unix signal plumbing.
//!
//! Everything platform-specific about signals lives here so the scheduler and
//! worker modules stay free of raw handler code: masking SIGINT around worker
//! construction, the worker-side suspendable clock, and process-group kills.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal};
use nix::unistd::Pid;

/// RAII guard blocking a set of signals on the current thread.
///
/// Used around worker spawning: the child inherits the spawning thread's
/// signal mask across `exec`, so blocking SIGINT here guarantees the worker
/// starts with interrupts blocked while the parent alone handles them. The
/// previous mask is restored on every exit path when the guard drops.
pub struct BlockedSignals {
    prev: SigSet,
}

/// Block `signals` on the current thread until the returned guard is dropped.
pub fn blocked(signals: &[Signal]) -> io::Result<BlockedSignals> {
    let mut set = SigSet::empty();
    for sig in signals {
        set.add(*sig);
    }
    let mut prev = SigSet::empty();
    signal::pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&set), Some(&mut prev))
        .map_err(io::Error::from)?;
    Ok(BlockedSignals { prev })
}

impl Drop for BlockedSignals {
    fn drop(&mut self) {
        let _ = signal::pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&self.prev), None);
    }
}

/// Send `sig` to a single process. Returns `false` if the process is already
/// gone (ESRCH), which callers treat as a no-op.
pub fn send(pid: Pid, sig: Signal) -> io::Result<bool> {
    match signal::kill(pid, sig) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(errno) => Err(errno.into()),
    }
}

/// SIGKILL an entire process group.
///
/// Workers call `setsid()` at startup, so their pid doubles as the process
/// group id and this takes down any grandchildren they spawned.
pub fn kill_process_group(pid: Pid) -> io::Result<bool> {
    match signal::killpg(pid, Signal::SIGKILL) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(errno) => Err(errno.into()),
    }
}

// Suspendable-clock state. Only async-signal-safe operations touch these:
// clock_gettime and atomic stores/loads.
static STOPPED_AT_NS: AtomicU64 = AtomicU64::new(0);
static SUSPENDED_NS: AtomicU64 = AtomicU64::new(0);

fn monotonic_ns() -> u64 {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

fn record_stop(now_ns: u64) {
    STOPPED_AT_NS.store(now_ns, Ordering::SeqCst);
}

fn record_cont(now_ns: u64) {
    let stopped = STOPPED_AT_NS.swap(0, Ordering::SeqCst);
    if stopped != 0 {
        SUSPENDED_NS.fetch_add(now_ns.saturating_sub(stopped), Ordering::SeqCst);
    }
}

extern "C" fn on_sigtstp(_: libc::c_int) {
    record_stop(monotonic_ns());
    // SIGSTOP cannot be caught, so this reliably stops us right here.
    unsafe {
        libc::raise(libc::SIGSTOP);
    }
}

extern "C" fn on_sigcont(_: libc::c_int) {
    record_cont(monotonic_ns());
}

/// Worker-side elapsed clock that pauses while the process is stopped.
///
/// Installing the clock replaces the SIGTSTP handler with one that records
/// the stop instant and re-raises a real stop, and the SIGCONT handler with
/// one that accumulates the stopped interval. The reported elapsed time of an
/// action therefore reflects only active execution.
pub struct SuspendClock {
    started: Instant,
}

impl SuspendClock {
    /// Install the handlers and start the clock.
    pub fn install() -> io::Result<SuspendClock> {
        STOPPED_AT_NS.store(0, Ordering::SeqCst);
        SUSPENDED_NS.store(0, Ordering::SeqCst);

        let stop = SigAction::new(
            SigHandler::Handler(on_sigtstp),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        let cont = SigAction::new(
            SigHandler::Handler(on_sigcont),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        unsafe {
            signal::sigaction(Signal::SIGTSTP, &stop).map_err(io::Error::from)?;
            signal::sigaction(Signal::SIGCONT, &cont).map_err(io::Error::from)?;
        }
        Ok(SuspendClock {
            started: Instant::now(),
        })
    }

    /// Total time spent stopped so far.
    pub fn suspended(&self) -> Duration {
        Duration::from_nanos(SUSPENDED_NS.load(Ordering::SeqCst))
    }

    /// Wall-clock elapsed since installation, minus stopped intervals.
    pub fn active_elapsed(&self) -> Duration {
        self.started.elapsed().saturating_sub(self.suspended())
    }
}

impl Drop for SuspendClock {
    fn drop(&mut self) {
        let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
        unsafe {
            let _ = signal::sigaction(Signal::SIGTSTP, &default);
            let _ = signal::sigaction(Signal::SIGCONT, &default);
        }
    }
}
