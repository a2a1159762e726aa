//! The worker pool.
//!
//! A global registry assigns new sessions to the most recently started
//! running worker whose lock yields without blocking, falls back to waking
//! the next unallocated worker, and spawns a new pinned worker when neither
//! takes the session. Shutdown suspends assignment, waits for every worker
//! to report idle, then flags and joins them all; per-worker failed and
//! canceled status folds into the exit code.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Condvar, Mutex, Once};
use std::thread::JoinHandle;

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use tracing::{trace, warn};

use crate::config::RunCtx;
use crate::error::{Error, Result};
use crate::session::Session;
use crate::worker::{worker_main, WorkerShared};

/// Hard ceiling on worker threads.
pub const WORKERS_MAX: usize = 128;

#[derive(Debug)]
pub struct PoolState {
    /// Allocated workers; the first `nrunning` are running, the rest sleep.
    pub workers: Vec<Arc<WorkerShared>>,
    pub nrunning: usize,
    pub suspended: bool,
    nextcpu: usize,
}

/// Pool state shared with every worker thread.
#[derive(Debug)]
pub struct PoolShared {
    pub state: Mutex<PoolState>,
    /// Signaled when a worker retires from the running count.
    pub nworkers_cond: Condvar,
    pub rc: Arc<RunCtx>,
    pub pin_workers: bool,
    processors: (usize, usize),
}

pub struct WorkerPool {
    shared: Arc<PoolShared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

/// The wakeup signal must have a handler installed before any worker can be
/// signaled out of a descriptor wait.
extern "C" fn handle_wakeup(_signum: libc::c_int) {}

fn install_wakeup_handler() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let sa = SigAction::new(
            SigHandler::Handler(handle_wakeup),
            SaFlags::empty(),
            SigSet::empty(),
        );
        unsafe {
            let _ = signal::sigaction(Signal::SIGUSR1, &sa);
        }
    });
}

impl WorkerPool {
    pub fn new(rc: Arc<RunCtx>, pin_workers: bool) -> Self {
        if rc.cfg.waitfd {
            install_wakeup_handler();
        }

        let ncores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let last = rc.cfg.processors.1.min(ncores - 1);
        let first = rc.cfg.processors.0.min(last);

        Self {
            shared: Arc::new(PoolShared {
                state: Mutex::new(PoolState {
                    workers: Vec::new(),
                    nrunning: 0,
                    suspended: false,
                    nextcpu: first,
                }),
                nworkers_cond: Condvar::new(),
                rc,
                pin_workers,
                processors: (first, last),
            }),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Assign `sess` to a worker, spawning one if every running and
    /// unallocated worker refuses.
    pub fn assign(&self, mut sess: Session) -> Result<()> {
        loop {
            {
                let mut st = self.shared.state.lock().unwrap();

                if st.suspended {
                    return Err(Error::Exhausted("worker assignment suspended"));
                }

                // Running workers, most recently started first.
                for i in (0..st.nrunning).rev() {
                    let w = Arc::clone(&st.workers[i]);
                    match w.try_assign(sess) {
                        Ok(()) => {
                            self.wake_waiter(&w);
                            return Ok(());
                        }
                        Err(back) => sess = back,
                    }
                }

                // The next unallocated worker, woken on acceptance.
                if st.nrunning < st.workers.len() {
                    let w = Arc::clone(&st.workers[st.nrunning]);
                    match w.try_assign(sess) {
                        Ok(()) => {
                            st.nrunning += 1;
                            w.sleep.notify_one();
                            self.wake_waiter(&w);
                            return Ok(());
                        }
                        Err(back) => sess = back,
                    }
                }
            }

            self.create_worker()?;
        }
    }

    /// Interrupt a worker blocked in its descriptor wait so it picks the
    /// new session up immediately.
    fn wake_waiter(&self, w: &WorkerShared) {
        if !self.shared.rc.cfg.waitfd {
            return;
        }
        let thread = w.pthread.load(Ordering::Relaxed);
        if thread == 0 {
            return;
        }
        if let Err(e) =
            nix::sys::pthread::pthread_kill(thread as libc::pthread_t, Signal::SIGUSR1)
        {
            warn!(target: "signal", "could not signal worker thread: {e}");
        }
    }

    fn create_worker(&self) -> Result<()> {
        let mut st = self.shared.state.lock().unwrap();

        if st.workers.len() == WORKERS_MAX {
            return Err(Error::Exhausted("worker table"));
        }

        let idx = st.workers.len();
        let shared = Arc::new(WorkerShared::new(self.shared.rc.cfg.waitfd)?);
        st.workers.push(Arc::clone(&shared));

        let cpu = st.nextcpu;
        let (first, last) = self.shared.processors;
        st.nextcpu = if cpu >= last { first } else { cpu + 1 };
        drop(st);

        let pool = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name(format!("fabxfer-worker-{idx}"))
            .spawn(move || worker_main(pool, shared, idx, cpu))?;
        self.handles.lock().unwrap().push(handle);

        trace!(target: "params", "created worker {idx} on cpu {cpu}");
        Ok(())
    }

    /// Suspend assignment, wait for all workers to go idle, shut them down,
    /// and fold their status into the result.
    pub fn join_all(self, expect_cancellation: bool) -> Result<()> {
        {
            let mut st = self.shared.state.lock().unwrap();
            st.suspended = true;

            while st.nrunning > 0 {
                st = self.shared.nworkers_cond.wait(st).unwrap();
            }

            for w in &st.workers {
                w.shutting_down.store(true, Ordering::Relaxed);
                w.sleep.notify_one();
            }
        }

        let mut ok = true;
        for handle in self.handles.into_inner().unwrap() {
            if handle.join().is_err() {
                ok = false;
            }
        }

        let st = self.shared.state.lock().unwrap();
        for w in st.workers.iter() {
            if w.failed.load(Ordering::Relaxed)
                || w.canceled.load(Ordering::Relaxed) != expect_cancellation
            {
                ok = false;
            }
        }

        if ok {
            Ok(())
        } else {
            Err(Error::WorkersFailed)
        }
    }
}
