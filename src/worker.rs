//! Worker threads.
//!
//! A worker owns up to eight session slots split into two halves under
//! independent locks, so the pool can assign into one half while the worker
//! services the other. Each pass over a half finds the I/O-ready sessions
//! (by polling their completion queues, or by an epoll sweep over their
//! wait descriptors under `-w`), compacts them to the front, promotes
//! sessions that have terminal-side work even without I/O, and runs the
//! ready prefix. A fixed-point moving average tracks contexts serviced per
//! loop.

use std::os::fd::BorrowedFd;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::sync::Arc;

use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use tracing::{trace, warn};

use crate::buffer::{BufArena, Buffer, BufId, BufList, XferKind};
use crate::config::RunCtx;
use crate::cxn::LoopCtl;
use crate::error::Result;
use crate::fabric::{AccessFlags, Cq, Fabric};
use crate::keys::KeySource;
use crate::pool::PoolShared;
use crate::session::Session;

/// Session slots per worker.
pub const WORKER_SESSIONS_MAX: usize = 8;

const HALF: usize = WORKER_SESSIONS_MAX / 2;
const PAYLIST_CAP: usize = 16;

/// Everything a session step may touch on its worker.
pub struct StepCtx<'a> {
    pub rc: &'a RunCtx,
    pub arena: &'a mut BufArena,
    pub pay: &'a mut PayBufs,
    pub keys: &'a mut KeySource,
}

/// Reservoirs of free payload buffers, replenished on demand with the
/// rotating capacity cycle 23, 29, 31, 37.
#[derive(Debug)]
pub struct PayBufs {
    tx: BufList,
    rx: BufList,
}

impl Default for PayBufs {
    fn default() -> Self {
        Self::new()
    }
}

impl PayBufs {
    pub fn new() -> Self {
        Self {
            tx: BufList::new(PAYLIST_CAP),
            rx: BufList::new(PAYLIST_CAP),
        }
    }

    /// Draw a transmit payload buffer, replenishing the reservoir when it
    /// runs dry.
    pub fn tx_get(
        &mut self,
        arena: &mut BufArena,
        rc: &RunCtx,
        keys: &mut KeySource,
    ) -> Result<Option<BufId>> {
        loop {
            if let Some(id) = self.tx.get() {
                trace!(target: "paybuf", "tx buf length {}", arena.get(id).nallocated());
                return Ok(Some(id));
            }
            if !replenish(&mut self.tx, AccessFlags::SEND, arena, rc, keys)? {
                return Ok(None);
            }
        }
    }

    /// Draw a receive payload buffer.
    pub fn rx_get(
        &mut self,
        arena: &mut BufArena,
        rc: &RunCtx,
        keys: &mut KeySource,
    ) -> Result<Option<BufId>> {
        loop {
            if let Some(id) = self.rx.get() {
                trace!(target: "paybuf", "rx buf length {}", arena.get(id).nallocated());
                return Ok(Some(id));
            }
            if !replenish(
                &mut self.rx,
                AccessFlags::RECV | AccessFlags::REMOTE_WRITE,
                arena,
                rc,
                keys,
            )? {
                return Ok(None);
            }
        }
    }
}

fn replenish(
    list: &mut BufList,
    access: AccessFlags,
    arena: &mut BufArena,
    rc: &RunCtx,
    keys: &mut KeySource,
) -> Result<bool> {
    if list.len() >= list.capacity() / 2 {
        return Ok(true);
    }

    let mut paylen = 0usize;
    while list.len() < list.capacity() / 2 {
        paylen = match paylen {
            23 => 29,
            29 => 31,
            31 => 37,
            _ => 23,
        };

        let mut buf = Buffer::bytes(XferKind::RdmaWrite, paylen);

        if !rc.cfg.reregister {
            match rc
                .domain
                .register(buf.base_addr(), buf.nallocated(), access, keys.next())
            {
                Ok(mr) => buf.mr = Some(mr),
                Err(e) => {
                    warn!(target: "memreg", "payload registration failed: {e}");
                    break;
                }
            }
        }

        trace!(target: "paybuflist", "pushing {paylen}-byte buffer");
        let id = arena.insert(buf);
        let _ = list.put(id);
    }

    Ok(!list.is_empty())
}

/// Fixed-point load average, 8 bits right of the point. Every loop adds the
/// ready count; every 65 536 loops the average folds in the accumulated
/// count and the per-loop extremes are logged.
#[derive(Debug)]
struct Load {
    average: u16,
    loops_since_mark: u16,
    ctxs_serviced_since_mark: u32,
    max_loop_contexts: i32,
    min_loop_contexts: i32,
}

impl Load {
    fn new() -> Self {
        Self {
            average: 0,
            loops_since_mark: 0,
            ctxs_serviced_since_mark: 0,
            max_loop_contexts: 0,
            min_loop_contexts: i32::MAX,
        }
    }

    fn update(&mut self, nready: i32) {
        if nready > self.max_loop_contexts {
            self.max_loop_contexts = nready;
        }
        if nready < self.min_loop_contexts {
            self.min_loop_contexts = nready;
        }

        self.ctxs_serviced_since_mark += nready as u32;

        if self.loops_since_mark < u16::MAX {
            self.loops_since_mark += 1;
        } else {
            self.average = ((self.average as u32
                + 256 * self.ctxs_serviced_since_mark / (u16::MAX as u32 + 1))
                / 2) as u16;
            trace!(
                target: "average",
                "average {}x{}",
                self.average / 256,
                self.average % 256
            );
            trace!(
                target: "average",
                "{} contexts in {} loops",
                self.ctxs_serviced_since_mark,
                self.loops_since_mark
            );
            trace!(
                target: "average",
                "{} to {} contexts per loop",
                self.min_loop_contexts,
                self.max_loop_contexts
            );
            self.loops_since_mark = 0;
            self.ctxs_serviced_since_mark = 0;
            self.max_loop_contexts = 0;
            self.min_loop_contexts = i32::MAX;
        }
    }
}

#[derive(Debug, Default)]
struct WorkerStats {
    loops_no_io_ready: u64,
    loops_no_session_ready: u64,
    loops_total: u64,
}

/// One half of a worker's session slots.
#[derive(Debug, Default)]
pub struct SessionHalf {
    pub slots: [Option<Session>; HALF],
}

/// Worker state shared with the pool.
pub struct WorkerShared {
    pub halves: [Mutex<SessionHalf>; 2],
    pub nsessions: [AtomicUsize; 2],
    /// Paired with the pool's state mutex.
    pub sleep: Condvar,
    pub shutting_down: AtomicBool,
    pub canceled: AtomicBool,
    pub failed: AtomicBool,
    /// Present in wait-descriptor mode.
    pub epoll: Option<Epoll>,
    /// The worker thread's pthread handle, for the wakeup signal.
    pub pthread: AtomicU64,
}

impl WorkerShared {
    pub fn new(waitfd: bool) -> Result<Self> {
        let epoll = if waitfd {
            Some(
                Epoll::new(EpollCreateFlags::empty())
                    .map_err(|e| crate::error::Error::Io(std::io::Error::from(e)))?,
            )
        } else {
            None
        };
        Ok(Self {
            halves: [Mutex::default(), Mutex::default()],
            nsessions: [AtomicUsize::new(0), AtomicUsize::new(0)],
            sleep: Condvar::new(),
            shutting_down: AtomicBool::new(false),
            canceled: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            epoll,
            pthread: AtomicU64::new(0),
        })
    }

    /// Try to place a session in an empty slot; non-blocking, so assignment
    /// never stalls a running worker.
    pub fn try_assign(&self, sess: Session) -> std::result::Result<(), Session> {
        for half in 0..2 {
            let Ok(mut guard) = self.halves[half].try_lock() else {
                continue;
            };
            let Some(at) = guard.slots.iter().position(|s| s.is_none()) else {
                continue;
            };

            if let Some(epoll) = &self.epoll {
                let cq = &sess.cxn.core().cq;
                if let Ok(fd) = cq.wait_fd() {
                    let _ = epoll.add(
                        unsafe { BorrowedFd::borrow_raw(fd) },
                        EpollEvent::new(EpollFlags::EPOLLIN, cq.id()),
                    );
                }
            }

            self.nsessions[half].fetch_add(1, Ordering::Relaxed);
            guard.slots[at] = Some(sess);
            return Ok(());
        }
        Err(sess)
    }
}

enum Readiness {
    /// Poll each slot's completion queue.
    Poll,
    /// The wait query refused; treat every occupied slot as ready.
    All,
    /// Queues whose wait descriptors reported readable.
    Ids(Vec<u64>),
}

/// Thread body of one worker.
pub(crate) fn worker_main(pool: Arc<PoolShared>, me: Arc<WorkerShared>, idx: usize, cpu: usize) {
    me.pthread
        .store(nix::sys::pthread::pthread_self() as u64, Ordering::Relaxed);

    if pool.pin_workers && !core_affinity::set_for_current(core_affinity::CoreId { id: cpu }) {
        warn!(target: "params", "could not pin worker {idx} to cpu {cpu}");
    }

    let mut arena = BufArena::new();
    let mut pay = PayBufs::new();
    let mut keys = KeySource::new();
    let mut load = Load::new();
    let mut stats = WorkerStats::default();

    while !me.shutting_down.load(Ordering::Relaxed) {
        idle_loop(&pool, &me, idx);
        loop {
            run_loop(
                &pool, &me, &mut arena, &mut pay, &mut keys, &mut load, &mut stats,
            );
            if is_idle(&pool, &me, idx) || me.shutting_down.load(Ordering::Relaxed) {
                break;
            }
        }
    }

    trace!(target: "worker_stats", "worker {idx} {} loops no I/O ready", stats.loops_no_io_ready);
    trace!(
        target: "worker_stats",
        "worker {idx} {} loops no session ready",
        stats.loops_no_session_ready
    );
    trace!(target: "worker_stats", "worker {idx} {} loops total", stats.loops_total);
}

fn idle_loop(pool: &PoolShared, me: &WorkerShared, idx: usize) {
    let mut st = pool.state.lock().unwrap();
    while st.nrunning <= idx && !me.shutting_down.load(Ordering::Relaxed) {
        st = me.sleep.wait(st).unwrap();
    }
}

/// An unassigned worker that is also the most recently started running one
/// retires itself from the running count and reports to the pool.
fn is_idle(pool: &PoolShared, me: &WorkerShared, idx: usize) -> bool {
    if me.nsessions[0].load(Ordering::Relaxed) != 0
        || me.nsessions[1].load(Ordering::Relaxed) != 0
    {
        return false;
    }

    let Ok(mut st) = pool.state.try_lock() else {
        return false;
    };
    if st.nrunning != idx + 1 {
        return false;
    }

    let Ok(_h0) = me.halves[0].try_lock() else {
        return false;
    };
    let Ok(_h1) = me.halves[1].try_lock() else {
        return false;
    };

    let idle = me.nsessions[0].load(Ordering::Relaxed) == 0
        && me.nsessions[1].load(Ordering::Relaxed) == 0;
    if idle {
        st.nrunning -= 1;
        pool.nworkers_cond.notify_one();
    }
    idle
}

fn run_loop(
    pool: &PoolShared,
    me: &WorkerShared,
    arena: &mut BufArena,
    pay: &mut PayBufs,
    keys: &mut KeySource,
    load: &mut Load,
    stats: &mut WorkerStats,
) {
    let rc = &*pool.rc;
    let cancel = rc.cfg.cancel;

    for half in 0..2 {
        let Ok(mut guard) = me.halves[half].try_lock() else {
            continue;
        };

        let readiness = half_readiness(me, &guard);

        // Compact I/O-ready sessions to the front of the half.
        let mut nio = 0usize;
        for i in 0..HALF {
            let ready = match (&guard.slots[i], &readiness) {
                (None, _) => false,
                (Some(s), Readiness::Poll) => s.cxn.core().cq.ready(),
                (Some(_), Readiness::All) => true,
                (Some(s), Readiness::Ids(ids)) => ids.contains(&s.cxn.core().cq.id()),
            };
            if ready {
                guard.slots.swap(i, nio);
                nio += 1;
            }
        }

        load.update(nio as i32);

        // Promote sessions with terminal-side work: first message unsent,
        // buffers waiting for the terminal, or cancellation pending.
        let mut nready = nio;
        for i in nready..HALF {
            let promote = match &guard.slots[i] {
                None => false,
                Some(s) => {
                    !s.cxn.core().sent_first
                        || !s.ready_for_terminal.empty()
                        || cancel.load(Ordering::Relaxed)
                }
            };
            if promote {
                guard.slots.swap(i, nready);
                nready += 1;
            }
        }

        stats.loops_total += 1;
        if nio == 0 {
            stats.loops_no_io_ready += 1;
        }
        if nready == nio {
            stats.loops_no_session_ready += 1;
        }

        // Service the ready prefix.
        for i in 0..nready {
            let Some(sess) = guard.slots[i].as_mut() else {
                continue;
            };

            let mut ctx = StepCtx {
                rc,
                arena: &mut *arena,
                pay: &mut *pay,
                keys: &mut *keys,
            };
            let ctl = match sess.step(&mut ctx) {
                Ok(ctl) => ctl,
                Err(e) => {
                    warn!(target: "err", "session failed: {e}");
                    LoopCtl::Error
                }
            };

            match ctl {
                LoopCtl::Continue => continue,
                LoopCtl::End => {}
                LoopCtl::Canceled => me.canceled.store(true, Ordering::Relaxed),
                LoopCtl::Error => me.failed.store(true, Ordering::Relaxed),
            }

            let sess = guard.slots[i].take().unwrap();
            if let Some(epoll) = &me.epoll {
                if let Ok(fd) = sess.cxn.core().cq.wait_fd() {
                    let _ = epoll.delete(unsafe { BorrowedFd::borrow_raw(fd) });
                }
            }
            me.nsessions[half].fetch_sub(1, Ordering::Relaxed);
            drop(sess);
        }
    }
}

/// Decide how to find the half's ready sessions: poll, an epoll sweep, or
/// (when waiting would sleep past queued completions) treat all as ready.
fn half_readiness(me: &WorkerShared, guard: &SessionHalf) -> Readiness {
    let Some(epoll) = &me.epoll else {
        return Readiness::Poll;
    };

    let cqs: Vec<Cq> = guard
        .slots
        .iter()
        .flatten()
        .map(|s| s.cxn.core().cq.clone())
        .collect();
    let refs: Vec<&Cq> = cqs.iter().collect();
    if !Fabric::trywait(&refs) {
        return Readiness::All;
    }

    let mut events = [EpollEvent::empty(); WORKER_SESSIONS_MAX];
    match epoll.wait(&mut events, EpollTimeout::ZERO) {
        Ok(n) => Readiness::Ids(events[..n].iter().map(|e| e.data()).collect()),
        Err(_) => Readiness::All,
    }
}

impl std::fmt::Debug for WorkerShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerShared")
            .field("nsessions", &self.nsessions)
            .field("shutting_down", &self.shutting_down)
            .field("canceled", &self.canceled)
            .field("failed", &self.failed)
            .finish_non_exhaustive()
    }
}
