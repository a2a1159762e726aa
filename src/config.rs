//! Run configuration.

use std::sync::atomic::AtomicBool;

use crate::fabric::Domain;

/// Process-global cancel flag; signal handlers set it, connection loops
/// poll it. Embedded runs may substitute their own flag via
/// [`RunConfig::with_cancel_flag`].
pub static CANCELLED: AtomicBool = AtomicBool::new(false);

/// User-facing configuration of one personality run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Listener bind address (`get` personality).
    pub bind: Option<String>,
    /// Destination address (`put` personality).
    pub dest: Option<String>,
    /// Number of parallel sessions.
    pub nsessions: usize,
    /// Cap writes to one remote segment.
    pub contiguous: bool,
    /// Re-register payload buffers per write.
    pub reregister: bool,
    /// Wait on completion-queue descriptors instead of polling.
    pub waitfd: bool,
    /// A clean exit requires the workers to have been canceled.
    pub expect_cancellation: bool,
    /// Inclusive CPU range workers are pinned to.
    pub processors: (usize, usize),
    /// The cancel flag connection loops poll.
    pub cancel: &'static AtomicBool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            bind: None,
            dest: None,
            nsessions: 1,
            contiguous: false,
            reregister: false,
            waitfd: false,
            expect_cancellation: false,
            processors: (0, usize::MAX),
            cancel: &CANCELLED,
        }
    }
}

impl RunConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bind(mut self, bind: impl Into<String>) -> Self {
        self.bind = Some(bind.into());
        self
    }

    pub fn with_dest(mut self, dest: impl Into<String>) -> Self {
        self.dest = Some(dest.into());
        self
    }

    pub fn with_nsessions(mut self, nsessions: usize) -> Self {
        self.nsessions = nsessions;
        self
    }

    pub fn with_contiguous(mut self, contiguous: bool) -> Self {
        self.contiguous = contiguous;
        self
    }

    pub fn with_reregister(mut self, reregister: bool) -> Self {
        self.reregister = reregister;
        self
    }

    pub fn with_waitfd(mut self, waitfd: bool) -> Self {
        self.waitfd = waitfd;
        self
    }

    pub fn with_expect_cancellation(mut self, expect: bool) -> Self {
        self.expect_cancellation = expect;
        self
    }

    pub fn with_processors(mut self, first: usize, last: usize) -> Self {
        self.processors = (first, last);
        self
    }

    pub fn with_cancel_flag(mut self, cancel: &'static AtomicBool) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Segment limits resolved against the opened fabric.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub mr_maxsegs: usize,
    pub rx_maxsegs: usize,
    pub tx_maxsegs: usize,
    pub rma_maxsegs: usize,
}

/// Everything a worker needs to service sessions.
#[derive(Debug)]
pub struct RunCtx {
    pub cfg: RunConfig,
    pub limits: Limits,
    pub domain: Domain,
}
