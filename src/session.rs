//! A session: one connection, one terminal, and the two FIFOs linking them.
//!
//! `ready_for_cxn` carries buffers ready for the connection (filled payload
//! awaiting write on a sender; empty buffers to advertise on a receiver);
//! `ready_for_terminal` carries buffers ready for the terminal (drained
//! payload on a sender; filled buffers to verify on a receiver).

use tracing::trace;

use crate::buffer::BufId;
use crate::cxn::{Conn, LoopCtl};
use crate::error::Result;
use crate::fifo::Fifo;
use crate::terminal::Terminal;
use crate::worker::StepCtx;

const SESSION_FIFO_DEPTH: usize = 64;

#[derive(Debug)]
pub struct Session {
    pub cxn: Conn,
    pub term: Terminal,
    pub ready_for_cxn: Fifo<BufId>,
    pub ready_for_terminal: Fifo<BufId>,
}

impl Session {
    pub fn new(cxn: Conn, term: Terminal) -> Self {
        Self {
            cxn,
            term,
            ready_for_cxn: Fifo::new(SESSION_FIFO_DEPTH),
            ready_for_terminal: Fifo::new(SESSION_FIFO_DEPTH),
        }
    }

    /// One scheduler pass: run the terminal's trade, then the connection's
    /// step. The endpoint is closed here on end-of-loop and on any error,
    /// so the teardown path is the same for protocol completion, terminal
    /// failure, and cancellation.
    pub fn step(&mut self, ctx: &mut StepCtx<'_>) -> Result<LoopCtl> {
        trace!(target: "session_loop", "going around");

        if let Err(e) = self.term.trade(
            ctx.arena,
            &mut self.ready_for_terminal,
            &mut self.ready_for_cxn,
        ) {
            self.cxn.core().ep.close();
            return Err(e);
        }

        let ctl = match self
            .cxn
            .step(ctx, &mut self.ready_for_cxn, &mut self.ready_for_terminal)
        {
            Ok(ctl) => ctl,
            Err(e) => {
                self.cxn.core().ep.close();
                return Err(e);
            }
        };

        if ctl == LoopCtl::End {
            self.cxn.core().ep.close();
            trace!(target: "close", "session: closed.");
        }

        Ok(ctl)
    }
}
