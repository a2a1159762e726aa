//! Receiver connection: the RDMA target side.
//!
//! The receiver acks the sender's initial message, then advertises empty
//! payload buffers as RDMA target vectors, tracks the sender's progress
//! reports against the targets in the order they were advertised, and hands
//! each filled target to the sink. Remote EOF is an `nleftover == 0`
//! progress report; the receiver answers with an empty vector
//! advertisement and ends once both closes are seen and its posted queues
//! drain.

use tracing::trace;

use crate::buffer::{Buffer, BufArena, BufId, XferKind};
use crate::ctl::{RxCtl, TxCtl};
use crate::cxn::{close_ep, ctx_is_cancelled, CxnCore, LoopCtl, SplitMsgSlot, CTX_ACK};
use crate::error::{Error, Result};
use crate::fabric::{AccessFlags, RmaIov};
use crate::fifo::Fifo;
use crate::message::{ProgressMsg, VectorMsg, PROGRESS_MSG_SIZE, VECTOR_IOVS_MAX, VECTOR_MSG_MAX};
use crate::worker::StepCtx;

const CTL_DEPTH: usize = 64;
const VEC_POOL: usize = 16;

/// Receiver-side connection state.
#[derive(Debug)]
pub struct Rcvr {
    pub core: CxnCore,
    /// Bytes reported written but not yet attributed to a target.
    nfull: usize,
    /// Posted RDMA target buffers, in order of issuance.
    tgtposted: Fifo<BufId>,
    ack: SplitMsgSlot,
    vec: TxCtl,
    progress: RxCtl,
}

impl Rcvr {
    pub fn new(core: CxnCore, ack: SplitMsgSlot) -> Self {
        Self {
            core,
            nfull: 0,
            tgtposted: Fifo::new(CTL_DEPTH),
            ack,
            vec: TxCtl::new(CTL_DEPTH, VEC_POOL),
            progress: RxCtl::new(CTL_DEPTH),
        }
    }

    pub fn step(
        &mut self,
        ctx: &mut StepCtx<'_>,
        ready_for_cxn: &mut Fifo<BufId>,
        ready_for_terminal: &mut Fifo<BufId>,
    ) -> Result<LoopCtl> {
        if !self.core.sent_first && self.ack_send()? == LoopCtl::Continue {
            self.cq_process(ctx)?;
            return Ok(LoopCtl::Continue);
        }

        if !self.core.started {
            return self.start(ctx, ready_for_cxn);
        }

        self.cq_process(ctx)?;

        if self.core.cancelled {
            if self.progress.posted.empty() && self.vec.posted.empty() {
                close_ep(&self.core.ep, "rcvr");
                return Ok(LoopCtl::Canceled);
            }
            return Ok(LoopCtl::Continue);
        } else if ctx.rc.cfg.cancel.load(std::sync::atomic::Ordering::Relaxed) {
            self.progress.cancel(ctx.arena, &self.core.ep);
            self.vec.cancel(ctx.arena, &self.core.ep);
            self.core.cancelled = true;
            return Ok(LoopCtl::Continue);
        }

        self.vector_update(ctx, ready_for_cxn)?;

        self.vec
            .transmit(ctx.arena, &self.core.ep, self.core.peer)?;

        self.targets_read(ctx, ready_for_terminal);

        if ready_for_terminal.eoget()
            && self.core.eof.remote
            && self.core.eof.local
            && self.vec.posted.empty()
        {
            return Ok(LoopCtl::End);
        }

        Ok(LoopCtl::Continue)
    }

    /// Send the ack once; `Continue` means the provider deferred it.
    fn ack_send(&mut self) -> Result<LoopCtl> {
        self.ack.arm(XferKind::Ack);

        match self
            .core
            .ep
            .sendmsg(&self.ack.iovs, self.core.peer, CTX_ACK)
        {
            Ok(()) => {
                self.core.sent_first = true;
                Ok(LoopCtl::End)
            }
            Err(Error::TryAgain) => {
                trace!(target: "txdefer", "deferred ack transmission");
                Ok(LoopCtl::Continue)
            }
            Err(e) => Err(e),
        }
    }

    /// First running step: build the vector-message pool, post the progress
    /// receive batch, and prime the session with empty payload buffers.
    fn start(&mut self, ctx: &mut StepCtx<'_>, ready_for_cxn: &mut Fifo<BufId>) -> Result<LoopCtl> {
        self.core.started = true;

        while self.vec.pool.len() < self.vec.pool.capacity() {
            let mut buf = Buffer::bytes(XferKind::Vector, VECTOR_MSG_MAX);
            let mr = ctx.rc.domain.register(
                buf.base_addr(),
                buf.nallocated(),
                AccessFlags::SEND,
                self.core.keys.next(),
            )?;
            buf.mr = Some(mr);
            let id = ctx.arena.insert(buf);
            self.vec
                .pool
                .put(id)
                .map_err(|_| Error::Exhausted("vector buffer pool"))?;
        }

        while !self.progress.posted.full() {
            let id = ctx
                .arena
                .insert(Buffer::bytes(XferKind::Progress, PROGRESS_MSG_SIZE));
            self.progress.post(ctx.arena, &self.core.ep, id)?;
        }

        let mut nleftover = crate::terminal::PATTERN.len();
        while nleftover > 0 {
            let Some(id) = ctx.pay.rx_get(ctx.arena, ctx.rc, ctx.keys)? else {
                trace!(target: "err", "could not get a payload buffer");
                return Err(Error::Exhausted("rx payload reservoir"));
            };
            let buf = ctx.arena.get_mut(id);
            buf.nused = nleftover.min(buf.nallocated());
            nleftover -= buf.nused;
            if ready_for_cxn.put(id).is_err() {
                return Err(Error::Exhausted("ready-for-connection FIFO"));
            }
        }

        Ok(LoopCtl::Continue)
    }

    /// Drain one completion and dispatch it by its context's type tag.
    fn cq_process(&mut self, ctx: &mut StepCtx<'_>) -> Result<()> {
        let cmpl = {
            let arena = &*ctx.arena;
            let ack = &self.ack.xfc;
            match self
                .core
                .cq_read(|c| ctx_is_cancelled(arena, None, Some(ack), c))?
            {
                Some(cmpl) => cmpl,
                None => return Ok(()),
            }
        };

        let kind = if cmpl.ctx == CTX_ACK {
            XferKind::Ack
        } else if ctx.arena.contains(cmpl.ctx) {
            ctx.arena.get(BufId::from_ctx(cmpl.ctx)).xfc.kind
        } else {
            return Err(Error::Protocol(format!(
                "completion for unknown context {:#x}",
                cmpl.ctx
            )));
        };

        match kind {
            XferKind::Progress => {
                trace!(target: "completion", "read a progress rx completion");
                self.progress_rx_process(ctx.arena, &cmpl)
            }
            XferKind::Vector => {
                trace!(target: "completion", "read a vector tx completion");
                self.vec.complete(ctx.arena, &cmpl)
            }
            XferKind::Ack => {
                trace!(target: "completion", "read an ack tx completion");
                Ok(())
            }
            _ => Err(Error::Protocol("unexpected xfer context type".into())),
        }
    }

    fn progress_rx_process(
        &mut self,
        arena: &mut BufArena,
        cmpl: &crate::fabric::Completion,
    ) -> Result<()> {
        let id = self.progress.complete(arena, cmpl)?;

        if arena.get(id).xfc.cancelled {
            arena.remove(id);
            return Ok(());
        }

        if arena.get(id).nused != PROGRESS_MSG_SIZE {
            // Not well-formed; put the buffer back to work.
            return self.progress.post(arena, &self.core.ep, id);
        }

        let msg = ProgressMsg::decode(&arena.get(id).payload()[..PROGRESS_MSG_SIZE])?;
        trace!(
            target: "msg",
            "received progress message, {} bytes filled, {} bytes leftover",
            msg.nfilled,
            msg.nleftover
        );

        self.nfull += msg.nfilled as usize;

        if msg.nleftover == 0 {
            trace!(target: "proto_progress", "received remote EOF");
            self.core.eof.remote = true;
        }

        self.progress.post(arena, &self.core.ep, id)
    }

    /// Advertise empty payload buffers as RDMA target vectors; after remote
    /// EOF, advertise the empty end-of-stream vector once.
    fn vector_update(
        &mut self,
        ctx: &mut StepCtx<'_>,
        ready_for_cxn: &mut Fifo<BufId>,
    ) -> Result<()> {
        if self.core.eof.remote {
            if !self.core.eof.local && !self.vec.ready.full() {
                if let Some(vid) = self.vec.pool.get() {
                    let buf = ctx.arena.get_mut(vid);
                    let msg = VectorMsg::eof();
                    msg.encode_to(buf.payload_mut());
                    buf.nused = msg.wire_len();
                    let _ = self.vec.ready.put(vid);
                    self.core.eof.local = true;
                    trace!(target: "proto_vector", "rcvr enqueued local EOF");
                }
            }
            // Send no more non-empty vectors after the remote closes.
            return Ok(());
        }

        while !self.vec.ready.full() && !ready_for_cxn.empty() {
            let Some(vid) = self.vec.pool.get() else {
                break;
            };

            let mut iovs = Vec::with_capacity(VECTOR_IOVS_MAX);
            while iovs.len() < VECTOR_IOVS_MAX {
                let Some(id) = ready_for_cxn.get() else {
                    break;
                };
                let reregister = ctx.rc.cfg.reregister;
                let buf = ctx.arena.get_mut(id);
                buf.nused = 0;

                if reregister {
                    let mr = ctx.rc.domain.register(
                        buf.base_addr(),
                        buf.nallocated(),
                        AccessFlags::RECV | AccessFlags::REMOTE_WRITE,
                        self.core.keys.next(),
                    )?;
                    buf.mr = Some(mr);
                }

                let key = buf
                    .mr
                    .as_ref()
                    .ok_or_else(|| Error::Registration("payload buffer is unregistered".into()))?
                    .key();
                iovs.push(RmaIov {
                    addr: 0,
                    len: buf.nallocated() as u64,
                    key,
                });

                self.tgtposted
                    .put(id)
                    .map_err(|_| Error::Exhausted("RDMA targets FIFO"))?;
            }

            let msg = VectorMsg::new(iovs);
            let buf = ctx.arena.get_mut(vid);
            msg.encode_to(buf.payload_mut());
            buf.nused = msg.wire_len();
            let _ = self.vec.ready.put(vid);
            trace!(target: "proto_vector", "rcvr enqueued vector, {} targets", msg.iovs.len());
        }

        Ok(())
    }

    /// Attribute reported progress to posted targets in issuance order; a
    /// filled target (or, at remote EOF, a partial one) goes to the sink.
    fn targets_read(&mut self, ctx: &mut StepCtx<'_>, ready_for_terminal: &mut Fifo<BufId>) {
        while self.nfull > 0 && !ready_for_terminal.alt_full() {
            let Some(&id) = self.tgtposted.peek() else {
                break;
            };
            let buf = ctx.arena.get_mut(id);

            if buf.nused + self.nfull < buf.nallocated() {
                buf.nused += self.nfull;
                self.nfull = 0;
            } else {
                self.nfull -= buf.nallocated() - buf.nused;
                buf.nused = buf.nallocated();
                if ctx.rc.cfg.reregister {
                    buf.mr = None;
                }
                let _ = self.tgtposted.get();
                let _ = ready_for_terminal.alt_put(id);
            }
        }

        // The remote does not necessarily close on a target boundary; at
        // EOF, flush a partially filled head target to the sink.
        if self.core.eof.remote {
            if let Some(&id) = self.tgtposted.peek() {
                let buf = ctx.arena.get_mut(id);
                if buf.nused != 0 {
                    if ctx.rc.cfg.reregister {
                        buf.mr = None;
                    }
                    let _ = self.tgtposted.get();
                    let _ = ready_for_terminal.alt_put(id);
                }
            }
        }
    }
}
