//! Sender connection: the RDMA initiator side.
//!
//! The sender opens with the initial message, waits for the receiver's ack,
//! then streams payload buffers into the receiver's advertised targets with
//! one-sided writes, fragmenting a buffer across a write window only when no
//! further advertisements can arrive. Progress reports follow the writes;
//! `nleftover == 0` is the sender's close.

use tracing::trace;

use crate::buffer::{Buffer, BufArena, BufId, BufList, Owner, Place, XferKind};
use crate::ctl::{fifo_cancel, RxCtl, TxCtl};
use crate::cxn::{
    check_flags, close_ep, ctx_is_cancelled, CxnCore, LoopCtl, MsgSlot, CTX_ACK, CTX_INITIAL,
};
use crate::error::{Error, Result};
use crate::fabric::{AccessFlags, Completion, PeerAddr, RmaIov, Sge, RX_MSG_FLAGS, WR_FLAGS};
use crate::fifo::Fifo;
use crate::message::{
    AckMsg, ProgressMsg, VectorMsg, ACK_MSG_SIZE, PROGRESS_MSG_SIZE, VECTOR_IOVS_MAX,
};
use crate::worker::StepCtx;

const CTL_DEPTH: usize = 64;
const WR_DEPTH: usize = 64;
const PROGRESS_POOL: usize = 16;
const FRAGMENT_POOL: usize = 64;

/// Sender-side connection state.
#[derive(Debug)]
pub struct Xmtr {
    pub core: CxnCore,
    /// Posted RDMA writes, in order of issuance.
    wrposted: Fifo<BufId>,
    /// Bytes retired since the last progress report.
    bytes_progress: usize,
    /// Vector-message receive control and the unload queue.
    vec: RxCtl,
    vec_rcvd: Fifo<BufId>,
    progress: TxCtl,
    initial: MsgSlot,
    ack: MsgSlot,
    fragment_pool: BufList,
    /// Offset into the buffer at the head of `ready_for_cxn`; nonzero while
    /// that buffer is being written out in fragments.
    fragment_offset: usize,
    /// Residual remote targets, oldest first.
    riovs: Vec<RmaIov>,
    /// Resume index into the vector message being unloaded.
    next_riov: usize,
    rcvd_ack: bool,
}

impl Xmtr {
    pub fn new(core: CxnCore, initial: MsgSlot, ack: MsgSlot) -> Self {
        Self {
            core,
            wrposted: Fifo::new(WR_DEPTH),
            bytes_progress: 0,
            vec: RxCtl::new(CTL_DEPTH),
            vec_rcvd: Fifo::new(CTL_DEPTH),
            progress: TxCtl::new(CTL_DEPTH, PROGRESS_POOL),
            initial,
            ack,
            fragment_pool: BufList::new(FRAGMENT_POOL),
            fragment_offset: 0,
            riovs: Vec::with_capacity(VECTOR_IOVS_MAX),
            next_riov: 0,
            rcvd_ack: false,
        }
    }

    /// Post the receive for the connection acknowledgement; done once at
    /// session setup.
    pub fn post_ack_rx(&mut self) -> Result<()> {
        self.ack.arm(XferKind::Ack);
        self.core.ep.recvmsg(&[self.ack.sge()], CTX_ACK)
    }

    pub fn step(
        &mut self,
        ctx: &mut StepCtx<'_>,
        ready_for_cxn: &mut Fifo<BufId>,
        ready_for_terminal: &mut Fifo<BufId>,
    ) -> Result<LoopCtl> {
        self.cq_process(ctx, ready_for_terminal)?;

        if self.core.cancelled {
            if self.progress.posted.empty() && self.vec.posted.empty() && self.wrposted.empty() {
                close_ep(&self.core.ep, "xmtr");
                return Ok(LoopCtl::Canceled);
            }
            return Ok(LoopCtl::Continue);
        } else if ctx.rc.cfg.cancel.load(std::sync::atomic::Ordering::Relaxed) {
            self.progress.cancel(ctx.arena, &self.core.ep);
            self.vec.cancel(ctx.arena, &self.core.ep);
            fifo_cancel(&mut self.wrposted, ctx.arena, &self.core.ep);
            self.core.cancelled = true;
            return Ok(LoopCtl::Continue);
        }

        if !self.core.sent_first {
            return self.initial_send();
        }

        if !self.core.started {
            return self.start(ctx, ready_for_terminal);
        }

        if !self.rcvd_ack {
            return Ok(LoopCtl::Continue);
        }

        self.vecbuf_unload(ctx)?;

        self.targets_write(ctx, ready_for_cxn)?;

        self.progress_update(ctx, ready_for_cxn);

        self.progress
            .transmit(ctx.arena, &self.core.ep, self.core.peer)?;

        if !((ready_for_cxn.eoget() || self.core.eof.remote)
            && self.wrposted.empty()
            && self.bytes_progress == 0
            && self.core.eof.local)
        {
            return Ok(LoopCtl::Continue);
        }

        // Hunt for the remote EOF among outstanding received vectors.
        while !self.core.eof.remote {
            let Some(id) = self.vec_rcvd.get() else {
                break;
            };
            let buf = ctx.arena.get(id);
            if let Ok(msg) = VectorMsg::decode(&buf.payload()[..buf.nused]) {
                if msg.iovs.is_empty() {
                    self.core.eof.remote = true;
                }
            }
            ctx.arena.remove(id);
        }

        if self.core.eof.remote && self.progress.posted.empty() {
            return Ok(LoopCtl::End);
        }

        Ok(LoopCtl::Continue)
    }

    fn initial_send(&mut self) -> Result<LoopCtl> {
        self.initial.arm(XferKind::Initial);

        match self
            .core
            .ep
            .sendmsg(&[self.initial.sge()], self.core.peer, CTX_INITIAL)
        {
            Ok(()) => {
                self.core.sent_first = true;
                Ok(LoopCtl::Continue)
            }
            Err(Error::TryAgain) => {
                trace!(target: "txdefer", "deferred initial transmission");
                Ok(LoopCtl::Continue)
            }
            Err(e) => Err(e),
        }
    }

    /// First running step: build the fragment and progress pools and hand
    /// the source a full window of empty payload buffers.
    fn start(
        &mut self,
        ctx: &mut StepCtx<'_>,
        ready_for_terminal: &mut Fifo<BufId>,
    ) -> Result<LoopCtl> {
        self.core.started = true;

        while self.fragment_pool.len() < self.fragment_pool.capacity() {
            let id = ctx.arena.insert(Buffer::fragment());
            self.fragment_pool
                .put(id)
                .map_err(|_| Error::Exhausted("fragment header pool"))?;
        }

        while self.progress.pool.len() < self.progress.pool.capacity() {
            let mut buf = Buffer::bytes(XferKind::Progress, PROGRESS_MSG_SIZE);
            let mr = ctx.rc.domain.register(
                buf.base_addr(),
                buf.nallocated(),
                AccessFlags::SEND,
                self.core.keys.next(),
            )?;
            buf.mr = Some(mr);
            let id = ctx.arena.insert(buf);
            self.progress
                .pool
                .put(id)
                .map_err(|_| Error::Exhausted("progress buffer pool"))?;
        }

        while !ready_for_terminal.full() {
            let Some(id) = ctx.pay.tx_get(ctx.arena, ctx.rc, ctx.keys)? else {
                return Err(Error::Exhausted("tx payload reservoir"));
            };
            ctx.arena.get_mut(id).nused = 0;
            if ready_for_terminal.put(id).is_err() {
                return Err(Error::Exhausted("ready-for-terminal FIFO"));
            }
        }

        Ok(LoopCtl::Continue)
    }

    /// Drain one completion and dispatch it by its context's type tag.
    fn cq_process(
        &mut self,
        ctx: &mut StepCtx<'_>,
        ready_for_terminal: &mut Fifo<BufId>,
    ) -> Result<()> {
        let cmpl = {
            let arena = &*ctx.arena;
            let initial = &self.initial.xfc;
            let ack = &self.ack.xfc;
            match self
                .core
                .cq_read(|c| ctx_is_cancelled(arena, Some(initial), Some(ack), c))?
            {
                Some(cmpl) => cmpl,
                None => return Ok(()),
            }
        };

        let kind = match cmpl.ctx {
            CTX_INITIAL => {
                self.initial.xfc.owner = Owner::Program;
                XferKind::Initial
            }
            CTX_ACK => {
                self.ack.xfc.owner = Owner::Program;
                XferKind::Ack
            }
            c if ctx.arena.contains(c) => {
                let buf = ctx.arena.get_mut(BufId::from_ctx(c));
                buf.xfc.owner = Owner::Program;
                buf.xfc.kind
            }
            c => {
                return Err(Error::Protocol(format!(
                    "completion for unknown context {c:#x}"
                )))
            }
        };

        match kind {
            XferKind::Vector => {
                trace!(target: "completion", "read a vector rx completion");
                self.vector_rx_process(ctx.arena, &cmpl)
            }
            XferKind::Fragment | XferKind::RdmaWrite => {
                trace!(target: "completion", "read an RDMA-write completion");
                self.write_complete(&cmpl, ctx, ready_for_terminal)
            }
            XferKind::Progress => {
                trace!(target: "completion", "read a progress tx completion");
                self.progress.complete(ctx.arena, &cmpl)
            }
            XferKind::Ack => {
                trace!(target: "completion", "read an ack rx completion");
                self.ack_rx_process(ctx, &cmpl)
            }
            XferKind::Initial => {
                trace!(target: "completion", "read an initial tx completion");
                Ok(())
            }
        }
    }

    fn vector_rx_process(&mut self, arena: &mut BufArena, cmpl: &Completion) -> Result<()> {
        let id = self.vec.complete(arena, cmpl)?;

        if arena.get(id).xfc.cancelled {
            let buf = arena.get_mut(id);
            buf.mr = None;
            arena.remove(id);
            return Ok(());
        }

        let buf = arena.get(id);
        if VectorMsg::decode(&buf.payload()[..buf.nused]).is_err() {
            trace!(target: "err", "rx'd malformed vector message");
            return self.vec.post(arena, &self.core.ep, id);
        }

        self.vec_rcvd
            .put(id)
            .map_err(|_| Error::Exhausted("received vectors FIFO"))?;
        Ok(())
    }

    /// Retire completed writes from the head of `wrposted`: fragments count
    /// down their parent, parents with no outstanding children go back to
    /// the source.
    fn write_complete(
        &mut self,
        cmpl: &Completion,
        ctx: &mut StepCtx<'_>,
        ready_for_terminal: &mut Fifo<BufId>,
    ) -> Result<()> {
        if self.wrposted.peek().is_none() {
            return Err(Error::Protocol(
                "no RDMA-write completions expected".into(),
            ));
        }
        // Every write carries the context of its batch's first buffer.
        if !ctx.arena.get(BufId::from_ctx(cmpl.ctx)).xfc.place.contains(Place::FIRST) {
            return Err(Error::Protocol(
                "write completion without a `first` context".into(),
            ));
        }

        // Retire the head batch, and any batch behind it that a previous
        // completion already released: fragments count down their parent,
        // parents with no outstanding children go back to the source.
        loop {
            let mut popped = false;

            while let Some(&id) = self.wrposted.peek() {
                let buf = ctx.arena.get(id);
                if buf.xfc.owner != Owner::Program || buf.xfc.kind != XferKind::Fragment {
                    break;
                }
                let _ = self.wrposted.get();
                popped = true;

                let parent = buf
                    .parent
                    .ok_or_else(|| Error::Protocol("fragment without a parent".into()))?;
                let frag = ctx.arena.get_mut(id);
                frag.mr = None;
                frag.parent = None;
                let pbuf = ctx.arena.get_mut(parent);
                debug_assert!(pbuf.xfc.nchildren > 0);
                pbuf.xfc.nchildren -= 1;

                self.fragment_pool
                    .put(id)
                    .map_err(|_| Error::Exhausted("fragment header pool"))?;
            }

            while let Some(&id) = self.wrposted.peek() {
                let buf = ctx.arena.get(id);
                if buf.xfc.owner != Owner::Program
                    || buf.xfc.kind != XferKind::RdmaWrite
                    || buf.xfc.nchildren != 0
                    || ready_for_terminal.full()
                {
                    break;
                }
                let _ = self.wrposted.get();
                popped = true;

                if ctx.rc.cfg.reregister {
                    ctx.arena.get_mut(id).mr = None;
                }
                self.bytes_progress += ctx.arena.get(id).nused;
                let _ = ready_for_terminal.alt_put(id);
            }

            if !popped {
                break;
            }
        }

        Ok(())
    }

    fn ack_rx_process(&mut self, ctx: &mut StepCtx<'_>, cmpl: &Completion) -> Result<()> {
        check_flags(cmpl, RX_MSG_FLAGS)?;
        if cmpl.len != ACK_MSG_SIZE {
            return Err(Error::Protocol("ack is incorrect size".into()));
        }

        let msg = AckMsg::decode(self.ack.bytes())?;
        self.core.peer = self.core.av.insert(&msg.addr)?;

        while !self.vec.posted.full() {
            let mut buf = Buffer::bytes(XferKind::Vector, crate::message::VECTOR_MSG_MAX);
            let mr = ctx.rc.domain.register(
                buf.base_addr(),
                buf.nallocated(),
                AccessFlags::RECV,
                self.core.keys.next(),
            )?;
            buf.mr = Some(mr);
            let id = ctx.arena.insert(buf);
            self.vec.post(ctx.arena, &self.core.ep, id)?;
        }

        self.rcvd_ack = true;
        Ok(())
    }

    /// Decompose received vector messages into the local list of remote
    /// targets. A zero-entry message records remote EOF. A message is
    /// reposted once fully drained; the resume index survives a partial
    /// unload.
    fn vecbuf_unload(&mut self, ctx: &mut StepCtx<'_>) -> Result<()> {
        let Some(&vid) = self.vec_rcvd.peek() else {
            return Ok(());
        };

        let msg = {
            let buf = ctx.arena.get(vid);
            VectorMsg::decode(&buf.payload()[..buf.nused])?
        };

        if !self.core.eof.remote && msg.iovs.is_empty() {
            trace!(target: "proto_vector", "received remote EOF");
            self.core.eof.remote = true;
        }

        let mut i = self.next_riov;
        while i < msg.iovs.len() && self.riovs.len() < VECTOR_IOVS_MAX {
            trace!(
                target: "proto_vector",
                "received vector {i} addr {} len {} key {:#x}",
                msg.iovs[i].addr,
                msg.iovs[i].len,
                msg.iovs[i].key
            );
            self.riovs.push(msg.iovs[i]);
            i += 1;
        }

        if i == msg.iovs.len() {
            let _ = self.vec_rcvd.get();
            self.vec.post(ctx.arena, &self.core.ep, vid)?;
            self.next_riov = 0;
        } else {
            self.next_riov = i;
        }

        Ok(())
    }

    /// Take payload buffers off the session queue while their cumulative
    /// length fits the remote targets writable in one scatter-gather write.
    /// If the head buffer overflows the window and no more advertisements
    /// will arrive, split it and write the fragment in the same batch. The
    /// first buffer of the batch carries the NIC context for the whole
    /// write.
    fn targets_write(&mut self, ctx: &mut StepCtx<'_>, ready_for_cxn: &mut Fifo<BufId>) -> Result<()> {
        let rma_maxsegs = ctx.rc.limits.rma_maxsegs;
        let maxriovs = rma_maxsegs.min(self.riovs.len());
        let maxbytes: usize = self.riovs[..maxriovs].iter().map(|r| r.len as usize).sum();

        // With fewer targets than the per-write limit, more advertisements
        // will arrive, so there is no need to fragment yet.
        let riovs_maxed_out = self.riovs.len() >= rma_maxsegs;

        let mut iovs: Vec<Sge> = Vec::with_capacity(maxriovs);
        let mut total = 0usize;
        let mut first: Option<BufId> = None;
        let mut last: Option<BufId> = None;

        for _ in 0..maxriovs {
            if total >= maxbytes || self.wrposted.full() {
                break;
            }
            let Some(&head) = ready_for_cxn.peek() else {
                break;
            };

            let frag_ofs = self.fragment_offset;
            let nused = ctx.arena.get(head).nused;
            let oversize_load = nused - frag_ofs > maxbytes - total;

            trace!(
                target: "write",
                "head {:#x} nchildren {} offset {frag_ofs} nused {nused} total {total} \
                 maxbytes {maxbytes} nriovs {} maxsegs {rma_maxsegs}",
                head.ctx(),
                ctx.arena.get(head).xfc.nchildren,
                self.riovs.len()
            );

            if oversize_load && !riovs_maxed_out {
                break;
            }

            let len = if oversize_load {
                maxbytes - total
            } else {
                nused - frag_ofs
            };

            if frag_ofs == 0 {
                ctx.arena.get_mut(head).xfc.nchildren = 0;

                if ctx.rc.cfg.reregister {
                    let buf = ctx.arena.get_mut(head);
                    let mr = ctx.rc.domain.register(
                        buf.base_addr(),
                        buf.nallocated(),
                        AccessFlags::SEND | AccessFlags::WRITE,
                        self.core.keys.next(),
                    )?;
                    buf.mr = Some(mr);
                }
            }

            let id = if oversize_load {
                self.buf_split(ctx.arena, head, len)?
            } else {
                let _ = ready_for_cxn.get();
                head
            };

            self.wrposted
                .put(id)
                .map_err(|_| Error::Exhausted("posted RDMA writes FIFO"))?;

            if first.is_none() {
                first = Some(id);
            }
            last = Some(id);

            let xfc = &mut ctx.arena.get_mut(id).xfc;
            xfc.owner = Owner::Program;
            xfc.place = Place::empty();

            iovs.push(Sge {
                addr: ctx.arena.get(head).base_addr() + frag_ofs as u64,
                len,
            });

            if oversize_load {
                self.fragment_offset += len;
                debug_assert!(self.fragment_offset < ctx.arena.get(head).nused);
            } else {
                self.fragment_offset = 0;
            }
            total += len;
        }

        if let Some(first_id) = first {
            {
                let xfc = &mut ctx.arena.get_mut(first_id).xfc;
                xfc.owner = Owner::Nic;
                xfc.place = Place::FIRST;
            }
            ctx.arena.get_mut(last.unwrap_or(first_id)).xfc.place |= Place::LAST;

            let nwritten = write_fully(
                &self.core.ep,
                &iovs,
                &mut self.riovs,
                total,
                maxriovs,
                self.core.peer,
                first_id.ctx(),
            )?;

            if nwritten != total {
                trace!(
                    target: "err",
                    "local I/O vectors were partially written, nwritten {nwritten} total {total}"
                );
                return Err(Error::Protocol("partial scatter-gather write".into()));
            }
        }

        Ok(())
    }

    /// Split the head buffer at `len`: a fragment header shares the parent's
    /// registration and counts against it until the fragment's write
    /// completes.
    fn buf_split(&mut self, arena: &mut BufArena, parent: BufId, len: usize) -> Result<BufId> {
        debug_assert!(self.fragment_offset < arena.get(parent).nused);
        debug_assert!(len < arena.get(parent).nused - self.fragment_offset);

        let id = self
            .fragment_pool
            .get()
            .ok_or(Error::Exhausted("fragment headers"))?;

        let parent_mr = arena.get(parent).mr.clone();
        let frag = arena.get_mut(id);
        frag.raddr = self.fragment_offset as u64;
        frag.nused = len;
        frag.mr = parent_mr;
        frag.parent = Some(parent);

        arena.get_mut(parent).xfc.nchildren += 1;

        Ok(id)
    }

    /// Report bytes retired since the last report; at end of stream, report
    /// `nleftover == 0` and record the local close. The remote closing
    /// first also ends the stream: no more targets will ever arrive, so
    /// nothing further can be written.
    fn progress_update(&mut self, ctx: &mut StepCtx<'_>, ready_for_cxn: &Fifo<BufId>) {
        let reached_eof = (ready_for_cxn.eoget() || self.core.eof.remote)
            && self.wrposted.empty()
            && !self.core.eof.local;

        if self.bytes_progress == 0 && !reached_eof {
            return;
        }
        if self.progress.ready.full() {
            return;
        }
        let Some(id) = self.progress.pool.get() else {
            return;
        };

        let buf = ctx.arena.get_mut(id);
        buf.xfc.owner = Owner::Nic;
        buf.nused = buf.nallocated();

        let msg = ProgressMsg {
            nfilled: self.bytes_progress as u64,
            nleftover: if reached_eof { 0 } else { 1 },
        };
        msg.encode_to(buf.payload_mut());

        trace!(
            target: "proto_progress",
            "sending progress message, {} filled, {} leftover",
            msg.nfilled,
            msg.nleftover
        );

        self.bytes_progress = 0;
        let _ = self.progress.ready.put(id);

        if reached_eof {
            trace!(target: "proto_progress", "enqueued local EOF");
            self.core.eof.local = true;
        }
    }
}

/// Issue one write of `len` bytes from `iovs` into the leading remote
/// targets, then drop the consumed prefix from `riovs`, keeping the
/// unconsumed residue (with the first surviving entry advanced past any
/// partial consumption).
fn write_fully(
    ep: &crate::fabric::Endpoint,
    iovs: &[Sge],
    riovs: &mut Vec<RmaIov>,
    len: usize,
    maxsegs: usize,
    peer: PeerAddr,
    ctx: u64,
) -> Result<usize> {
    let mut out: Vec<RmaIov> = Vec::with_capacity(maxsegs);
    let mut remaining = len as u64;
    for riov in riovs.iter().take(maxsegs) {
        if remaining == 0 {
            break;
        }
        let take = riov.len.min(remaining);
        out.push(RmaIov {
            addr: riov.addr,
            len: take,
            key: riov.key,
        });
        remaining -= take;
    }
    debug_assert_eq!(remaining, 0, "write window smaller than batch");

    ep.writemsg(iovs, &out, peer, ctx, WR_FLAGS)?;

    let mut consumed = len as u64;
    while consumed > 0 {
        if riovs[0].len <= consumed {
            consumed -= riovs[0].len;
            riovs.remove(0);
        } else {
            riovs[0].addr += consumed;
            riovs[0].len -= consumed;
            consumed = 0;
        }
    }

    Ok(len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::config::{Limits, RunCtx};
    use crate::fabric::{AddressVector, Domain, Endpoint, Fabric, FabricConfig};
    use crate::keys::KeySource;
    use crate::message::INITIAL_MSG_SIZE;
    use crate::worker::PayBufs;

    fn endpoints() -> (Endpoint, Endpoint, Domain, AddressVector, PeerAddr) {
        let fabric = Fabric::open(FabricConfig::default()).unwrap();
        let domain = fabric.domain();
        let av = domain.av();
        let a = domain.endpoint(&av, None).unwrap();
        let b = domain.endpoint(&av, None).unwrap();
        let peer_b = av.insert(&b.getname()).unwrap();
        (a, b, domain, av, peer_b)
    }

    #[test]
    fn test_write_fully_clamps_and_keeps_residue() {
        let (a, b, domain, _av, peer_b) = endpoints();

        let mut target = vec![0u8; 64];
        let mr = domain
            .register(
                target.as_mut_ptr() as u64,
                target.len(),
                AccessFlags::RECV | AccessFlags::REMOTE_WRITE,
                0x6000,
            )
            .unwrap();

        let data: Vec<u8> = (0..30u8).collect();
        let mut riovs = vec![
            RmaIov {
                addr: 0,
                len: 37,
                key: mr.key(),
            },
            RmaIov {
                addr: 37,
                len: 23,
                key: mr.key(),
            },
        ];

        let n = write_fully(
            &a,
            &[Sge {
                addr: data.as_ptr() as u64,
                len: data.len(),
            }],
            &mut riovs,
            30,
            8,
            peer_b,
            5,
        )
        .unwrap();
        assert_eq!(n, 30);

        // The consumed prefix is gone; the surviving first entry advanced
        // past the partial consumption.
        assert_eq!(
            riovs,
            vec![
                RmaIov {
                    addr: 30,
                    len: 7,
                    key: mr.key(),
                },
                RmaIov {
                    addr: 37,
                    len: 23,
                    key: mr.key(),
                },
            ]
        );

        let cmpl = loop {
            b.cq().ready();
            if let Some(c) = a.cq().read() {
                break c;
            }
            std::thread::sleep(Duration::from_micros(100));
        };
        assert_eq!(cmpl.ctx, 5);
        assert_eq!(cmpl.len, 30);
        assert_eq!(&target[..30], &data[..]);
    }

    /// A 40-byte payload buffer against 16-byte write windows must split
    /// into ceil(40 / 16) = 3 operations: two fragments and the parent's
    /// own tail write, and the parent goes back to the terminal only after
    /// every child completion has been consumed.
    #[test]
    fn test_oversize_payload_fragments_and_retires() {
        let (a, b, domain, av, peer_b) = endpoints();

        let rc = RunCtx {
            cfg: crate::config::RunConfig::default(),
            limits: Limits {
                mr_maxsegs: 1,
                rx_maxsegs: 1,
                tx_maxsegs: 1,
                rma_maxsegs: 1,
            },
            domain: domain.clone(),
        };
        let mut arena = BufArena::new();
        let mut pay = PayBufs::new();
        let mut keys = KeySource::new();

        let mut target = vec![0u8; 48];
        let mr = domain
            .register(
                target.as_mut_ptr() as u64,
                target.len(),
                AccessFlags::RECV | AccessFlags::REMOTE_WRITE,
                0x7000,
            )
            .unwrap();

        let initial = MsgSlot::new(
            &domain,
            XferKind::Initial,
            INITIAL_MSG_SIZE,
            AccessFlags::SEND,
            &mut keys,
        )
        .unwrap();
        let ack = MsgSlot::new(
            &domain,
            XferKind::Ack,
            ACK_MSG_SIZE,
            AccessFlags::RECV,
            &mut keys,
        )
        .unwrap();
        let mut x = Xmtr::new(CxnCore::new(a, av, peer_b), initial, ack);

        for _ in 0..8 {
            let id = arena.insert(Buffer::fragment());
            x.fragment_pool.put(id).unwrap();
        }

        let head = arena.insert(Buffer::bytes(XferKind::RdmaWrite, 40));
        {
            let buf = arena.get_mut(head);
            buf.nused = 40;
            for (i, byte) in buf.payload_mut().iter_mut().enumerate() {
                *byte = i as u8;
            }
        }
        let mut rfc: Fifo<BufId> = Fifo::new(64);
        let mut rft: Fifo<BufId> = Fifo::new(64);
        rfc.put(head).unwrap();

        // One 16-byte window per advertisement; with the per-write limit
        // already reached, each pass must fragment rather than wait.
        for (i, addr) in [0u64, 16, 32].into_iter().enumerate() {
            x.riovs.push(RmaIov {
                addr,
                len: 16,
                key: mr.key(),
            });
            let mut ctx = StepCtx {
                rc: &rc,
                arena: &mut arena,
                pay: &mut pay,
                keys: &mut keys,
            };
            x.targets_write(&mut ctx, &mut rfc).unwrap();
            assert_eq!(x.wrposted.len(), i + 1);
        }

        assert_eq!(arena.get(head).xfc.nchildren, 2);
        assert!(rfc.empty());
        assert_eq!(x.fragment_pool.len(), 6);
        // The 8-byte tail consumed only half of the last window.
        assert_eq!(
            x.riovs,
            vec![RmaIov {
                addr: 40,
                len: 8,
                key: mr.key(),
            }]
        );

        // Drain the three write completions; the parent may not retire
        // while any of them is outstanding.
        let bcq = b.cq();
        let mut spins = 0;
        while x.wrposted.len() > 0 {
            bcq.ready();
            let mut ctx = StepCtx {
                rc: &rc,
                arena: &mut arena,
                pay: &mut pay,
                keys: &mut keys,
            };
            x.cq_process(&mut ctx, &mut rft).unwrap();
            if x.wrposted.len() > 0 {
                assert!(rft.empty(), "parent retired before its children completed");
            }
            spins += 1;
            assert!(spins < 200_000, "write completions never drained");
            std::thread::sleep(Duration::from_micros(100));
        }

        assert_eq!(rft.get(), Some(head));
        assert_eq!(arena.get(head).xfc.nchildren, 0);
        assert_eq!(x.bytes_progress, 40);
        assert_eq!(x.fragment_pool.len(), 8);

        let expect: Vec<u8> = (0..40u8).collect();
        assert_eq!(&target[..40], &expect[..]);
    }
}
