//! Receive and transmit control queues.
//!
//! An [`RxCtl`] tracks buffers the fabric is receiving into, in post order;
//! every receive completion must match the first posted entry, anything
//! else is a fatal protocol error. A [`TxCtl`] stages outgoing message
//! buffers on a `ready` FIFO, keeps in-flight ones on `posted`, and
//! recycles completed ones through a free pool. Provider back-pressure
//! (`TryAgain`) stops a transmit walk cleanly without losing buffers.

use tracing::trace;

use crate::buffer::{BufArena, BufId};
use crate::error::{Error, Result};
use crate::fabric::{Completion, Endpoint, PeerAddr, RX_MSG_FLAGS, TX_MSG_FLAGS};
use crate::fifo::Fifo;

/// Mark every entry of a posted FIFO cancelled and cancel it with the
/// provider, exactly once per entry.
pub fn fifo_cancel(posted: &mut Fifo<BufId>, arena: &mut BufArena, ep: &Endpoint) {
    for _ in 0..posted.len() {
        let Some(id) = posted.alt_get() else {
            break;
        };
        arena.get_mut(id).xfc.cancelled = true;
        ep.cancel(id.ctx());
        let _ = posted.alt_put(id);
    }
}

/// Buffers posted for message receive.
#[derive(Debug)]
pub struct RxCtl {
    pub posted: Fifo<BufId>,
}

impl RxCtl {
    pub fn new(depth: usize) -> Self {
        Self {
            posted: Fifo::new(depth),
        }
    }

    /// Issue a one-segment receive for the buffer's whole allocation and
    /// append it to `posted`.
    pub fn post(&mut self, arena: &mut BufArena, ep: &Endpoint, id: BufId) -> Result<()> {
        let buf = arena.get_mut(id);
        buf.xfc.cancelled = false;
        ep.recvmsg(&[buf.sge_allocated()], id.ctx())?;
        self.posted
            .put(id)
            .map_err(|_| Error::Exhausted("rx posted FIFO"))?;
        Ok(())
    }

    /// Dequeue the head of `posted` for a receive completion. The
    /// completion must carry receive flags (unless the buffer was
    /// cancelled) and must match the head's context.
    pub fn complete(&mut self, arena: &mut BufArena, cmpl: &Completion) -> Result<BufId> {
        let cancelled =
            arena.contains(cmpl.ctx) && arena.get(BufId::from_ctx(cmpl.ctx)).xfc.cancelled;
        if !cmpl.flags.contains(RX_MSG_FLAGS) && !cancelled {
            return Err(Error::CompletionFlags {
                expected: RX_MSG_FLAGS.bits(),
                got: cmpl.flags.bits(),
            });
        }

        let id = self.posted.get().ok_or(Error::NoPostedOp)?;
        if id.ctx() != cmpl.ctx {
            return Err(Error::ContextMismatch {
                expected: id.ctx(),
                got: cmpl.ctx,
            });
        }

        arena.get_mut(id).nused = cmpl.len;
        Ok(id)
    }

    pub fn cancel(&mut self, arena: &mut BufArena, ep: &Endpoint) {
        fifo_cancel(&mut self.posted, arena, ep);
    }
}

/// Buffers staged for and in flight on message transmit.
#[derive(Debug)]
pub struct TxCtl {
    pub ready: Fifo<BufId>,
    pub posted: Fifo<BufId>,
    pub pool: crate::buffer::BufList,
}

impl TxCtl {
    pub fn new(depth: usize, pool_cap: usize) -> Self {
        Self {
            ready: Fifo::new(depth),
            posted: Fifo::new(depth),
            pool: crate::buffer::BufList::new(pool_cap),
        }
    }

    /// Walk `ready` issuing one send per buffer while `posted` has room.
    /// Provider back-pressure defers the rest to a later loop.
    pub fn transmit(&mut self, arena: &BufArena, ep: &Endpoint, peer: PeerAddr) -> Result<()> {
        while let Some(&id) = self.ready.peek() {
            if self.posted.full() {
                break;
            }
            let buf = arena.get(id);
            match ep.sendmsg(&[buf.sge_used()], peer, id.ctx()) {
                Ok(()) => {
                    let _ = self.ready.get();
                    let _ = self.posted.put(id);
                }
                Err(Error::TryAgain) => {
                    trace!(target: "txdefer", "deferred transmission");
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Move the head of `posted` back into the free pool for a transmit
    /// completion.
    pub fn complete(&mut self, arena: &BufArena, cmpl: &Completion) -> Result<()> {
        let cancelled =
            arena.contains(cmpl.ctx) && arena.get(BufId::from_ctx(cmpl.ctx)).xfc.cancelled;
        if !cmpl.flags.contains(TX_MSG_FLAGS) && !cancelled {
            return Err(Error::CompletionFlags {
                expected: TX_MSG_FLAGS.bits(),
                got: cmpl.flags.bits(),
            });
        }

        let id = self.posted.get().ok_or_else(|| {
            trace!(target: "txctl", "message Tx completed, but no Tx was posted");
            Error::NoPostedOp
        })?;
        if id.ctx() != cmpl.ctx {
            return Err(Error::ContextMismatch {
                expected: id.ctx(),
                got: cmpl.ctx,
            });
        }

        self.pool
            .put(id)
            .map_err(|_| Error::Exhausted("tx buffer pool"))?;
        Ok(())
    }

    pub fn cancel(&mut self, arena: &mut BufArena, ep: &Endpoint) {
        fifo_cancel(&mut self.posted, arena, ep);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{Buffer, XferKind};
    use crate::fabric::{Fabric, FabricConfig};
    use std::sync::atomic::AtomicBool;

    fn setup() -> (
        BufArena,
        Endpoint,
        Endpoint,
        PeerAddr,
        crate::fabric::AddressVector,
    ) {
        let domain = Fabric::open(FabricConfig::default()).unwrap().domain();
        let av = domain.av();
        let a = domain.endpoint(&av, None).unwrap();
        let b = domain.endpoint(&av, None).unwrap();
        let peer_b = av.insert(&b.getname()).unwrap();
        (BufArena::new(), a, b, peer_b, av)
    }

    #[test]
    fn test_rx_tx_roundtrip() {
        let (mut arena, a, b, peer_b, _av) = setup();
        let cancel = AtomicBool::new(false);

        let mut rx = RxCtl::new(8);
        let rx_id = arena.insert(Buffer::bytes(XferKind::Progress, 16));
        rx.post(&mut arena, &b, rx_id).unwrap();

        let mut tx = TxCtl::new(8, 8);
        let tx_id = arena.insert(Buffer::bytes(XferKind::Progress, 16));
        arena.get_mut(tx_id).nused = 16;
        tx.ready.put(tx_id).unwrap();
        tx.transmit(&arena, &a, peer_b).unwrap();
        assert!(tx.ready.empty());
        assert_eq!(tx.posted.len(), 1);

        let send_cmpl = a.cq().sread(&cancel).unwrap();
        tx.complete(&arena, &send_cmpl).unwrap();
        assert_eq!(tx.pool.len(), 1);

        let recv_cmpl = b.cq().sread(&cancel).unwrap();
        let got = rx.complete(&mut arena, &recv_cmpl).unwrap();
        assert_eq!(got, rx_id);
        assert_eq!(arena.get(got).nused, 16);
    }

    #[test]
    fn test_rx_context_mismatch_is_fatal() {
        let (mut arena, _a, b, _peer_b, _av) = setup();
        let mut rx = RxCtl::new(8);
        let id = arena.insert(Buffer::bytes(XferKind::Progress, 16));
        rx.post(&mut arena, &b, id).unwrap();

        let bogus = Completion {
            ctx: id.ctx() + 1,
            len: 16,
            flags: RX_MSG_FLAGS,
            status: crate::fabric::CqStatus::Ok,
        };
        assert!(matches!(
            rx.complete(&mut arena, &bogus),
            Err(Error::ContextMismatch { .. })
        ));
    }

    #[test]
    fn test_cancel_marks_and_keeps_posted() {
        let (mut arena, _a, b, _peer_b, _av) = setup();
        let mut rx = RxCtl::new(8);
        let id = arena.insert(Buffer::bytes(XferKind::Vector, 296));
        rx.post(&mut arena, &b, id).unwrap();

        rx.cancel(&mut arena, &b);
        assert_eq!(rx.posted.len(), 1);
        assert!(arena.get(id).xfc.cancelled);

        // The provider reports the canceled receive; it still matches the
        // posted head even with empty flags.
        let cmpl = b.cq().read().expect("canceled completion");
        assert_eq!(cmpl.status, crate::fabric::CqStatus::Canceled);
        let got = rx.complete(&mut arena, &cmpl).unwrap();
        assert_eq!(got, id);
    }
}
