//! Shared connection state and the connection sum type.
//!
//! A connection is one of two variants, the receiver (RDMA target) or the
//! sender (RDMA initiator), each driven by a single `step` the worker
//! invokes. Both share a [`CxnCore`]: the endpoint, its completion queue,
//! the peer handle, handshake and cancellation flags, and the two-sided EOF
//! state. `eof.local` means this side's close has been enqueued (an empty
//! vector for a receiver, an `nleftover == 0` progress for a sender);
//! `eof.remote` means the peer's close has been observed.

use tracing::trace;

use crate::buffer::{BufArena, BufId, Owner, Place, XferContext, XferKind};
use crate::error::{Error, Result};
use crate::fabric::{
    AccessFlags, AddressVector, CompFlags, Completion, Cq, CqStatus, Domain, Endpoint, PeerAddr,
    Sge,
};
use crate::fifo::Fifo;
use crate::keys::KeySource;
use crate::rcvr::Rcvr;
use crate::reg::{self, RegisteredIov};
use crate::worker::StepCtx;
use crate::xmtr::Xmtr;

/// What a connection or terminal step tells the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopCtl {
    Continue,
    End,
    Error,
    Canceled,
}

/// Completion context of a dedicated initial-message slot.
pub const CTX_INITIAL: u64 = 1 << 62;

/// Completion context of a dedicated ack-message slot.
pub const CTX_ACK: u64 = (1 << 62) + 1;

#[derive(Debug, Default, Clone, Copy)]
pub struct EofState {
    pub local: bool,
    pub remote: bool,
}

/// State common to both connection variants.
#[derive(Debug)]
pub struct CxnCore {
    pub ep: Endpoint,
    pub cq: Cq,
    pub av: AddressVector,
    pub peer: PeerAddr,
    pub sent_first: bool,
    pub started: bool,
    pub cancelled: bool,
    pub eof: EofState,
    pub keys: KeySource,
}

impl CxnCore {
    pub fn new(ep: Endpoint, av: AddressVector, peer: PeerAddr) -> Self {
        let cq = ep.cq();
        Self {
            ep,
            cq,
            av,
            peer,
            sent_first: false,
            started: false,
            cancelled: false,
            eof: EofState::default(),
            keys: KeySource::new(),
        }
    }

    /// Read one completion. A `Canceled` status is delivered to the caller
    /// only when the posted buffer was marked cancelled; otherwise it is a
    /// fatal error, as is any other error record.
    pub fn cq_read(&self, cancelled_ctx: impl Fn(u64) -> bool) -> Result<Option<Completion>> {
        let Some(cmpl) = self.cq.read() else {
            return Ok(None);
        };
        if cmpl.status == CqStatus::Canceled && !cancelled_ctx(cmpl.ctx) {
            return Err(Error::Protocol(format!(
                "unexpected canceled completion, context {:#x}",
                cmpl.ctx
            )));
        }
        Ok(Some(cmpl))
    }
}

/// A dedicated message slot registered as one region: owned bytes, a
/// transfer context, and the registration.
#[derive(Debug)]
pub struct MsgSlot {
    pub xfc: XferContext,
    pub mr: Option<crate::fabric::MemoryRegion>,
    data: Box<[u8]>,
}

impl MsgSlot {
    pub fn new(
        domain: &Domain,
        kind: XferKind,
        size: usize,
        access: AccessFlags,
        keys: &mut KeySource,
    ) -> Result<Self> {
        let data = vec![0u8; size].into_boxed_slice();
        let mr = domain.register(data.as_ptr() as u64, size, access, keys.next())?;
        Ok(Self {
            xfc: XferContext::new(kind),
            mr: Some(mr),
            data,
        })
    }

    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    #[inline]
    pub fn sge(&self) -> Sge {
        Sge {
            addr: self.data.as_ptr() as u64,
            len: self.data.len(),
        }
    }

    /// Arm the context for a single posted operation.
    pub fn arm(&mut self, kind: XferKind) {
        self.xfc = XferContext {
            kind,
            owner: Owner::Nic,
            place: Place::FIRST | Place::LAST,
            nchildren: 0,
            cancelled: false,
        };
    }
}

/// A dedicated message slot split into Fibonacci segments and registered
/// across chunked registration calls; exercises the scatter-gather paths.
#[derive(Debug)]
pub struct SplitMsgSlot {
    pub xfc: XferContext,
    pub iovs: Vec<Sge>,
    pub reg: RegisteredIov,
    data: Box<[u8]>,
}

impl SplitMsgSlot {
    pub fn new(
        domain: &Domain,
        kind: XferKind,
        size: usize,
        split_maxsegs: usize,
        mr_maxsegs: usize,
        access: AccessFlags,
        keys: &mut KeySource,
    ) -> Result<Self> {
        let data = vec![0u8; size].into_boxed_slice();
        let iovs = reg::fibonacci_iov_setup(data.as_ptr() as u64, size, split_maxsegs)?;
        if iovs.is_empty() {
            return Err(Error::InvalidConfig("unexpected empty I/O vector".into()));
        }
        let reg = reg::regv_all(domain, &iovs, mr_maxsegs.min(2), access, keys)?;
        Ok(Self {
            xfc: XferContext::new(kind),
            iovs,
            reg,
            data,
        })
    }

    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn arm(&mut self, kind: XferKind) {
        self.xfc = XferContext {
            kind,
            owner: Owner::Nic,
            place: Place::FIRST | Place::LAST,
            nchildren: 0,
            cancelled: false,
        };
    }
}

/// The two connection variants, dispatched statically from the worker.
#[derive(Debug)]
pub enum Conn {
    Rcvr(Rcvr),
    Xmtr(Xmtr),
}

impl Conn {
    pub fn core(&self) -> &CxnCore {
        match self {
            Conn::Rcvr(r) => &r.core,
            Conn::Xmtr(x) => &x.core,
        }
    }

    pub fn core_mut(&mut self) -> &mut CxnCore {
        match self {
            Conn::Rcvr(r) => &mut r.core,
            Conn::Xmtr(x) => &mut x.core,
        }
    }

    /// One scheduler step. Closes the endpoint itself only on the
    /// cancellation-drain path; the session wrapper closes it for `End` and
    /// errors.
    pub fn step(
        &mut self,
        ctx: &mut StepCtx<'_>,
        ready_for_cxn: &mut Fifo<BufId>,
        ready_for_terminal: &mut Fifo<BufId>,
    ) -> Result<LoopCtl> {
        match self {
            Conn::Rcvr(r) => r.step(ctx, ready_for_cxn, ready_for_terminal),
            Conn::Xmtr(x) => x.step(ctx, ready_for_cxn, ready_for_terminal),
        }
    }
}

/// Whether the completion context `ctx` belongs to a buffer marked
/// cancelled, looking through the arena and the dedicated slots.
pub fn ctx_is_cancelled(
    arena: &BufArena,
    initial: Option<&XferContext>,
    ack: Option<&XferContext>,
    ctx: u64,
) -> bool {
    match ctx {
        CTX_INITIAL => initial.map(|x| x.cancelled).unwrap_or(false),
        CTX_ACK => ack.map(|x| x.cancelled).unwrap_or(false),
        _ => arena.contains(ctx) && arena.get(BufId::from_ctx(ctx)).xfc.cancelled,
    }
}

/// Close a connection endpoint, logging like every other close site.
pub fn close_ep(ep: &Endpoint, who: &str) {
    ep.close();
    trace!(target: "close", "{who}: closed.");
}

/// Completion-flag subset check shared by the dedicated-slot paths.
pub fn check_flags(cmpl: &Completion, want: CompFlags) -> Result<()> {
    if !cmpl.flags.contains(want) {
        return Err(Error::CompletionFlags {
            expected: want.bits(),
            got: cmpl.flags.bits(),
        });
    }
    Ok(())
}
