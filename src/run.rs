//! Personality entry points.
//!
//! `get` opens a listener, pre-posts one initial-message receive per
//! session, accepts each sender's initial message from the listen queue,
//! opens a per-session endpoint whose address travels back in the ack, and
//! hands the receiver sessions to the worker pool. `put` resolves the
//! destination, opens one sender endpoint per session, posts the ack
//! receive, and hands the sender sessions to the pool. Both join the pool
//! for the final status.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use tracing::trace;

use crate::buffer::XferKind;
use crate::config::{Limits, RunConfig, RunCtx};
use crate::cxn::{check_flags, Conn, CxnCore, MsgSlot, SplitMsgSlot};
use crate::error::{Error, Result};
use crate::fabric::{
    local_ip_toward, AccessFlags, AddressVector, Cq, Endpoint, Fabric, FabricAddr, FabricConfig,
    RX_MSG_FLAGS,
};
use crate::keys::KeySource;
use crate::message::{AckMsg, InitialMsg, ACK_MSG_SIZE, INITIAL_MSG_SIZE};
use crate::pool::WorkerPool;
use crate::rcvr::Rcvr;
use crate::session::Session;
use crate::terminal::{Sink, Source, Terminal};
use crate::xmtr::Xmtr;

/// The fixed transfer service.
pub const SERVICE: &str = "4242";

/// Resolve a user-supplied address, defaulting the port to the service.
fn resolve(addr: &str) -> Result<SocketAddr> {
    if let Ok(sa) = addr.parse() {
        return Ok(sa);
    }
    if let Ok(mut it) = addr.to_socket_addrs() {
        if let Some(sa) = it.next() {
            return Ok(sa);
        }
    }
    if let Some(sa) = (addr, SERVICE.parse::<u16>().unwrap_or(4242))
        .to_socket_addrs()
        .ok()
        .and_then(|mut it| it.next())
    {
        return Ok(sa);
    }
    Err(Error::InvalidConfig(format!("cannot resolve `{addr}`")))
}

fn open_fabric(cfg: &RunConfig) -> Result<(Fabric, Limits)> {
    let fabric = Fabric::open(FabricConfig::default())?;

    if !fabric.offset_addressing() {
        return Err(Error::Unsupported(
            "provider RDMA uses virtual addresses instead of offsets",
        ));
    }

    // Single-segment registration and message vectors; multi-segment
    // registration has interoperability problems with some providers.
    let limits = Limits {
        mr_maxsegs: 1,
        rx_maxsegs: 1,
        tx_maxsegs: 1,
        rma_maxsegs: if cfg.contiguous {
            1
        } else {
            fabric.rma_iov_limit()
        },
    };

    trace!(
        target: "params",
        "Rx/Tx I/O vector limits {}/{}",
        fabric.rx_iov_limit(),
        fabric.tx_iov_limit()
    );
    trace!(target: "params", "RMA I/O vector limit {}", fabric.rma_iov_limit());

    Ok((fabric, limits))
}

struct GetSlot {
    initial: SplitMsgSlot,
}

/// The opened listener personality.
pub struct GetState {
    rc: Arc<RunCtx>,
    av: AddressVector,
    listen_ep: Endpoint,
    listen_cq: Cq,
    slots: Vec<GetSlot>,
    keys: KeySource,
}

impl GetState {
    /// Bind the listener and pre-post one initial-message receive per
    /// session.
    pub fn open(cfg: RunConfig) -> Result<Self> {
        let (fabric, limits) = open_fabric(&cfg)?;
        let domain = fabric.domain();
        let av = domain.av();

        let bind = match &cfg.bind {
            Some(addr) => resolve(addr)?,
            None => SocketAddr::new(
                IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                SERVICE.parse().unwrap_or(4242),
            ),
        };
        let listen_ep = domain.endpoint(&av, Some(bind))?;
        let listen_cq = listen_ep.cq();

        trace!(target: "params", "starting personality 'fget'");

        let nsessions = cfg.nsessions;
        let rc = Arc::new(RunCtx {
            cfg,
            limits,
            domain,
        });

        let mut keys = KeySource::new();
        let mut slots = Vec::with_capacity(nsessions);
        for i in 0..nsessions {
            let initial = SplitMsgSlot::new(
                &rc.domain,
                XferKind::Initial,
                INITIAL_MSG_SIZE,
                limits.rx_maxsegs,
                limits.mr_maxsegs,
                AccessFlags::RECV,
                &mut keys,
            )?;
            listen_ep.recvmsg(&initial.iovs, i as u64)?;
            slots.push(GetSlot { initial });
        }

        Ok(Self {
            rc,
            av,
            listen_ep,
            listen_cq,
            slots,
            keys,
        })
    }

    /// The address the listener is reachable at.
    pub fn local_addr(&self) -> SocketAddr {
        self.listen_ep.local_addr()
    }

    /// Accept every session, hand them to the pool, and join.
    pub fn run(mut self) -> Result<()> {
        let pool = WorkerPool::new(Arc::clone(&self.rc), true);

        let mut sessions = Vec::with_capacity(self.slots.len());
        for _ in 0..self.slots.len() {
            sessions.push(self.accept()?);
        }

        for sess in sessions {
            pool.assign(sess)?;
        }

        let expect = self.rc.cfg.expect_cancellation;
        pool.join_all(expect)
    }

    /// Await one initial message on the listen queue and build the
    /// receiver session it announces.
    fn accept(&mut self) -> Result<Session> {
        let cmpl = self.listen_cq.sread(self.rc.cfg.cancel)?;
        check_flags(&cmpl, RX_MSG_FLAGS)?;

        let idx = cmpl.ctx as usize;
        let slot = self
            .slots
            .get(idx)
            .ok_or_else(|| Error::Protocol(format!("initial for unknown session {idx}")))?;

        if cmpl.len != INITIAL_MSG_SIZE {
            return Err(Error::Protocol(format!(
                "initially received {} bytes, expected {INITIAL_MSG_SIZE}",
                cmpl.len
            )));
        }

        let msg = InitialMsg::decode(slot.initial.bytes())?;
        let nsessions = self.rc.cfg.nsessions;
        if msg.nsources as usize != nsessions || msg.id as usize > nsessions {
            return Err(Error::Protocol(format!(
                "received nsources {}, id {}, expected {nsessions}, 0",
                msg.nsources, msg.id
            )));
        }

        let peer_sa = msg.addr.to_socket_addr()?;
        let peer = self.av.insert(&msg.addr)?;

        // Bind the session endpoint to an address the peer can dial back.
        let listen_ip = self.listen_ep.local_addr().ip();
        let ip = if listen_ip.is_unspecified() {
            local_ip_toward(peer_sa)
        } else {
            listen_ip
        };
        let ep = self.rc.domain.endpoint(&self.av, Some(SocketAddr::new(ip, 0)))?;

        let mut ack = SplitMsgSlot::new(
            &self.rc.domain,
            XferKind::Ack,
            ACK_MSG_SIZE,
            self.rc.limits.rx_maxsegs,
            self.rc.limits.mr_maxsegs,
            AccessFlags::SEND,
            &mut self.keys,
        )?;
        AckMsg::new(ep.getname()).encode_to(ack.bytes_mut());

        let core = CxnCore::new(ep, self.av.clone(), peer);
        let rcvr = Rcvr::new(core, ack);

        Ok(Session::new(
            Conn::Rcvr(rcvr),
            Terminal::Sink(Sink::new()),
        ))
    }
}

/// The opened connector personality.
pub struct PutState {
    rc: Arc<RunCtx>,
    sessions: Vec<Session>,
}

impl PutState {
    /// Resolve the destination and open one sender session per `-n`.
    pub fn open(cfg: RunConfig) -> Result<Self> {
        let (fabric, limits) = open_fabric(&cfg)?;
        let domain = fabric.domain();
        let av = domain.av();

        let dest = resolve(
            cfg.dest
                .as_deref()
                .ok_or_else(|| Error::InvalidConfig("no destination address".into()))?,
        )?;
        let dest_peer = av.insert(&FabricAddr::from_socket_addr(dest))?;
        let bind_ip = local_ip_toward(dest);

        trace!(target: "params", "starting personality 'fput'");

        let nsessions = cfg.nsessions;
        let rc = Arc::new(RunCtx {
            cfg,
            limits,
            domain,
        });

        let mut keys = KeySource::new();
        let mut sessions = Vec::with_capacity(nsessions);
        for i in 0..nsessions {
            let ep = rc
                .domain
                .endpoint(&av, Some(SocketAddr::new(bind_ip, 0)))?;

            let mut initial = MsgSlot::new(
                &rc.domain,
                XferKind::Initial,
                INITIAL_MSG_SIZE,
                AccessFlags::SEND,
                &mut keys,
            )?;
            InitialMsg::new(nsessions as u32, i as u32, ep.getname())
                .encode_to(initial.bytes_mut());

            let ack = MsgSlot::new(
                &rc.domain,
                XferKind::Ack,
                ACK_MSG_SIZE,
                AccessFlags::RECV,
                &mut keys,
            )?;

            let core = CxnCore::new(ep, av.clone(), dest_peer);
            let mut xmtr = Xmtr::new(core, initial, ack);
            xmtr.post_ack_rx()?;

            sessions.push(Session::new(
                Conn::Xmtr(xmtr),
                Terminal::Source(Source::new()),
            ));
        }

        Ok(Self { rc, sessions })
    }

    /// Hand every session to the pool and join.
    pub fn run(self) -> Result<()> {
        let pool = WorkerPool::new(Arc::clone(&self.rc), false);

        for sess in self.sessions {
            pool.assign(sess)?;
        }

        let expect = self.rc.cfg.expect_cancellation;
        pool.join_all(expect)
    }
}

/// Listener personality, start to finish.
pub fn get(cfg: RunConfig) -> Result<()> {
    GetState::open(cfg)?.run()
}

/// Connector personality, start to finish.
pub fn put(cfg: RunConfig) -> Result<()> {
    PutState::open(cfg)?.run()
}
