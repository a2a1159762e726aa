//! Fabric collaborator: endpoints, completion queues, address vectors, and
//! keyed memory registration.
//!
//! The core consumes the fabric only through this interface: reliable
//! datagram-style message send/recv plus one-sided remote writes on the same
//! endpoint, each posted operation tagged with a caller context that the
//! completion queue hands back. Remote addresses are *offsets into a
//! registration*, never virtual addresses.
//!
//! The shipped provider carries that contract over non-blocking TCP sockets,
//! so the whole protocol runs on any host: messages and writes travel as
//! small ordered frames, writes are applied into the target registration
//! before any later frame from the same peer is delivered (which yields the
//! fence ordering the core relies on), and a write completion fires only
//! once the target has acknowledged it (delivery complete). Progress is
//! manual: reading a completion queue pumps its endpoint.

mod ep;
mod frame;

pub use ep::{Cq, Endpoint};

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bitflags::bitflags;

use crate::error::{Error, Result};

/// Largest fabric address the wire formats can carry.
pub const ADDR_MAX: usize = 512;

bitflags! {
    /// Access rights requested when registering memory.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessFlags: u32 {
        const RECV         = 1 << 0;
        const SEND         = 1 << 1;
        const WRITE        = 1 << 2;
        const REMOTE_WRITE = 1 << 3;
    }
}

bitflags! {
    /// Operation and completion flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CompFlags: u64 {
        const MSG               = 1 << 0;
        const RMA               = 1 << 1;
        const RECV              = 1 << 2;
        const SEND              = 1 << 3;
        const WRITE             = 1 << 4;
        const COMPLETION        = 1 << 5;
        const DELIVERY_COMPLETE = 1 << 6;
        const FENCE             = 1 << 7;
    }
}

/// Flags a message-receive completion must carry.
pub const RX_MSG_FLAGS: CompFlags = CompFlags::MSG.union(CompFlags::RECV);

/// Flags a message-send completion must carry.
pub const TX_MSG_FLAGS: CompFlags = CompFlags::MSG.union(CompFlags::SEND);

/// Flags a remote-write completion must carry.
pub const WR_FLAGS: CompFlags = CompFlags::RMA
    .union(CompFlags::WRITE)
    .union(CompFlags::COMPLETION)
    .union(CompFlags::DELIVERY_COMPLETE);

/// One local scatter-gather segment.
#[derive(Debug, Clone, Copy)]
pub struct Sge {
    pub addr: u64,
    pub len: usize,
}

/// One remote scatter-gather segment: an offset into the registration named
/// by `key`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RmaIov {
    pub addr: u64,
    pub len: u64,
    pub key: u64,
}

/// Opaque fabric address, at most [`ADDR_MAX`] bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FabricAddr(Vec<u8>);

impl FabricAddr {
    pub fn new(bytes: &[u8]) -> Self {
        debug_assert!(bytes.len() <= ADDR_MAX);
        Self(bytes.to_vec())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        Self(addr.to_string().into_bytes())
    }

    pub fn to_socket_addr(&self) -> Result<SocketAddr> {
        std::str::from_utf8(&self.0)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(Error::UnknownPeer)
    }
}

impl fmt::Display for FabricAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) => f.write_str(s),
            Err(_) => write!(f, "{:02x?}", self.0),
        }
    }
}

/// Handle a peer address resolves to once inserted into an address vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerAddr(pub u64);

/// Completion status; canceled operations complete with `Canceled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CqStatus {
    Ok,
    Canceled,
}

/// One completion record.
#[derive(Debug, Clone, Copy)]
pub struct Completion {
    /// The context the operation was posted with.
    pub ctx: u64,
    /// Bytes transferred.
    pub len: usize,
    pub flags: CompFlags,
    pub status: CqStatus,
}

/// Provider limits and tunables.
#[derive(Debug, Clone)]
pub struct FabricConfig {
    /// Most segments one registration call accepts.
    pub mr_iov_limit: usize,
    /// Most segments one receive accepts.
    pub rx_iov_limit: usize,
    /// Most segments one send accepts.
    pub tx_iov_limit: usize,
    /// Most remote segments one write accepts.
    pub rma_iov_limit: usize,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            mr_iov_limit: 4,
            rx_iov_limit: 4,
            tx_iov_limit: 4,
            rma_iov_limit: 8,
        }
    }
}

static NEXT_CQ_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_cq_id() -> u64 {
    NEXT_CQ_ID.fetch_add(1, Ordering::Relaxed)
}

/// The opened fabric.
#[derive(Debug, Clone)]
pub struct Fabric {
    cfg: FabricConfig,
}

impl Fabric {
    pub fn open(cfg: FabricConfig) -> Result<Self> {
        Ok(Self { cfg })
    }

    pub fn domain(&self) -> Domain {
        Domain {
            inner: Arc::new(DomainInner {
                regions: Mutex::new(HashMap::new()),
            }),
        }
    }

    #[inline]
    pub fn mr_iov_limit(&self) -> usize {
        self.cfg.mr_iov_limit
    }

    #[inline]
    pub fn rx_iov_limit(&self) -> usize {
        self.cfg.rx_iov_limit
    }

    #[inline]
    pub fn tx_iov_limit(&self) -> usize {
        self.cfg.tx_iov_limit
    }

    #[inline]
    pub fn rma_iov_limit(&self) -> usize {
        self.cfg.rma_iov_limit
    }

    /// True when remote addresses are offsets into a registration. The core
    /// refuses providers that require virtual-address RMA; this provider
    /// never does.
    #[inline]
    pub fn offset_addressing(&self) -> bool {
        true
    }

    /// True when it is safe to wait on the queues' descriptors: no queue
    /// holds a completion that a descriptor wait would sleep past.
    pub fn trywait(cqs: &[&Cq]) -> bool {
        cqs.iter().all(|cq| !cq.ready())
    }
}

#[derive(Debug)]
struct Region {
    base: u64,
    len: usize,
    access: AccessFlags,
}

#[derive(Debug)]
pub(crate) struct DomainInner {
    regions: Mutex<HashMap<u64, Region>>,
}

impl DomainInner {
    /// Apply a remote write of `data` at `offset` into the registration
    /// named by `key`.
    ///
    /// # Safety
    /// Registered memory must stay allocated until the registration is
    /// dropped; the registering side guarantees that by keeping posted
    /// buffers alive until their completions are consumed.
    pub(crate) fn apply_write(&self, key: u64, offset: u64, data: &[u8]) -> Result<()> {
        let regions = self.regions.lock().unwrap();
        let region = regions
            .get(&key)
            .ok_or_else(|| Error::Protocol(format!("write to unknown key {key:#x}")))?;
        if !region.access.contains(AccessFlags::REMOTE_WRITE) {
            return Err(Error::Protocol(format!(
                "write to key {key:#x} without remote-write access"
            )));
        }
        let offset = offset as usize;
        if offset + data.len() > region.len {
            return Err(Error::Protocol(format!(
                "write of {} bytes at offset {offset} overruns {}-byte registration",
                data.len(),
                region.len
            )));
        }
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                (region.base as *mut u8).add(offset),
                data.len(),
            );
        }
        Ok(())
    }

    fn deregister(&self, key: u64) {
        self.regions.lock().unwrap().remove(&key);
    }
}

/// Resource domain: owns the registration table and opens endpoints.
#[derive(Debug, Clone)]
pub struct Domain {
    inner: Arc<DomainInner>,
}

impl Domain {
    /// Register `len` bytes at `addr` under `key` with the given access.
    pub fn register(
        &self,
        addr: u64,
        len: usize,
        access: AccessFlags,
        key: u64,
    ) -> Result<MemoryRegion> {
        let mut regions = self.inner.regions.lock().unwrap();
        if regions.contains_key(&key) {
            return Err(Error::Registration(format!("key {key:#x} already in use")));
        }
        regions.insert(
            key,
            Region {
                base: addr,
                len,
                access,
            },
        );
        Ok(MemoryRegion {
            inner: Arc::new(MrInner {
                key,
                domain: Arc::clone(&self.inner),
            }),
        })
    }

    pub fn av(&self) -> AddressVector {
        AddressVector {
            inner: Arc::new(AvInner {
                peers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Open an endpoint bound to `bind`, or to an ephemeral loopback port.
    pub fn endpoint(&self, av: &AddressVector, bind: Option<SocketAddr>) -> Result<Endpoint> {
        let bind = bind.unwrap_or_else(|| {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 0)
        });
        Endpoint::open(Arc::clone(&self.inner), av.clone(), bind)
    }
}

#[derive(Debug)]
struct MrInner {
    key: u64,
    domain: Arc<DomainInner>,
}

impl Drop for MrInner {
    fn drop(&mut self) {
        self.domain.deregister(self.key);
    }
}

/// A registered memory region. Clones share the registration; the fabric
/// releases it when the last clone drops.
#[derive(Debug, Clone)]
pub struct MemoryRegion {
    inner: Arc<MrInner>,
}

impl MemoryRegion {
    /// The remote key peers name this registration by.
    #[inline]
    pub fn key(&self) -> u64 {
        self.inner.key
    }
}

#[derive(Debug)]
struct AvInner {
    peers: Mutex<Vec<SocketAddr>>,
}

/// Address vector: resolves fabric addresses to peer handles.
#[derive(Debug, Clone)]
pub struct AddressVector {
    inner: Arc<AvInner>,
}

impl AddressVector {
    pub fn insert(&self, addr: &FabricAddr) -> Result<PeerAddr> {
        let sa = addr.to_socket_addr()?;
        let mut peers = self.inner.peers.lock().unwrap();
        peers.push(sa);
        Ok(PeerAddr(peers.len() as u64 - 1))
    }

    pub(crate) fn lookup(&self, peer: PeerAddr) -> Result<SocketAddr> {
        self.inner
            .peers
            .lock()
            .unwrap()
            .get(peer.0 as usize)
            .copied()
            .ok_or(Error::UnknownPeer)
    }
}

/// The local IP a connection toward `dest` would use; endpoints bind to it
/// so that the addresses they advertise are dialable from the peer.
pub fn local_ip_toward(dest: SocketAddr) -> IpAddr {
    let probe = || -> std::io::Result<IpAddr> {
        let sock = UdpSocket::bind("0.0.0.0:0")?;
        sock.connect(dest)?;
        Ok(sock.local_addr()?.ip())
    };
    probe().unwrap_or(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)))
}
