//! Buffers and the transfer context embedded in every completion.
//!
//! Every buffer a connection posts carries a transfer context: a kind tag,
//! an owner bit, placement bits for multi-buffer writes, an
//! outstanding-child count, and a cancelled flag. The fabric hands back the
//! context token an operation was posted with, so the core identifies a
//! completion's kind by looking the token up in the worker's buffer arena
//! and reading the tag.
//!
//! Buffers live in a per-worker arena ([`BufArena`]); FIFOs and pools move
//! [`BufId`] tokens, never the buffers themselves, so a fragment can name
//! its parent while both sit on different queues. The byte storage of a
//! buffer never moves once allocated, which is what lets registrations and
//! posted operations hold raw addresses into it.

use bitflags::bitflags;
use slab::Slab;

use crate::fabric::{MemoryRegion, Sge};

/// Transfer kind, the tag completions are dispatched by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XferKind {
    Ack,
    Fragment,
    Initial,
    Progress,
    RdmaWrite,
    Vector,
}

/// Which side currently owns a posted buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    Program,
    Nic,
}

bitflags! {
    /// Placement of a buffer within one multi-buffer write.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Place: u8 {
        const FIRST = 0x1;
        const LAST = 0x2;
    }
}

/// The context the fabric returns on completion.
#[derive(Debug, Clone)]
pub struct XferContext {
    pub kind: XferKind,
    pub owner: Owner,
    pub place: Place,
    pub nchildren: u8,
    pub cancelled: bool,
}

impl XferContext {
    pub fn new(kind: XferKind) -> Self {
        Self {
            kind,
            owner: Owner::Program,
            place: Place::empty(),
            nchildren: 0,
            cancelled: false,
        }
    }
}

/// A buffer: header plus owned byte storage. Fragments own no storage; they
/// reference a parent buffer's bytes and registration.
#[derive(Debug)]
pub struct Buffer {
    pub xfc: XferContext,
    /// Bytes of the storage currently meaningful.
    pub nused: usize,
    /// Remote-address hint; on a fragment, the offset into the parent.
    pub raddr: u64,
    pub mr: Option<MemoryRegion>,
    /// Set on fragments only.
    pub parent: Option<BufId>,
    data: Box<[u8]>,
}

impl Buffer {
    /// Allocate a byte buffer of `paylen` bytes tagged `kind`.
    pub fn bytes(kind: XferKind, paylen: usize) -> Self {
        Self {
            xfc: XferContext::new(kind),
            nused: 0,
            raddr: 0,
            mr: None,
            parent: None,
            data: vec![0u8; paylen].into_boxed_slice(),
        }
    }

    /// Allocate a fragment header.
    pub fn fragment() -> Self {
        Self {
            xfc: XferContext::new(XferKind::Fragment),
            nused: 0,
            raddr: 0,
            mr: None,
            parent: None,
            data: Box::new([]),
        }
    }

    #[inline]
    pub fn nallocated(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Base address of the storage, for registration and posting.
    #[inline]
    pub fn base_addr(&self) -> u64 {
        self.data.as_ptr() as u64
    }

    /// The whole allocation as one segment, for receive posts.
    #[inline]
    pub fn sge_allocated(&self) -> Sge {
        Sge {
            addr: self.base_addr(),
            len: self.nallocated(),
        }
    }

    /// The used prefix as one segment, for sends.
    #[inline]
    pub fn sge_used(&self) -> Sge {
        Sge {
            addr: self.base_addr(),
            len: self.nused,
        }
    }
}

/// Token naming a buffer in its worker's arena. Doubles as the fabric
/// completion context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufId(usize);

impl BufId {
    #[inline]
    pub fn ctx(self) -> u64 {
        self.0 as u64
    }

    #[inline]
    pub fn from_ctx(ctx: u64) -> Self {
        Self(ctx as usize)
    }
}

/// Per-worker buffer arena.
#[derive(Debug, Default)]
pub struct BufArena {
    slab: Slab<Buffer>,
}

impl BufArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, buf: Buffer) -> BufId {
        BufId(self.slab.insert(buf))
    }

    #[inline]
    pub fn get(&self, id: BufId) -> &Buffer {
        &self.slab[id.0]
    }

    #[inline]
    pub fn get_mut(&mut self, id: BufId) -> &mut Buffer {
        &mut self.slab[id.0]
    }

    #[inline]
    pub fn contains(&self, ctx: u64) -> bool {
        self.slab.contains(ctx as usize)
    }

    pub fn remove(&mut self, id: BufId) -> Buffer {
        self.slab.remove(id.0)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.slab.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slab.is_empty()
    }
}

/// Fixed-capacity free list of buffers.
#[derive(Debug)]
pub struct BufList {
    ids: Vec<BufId>,
    cap: usize,
}

impl BufList {
    pub fn new(cap: usize) -> Self {
        Self {
            ids: Vec::with_capacity(cap),
            cap,
        }
    }

    pub fn get(&mut self) -> Option<BufId> {
        self.ids.pop()
    }

    pub fn put(&mut self, id: BufId) -> Result<(), BufId> {
        if self.ids.len() == self.cap {
            return Err(id);
        }
        self.ids.push(id);
        Ok(())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.cap
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_storage_is_stable() {
        let mut arena = BufArena::new();
        let id = arena.insert(Buffer::bytes(XferKind::RdmaWrite, 64));
        let addr = arena.get(id).base_addr();
        // Growing the arena must not move existing storage.
        let more: Vec<BufId> = (0..64)
            .map(|_| arena.insert(Buffer::bytes(XferKind::RdmaWrite, 16)))
            .collect();
        assert_eq!(arena.get(id).base_addr(), addr);
        for id in more {
            arena.remove(id);
        }
    }

    #[test]
    fn test_buflist_capacity() {
        let mut arena = BufArena::new();
        let mut pool = BufList::new(2);
        let a = arena.insert(Buffer::bytes(XferKind::Progress, 16));
        let b = arena.insert(Buffer::bytes(XferKind::Progress, 16));
        let c = arena.insert(Buffer::bytes(XferKind::Progress, 16));
        pool.put(a).unwrap();
        pool.put(b).unwrap();
        assert!(pool.put(c).is_err());
        assert_eq!(pool.get(), Some(b));
        assert_eq!(pool.get(), Some(a));
        assert_eq!(pool.get(), None);
    }

    #[test]
    fn test_ctx_roundtrip() {
        let mut arena = BufArena::new();
        let id = arena.insert(Buffer::fragment());
        assert_eq!(BufId::from_ctx(id.ctx()), id);
        assert!(arena.contains(id.ctx()));
    }
}
