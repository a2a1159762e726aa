//! Out-of-band control messages.
//!
//! Four fixed-layout messages coordinate the transfer: the sender's
//! `initial` message, the receiver's `ack`, the receiver's RDMA-target
//! `vector` advertisements, and the sender's `progress` reports. All
//! integers are little-endian on the wire.
//!
//! Layouts:
//! ```text
//! initial   nonce[16]  nsources:u32  id:u32  addrlen:u32  addr[512]   (540 B)
//! ack       addrlen:u32  addr[512]                                    (516 B)
//! vector    niovs:u32  pad:u32  niovs x (addr:u64 len:u64 key:u64)    (<= 296 B)
//! progress  nfilled:u64  nleftover:u64                                (16 B)
//! ```

use crate::error::{Error, Result};
use crate::fabric::{FabricAddr, RmaIov, ADDR_MAX};

/// Most scatter-gather entries one vector message can carry.
pub const VECTOR_IOVS_MAX: usize = 12;

/// Wire size of an initial message.
pub const INITIAL_MSG_SIZE: usize = 16 + 4 + 4 + 4 + ADDR_MAX;

/// Wire size of an ack message.
pub const ACK_MSG_SIZE: usize = 4 + ADDR_MAX;

/// Wire size of a vector message header (`niovs` and padding).
pub const VECTOR_HDR_SIZE: usize = 8;

/// Wire size of one vector message scatter-gather entry.
pub const VECTOR_IOV_SIZE: usize = 24;

/// Largest wire size of a vector message.
pub const VECTOR_MSG_MAX: usize = VECTOR_HDR_SIZE + VECTOR_IOVS_MAX * VECTOR_IOV_SIZE;

/// Wire size of a progress message.
pub const PROGRESS_MSG_SIZE: usize = 16;

fn put_u32(buf: &mut [u8], at: usize, v: u32) {
    buf[at..at + 4].copy_from_slice(&v.to_le_bytes());
}

fn put_u64(buf: &mut [u8], at: usize, v: u64) {
    buf[at..at + 8].copy_from_slice(&v.to_le_bytes());
}

fn get_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(buf[at..at + 4].try_into().unwrap())
}

fn get_u64(buf: &[u8], at: usize) -> u64 {
    u64::from_le_bytes(buf[at..at + 8].try_into().unwrap())
}

fn put_addr(buf: &mut [u8], at: usize, addr: &FabricAddr) {
    put_u32(buf, at, addr.len() as u32);
    buf[at + 4..at + 4 + addr.len()].copy_from_slice(addr.as_bytes());
    buf[at + 4 + addr.len()..at + 4 + ADDR_MAX].fill(0);
}

fn get_addr(buf: &[u8], at: usize, what: &'static str) -> Result<FabricAddr> {
    let addrlen = get_u32(buf, at) as usize;
    if addrlen > ADDR_MAX {
        return Err(Error::MalformedMessage {
            what,
            detail: format!("addrlen {addrlen} exceeds {ADDR_MAX}"),
        });
    }
    Ok(FabricAddr::new(&buf[at + 4..at + 4 + addrlen]))
}

/// First message of a session, sender to receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitialMsg {
    /// Reserved; written as zero and ignored on receipt.
    pub nonce: [u8; 16],
    /// Number of sessions the sender will open.
    pub nsources: u32,
    /// 0-based index of this session among `nsources`.
    pub id: u32,
    /// The sender's fabric address for this session.
    pub addr: FabricAddr,
}

impl InitialMsg {
    pub fn new(nsources: u32, id: u32, addr: FabricAddr) -> Self {
        Self {
            nonce: [0; 16],
            nsources,
            id,
            addr,
        }
    }

    pub fn encode_to(&self, buf: &mut [u8]) {
        assert!(buf.len() >= INITIAL_MSG_SIZE);
        buf[..16].copy_from_slice(&self.nonce);
        put_u32(buf, 16, self.nsources);
        put_u32(buf, 20, self.id);
        put_addr(buf, 24, &self.addr);
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != INITIAL_MSG_SIZE {
            return Err(Error::MalformedMessage {
                what: "initial",
                detail: format!("expected {INITIAL_MSG_SIZE} bytes, got {}", buf.len()),
            });
        }
        Ok(Self {
            nonce: buf[..16].try_into().unwrap(),
            nsources: get_u32(buf, 16),
            id: get_u32(buf, 20),
            addr: get_addr(buf, 24, "initial")?,
        })
    }
}

/// Receiver's reply to the initial message, carrying the fabric address of
/// the endpoint it opened for this session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckMsg {
    pub addr: FabricAddr,
}

impl AckMsg {
    pub fn new(addr: FabricAddr) -> Self {
        Self { addr }
    }

    pub fn encode_to(&self, buf: &mut [u8]) {
        assert!(buf.len() >= ACK_MSG_SIZE);
        put_addr(buf, 0, &self.addr);
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != ACK_MSG_SIZE {
            return Err(Error::MalformedMessage {
                what: "ack",
                detail: format!("expected {ACK_MSG_SIZE} bytes, got {}", buf.len()),
            });
        }
        Ok(Self {
            addr: get_addr(buf, 0, "ack")?,
        })
    }
}

/// RDMA-target advertisement, receiver to sender. `niovs == 0` means end of
/// stream: no more target buffers are coming.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VectorMsg {
    pub iovs: Vec<RmaIov>,
}

impl VectorMsg {
    pub fn new(iovs: Vec<RmaIov>) -> Self {
        debug_assert!(iovs.len() <= VECTOR_IOVS_MAX);
        Self { iovs }
    }

    /// An empty advertisement; signals receiver-side end of stream.
    pub fn eof() -> Self {
        Self { iovs: Vec::new() }
    }

    /// Bytes this message occupies on the wire.
    pub fn wire_len(&self) -> usize {
        VECTOR_HDR_SIZE + self.iovs.len() * VECTOR_IOV_SIZE
    }

    pub fn encode_to(&self, buf: &mut [u8]) {
        assert!(buf.len() >= self.wire_len());
        put_u32(buf, 0, self.iovs.len() as u32);
        put_u32(buf, 4, 0);
        for (i, iov) in self.iovs.iter().enumerate() {
            let at = VECTOR_HDR_SIZE + i * VECTOR_IOV_SIZE;
            put_u64(buf, at, iov.addr);
            put_u64(buf, at + 8, iov.len);
            put_u64(buf, at + 16, iov.key);
        }
    }

    /// Decode a received vector message of `len` wire bytes.
    ///
    /// The well-formedness rules: the message must cover its header, end on
    /// an entry boundary, and carry no more entries than it has room for or
    /// than the protocol allows.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let len = buf.len();
        if len < VECTOR_HDR_SIZE {
            return Err(Error::MalformedMessage {
                what: "vector",
                detail: format!("expected >= {VECTOR_HDR_SIZE} bytes, got {len}"),
            });
        }
        if (len - VECTOR_HDR_SIZE) % VECTOR_IOV_SIZE != 0 {
            return Err(Error::MalformedMessage {
                what: "vector",
                detail: format!("{len}-byte message does not end on an entry boundary"),
            });
        }
        let niovs = get_u32(buf, 0) as usize;
        let niovs_space = (len - VECTOR_HDR_SIZE) / VECTOR_IOV_SIZE;
        if niovs > niovs_space {
            return Err(Error::MalformedMessage {
                what: "vector",
                detail: "truncated entries".into(),
            });
        }
        if niovs > VECTOR_IOVS_MAX {
            return Err(Error::MalformedMessage {
                what: "vector",
                detail: format!("too many entries: {niovs}"),
            });
        }
        let iovs = (0..niovs)
            .map(|i| {
                let at = VECTOR_HDR_SIZE + i * VECTOR_IOV_SIZE;
                RmaIov {
                    addr: get_u64(buf, at),
                    len: get_u64(buf, at + 8),
                    key: get_u64(buf, at + 16),
                }
            })
            .collect();
        Ok(Self { iovs })
    }
}

/// Write-progress report, sender to receiver. `nleftover == 0` means the
/// sender will write no more bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressMsg {
    /// Bytes written since the previous progress message.
    pub nfilled: u64,
    /// Nonzero when more data follows.
    pub nleftover: u64,
}

impl ProgressMsg {
    pub fn encode_to(&self, buf: &mut [u8]) {
        assert!(buf.len() >= PROGRESS_MSG_SIZE);
        put_u64(buf, 0, self.nfilled);
        put_u64(buf, 8, self.nleftover);
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != PROGRESS_MSG_SIZE {
            return Err(Error::MalformedMessage {
                what: "progress",
                detail: format!("expected {PROGRESS_MSG_SIZE} bytes, got {}", buf.len()),
            });
        }
        Ok(Self {
            nfilled: get_u64(buf, 0),
            nleftover: get_u64(buf, 8),
        })
    }
}
