//! Internal framing of the socket-backed provider.
//!
//! Every byte on a provider stream belongs to one frame:
//! `[kind:u8][len:u32 LE][body...]`. The `Hello` frame opens a stream and
//! names the dialing endpoint's listener address; `Msg` carries one posted
//! message; `Write` carries a one-sided write (id, remote segments, data);
//! `WriteAck` acknowledges a fully applied write back to its initiator.

use crate::error::{Error, Result};
use crate::fabric::RmaIov;

const FRAME_HDR: usize = 5;

/// Largest frame body the parser will accept, a backstop against garbage
/// lengths from a misbehaving peer.
const BODY_MAX: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum FrameKind {
    Hello = 1,
    Msg = 2,
    Write = 3,
    WriteAck = 4,
}

impl TryFrom<u8> for FrameKind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(FrameKind::Hello),
            2 => Ok(FrameKind::Msg),
            3 => Ok(FrameKind::Write),
            4 => Ok(FrameKind::WriteAck),
            _ => Err(Error::Protocol(format!("unknown frame kind {value}"))),
        }
    }
}

pub(crate) fn frame(kind: FrameKind, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(FRAME_HDR + body.len());
    out.push(kind as u8);
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(body);
    out
}

pub(crate) fn hello_frame(addr: &[u8]) -> Vec<u8> {
    frame(FrameKind::Hello, addr)
}

pub(crate) fn msg_frame(payload: &[u8]) -> Vec<u8> {
    frame(FrameKind::Msg, payload)
}

pub(crate) fn write_frame(write_id: u64, riovs: &[RmaIov], data: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(12 + riovs.len() * 24 + data.len());
    body.extend_from_slice(&write_id.to_le_bytes());
    body.extend_from_slice(&(riovs.len() as u32).to_le_bytes());
    for riov in riovs {
        body.extend_from_slice(&riov.key.to_le_bytes());
        body.extend_from_slice(&riov.addr.to_le_bytes());
        body.extend_from_slice(&riov.len.to_le_bytes());
    }
    body.extend_from_slice(data);
    frame(FrameKind::Write, &body)
}

pub(crate) fn write_ack_frame(write_id: u64) -> Vec<u8> {
    frame(FrameKind::WriteAck, &write_id.to_le_bytes())
}

/// A decoded `Write` frame body.
pub(crate) struct WriteBody<'a> {
    pub write_id: u64,
    pub riovs: Vec<RmaIov>,
    pub data: &'a [u8],
}

pub(crate) fn decode_write(body: &[u8]) -> Result<WriteBody<'_>> {
    let short = || Error::Protocol("truncated write frame".into());
    if body.len() < 12 {
        return Err(short());
    }
    let write_id = u64::from_le_bytes(body[..8].try_into().unwrap());
    let nsegs = u32::from_le_bytes(body[8..12].try_into().unwrap()) as usize;
    let segs_end = 12 + nsegs * 24;
    if body.len() < segs_end {
        return Err(short());
    }
    let mut riovs = Vec::with_capacity(nsegs);
    let mut total = 0usize;
    for i in 0..nsegs {
        let at = 12 + i * 24;
        let riov = RmaIov {
            key: u64::from_le_bytes(body[at..at + 8].try_into().unwrap()),
            addr: u64::from_le_bytes(body[at + 8..at + 16].try_into().unwrap()),
            len: u64::from_le_bytes(body[at + 16..at + 24].try_into().unwrap()),
        };
        total += riov.len as usize;
        riovs.push(riov);
    }
    let data = &body[segs_end..];
    if data.len() != total {
        return Err(Error::Protocol(format!(
            "write frame carries {} data bytes for {total} segment bytes",
            data.len()
        )));
    }
    Ok(WriteBody {
        write_id,
        riovs,
        data,
    })
}

/// Accumulates stream bytes and yields complete frames.
#[derive(Debug, Default)]
pub(crate) struct FrameReader {
    buf: Vec<u8>,
}

impl FrameReader {
    pub(crate) fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub(crate) fn next(&mut self) -> Result<Option<(FrameKind, Vec<u8>)>> {
        if self.buf.len() < FRAME_HDR {
            return Ok(None);
        }
        let kind = FrameKind::try_from(self.buf[0])?;
        let len = u32::from_le_bytes(self.buf[1..5].try_into().unwrap()) as usize;
        if len > BODY_MAX {
            return Err(Error::Protocol(format!("oversized frame body: {len}")));
        }
        if self.buf.len() < FRAME_HDR + len {
            return Ok(None);
        }
        let body = self.buf[FRAME_HDR..FRAME_HDR + len].to_vec();
        self.buf.drain(..FRAME_HDR + len);
        Ok(Some((kind, body)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip() {
        let mut rd = FrameReader::default();
        rd.feed(&msg_frame(b"hello"));
        let (kind, body) = rd.next().unwrap().unwrap();
        assert_eq!(kind, FrameKind::Msg);
        assert_eq!(body, b"hello");
        assert!(rd.next().unwrap().is_none());
    }

    #[test]
    fn test_partial_feed() {
        let bytes = msg_frame(b"split");
        let mut rd = FrameReader::default();
        rd.feed(&bytes[..3]);
        assert!(rd.next().unwrap().is_none());
        rd.feed(&bytes[3..]);
        let (_, body) = rd.next().unwrap().unwrap();
        assert_eq!(body, b"split");
    }

    #[test]
    fn test_write_roundtrip() {
        let riovs = vec![
            RmaIov {
                key: 7,
                addr: 0,
                len: 3,
            },
            RmaIov {
                key: 8,
                addr: 16,
                len: 2,
            },
        ];
        let bytes = write_frame(42, &riovs, b"abcde");
        let mut rd = FrameReader::default();
        rd.feed(&bytes);
        let (kind, body) = rd.next().unwrap().unwrap();
        assert_eq!(kind, FrameKind::Write);
        let wb = decode_write(&body).unwrap();
        assert_eq!(wb.write_id, 42);
        assert_eq!(wb.riovs, riovs);
        assert_eq!(wb.data, b"abcde");
    }

    #[test]
    fn test_write_length_mismatch() {
        let riovs = vec![RmaIov {
            key: 7,
            addr: 0,
            len: 4,
        }];
        let bytes = write_frame(1, &riovs, b"abc");
        let mut rd = FrameReader::default();
        rd.feed(&bytes);
        let (_, body) = rd.next().unwrap().unwrap();
        assert!(decode_write(&body).is_err());
    }

    #[test]
    fn test_unknown_kind() {
        let mut rd = FrameReader::default();
        rd.feed(&[0xEE, 0, 0, 0, 0]);
        assert!(rd.next().is_err());
    }
}
