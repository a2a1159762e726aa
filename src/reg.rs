//! Memory-registration helpers.
//!
//! `regv_all` registers an I/O vector across as many registration calls as
//! the provider's per-call segment limit demands, a fresh key per call,
//! filling per-segment parallel arrays of registrations and cumulative
//! logical remote offsets. Remote addresses are offsets into a
//! registration, never virtual addresses.
//!
//! `fibonacci_iov_setup` splits a contiguous buffer into segments whose
//! lengths follow the Fibonacci sequence. It exists to exercise the
//! registration and scatter-gather paths with non-uniform segment sizes
//! under test.

use crate::error::{Error, Result};
use crate::fabric::{AccessFlags, Domain, MemoryRegion, Sge};
use crate::keys::KeySource;

/// Split `len` bytes at `base` into at most `niovs` segments with Fibonacci
/// lengths (1, 1, 2, 3, 5, ...), each capped at the remaining length; the
/// final segment absorbs any residue.
pub fn fibonacci_iov_setup(base: u64, len: usize, niovs: usize) -> Result<Vec<Sge>> {
    if niovs < 1 && len > 0 {
        return Err(Error::InvalidConfig(
            "fibonacci split needs at least one segment".into(),
        ));
    }

    let mut iovs = Vec::new();
    let (mut prev, mut curr) = (0usize, 1usize);
    let mut addr = base;
    let mut left = len;

    while left > 0 && iovs.len() < niovs - 1 {
        let seg = curr.min(left);
        iovs.push(Sge { addr, len: seg });
        addr += seg as u64;
        left -= seg;
        (prev, curr) = (curr, prev + curr);
    }
    if left > 0 {
        iovs.push(Sge { addr, len: left });
    }

    Ok(iovs)
}

/// Per-segment registration results of [`regv_all`]: parallel to the input
/// vector, each segment names its registration and its logical remote
/// offset within it.
#[derive(Debug)]
pub struct RegisteredIov {
    pub mrs: Vec<MemoryRegion>,
    pub raddrs: Vec<u64>,
}

/// Register the segments of `iovs` in `ceil(n / maxsegs)` calls, issuing a
/// fresh key per call. On any failure every registration issued so far is
/// released.
pub fn regv_all(
    domain: &Domain,
    iovs: &[Sge],
    maxsegs: usize,
    access: AccessFlags,
    keys: &mut KeySource,
) -> Result<RegisteredIov> {
    let mut mrs = Vec::with_capacity(iovs.len());
    let mut raddrs = Vec::with_capacity(iovs.len());

    for chunk in iovs.chunks(maxsegs) {
        let mut span = 0u64;
        for (i, seg) in chunk.iter().enumerate() {
            if i > 0 && seg.addr != chunk[0].addr + span {
                return Err(Error::Registration(
                    "segments of one registration call must be contiguous".into(),
                ));
            }
            span += seg.len as u64;
        }

        let mr = domain.register(chunk[0].addr, span as usize, access, keys.next())?;

        let mut raddr = 0u64;
        for seg in chunk {
            mrs.push(mr.clone());
            raddrs.push(raddr);
            raddr += seg.len as u64;
        }
    }

    Ok(RegisteredIov { mrs, raddrs })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::{Fabric, FabricConfig};

    #[test]
    fn test_fibonacci_lengths() {
        let iovs = fibonacci_iov_setup(0x1000, 100, 12).unwrap();
        let lens: Vec<usize> = iovs.iter().map(|s| s.len).collect();
        assert_eq!(lens, vec![1, 1, 2, 3, 5, 8, 13, 21, 34, 12]);
        assert_eq!(lens.iter().sum::<usize>(), 100);

        // Segments tile the buffer.
        let mut addr = 0x1000u64;
        for s in &iovs {
            assert_eq!(s.addr, addr);
            addr += s.len as u64;
        }
    }

    #[test]
    fn test_fibonacci_residue_absorbed() {
        let iovs = fibonacci_iov_setup(0, 1000, 4).unwrap();
        let lens: Vec<usize> = iovs.iter().map(|s| s.len).collect();
        assert_eq!(lens, vec![1, 1, 2, 996]);
    }

    #[test]
    fn test_fibonacci_single_segment() {
        let iovs = fibonacci_iov_setup(0, 540, 1).unwrap();
        assert_eq!(iovs.len(), 1);
        assert_eq!(iovs[0].len, 540);
    }

    #[test]
    fn test_fibonacci_short_buffer() {
        let iovs = fibonacci_iov_setup(0, 2, 12).unwrap();
        let lens: Vec<usize> = iovs.iter().map(|s| s.len).collect();
        assert_eq!(lens, vec![1, 1]);
    }

    #[test]
    fn test_regv_all_chunks() {
        let domain = Fabric::open(FabricConfig::default()).unwrap().domain();
        let mut keys = KeySource::new();
        let buf = vec![0u8; 100];
        let iovs = fibonacci_iov_setup(buf.as_ptr() as u64, buf.len(), 12).unwrap();

        let reg = regv_all(&domain, &iovs, 4, AccessFlags::RECV, &mut keys).unwrap();
        assert_eq!(reg.mrs.len(), iovs.len());
        assert_eq!(reg.raddrs.len(), iovs.len());

        // One key per chunk of four, shared by the chunk's segments.
        assert_eq!(reg.mrs[0].key(), reg.mrs[3].key());
        assert_ne!(reg.mrs[3].key(), reg.mrs[4].key());

        // Remote offsets are cumulative within each chunk.
        assert_eq!(reg.raddrs[0], 0);
        assert_eq!(reg.raddrs[1], 1);
        assert_eq!(reg.raddrs[2], 2);
        assert_eq!(reg.raddrs[3], 4);
        assert_eq!(reg.raddrs[4], 0);
    }
}
