//! Data terminals: the pattern source and the verifying sink.
//!
//! A terminal trades buffers with its connection across the session FIFOs:
//! the source copies a repeating text pattern into payload buffers until a
//! fixed total is produced, then closes its completed FIFO; the sink
//! verifies arriving payloads against the same pattern at the matching
//! offset and closes its ready FIFO once the total arrives. A payload
//! mismatch is a fatal loop error.

use tracing::trace;

use crate::buffer::{BufArena, BufId};
use crate::cxn::LoopCtl;
use crate::error::{Error, Result};
use crate::fifo::Fifo;

/// The fixed self-check pattern.
pub const PATTERN: &[u8] =
    b"If this message was received in error then please print it out and shred it.";

/// How many times the pattern repeats in one transfer.
pub const PATTERN_REPEATS: usize = 100_000;

/// Total bytes one transfer carries.
pub fn entire_len() -> usize {
    PATTERN.len() * PATTERN_REPEATS
}

/// The producing or consuming end of a session.
#[derive(Debug)]
pub enum Terminal {
    Source(Source),
    Sink(Sink),
}

impl Terminal {
    /// Trade buffers with the connection: take from `ready`, hand results to
    /// `completed`.
    pub fn trade(
        &mut self,
        arena: &mut BufArena,
        ready: &mut Fifo<BufId>,
        completed: &mut Fifo<BufId>,
    ) -> Result<LoopCtl> {
        match self {
            Terminal::Source(s) => s.trade(arena, ready, completed),
            Terminal::Sink(s) => s.trade(arena, ready, completed),
        }
    }
}

/// Produces the pattern into empty payload buffers.
#[derive(Debug)]
pub struct Source {
    idx: usize,
    txbuflen: usize,
    entirelen: usize,
}

impl Default for Source {
    fn default() -> Self {
        Self::new()
    }
}

impl Source {
    pub fn new() -> Self {
        Self {
            idx: 0,
            txbuflen: PATTERN.len(),
            entirelen: entire_len(),
        }
    }

    fn trade(
        &mut self,
        arena: &mut BufArena,
        ready: &mut Fifo<BufId>,
        completed: &mut Fifo<BufId>,
    ) -> Result<LoopCtl> {
        if completed.eoput() {
            return Ok(LoopCtl::End);
        }

        while let Some(&id) = ready.peek() {
            if completed.full() {
                break;
            }
            if self.idx == self.entirelen {
                completed.put_close();
                break;
            }

            let buf = arena.get_mut(id);
            buf.nused = (self.entirelen - self.idx).min(buf.nallocated());
            let nused = buf.nused;
            let mut ofs = 0;
            while ofs < nused {
                let pat_ofs = (self.idx + ofs) % self.txbuflen;
                let len = (nused - ofs).min(self.txbuflen - pat_ofs);
                buf.payload_mut()[ofs..ofs + len]
                    .copy_from_slice(&PATTERN[pat_ofs..pat_ofs + len]);
                ofs += len;
            }

            let _ = ready.get();
            let _ = completed.alt_put(id);
            self.idx += nused;
        }

        if self.idx != self.entirelen {
            return Ok(LoopCtl::Continue);
        }
        Ok(LoopCtl::End)
    }
}

/// Verifies filled payload buffers against the pattern.
#[derive(Debug)]
pub struct Sink {
    idx: usize,
    txbuflen: usize,
    entirelen: usize,
}

impl Default for Sink {
    fn default() -> Self {
        Self::new()
    }
}

impl Sink {
    pub fn new() -> Self {
        Self {
            idx: 0,
            txbuflen: PATTERN.len(),
            entirelen: entire_len(),
        }
    }

    fn trade(
        &mut self,
        arena: &mut BufArena,
        ready: &mut Fifo<BufId>,
        completed: &mut Fifo<BufId>,
    ) -> Result<LoopCtl> {
        if ready.eoget() {
            if !ready.alt_empty() {
                return self.fail();
            }
            return Ok(LoopCtl::End);
        }

        while let Some(&id) = ready.peek() {
            if completed.full() {
                break;
            }
            let buf = arena.get(id);

            if buf.nused + self.idx > self.entirelen {
                return self.fail();
            }

            let mut ofs = 0;
            while ofs < buf.nused {
                let pat_ofs = (self.idx + ofs) % self.txbuflen;
                let len = (buf.nused - ofs).min(self.txbuflen - pat_ofs);
                if buf.payload()[ofs..ofs + len] != PATTERN[pat_ofs..pat_ofs + len] {
                    return self.fail();
                }
                ofs += len;
            }

            let _ = ready.get();
            let _ = completed.put(id);
            self.idx += buf.nused;
        }

        if self.idx != self.entirelen {
            return Ok(LoopCtl::Continue);
        }

        ready.get_close();
        Ok(LoopCtl::End)
    }

    fn fail(&self) -> Result<LoopCtl> {
        trace!(target: "payverify", "unexpected received payload");
        Err(Error::PayloadMismatch { offset: self.idx })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{Buffer, XferKind};

    fn payload_bufs(arena: &mut BufArena, fifo: &mut Fifo<BufId>, sizes: &[usize]) {
        for &size in sizes {
            let id = arena.insert(Buffer::bytes(XferKind::RdmaWrite, size));
            fifo.put(id).unwrap();
        }
    }

    #[test]
    fn test_source_fills_and_closes() {
        let mut arena = BufArena::new();
        let mut ready = Fifo::new(64);
        let mut completed = Fifo::new(64);
        payload_bufs(&mut arena, &mut ready, &[23, 29, 31, 37]);

        let mut src = Source::new();
        let ctl = src.trade(&mut arena, &mut ready, &mut completed).unwrap();
        assert_eq!(ctl, LoopCtl::Continue);
        assert_eq!(completed.len(), 4);

        // Every produced byte matches the pattern at its stream offset.
        let mut idx = 0;
        while let Some(id) = completed.get() {
            let buf = arena.get(id);
            for (i, &b) in buf.payload()[..buf.nused].iter().enumerate() {
                assert_eq!(b, PATTERN[(idx + i) % PATTERN.len()]);
            }
            idx += buf.nused;
        }
    }

    #[test]
    fn test_source_sink_pipeline() {
        let mut arena = BufArena::new();
        let mut src_ready = Fifo::new(64);
        let mut pipe = Fifo::new(64);
        let mut sink_ready = Fifo::new(64);
        let mut sink_done = Fifo::new(64);
        payload_bufs(&mut arena, &mut src_ready, &[23, 29, 31, 37]);

        let mut src = Source::new();
        let mut sink = Sink::new();
        let mut moved = 0usize;

        loop {
            let sctl = src.trade(&mut arena, &mut src_ready, &mut pipe).unwrap();
            // Stand in for the connection: carry filled buffers across.
            while let Some(id) = pipe.get() {
                sink_ready.put(id).unwrap();
            }
            let kctl = sink
                .trade(&mut arena, &mut sink_ready, &mut sink_done)
                .unwrap();
            // Recycle drained buffers back to the source.
            while let Some(id) = sink_done.get() {
                moved += arena.get(id).nused;
                arena.get_mut(id).nused = 0;
                let _ = src_ready.put(id);
            }
            if sctl == LoopCtl::End && kctl == LoopCtl::End {
                break;
            }
        }
        assert_eq!(moved, entire_len());
        assert!(pipe.eoput());
        assert!(sink_ready.eoget());
    }

    #[test]
    fn test_sink_detects_mismatch() {
        let mut arena = BufArena::new();
        let mut ready = Fifo::new(8);
        let mut completed = Fifo::new(8);

        let id = arena.insert(Buffer::bytes(XferKind::RdmaWrite, 23));
        let buf = arena.get_mut(id);
        buf.nused = 23;
        buf.payload_mut()[..23].copy_from_slice(&PATTERN[..23]);
        buf.payload_mut()[10] ^= 0xFF;
        ready.put(id).unwrap();

        let mut sink = Sink::new();
        assert!(matches!(
            sink.trade(&mut arena, &mut ready, &mut completed),
            Err(Error::PayloadMismatch { .. })
        ));
    }

    #[test]
    fn test_sink_rejects_overrun() {
        let mut arena = BufArena::new();
        let mut ready = Fifo::new(8);
        let mut completed = Fifo::new(8);

        let id = arena.insert(Buffer::bytes(XferKind::RdmaWrite, 64));
        arena.get_mut(id).nused = 64;
        ready.put(id).unwrap();

        let mut sink = Sink::new();
        sink.idx = entire_len() - 10;
        assert!(sink.trade(&mut arena, &mut ready, &mut completed).is_err());
    }
}
