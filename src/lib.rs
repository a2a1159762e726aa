//! # fabxfer - bulk data transfer over a message/RDMA fabric
//!
//! This crate implements a bidirectional bulk-data transfer service: the
//! `fput` personality pushes a byte stream into the `fget` personality with
//! one-sided remote writes, coordinated by small out-of-band control
//! messages. Peers share no pre-arranged memory layout; the receiver
//! dynamically advertises target buffers and the sender adaptively writes
//! into them, fragmenting a payload buffer across the advertised window
//! only when no further advertisements can arrive.
//!
//! ## Features
//!
//! - **Vector-advertised targets**: the receiver registers empty payload
//!   buffers and advertises them as scatter-gather vectors of
//!   `(offset, len, key)` triples
//! - **Adaptive fragmentation**: the sender splits payload buffers across a
//!   write window, with fragment children retiring into their parent
//! - **Progress-report accounting**: fenced progress messages map written
//!   bytes onto targets in advertisement order
//! - **Cooperative worker runtime**: up to 128 pinned worker threads, each
//!   multiplexing up to 8 sessions over completion queues, optionally with
//!   descriptor waits
//!
//! ## Architecture
//!
//! - [`fifo`]: bounded FIFOs with a close position
//! - [`buffer`]: transfer contexts, the buffer arena, free pools
//! - [`message`]: the four wire messages
//! - [`keys`] / [`reg`]: registration keys and scatter-gather registration
//! - [`fabric`]: the fabric collaborator (endpoints, completion queues,
//!   address vectors, keyed registration)
//! - [`ctl`]: rx/tx control queues
//! - [`terminal`]: the self-check source and sink
//! - [`cxn`] / [`rcvr`] / [`xmtr`]: the connection state machines
//! - [`session`] / [`worker`] / [`pool`]: the scheduler
//! - [`run`]: the `get` and `put` personalities

pub mod buffer;
pub mod cli;
pub mod config;
pub mod ctl;
pub mod cxn;
pub mod error;
pub mod fabric;
pub mod fifo;
pub mod keys;
pub mod message;
pub mod pool;
pub mod rcvr;
pub mod reg;
pub mod run;
pub mod session;
pub mod terminal;
pub mod worker;
pub mod xmtr;

pub use config::{RunConfig, CANCELLED};
pub use error::{Error, Result};
pub use run::{get, put, GetState, PutState, SERVICE};
