//! Shared plumbing for the `fget` and `fput` binaries: the tracing
//! subscriber, the cancel-signal trampoline, and the processor-range
//! parser.

use std::sync::atomic::Ordering;

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use tracing_subscriber::EnvFilter;

use crate::config::CANCELLED;
use crate::error::{Error, Result};

/// Install the `RUST_LOG`-driven subscriber.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init();
}

extern "C" fn handle_cancel(_signum: libc::c_int) {
    CANCELLED.store(true, Ordering::Relaxed);
}

/// Route SIGHUP/INT/QUIT/TERM to the cancel flag.
pub fn install_cancel_handlers() {
    let sa = SigAction::new(
        SigHandler::Handler(handle_cancel),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for sig in [
        Signal::SIGHUP,
        Signal::SIGINT,
        Signal::SIGQUIT,
        Signal::SIGTERM,
    ] {
        unsafe {
            let _ = signal::sigaction(sig, &sa);
        }
    }
}

/// Parse a `-p "first - last"` processor range.
pub fn parse_processors(arg: &str) -> Result<(usize, usize)> {
    let bad = || Error::InvalidConfig(format!("unexpected `-p` parameter `{arg}`"));
    let (first, last) = arg.split_once('-').ok_or_else(bad)?;
    let first = first.trim().parse().map_err(|_| bad())?;
    let last = last.trim().parse().map_err(|_| bad())?;
    if first > last {
        return Err(bad());
    }
    Ok((first, last))
}
