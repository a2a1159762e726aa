//! The listener personality: receive a bulk transfer and verify it.

use clap::Parser;

use fabxfer::{cli, RunConfig};

#[derive(Parser, Debug)]
#[command(name = "fget")]
#[command(about = "Receive a bulk transfer over the fabric")]
struct Cli {
    /// Local bind address
    #[arg(short = 'b')]
    bind: Option<String>,

    /// Expect cancellation; exit cleanly only if the workers were canceled
    #[arg(short = 'c')]
    expect_cancellation: bool,

    /// Number of parallel sessions
    #[arg(short = 'n', default_value = "1")]
    nsessions: usize,

    /// CPU range "first - last" for worker affinity
    #[arg(short = 'p')]
    processors: Option<String>,

    /// Re-register payload buffers per write
    #[arg(short = 'r')]
    reregister: bool,

    /// Wait on completion-queue descriptors instead of polling
    #[arg(short = 'w')]
    waitfd: bool,
}

fn main() -> std::process::ExitCode {
    cli::init_tracing();
    cli::install_cancel_handlers();

    let args = Cli::parse();

    let mut cfg = RunConfig::default()
        .with_nsessions(args.nsessions)
        .with_expect_cancellation(args.expect_cancellation)
        .with_reregister(args.reregister)
        .with_waitfd(args.waitfd);
    if let Some(bind) = args.bind {
        cfg = cfg.with_bind(bind);
    }
    if let Some(p) = &args.processors {
        match cli::parse_processors(p) {
            Ok((first, last)) => cfg = cfg.with_processors(first, last),
            Err(e) => {
                eprintln!("fget: {e}");
                return std::process::ExitCode::FAILURE;
            }
        }
    }

    match fabxfer::get(cfg) {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("fget: {e}");
            std::process::ExitCode::FAILURE
        }
    }
}
