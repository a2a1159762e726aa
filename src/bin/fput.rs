//! The connector personality: push the pattern stream to a listener.

use clap::Parser;

use fabxfer::{cli, RunConfig};

#[derive(Parser, Debug)]
#[command(name = "fput")]
#[command(about = "Send a bulk transfer over the fabric")]
struct Cli {
    /// Expect cancellation; exit cleanly only if the workers were canceled
    #[arg(short = 'c')]
    expect_cancellation: bool,

    /// Contiguous writes: never scatter one write across target segments
    #[arg(short = 'g')]
    contiguous: bool,

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

    /// Destination address
    dest: String,
}

fn main() -> std::process::ExitCode {
    cli::init_tracing();
    cli::install_cancel_handlers();

    let args = Cli::parse();

    let mut cfg = RunConfig::default()
        .with_dest(args.dest)
        .with_nsessions(args.nsessions)
        .with_expect_cancellation(args.expect_cancellation)
        .with_contiguous(args.contiguous)
        .with_reregister(args.reregister)
        .with_waitfd(args.waitfd);
    if let Some(p) = &args.processors {
        match cli::parse_processors(p) {
            Ok((first, last)) => cfg = cfg.with_processors(first, last),
            Err(e) => {
                eprintln!("fput: {e}");
                return std::process::ExitCode::FAILURE;
            }
        }
    }

    match fabxfer::put(cfg) {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("fput: {e}");
            std::process::ExitCode::FAILURE
        }
    }
}
