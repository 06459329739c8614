use std::path::PathBuf;
use std::process::ExitCode;

use barhost::{Host, HostConfig, Level, Logger, TaintPolicy};
use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "barhost", disable_version_flag = true)]
struct Args {
    /// Barlib to render with (a name in the barlib directory, or a path).
    #[arg(short = 'b', value_name = "BARLIB", required_unless_present = "version")]
    barlib: Option<String>,

    /// Option passed to the barlib; may be repeated.
    #[arg(short = 'B', value_name = "OPT")]
    bar_options: Vec<String>,

    /// Log level: fatal, error, warning, info, verbose, debug or trace.
    #[arg(short = 'l', value_name = "LEVEL", default_value = "info")]
    level: Level,

    /// Exit once every plugin and the event watcher have returned.
    #[arg(short = 'e')]
    exit_when_done: bool,

    /// Start even if modules declare the same taint.
    #[arg(long)]
    ignore_taints: bool,

    /// Print version and exit.
    #[arg(short = 'v')]
    version: bool,

    widgets: Vec<PathBuf>,
}

fn main() -> ExitCode {
    let args = Args::parse();

    if args.version {
        println!("This is barhost {}.", env!("CARGO_PKG_VERSION"));
        return ExitCode::SUCCESS;
    }

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(args.level.to_tracing())
        .with_target(false)
        .init();

    let logger = Logger::tracing().with_max_level(args.level);
    let mut config = HostConfig::from_env();
    if args.ignore_taints {
        config = config.with_taint_policy(TaintPolicy::Warn);
    }

    let Some(barlib) = args.barlib else {
        return ExitCode::FAILURE;
    };

    let host = Host::new(config, logger.clone());
    let running = match host.start(&barlib, &args.bar_options, &args.widgets) {
        Ok(running) => running,
        Err(e) => {
            barhost::log_at!(logger, Fatal, "{}", e);
            return ExitCode::FAILURE;
        }
    };

    if args.exit_when_done {
        running.wait();
        return ExitCode::SUCCESS;
    }
    let _keep = running;
    loop {
        std::thread::park();
    }
}
