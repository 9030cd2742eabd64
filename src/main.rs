//! CLI entry point: parse arguments, validate configuration, and run the
//! driver loop until a fatal error or a termination signal.

use clap::Parser;
use log::error;

use quantisd::config::{CliArgs, Config};
use quantisd::driver::Driver;
use quantisd::error::DaemonError;

/// Exit codes mirror the original daemon: 0 on a clean signalled shutdown,
/// 1 on a usage/configuration error, -1 (255) on a network/USB setup
/// failure once running, -3 (253) on an allocation failure.
fn main() {
    let args = CliArgs::parse();

    if args.show_version {
        eprintln!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
        std::process::exit(1);
    }

    let config = match Config::from_args(&args) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    env_logger::Builder::new()
        .filter_level(config.log_level)
        .init();

    let mut driver = match Driver::new(&config) {
        Ok(d) => d,
        Err(e) => {
            error!("failed to start: {e}");
            std::process::exit(exit_code(&e));
        }
    };

    if let Err(e) = driver.run() {
        error!("fatal error: {e}");
        std::process::exit(exit_code(&e));
    }
}

fn exit_code(err: &DaemonError) -> i32 {
    match err {
        DaemonError::OutOfMemory => -3,
        DaemonError::Configuration(_) => 1,
        DaemonError::UsbInit(_) => -3,
        DaemonError::Network(_) | DaemonError::UsbTransfer(_) => -1,
        DaemonError::ProtocolViolation(_) | DaemonError::IdleTimeout => -1,
        DaemonError::Signalled => 0,
    }
}
