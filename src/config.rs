//! Command-line surface and the validated configuration it produces.

use std::path::PathBuf;

use clap::Parser;
use log::LevelFilter;

use crate::error::{DaemonError, Result};

/// Minimum ring buffer capacity: enough free space for at least one
/// low-water replenishment (`BUFFER_SPACE`).
pub const MIN_BUF_SIZE: usize = BUFFER_SPACE;

/// Low-water free-space threshold that gates resuming ingestion.
pub const BUFFER_SPACE: usize = 512 * 16;

pub const DEFAULT_ENTROPY_BUF_SIZE: usize = 2 * 1024 * 1024;
pub const DEFAULT_PORT: u16 = 4545;
pub const DEFAULT_VERBOSITY: i8 = 2;

pub const MAX_CLIENTS: usize = 512;
pub const MAX_IDLE_SECS: u64 = 30;
pub const MAX_FRAME_SIZE: usize = 65536;
pub const HEADER_SIZE: usize = 4;

pub const QUANTIS_VENDOR_ID: u16 = 0x0aba;
pub const QUANTIS_PRODUCT_ID: u16 = 0x0102;

/// Raw CLI surface, parsed with `clap`. `-h`/`--help` is handled by clap
/// itself (exit 0); `-v` is intentionally hand-rolled below so it keeps the
/// original daemon's exit code of 1 instead of clap's usual 0.
#[derive(Parser, Debug)]
#[command(
    name = "quantisd",
    disable_version_flag = true,
    about = "Distributes entropy from Quantis USB hardware RNGs over TCP"
)]
pub struct CliArgs {
    /// Listen on IPv4 only.
    #[arg(short = '4', default_value_t = false)]
    pub ipv4_only: bool,

    /// Listen on IPv6 only.
    #[arg(short = '6', default_value_t = false)]
    pub ipv6_only: bool,

    /// Ring buffer capacity, in bytes.
    #[arg(short = 'b', value_name = "SIZE")]
    pub buffer_size: Option<usize>,

    /// TCP port to listen on.
    #[arg(short = 'p', value_name = "PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Log verbosity: -1 critical only, 0 errors, 1 warnings, 2 info, 3 debug.
    #[arg(short = 'l', value_name = "LEVEL", default_value_t = DEFAULT_VERBOSITY, allow_negative_numbers = true)]
    pub verbosity: i8,

    /// Tee raw hardware ingest to this file (for testing hardware fidelity).
    #[arg(short = 'o', value_name = "FILE")]
    pub tee_file: Option<PathBuf>,

    /// Print version and usage, then exit with status 1.
    #[arg(short = 'v', default_value_t = false)]
    pub show_version: bool,

    /// Extra positional arguments are a usage error, never accepted.
    #[arg(trailing_var_arg = true, hide = true)]
    pub extra: Vec<String>,
}

/// Validated, immutable configuration the rest of the daemon runs from.
#[derive(Debug, Clone)]
pub struct Config {
    pub ipv4_enabled: bool,
    pub ipv6_enabled: bool,
    pub port: u16,
    pub buffer_capacity: usize,
    pub log_level: LevelFilter,
    pub tee_path: Option<PathBuf>,
}

impl Config {
    /// Validates raw CLI args into a `Config`. Does not touch sockets, the
    /// USB context, or the tee file — only bounds-checks.
    pub fn from_args(args: &CliArgs) -> Result<Self> {
        if !args.extra.is_empty() {
            return Err(DaemonError::Configuration(
                "extra characters after options".into(),
            ));
        }

        let (ipv4_enabled, ipv6_enabled) = match (args.ipv4_only, args.ipv6_only) {
            (true, true) => (true, true),
            (true, false) => (true, false),
            (false, true) => (false, true),
            (false, false) => (true, true),
        };

        if !ipv4_enabled && !ipv6_enabled {
            return Err(DaemonError::Configuration(
                "no listen addresses are enabled".into(),
            ));
        }

        let buffer_capacity = args.buffer_size.unwrap_or(DEFAULT_ENTROPY_BUF_SIZE);
        let max_alloc = max_alloc_size();
        if buffer_capacity < MIN_BUF_SIZE || buffer_capacity > max_alloc {
            return Err(DaemonError::Configuration(format!(
                "buffer size out of bounds. allowed ({MIN_BUF_SIZE} - {max_alloc})"
            )));
        }

        let log_level = match args.verbosity {
            -1 => LevelFilter::Error,
            0 => LevelFilter::Error,
            1 => LevelFilter::Warn,
            2 => LevelFilter::Info,
            3 => LevelFilter::Debug,
            other => {
                return Err(DaemonError::Configuration(format!(
                    "invalid verbosity: {other}"
                )))
            }
        };

        Ok(Config {
            ipv4_enabled,
            ipv6_enabled,
            port: args.port,
            buffer_capacity,
            log_level,
            tee_path: args.tee_file.clone(),
        })
    }
}

/// Queries `RLIMIT_AS` for the maximum size a single allocation may take.
/// Falls back to `usize::MAX` when the limit is unavailable or unbounded.
fn max_alloc_size() -> usize {
    unsafe {
        let mut rlim: libc::rlimit = std::mem::zeroed();
        if libc::getrlimit(libc::RLIMIT_AS, &mut rlim) != 0 {
            return usize::MAX;
        }
        if rlim.rlim_cur == libc::RLIM_INFINITY {
            return usize::MAX;
        }
        rlim.rlim_cur as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> CliArgs {
        let mut v = vec!["quantisd"];
        v.extend_from_slice(extra);
        CliArgs::parse_from(v)
    }

    #[test]
    fn defaults_enable_both_families() {
        let cfg = Config::from_args(&args(&[])).unwrap();
        assert!(cfg.ipv4_enabled);
        assert!(cfg.ipv6_enabled);
        assert_eq!(cfg.port, DEFAULT_PORT);
        assert_eq!(cfg.buffer_capacity, DEFAULT_ENTROPY_BUF_SIZE);
    }

    #[test]
    fn ipv4_only_disables_ipv6() {
        let cfg = Config::from_args(&args(&["-4"])).unwrap();
        assert!(cfg.ipv4_enabled);
        assert!(!cfg.ipv6_enabled);
    }

    #[test]
    fn buffer_below_minimum_is_rejected() {
        let err = Config::from_args(&args(&["-b", "1"])).unwrap_err();
        assert!(matches!(err, DaemonError::Configuration(_)));
    }

    #[test]
    fn invalid_verbosity_is_rejected() {
        let err = Config::from_args(&args(&["-l", "9"])).unwrap_err();
        assert!(matches!(err, DaemonError::Configuration(_)));
    }

    #[test]
    fn extra_positional_arguments_rejected() {
        let err = Config::from_args(&args(&["bogus"])).unwrap_err();
        assert!(matches!(err, DaemonError::Configuration(_)));
    }
}
