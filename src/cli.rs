//! # Command-Line Interface Module
//!
//! Command-line argument parsing and configuration for the tracing daemon.
//! Uses the `clap` derive API for type-safe parsing with automatic validation
//! and help generation.
//!
//! ## Usage Examples
//!
//! ```bash
//! # Start with default socket paths and shared-memory sizing
//! tracing-serviced
//!
//! # Use abstract-namespace sockets and a larger shared-memory hint
//! tracing-serviced --producer-sock @tracing-producer --consumer-sock @tracing-consumer \
//!     --shmem-size-hint 1048576
//!
//! # Verbose logging to a rotating file
//! tracing-serviced -vv --log-file /var/log/tracing-serviced.log
//! ```

use clap::{
    builder::styling::{AnsiColor, Styles},
    Parser,
};
use std::path::PathBuf;

use crate::shmem::{DEFAULT_SHMEM_SIZE, MAX_SHMEM_SIZE, MIN_SHMEM_SIZE};

/// Default page size for trace buffers when a consumer's `TraceConfig`
/// doesn't specify one.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Reproduces clap v3's colored `--help` appearance.
fn styles() -> Styles {
    Styles::styled()
        .header(AnsiColor::Yellow.on_default())
        .usage(AnsiColor::Yellow.on_default())
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

/// Tracing Service Daemon - coordinates trace producers and consumers over
/// shared memory and IPC.
///
/// The daemon exposes two IPC hosts: a `ProducerPort` that producers connect
/// to in order to register data sources and feed trace data through shared
/// memory, and a `ConsumerPort` that consumers connect to in order to
/// configure and drain tracing sessions.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None, styles = styles())]
pub struct Args {
    /// Unix domain socket the producer-facing IPC host binds.
    ///
    /// A leading `@` selects Linux's abstract socket namespace (no
    /// filesystem entry, no cleanup required on exit); otherwise this is a
    /// filesystem path that the daemon creates and removes on shutdown.
    #[arg(long, default_value = "/tmp/tracing-service-producer.sock", help_heading = "Sockets")]
    pub producer_sock: String,

    /// Unix domain socket the consumer-facing IPC host binds.
    #[arg(long, default_value = "/tmp/tracing-service-consumer.sock", help_heading = "Sockets")]
    pub consumer_sock: String,

    /// Default shared-memory size hint, in bytes, used when a connecting
    /// producer doesn't request one.
    ///
    /// Clamped to `[4 KiB, 32 MiB]` regardless of what's requested, per the
    /// service's resource-exhaustion defenses.
    #[arg(long, default_value_t = DEFAULT_SHMEM_SIZE, help_heading = "Shared Memory")]
    pub shmem_size_hint: usize,

    /// Default trace buffer page size, in bytes.
    ///
    /// Must be a power of two no smaller than 4 KiB. Individual `TraceConfig`
    /// buffer specs may override this per-session.
    #[arg(long, default_value_t = DEFAULT_PAGE_SIZE, help_heading = "Shared Memory")]
    pub page_size: usize,

    /// Path to write detailed logs to, or "stderr" to log there instead of a
    /// file.
    ///
    /// Defaults to a daily-rotating file in the current directory when
    /// unset. File logging never applies ANSI color codes; the clean
    /// stdout status line does.
    #[arg(long, help_heading = "Output and Logging")]
    pub log_file: Option<String>,

    /// Silence the clean, user-facing status line on stdout.
    ///
    /// Diagnostic logs on stderr/file are unaffected.
    #[arg(short = 'q', long, help_heading = "Output and Logging")]
    pub quiet: bool,

    /// Increase diagnostic log verbosity.
    ///
    ///  -v: debug
    ///  -vv and above: trace
    /// By default, only INFO and above is shown.
    #[arg(short, long, action = clap::ArgAction::Count, help_heading = "Output and Logging")]
    pub verbose: u8,
}

impl Args {
    /// Validates and clamps the shared-memory size hint, logging if the
    /// requested value fell outside the allowed range.
    pub fn clamped_shmem_size_hint(&self) -> usize {
        self.shmem_size_hint.clamp(MIN_SHMEM_SIZE, MAX_SHMEM_SIZE)
    }

    /// Where the detailed log layer should write, resolved from `log_file`.
    pub fn log_destination(&self) -> LogDestination {
        match self.log_file.as_deref() {
            Some("stderr") => LogDestination::Stderr,
            Some(path) => LogDestination::File(PathBuf::from(path)),
            None => LogDestination::File(PathBuf::from("tracing-serviced.log")),
        }
    }
}

/// Where the daemon's detailed log layer writes.
#[derive(Debug, Clone)]
pub enum LogDestination {
    Stderr,
    File(PathBuf),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shmem_hint_is_clamped_to_bounds() {
        let mut args = Args::parse_from(["tracing-serviced"]);
        args.shmem_size_hint = 1;
        assert_eq!(args.clamped_shmem_size_hint(), MIN_SHMEM_SIZE);

        args.shmem_size_hint = usize::MAX;
        assert_eq!(args.clamped_shmem_size_hint(), MAX_SHMEM_SIZE);
    }

    #[test]
    fn log_file_stderr_keyword_selects_stderr_destination() {
        let mut args = Args::parse_from(["tracing-serviced"]);
        args.log_file = Some("stderr".to_string());
        assert!(matches!(args.log_destination(), LogDestination::Stderr));
    }

    #[test]
    fn missing_log_file_defaults_to_a_named_file() {
        let args = Args::parse_from(["tracing-serviced"]);
        assert!(matches!(args.log_destination(), LogDestination::File(_)));
    }
}
