//! Command line surface of the proxy binary.

use std::path::PathBuf;

use clap::Parser;

/// Accessors for the worker-facing settings.
pub trait ProxyArgs {
    /// Path of the FIFO the proxy signals the worker through.
    fn to_worker(&self) -> &PathBuf;
    /// Path of the FIFO the worker answers through.
    fn from_worker(&self) -> &PathBuf;
}

impl ProxyArgs for Args {
    fn to_worker(&self) -> &PathBuf {
        &self.to_worker
    }
    fn from_worker(&self) -> &PathBuf {
        &self.from_worker
    }
}

/// Accessors for the logging settings.
pub trait LogArgs {
    /// Log destination, if any.
    fn log_file(&self) -> Option<&PathBuf>;
    /// Whether non-fatal progress lines should be recorded too.
    fn verbose(&self) -> bool;
}

impl LogArgs for Args {
    fn log_file(&self) -> Option<&PathBuf> {
        self.log_file.as_ref()
    }
    fn verbose(&self) -> bool {
        self.verbose
    }
}

#[derive(Parser, Debug)]
#[command(
    version,
    about = "afl-proxy",
    long_about = "Proxy between an AFL-style fuzzer and a worker reachable over two named pipes. \
                  Both pipes must exist before the proxy starts; the shared memory id is taken \
                  from the fuzzer's environment."
)]
pub struct Args {
    #[arg(help = "Fifo used to signal the worker")]
    to_worker: PathBuf,

    #[arg(help = "Fifo the worker writes status and coverage to")]
    from_worker: PathBuf,

    #[arg(help = "Log file (created fresh, flushed per line)")]
    log_file: Option<PathBuf>,

    #[arg(
        short,
        long,
        help = "Also log non-fatal progress messages (requires a log file)",
        requires = "log_file"
    )]
    verbose: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positional_paths_parse() {
        let args = Args::try_parse_from(["afl-proxy", "/tmp/to", "/tmp/from"]).unwrap();
        assert_eq!(args.to_worker(), &PathBuf::from("/tmp/to"));
        assert_eq!(args.from_worker(), &PathBuf::from("/tmp/from"));
        assert!(args.log_file().is_none());
        assert!(!args.verbose());
    }

    #[test]
    fn log_file_is_the_third_positional() {
        let args =
            Args::try_parse_from(["afl-proxy", "/tmp/to", "/tmp/from", "/tmp/proxy.log", "-v"])
                .unwrap();
        assert_eq!(args.log_file(), Some(&PathBuf::from("/tmp/proxy.log")));
        assert!(args.verbose());
    }

    #[test]
    fn missing_fifo_paths_are_a_usage_error() {
        assert!(Args::try_parse_from(["afl-proxy"]).is_err());
        assert!(Args::try_parse_from(["afl-proxy", "/tmp/to"]).is_err());
    }

    #[test]
    fn verbose_requires_a_log_file() {
        assert!(Args::try_parse_from(["afl-proxy", "/tmp/to", "/tmp/from", "-v"]).is_err());
    }
}
