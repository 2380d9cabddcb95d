//! File logger for crash forensics.
//!
//! The proxy dies mid-protocol on purpose, so the log must hit the disk
//! before the process does: every record is flushed as it is written.
//! Without a destination the `log` macros stay compiled in but filtered
//! to `Off`, and fatality is carried by the process exit code alone.

use std::{
    fs::File,
    io::Write,
    sync::Mutex,
};

use log::{LevelFilter, Metadata, Record};

use crate::{args::LogArgs, Error};

/// A [`log::Log`] implementation appending to one file, flushing after
/// every record.
#[derive(Debug)]
pub struct FileLogger {
    file: Mutex<File>,
}

impl FileLogger {
    /// Register the global logger according to the parsed arguments.
    ///
    /// The destination is created fresh, discarding prior contents. With
    /// no destination configured, logging is turned off entirely. Errors
    /// are always recorded; everything below needs `--verbose`.
    pub fn init(args: &impl LogArgs) -> Result<(), Error> {
        let Some(path) = args.log_file() else {
            log::set_max_level(LevelFilter::Off);
            return Ok(());
        };

        let file = File::create(path).map_err(|e| {
            Error::illegal_argument(format!(
                "Couldn't open log file {}: {e}",
                path.display()
            ))
        })?;

        log::set_boxed_logger(Box::new(FileLogger {
            file: Mutex::new(file),
        }))
        .map_err(|_| Error::unknown("Failed to register logger"))?;
        log::set_max_level(if args.verbose() {
            LevelFilter::Debug
        } else {
            LevelFilter::Error
        });
        Ok(())
    }
}

impl log::Log for FileLogger {
    #[inline]
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        if let Ok(mut file) = self.file.lock() {
            let _ = writeln!(file, "{}: {}", record.level(), record.args());
            // This program might terminate strangely; keep the last line
            // on disk.
            let _ = file.flush();
        }
    }

    fn flush(&self) {
        if let Ok(mut file) = self.file.lock() {
            let _ = file.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{fs, path::PathBuf};

    use log::Log;

    use super::*;

    struct TestLogArgs {
        log_file: Option<PathBuf>,
        verbose: bool,
    }

    impl LogArgs for TestLogArgs {
        fn log_file(&self) -> Option<&PathBuf> {
            self.log_file.as_ref()
        }
        fn verbose(&self) -> bool {
            self.verbose
        }
    }

    #[test]
    fn records_are_on_disk_immediately() {
        let path = std::env::temp_dir().join("afl_proxy_logger_test.log");
        fs::write(&path, "stale contents from a previous run\n").unwrap();

        let logger = FileLogger {
            file: Mutex::new(File::create(&path).unwrap()),
        };
        logger.log(
            &Record::builder()
                .level(log::Level::Error)
                .args(format_args!("Something went wrong"))
                .build(),
        );

        // No flush() call: the write itself must already be durable.
        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "ERROR: Something went wrong\n");
        fs::remove_file(&path).unwrap();
    }
}
