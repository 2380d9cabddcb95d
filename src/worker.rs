//! The worker side of the proxy: two named pipes.
//!
//! The worker is a long-lived external process that executes one test case
//! per go signal and answers with a 4-byte status word followed by its raw
//! coverage bytes. It knows nothing about the forkserver handshake or the
//! shared memory layout; the proxy copies its coverage payload into the
//! shared maps as part of reading the response.

use std::{
    fs::{File, OpenOptions},
    io::{Read, Write},
    ops::DerefMut,
    path::Path,
};

use crate::{forkserver::HELLO_MSG, shmem::CoverageMaps, Error};

/// The two byte streams to and from the worker.
///
/// Generic over the stream types so tests can drive the channel with
/// in-memory buffers; production uses a pair of FIFOs.
#[derive(Debug)]
pub struct WorkerChannel<R = File, W = File> {
    from_worker: R,
    to_worker: W,
}

impl WorkerChannel {
    /// Open the two FIFOs, outbound end first.
    ///
    /// Both paths must already exist as named pipes, created by whoever
    /// launched the worker. Opening the outbound FIFO for writing blocks
    /// until the worker opens its read end, which is the only startup
    /// synchronization the protocol needs.
    pub fn open(to_worker: &Path, from_worker: &Path) -> Result<Self, Error> {
        let to_worker_fd = OpenOptions::new().write(true).open(to_worker).map_err(|e| {
            Error::illegal_state(format!(
                "Failed to open the fifo to the worker {}: {e}",
                to_worker.display()
            ))
        })?;
        log::debug!("Opened the fifo to the worker {}", to_worker.display());

        let from_worker_fd = File::open(from_worker).map_err(|e| {
            Error::illegal_state(format!(
                "Failed to open the fifo from the worker {}: {e}",
                from_worker.display()
            ))
        })?;
        log::debug!("Opened the fifo from the worker {}", from_worker.display());

        Ok(Self {
            from_worker: from_worker_fd,
            to_worker: to_worker_fd,
        })
    }
}

impl<R, W> WorkerChannel<R, W>
where
    R: Read,
    W: Write,
{
    /// Wrap a pair of already-open streams.
    pub fn from_streams(from_worker: R, to_worker: W) -> Self {
        Self {
            from_worker,
            to_worker,
        }
    }

    /// Signal the worker to execute one test case: exactly 4 bytes,
    /// flushed so the worker unblocks immediately.
    pub fn signal(&mut self) -> Result<(), Error> {
        self.to_worker.write_all(&HELLO_MSG).map_err(|e| {
            Error::illegal_state(format!("Something went wrong signaling the worker: {e}"))
        })?;
        self.to_worker.flush()?;
        Ok(())
    }

    /// Read one iteration's result: the status word, then the full trace
    /// map, then the full perf map if it is enabled.
    ///
    /// The coverage bytes land directly in `maps`, so once this returns
    /// the shared memory reflects exactly what the worker produced. Any
    /// short read at any stage is fatal; nothing is buffered or retried.
    pub fn read_result<SHM>(&mut self, maps: &mut CoverageMaps<SHM>) -> Result<u32, Error>
    where
        SHM: DerefMut<Target = [u8]>,
    {
        let mut buf = [0_u8; 4];
        self.from_worker.read_exact(&mut buf).map_err(|e| {
            Error::illegal_state(format!(
                "Something went wrong getting the status from the worker: {e}"
            ))
        })?;
        let status = u32::from_ne_bytes(buf);

        self.from_worker.read_exact(maps.trace_map()).map_err(|e| {
            Error::illegal_state(format!(
                "Something went wrong getting the trace map from the worker: {e}"
            ))
        })?;

        if let Some(perf_map) = maps.perf_map() {
            self.from_worker.read_exact(perf_map).map_err(|e| {
                Error::illegal_state(format!(
                    "Something went wrong getting the perf map from the worker: {e}"
                ))
            })?;
        }

        Ok(status)
    }

    /// Flush the outbound stream before the channel is torn down.
    ///
    /// The streams themselves close on drop; a flush failure here is the
    /// only close error we can still observe and report.
    pub fn shutdown(&mut self) -> Result<(), Error> {
        self.to_worker.flush()?;
        Ok(())
    }

    /// Take the two streams back out, mainly so tests can inspect what
    /// was written.
    pub fn into_streams(self) -> (R, W) {
        (self.from_worker, self.to_worker)
    }
}
