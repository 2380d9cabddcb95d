//! The protocol state machine tying the three channels together.
//!
//! One startup handshake, then a repeating execute-and-relay cycle:
//! wait for the fuzzer's ready signal, announce the synthetic pid, wake
//! the worker, pull status and coverage back, report the status. Every
//! step transfers an exact byte count and any deviation aborts the whole
//! process - the forkserver protocol has no way to resynchronize a
//! desynced stream, so the only safe reaction is to die and let the
//! fuzzer's EOF/timeout handling take over.

use std::{
    io::{Read, Write},
    ops::DerefMut,
};

use crate::{
    forkserver::{ForkserverChannel, PROXY_PID},
    shmem::CoverageMaps,
    worker::WorkerChannel,
    Error,
};

/// The proxy's state machine, generic over the coverage backing store and
/// the worker streams so the whole loop runs in-process under test.
#[derive(Debug)]
pub struct Proxy<SHM, R, W> {
    maps: CoverageMaps<SHM>,
    worker: WorkerChannel<R, W>,
    forkserver: ForkserverChannel,
    run_once: bool,
}

impl<SHM, R, W> Proxy<SHM, R, W>
where
    SHM: DerefMut<Target = [u8]>,
    R: Read,
    W: Write,
{
    /// Assemble a proxy from its three channels.
    pub fn new(
        maps: CoverageMaps<SHM>,
        worker: WorkerChannel<R, W>,
        forkserver: ForkserverChannel,
    ) -> Self {
        Self {
            maps,
            worker,
            forkserver,
            run_once: false,
        }
    }

    /// Handshake, then loop until the fuzzer closes its end.
    ///
    /// Returns the last status word the worker produced; the caller is
    /// expected to use it as the process exit code so a wrapping tool can
    /// observe the final worker outcome. Every error out of here is fatal.
    pub fn run(&mut self) -> Result<u32, Error> {
        // If nobody answers the first hello, there is no fuzzer on the
        // other end: fall back to a single execution instead of failing.
        if self.forkserver.handshake() {
            log::debug!("Said hello to the fuzzer");
        } else {
            log::debug!("No fuzzer is listening, running a single cycle");
            self.run_once = true;
        }

        let mut status = 0_u32;
        loop {
            if !self.run_once {
                if !self.forkserver.wait_ready() {
                    log::debug!("No more ready signals from the fuzzer, exiting the loop");
                    break;
                }
                self.forkserver.announce(PROXY_PID)?;
                log::debug!("Announced pid {PROXY_PID} to the fuzzer");
            }

            self.worker.signal()?;
            log::debug!("Signaled the worker");

            status = self.worker.read_result(&mut self.maps)?;
            log::debug!("Got status {status:#x} and coverage from the worker");

            if self.run_once {
                break;
            }

            self.forkserver.report(status)?;
            log::debug!("Reported status to the fuzzer");
        }

        // Teardown failures are reported but no longer change the
        // outcome: the loop is already over.
        if let Err(e) = self.worker.shutdown() {
            log::error!("Something went wrong closing the worker pipes: {e}");
        }

        Ok(status)
    }

    /// Whether the proxy fell back to a single worker cycle.
    #[must_use]
    pub fn is_run_once(&self) -> bool {
        self.run_once
    }

    /// Tear the proxy apart, for inspecting channel state in tests.
    pub fn into_parts(self) -> (CoverageMaps<SHM>, WorkerChannel<R, W>) {
        (self.maps, self.worker)
    }
}
