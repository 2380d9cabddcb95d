//! The fuzzer side of the proxy: the forkserver control channel.
//!
//! An AFL-style fuzzer launches its target with two pipe ends already
//! wired to well-known file descriptors: it writes ready signals into
//! [`FORKSRV_FD`] and expects the handshake, a child pid and a status word
//! back on [`FORKSRV_FD`]` + 1`. The proxy plays the target's role here.

use std::os::fd::{BorrowedFd, RawFd};

use nix::unistd;

use crate::Error;

/// The forkserver read fd inherited from the fuzzer. Writes go to the
/// next descriptor up, per the forkserver convention.
pub const FORKSRV_FD: RawFd = 198;

/// SAFETY:
///
/// The fd is inherited from the fuzzer and stays open for the whole
/// process lifetime; nothing in the proxy ever closes it.
const FORKSRV_R_FD: BorrowedFd<'static> = unsafe { BorrowedFd::borrow_raw(FORKSRV_FD) };
/// SAFETY:
///
/// Same as [`FORKSRV_R_FD`].
const FORKSRV_W_FD: BorrowedFd<'static> = unsafe { BorrowedFd::borrow_raw(FORKSRV_FD + 1) };

/// The 4-byte hello token. Sent to the fuzzer at startup and reused as
/// the per-iteration go signal towards the worker; the receiving ends
/// only care that exactly 4 bytes arrive.
pub const HELLO_MSG: [u8; 4] = *b"HELO";

/// Portable upper bound for the value in `linux/threads.h`: no real
/// process id on the host can exceed it.
pub const PID_MAX_LIMIT: u32 = 1 << 22;

/// The pid the proxy reports for its fake child. Chosen above
/// [`PID_MAX_LIMIT`] so the fuzzer's timeout handling can never signal a
/// live, unrelated process.
pub const PROXY_PID: u32 = PID_MAX_LIMIT + 1;

/// The two inherited descriptors towards the fuzzer.
#[derive(Debug)]
pub struct ForkserverChannel {
    rx: BorrowedFd<'static>,
    tx: BorrowedFd<'static>,
}

impl ForkserverChannel {
    /// The channel on the descriptors the fuzzer convention fixes.
    #[must_use]
    pub const fn inherited() -> Self {
        Self {
            rx: FORKSRV_R_FD,
            tx: FORKSRV_W_FD,
        }
    }

    /// Wrap two arbitrary descriptors, for driving the channel from tests.
    ///
    /// # Safety
    ///
    /// Both fds must stay open for the lifetime of the channel.
    #[must_use]
    pub const unsafe fn from_raw_fds(rx: RawFd, tx: RawFd) -> Self {
        Self {
            rx: unsafe { BorrowedFd::borrow_raw(rx) },
            tx: unsafe { BorrowedFd::borrow_raw(tx) },
        }
    }

    fn write_exact(&self, message: &[u8]) -> Result<(), Error> {
        let bytes_written = unistd::write(self.tx, message)?;
        if bytes_written != message.len() {
            return Err(Error::illegal_state(format!(
                "Could not write to the fuzzer fd. Expected {} bytes, wrote {bytes_written} bytes",
                message.len()
            )));
        }
        Ok(())
    }

    /// Phone home and tell the fuzzer that we're OK.
    ///
    /// Returns `false` if fewer than 4 bytes were accepted - the one write
    /// whose failure is not fatal, because it is the only way to detect
    /// that no fuzzer is attached (e.g. a one-shot tool invoked us).
    #[must_use]
    pub fn handshake(&self) -> bool {
        matches!(unistd::write(self.tx, &HELLO_MSG), Ok(n) if n == HELLO_MSG.len())
    }

    /// Block until the fuzzer sends the next 4-byte ready signal.
    ///
    /// Returns `false` on anything but a full signal, including a clean
    /// zero-byte read when the fuzzer closed its end: both mean the loop
    /// is over, neither is an error.
    #[must_use]
    pub fn wait_ready(&self) -> bool {
        let mut buf = [0_u8; 4];
        matches!(unistd::read(self.rx, &mut buf), Ok(n) if n == buf.len())
    }

    /// Report the (synthetic) child pid for this iteration.
    pub fn announce(&self, pid: u32) -> Result<(), Error> {
        self.write_exact(&pid.to_ne_bytes())
    }

    /// Relay the worker's status word for this iteration.
    pub fn report(&self, status: u32) -> Result<(), Error> {
        self.write_exact(&status.to_ne_bytes())
    }
}

#[cfg(test)]
mod tests {
    use std::os::fd::AsRawFd;

    use nix::unistd::{pipe, read, write};

    use super::*;

    #[test]
    fn handshake_reaches_the_fuzzer() {
        let (fuzzer_rx, proxy_tx) = pipe().unwrap();
        let chan = unsafe { ForkserverChannel::from_raw_fds(510, proxy_tx.as_raw_fd()) };

        assert!(chan.handshake());

        let mut buf = [0_u8; 4];
        assert_eq!(read(fuzzer_rx, &mut buf).unwrap(), 4);
        assert_eq!(buf, HELLO_MSG);
    }

    #[test]
    fn handshake_without_a_fuzzer_is_not_fatal() {
        // Nothing is open at these descriptors.
        let chan = unsafe { ForkserverChannel::from_raw_fds(511, 512) };
        assert!(!chan.handshake());
    }

    #[test]
    fn wait_ready_accepts_a_full_signal() {
        let (proxy_rx, fuzzer_tx) = pipe().unwrap();
        let chan = unsafe { ForkserverChannel::from_raw_fds(proxy_rx.as_raw_fd(), 510) };

        write(&fuzzer_tx, &[0_u8; 4]).unwrap();
        assert!(chan.wait_ready());
    }

    #[test]
    fn wait_ready_is_false_on_eof() {
        let (proxy_rx, fuzzer_tx) = pipe().unwrap();
        let chan = unsafe { ForkserverChannel::from_raw_fds(proxy_rx.as_raw_fd(), 510) };

        drop(fuzzer_tx);
        assert!(!chan.wait_ready());
    }

    #[test]
    fn announce_and_report_frame_host_order_words() {
        let (fuzzer_rx, proxy_tx) = pipe().unwrap();
        let chan = unsafe { ForkserverChannel::from_raw_fds(510, proxy_tx.as_raw_fd()) };

        chan.announce(PROXY_PID).unwrap();
        chan.report(0xdead_beef).unwrap();

        let mut buf = [0_u8; 8];
        assert_eq!(read(fuzzer_rx, &mut buf).unwrap(), 8);
        assert_eq!(u32::from_ne_bytes(buf[..4].try_into().unwrap()), PROXY_PID);
        assert_eq!(
            u32::from_ne_bytes(buf[4..].try_into().unwrap()),
            0xdead_beef
        );
    }

    #[test]
    fn announce_to_a_dead_fd_is_fatal() {
        let chan = unsafe { ForkserverChannel::from_raw_fds(511, 512) };
        assert!(chan.announce(PROXY_PID).is_err());
    }
}
