//! Signal delivery.
//!
//! A signal is an integer delivered by appending it to a process's signal
//! stream (a bounded ring buffer of 32-bit items, see [`crate::ipc::stream`]).
//! A per-process mask bit gates whether a given signal is deliverable; if a
//! signal is unmasked and the process has no stream yet, the default action
//! is to mark the process `finished` rather than lose the signal silently.
//!
//! This module holds the pure mask/stream logic so it is unit-testable
//! without a process table; [`crate::task::process`] wires `signalSet`,
//! `signal`, and `signalRead` to process IDs and the `finished` transition.

use crate::error::{Error, KResult};
use crate::ipc::stream::{ItemSize, Stream};

/// Terminate signal (graceful shutdown request).
pub const SIG_TERM: u32 = 1;
/// Kill signal (not specially protected here — `kill(pid)` bypasses signals
/// entirely in the process table; this constant exists for callers that want a
/// conventional "please die" signal number).
pub const SIG_KILL: u32 = 2;
/// Interrupt signal (e.g. Ctrl-C).
pub const SIG_INT: u32 = 3;
/// User-defined signal 1.
pub const SIG_USR1: u32 = 10;
/// User-defined signal 2.
pub const SIG_USR2: u32 = 11;

/// Default capacity of a lazily-allocated signal stream.
const SIGNAL_STREAM_CAPACITY: usize = 32;

/// Result of [`signal`]: whether the signal was queued or the process
/// should be transitioned to `finished` because the signal was unmasked
/// and there was nowhere to queue it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalOutcome {
    Queued,
    DefaultTerminate,
}

/// Per-process signal state: the mask plus a lazily-allocated stream.
///
/// The stream is `None` until the first call to [`SignalState::set]` turns a
/// bit on — mirrors the source's "lazily allocates a signal stream" wording.
pub struct SignalState {
    mask: u32,
    stream: Option<Stream>,
}

impl SignalState {
    pub const fn new() -> Self {
        SignalState { mask: 0, stream: None }
    }

    /// `signalSet(pid, sig, on)`: toggle the mask bit, lazily allocating the
    /// stream the first time any bit is turned on.
    pub fn set(&mut self, sig: u32, on: bool) -> KResult<()> {
        if sig >= 32 {
            return Err(Error::Range);
        }
        if on {
            self.mask |= 1 << sig;
            if self.stream.is_none() {
                self.stream = Some(Stream::new(SIGNAL_STREAM_CAPACITY, ItemSize::Dword));
            }
        } else {
            self.mask &= !(1 << sig);
        }
        Ok(())
    }

    pub fn is_set(&self, sig: u32) -> bool {
        sig < 32 && (self.mask & (1 << sig)) != 0
    }

    /// `signal(pid, sig)`: append to the stream if unmasked and a stream
    /// exists; otherwise report that the process should be terminated.
    pub fn signal(&mut self, sig: u32) -> SignalOutcome {
        if self.is_set(sig) {
            if let Some(stream) = &mut self.stream {
                // A full signal stream silently drops the oldest entry
                // rather than blocking the sender — signals are inherently
                // lossy/asynchronous.
                if stream.append(sig).is_err() {
                    let _ = stream.pop();
                    let _ = stream.append(sig);
                }
                return SignalOutcome::Queued;
            }
        }
        SignalOutcome::DefaultTerminate
    }

    /// `signalRead(pid)`: pop one signal, or `nodata` if none pending.
    pub fn read(&mut self) -> KResult<u32> {
        match &mut self.stream {
            Some(stream) => stream.pop(),
            None => Err(Error::NoData),
        }
    }
}

impl Default for SignalState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masked_signal_terminates_by_default() {
        let mut s = SignalState::new();
        assert_eq!(s.signal(SIG_TERM), SignalOutcome::DefaultTerminate);
    }

    #[test]
    fn unmasked_signal_is_queued_and_readable() {
        let mut s = SignalState::new();
        s.set(SIG_USR1, true).unwrap();
        assert_eq!(s.signal(SIG_USR1), SignalOutcome::Queued);
        assert_eq!(s.read().unwrap(), SIG_USR1);
        assert_eq!(s.read(), Err(Error::NoData));
    }

    #[test]
    fn unsetting_mask_reverts_to_default_terminate() {
        let mut s = SignalState::new();
        s.set(SIG_INT, true).unwrap();
        s.set(SIG_INT, false).unwrap();
        assert_eq!(s.signal(SIG_INT), SignalOutcome::DefaultTerminate);
    }

    #[test]
    fn out_of_range_signal_rejected() {
        let mut s = SignalState::new();
        assert_eq!(s.set(32, true), Err(Error::Range));
    }
}
