//! Inter-process communication primitives.
//!
//! Covers the signal model (§4 "Signal delivery") and the generic ring-buffer
//! [`stream::Stream`] it's built on, which also backs a process's text
//! input/output streams.

pub mod signal;
pub mod stream;
