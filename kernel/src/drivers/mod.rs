//! Device drivers.
//!
//! Only the serial console survives in the core: everything else named in
//! the device layer (timer, interrupt controller, keyboard/mouse,
//! framebuffer) is an external collaborator with a named interface, not an
//! implementation this crate owns.

pub mod serial;
