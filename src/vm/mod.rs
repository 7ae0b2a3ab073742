//! VM lifecycle management.
//!
//! `engine` owns the platform instances and drives all state transitions;
//! `builder` turns a `VmRecord` into a platform configuration descriptor;
//! `state` is the per-VM transition table both the event listener and the
//! status poller feed into.

pub mod builder;
pub mod engine;
pub mod state;

pub use engine::{VmEngine, sanitize_vm_name};
