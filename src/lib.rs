//! hyperhost: lifecycle manager for lightweight virtual machines.
//!
//! The host's virtualization support is optional and version-skewed, and
//! driving it requires privileges this process does not hold. Three
//! subsystems deal with that:
//!
//! - **privilege escalation** (`broker`, `protocol`) — negotiates the
//!   required permissions through an external privileged broker over a Unix
//!   socket, with per-permission fallback strategies;
//! - **the lifecycle engine** (`vm`, `capability`, `platform`) — probes
//!   what the host can do, builds platform configuration descriptors from
//!   VM records and drives instances through create/run/stop/delete,
//!   reconciling state from both lifecycle events and a polling safety net;
//! - **the session bridge** (`session`, `discovery`) — an interactive
//!   byte-stream session into a running guest, over the serial console when
//!   the host captures it, otherwise over SSH to a discovered guest
//!   address.

pub mod broker;
pub mod capability;
pub mod config;
pub mod context;
pub mod discovery;
pub mod logging;
pub mod model;
pub mod paths;
pub mod platform;
pub mod protocol;
pub mod session;
pub mod signal;
pub mod store;
pub mod vm;
