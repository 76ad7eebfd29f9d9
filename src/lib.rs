//! A programmable control plane for debugging JS runtimes over the Chrome
//! DevTools / V8 Inspector Protocol: launch a target with the inspector
//! enabled, attach to it, and drive breakpoints, stepping, and evaluation
//! from Rust instead of a browser's DevTools UI.
//!
//! [`session::Session`] is the entry point; everything else is a component
//! it wires together (process launch, the wire-level transport, the script
//! and breakpoint registries, and the source-map cache).

pub mod breakpoints;
pub mod config;
pub mod error;
pub mod launcher;
pub mod scripts;
pub mod session;
pub mod source_map;
pub mod transport;
pub mod types;

pub use config::{SessionConfig, SessionConfigBuilder};
pub use error::{KernelError, Result};
pub use session::Session;
