//! Library modules for the marketkeeper daemon.
//!
//! The binary in `main.rs` wires these together; tests exercise them
//! directly through the collaborator traits in `chain` and `bridge`.

pub mod bridge;
pub mod chain;
pub mod config;
pub mod discovery;
pub mod guard;
pub mod keeper;
pub mod lifecycle;
