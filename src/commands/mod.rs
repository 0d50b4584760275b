//! Commands module
//!
//! Entry points the UI collaborator calls into.

pub mod tunnel;

pub use tunnel::*;
