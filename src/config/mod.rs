// src/config/mod.rs
// Configuration: page globals and runtime tunables

pub mod file;
pub mod globals;

pub use file::ClientConfig;
pub use globals::PortalGlobals;
