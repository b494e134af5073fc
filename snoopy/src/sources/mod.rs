//! Reference source adapters shipped with the daemon.

pub mod apps;
pub mod filesystem;
pub mod shell;
