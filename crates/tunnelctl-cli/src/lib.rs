//! Operator surface for the tunnel supervisor: global config, backups, the
//! daemon that hosts the supervisor and the IPC protocol the CLI speaks to it.

pub mod backup;
pub mod config;
pub mod daemon;
pub mod ipc;
