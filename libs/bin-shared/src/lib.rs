//! Bootstrap glue shared by the `passage-server` and `passage-client`
//! binaries: configuration files and log setup.

#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod config;
pub mod logging;
