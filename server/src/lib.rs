//! The public half of the forwarder: accepts one authenticated transit
//! client, binds the public ports it asks for and relays every flow between
//! those ports and the transit channel.

#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod eventloop;
pub mod server;

pub use eventloop::Eventloop;
pub use server::{Command, Server, SessionError};
