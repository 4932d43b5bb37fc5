//! The NAT-side half of the forwarder: connects out to the server,
//! authenticates, announces the ports to expose and relays every flow
//! between the transit channel and the local services.

#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod client;
pub mod eventloop;

mod time_events;

pub use client::{ClientState, Command, FlowKey, DEFAULT_IDLE_TIMEOUT};
pub use eventloop::{Error, Eventloop};
