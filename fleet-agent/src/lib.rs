#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Connects a cluster that the control plane cannot reach to the fleet.
//!
//! The agent dials out to the control plane over a WebSocket, authenticates, and then executes
//! the API requests forwarded to it against its own cluster's API server.

mod args;
mod connect;
mod execute;


pub use self::{
    args::Args,
    connect::{Agent, Config},
    execute::{Execute, KubeExecutor},
};
