#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod metrics;
mod server;
mod session;
pub mod ws;

#[cfg(test)]
mod tests;

pub use self::{
    metrics::TunnelMetrics,
    server::{Config, TunnelServer},
    session::Session,
};
