#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use fleet_controller_core as core;
pub use fleet_controller_hub as hub;
pub use fleet_controller_registry as registry;
pub use fleet_controller_tunnel as tunnel;

mod api;
mod args;
mod auth;
mod config;
mod health;
mod proxy;
mod socket;
mod upstream;

pub use self::{
    api::Api,
    args::Args,
    auth::Identities,
    config::FleetConfig,
    proxy::{ProxyMetrics, Router, RouterConfig},
    upstream::ClusterUpstream,
};

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The body of every response the API serves.
pub type Body = http_body_util::combinators::UnsyncBoxBody<bytes::Bytes, BoxError>;
