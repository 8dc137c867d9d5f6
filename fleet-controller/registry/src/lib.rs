#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod client;
mod registry;

pub use self::{client::ClientFactory, registry::Registry};
