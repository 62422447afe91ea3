// lib.rs is the public API hub: modules are declared here and the types a
// caller needs are re-exported at the crate root.
pub mod broker;
pub mod compression;
pub mod config;
mod error;
pub mod http;
pub mod link;
pub mod location;
pub mod logging;
pub mod server;
pub mod upstream;

pub use config::Config;
pub use error::{CodecError, ProxyError, Result};
pub use server::Proxy;
