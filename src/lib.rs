pub mod background;
pub mod config;
pub mod error;
pub mod policy;
pub mod proxy;
pub mod relay;
pub mod routing;
pub mod server;
pub mod store;
pub mod telemetry;
