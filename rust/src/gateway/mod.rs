pub mod admission;
pub mod bus;
pub mod cluster;
pub mod compression;
pub mod dedup;
pub mod dispatcher;
pub mod filters;
pub mod message;
pub mod queue;
pub mod rate_limiter;
pub mod redis_bus;
pub mod registry;
pub mod reliability;
pub mod router;
pub mod security;
pub mod server;
pub mod transport;
pub mod worker;

pub use server::Gateway;
