pub mod client;
pub mod error;
pub mod rate_limiter;
pub mod transport;

#[cfg(test)]
pub mod testing;

pub use client::RpcClient;
pub use error::RpcError;
pub use transport::{HttpTransport, Transport};
