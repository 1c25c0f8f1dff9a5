//! Transparent proxies for objects living in another runtime.
//!
//! A [`Bridge`] owns one connection. Its [`Proxy`] handles turn attribute
//! reads, writes, calls and iteration into requests over the `exowire`
//! protocol; local objects passed as arguments are adopted so the remote
//! side can call back into them.

pub mod bridge;
pub mod config;
pub mod error;
pub mod event_loop;
pub mod events;
pub mod executor;
pub mod free_queue;
pub mod logging;
pub mod mock_transport;
pub mod proxy;
pub mod reftable;
pub mod registry;
pub mod session;
pub mod transport;
pub mod value;

#[cfg(test)]
mod tests;

pub use bridge::Bridge;
pub use bridge::RequireOptions;
pub use config::BridgeConfig;
pub use config::Defaults;
pub use error::Error;
pub use error::Result;
pub use executor::CallOptions;
pub use executor::InspectMode;
pub use proxy::Cursor;
pub use proxy::Proxy;
pub use proxy::RemoteHandle;
pub use session::Session;
pub use value::LocalObject;
pub use value::LocalRef;
pub use value::Value;

pub use exowire::Ffid;
pub use exowire::Key;
pub use exowire::ROOT_FFID;
