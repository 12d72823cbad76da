pub mod client;
pub mod config;
pub mod entity;
pub mod error;
pub mod frontend;
pub mod manager;
pub mod poll;
pub mod registry;
pub mod rpc;
pub mod schema;
pub mod service;
pub mod signal;
pub mod reexports {
    pub use time;
    pub use tokio_util;
    pub use url;
}
