pub mod capabilities;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod proxy;
pub mod restart;
pub mod rpc;
pub mod supervisor;

pub use config::Config;
pub use error::ProxyError;
pub use proxy::Proxy;
pub use supervisor::{ChildSpec, ChildState, RestartPolicy, Supervisor};
