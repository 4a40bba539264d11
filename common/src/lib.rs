pub mod config;
pub mod discovery;
pub mod http;
pub mod types;
pub mod value;

pub use config::{ConfigError, ConfigMap, NodeConfig, WifiConfig, WifiTiming};
pub use http::{HttpError, Method, Request, StatusCode};
pub use types::{AuthMode, ConnectivityState, ScanResult, WifiMode};
pub use value::{UnsupportedValue, Value};
