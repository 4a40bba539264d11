pub mod discovery;
pub mod http;
pub mod link;
pub mod routes;
pub mod store;
pub mod supervisor;
pub mod wifi;

pub use supervisor::{Supervisor, SupervisorHandle};
pub use wifi::{ConnectOutcome, ConnectivityHandle, WifiManager};
