pub mod json;
pub mod response;
pub mod router;
pub mod server;

pub use response::{Body, ConnectionWriter, Response};
pub use router::{Handler, HandlerFuture, Resolved, Router};
pub use server::HttpServer;
