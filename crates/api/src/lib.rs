pub mod routes;
pub mod websocket;

pub use routes::*;
pub use websocket::*;
