pub mod status_server;

pub use status_server::{start_status_server, StatusServer};
