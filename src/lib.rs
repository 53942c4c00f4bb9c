pub mod cancel;
pub mod config;
pub mod debug_log;
pub mod dispatch;
pub mod error;
pub mod payload;
pub mod progress;
pub mod response;
pub mod server;
pub mod telemetry;
pub mod thinking;
pub mod tools;
pub mod url;
