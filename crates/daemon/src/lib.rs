// chatlog-daemon library entry point.

pub mod config;
pub mod http;
pub mod runtime;
pub mod store;
pub mod sync;
