pub mod config;
pub mod dialog;
pub mod distributed;
pub mod events;
pub mod flow_commands;
pub mod logger;
pub mod runtime;
pub mod schema;
pub mod watcher;

pub use converse_sdk as sdk;
