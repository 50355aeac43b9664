pub mod commands;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod notification;
pub mod poller;
pub mod reader;
pub mod session;
pub mod status;
pub mod utils;
