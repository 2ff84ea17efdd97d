pub mod config;
pub mod conn;
pub mod controller;
pub mod event;
pub mod ipc;
pub mod monitor;
pub mod process_monitor;
pub mod protocol;
pub mod server;
pub mod supervisor;
pub mod utils;
pub mod wait;
