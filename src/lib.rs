pub mod app;
pub mod cli;
pub mod config;
pub mod errors;
pub mod imap;
pub mod storage;
pub mod sync;
pub mod threads;
pub mod types;
