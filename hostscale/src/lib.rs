//! hostscale library
//!
//! Runs one replicated service on a single host, picking between a plain
//! container, a swarm service and a compose stack behind nginx.

pub mod app;
pub mod deploy;
pub mod errors;
pub mod filesys;
pub mod health;
pub mod logs;
pub mod models;
pub mod storage;
pub mod utils;
