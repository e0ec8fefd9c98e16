//! Side-effecting adapters: filesystem, processes, and pipes.

pub mod capture;
pub mod collector;
pub mod config;
pub mod launcher;
pub mod report;
pub mod task_file;
pub mod workspace;
