//! 网络层模块

pub mod client;

pub use client::BlockingTcpClient;
