//! 对外服务层（TCP 接入 + 命令分发）

pub mod tcp_server;

pub use tcp_server::ReplServer;
