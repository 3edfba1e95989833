//! # QAKV
//!
//! 多实例 KV 存储服务器 - 主从复制引擎
//!
//! ## 核心能力
//!
//! - **多实例存储**: 固定数量的独立存储实例，每实例独立 binlog
//! - **全量同步**: 快照 + 文件清单流式传输 (FULLSYNC)
//! - **增量同步**: 事务边界感知的 binlog 批量推送 (INCRSYNC)
//! - **推送调度**: 协作式调度器 + 有界工作线程池
//! - **对外服务**: redis 风格行协议 (阻塞式 TCP)
//!
//! ## 架构设计
//!
//! ```text
//! 副本 (TCP, redis 风格行协议)
//!     ↓
//! Service Layer (service/)          - 接入 + 命令分发
//!     ↓
//! Replication Engine (replication/) - 全量/增量同步, MPOV 注册表
//!     ↓
//! Storage (storage/)                - 实例存储 + binlog + 快照
//! ```
//!
//! ## 推送语义
//!
//! - 单批推送: <= 64 条 / 16 MiB，且不切分事务
//! - 全量传输: 20 MiB 分块流式写出
//! - 推送空转退避: 1s

#![allow(dead_code)]

// ============================================================================
// 外部依赖
// ============================================================================

// 并发工具
pub use crossbeam;
pub use parking_lot;

// 序列化
pub use rkyv;
pub use serde;
pub use serde_json;

// 时间
pub use chrono;

// 日志
pub use log;

// 错误处理
pub use thiserror;

// ============================================================================
// 内部模块
// ============================================================================

/// 持久化存储（实例表 + binlog + 快照）
pub mod storage;

/// 网络层（阻塞式 framed TCP 客户端）
pub mod network;

/// 协议层（redis 风格行/批量帧）
pub mod protocol;

/// 主从复制引擎
pub mod replication;

/// 对外服务层（TCP 接入 + 命令分发）
pub mod service;

/// 工具模块（配置 / 工作线程池）
pub mod utils;

// ============================================================================
// 全局错误类型
// ============================================================================

/// 存储服务错误类型
#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Replication error: {0}")]
    ReplicationError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("IO error: {0}")]
    IOError(String),
}

pub type Result<T> = std::result::Result<T, KvError>;
