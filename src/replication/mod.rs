//! 主从复制模块（master 侧）
//!
//! 每个存储实例可挂接多个副本，master 为每个副本维护一条推送流：
//!
//! ```text
//! Master                          Replica
//!   |<----- FULLSYNC storeId -------|
//!   |------ manifest + files ------>|      全量同步（快照）
//!   |<----- reply ------------------|
//!   |                               |
//!   |<----- INCRSYNC s d pos -------|
//!   |------ +OK ------------------->|      增量同步握手
//!   |<----- +PONG ------------------|
//!   |------ applybinlogs ... ------>|      周期批量推送
//!   |<----- +OK --------------------|
//! ```
//!
//! 握手中的 +PONG 一步不可省略：行/批量协议不是定长帧，若 +OK 与
//! 首个 binlog 批次在副本输入缓冲中粘连，副本侧拆帧会复杂化。
//!
//! binlog_pos 定义为"副本已应用的最大 txn_id"，而不是"第一个未应用
//! 的 txn_id"；与快照 BackupInfo 的 commit_id 语义保持一致。

pub mod batch;
pub mod full_sync;
pub mod manager;

pub use manager::{MPovStatus, ReplManager, ReplStats};

/// 单批建议条数上限（事务边界优先，可被单个大事务突破）
pub const SUGGEST_BATCH: usize = 64;

/// 单批建议字节上限
pub const SUGGEST_BYTES: usize = 16 * 1024 * 1024;

/// 全量同步文件传输分块大小
pub const FULL_FILE_CHUNK: usize = 20 * 1024 * 1024;
