//! 配置管理模块

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QakvConfig {
    pub server: ServerConfig,
    pub listen: ListenConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub replication: ReplicationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub name: String,
    pub environment: String,
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    pub host: String,
    pub port: u16,
}

impl ListenConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub base_path: String,
    /// 存储实例数量（storeId 的上界）
    #[serde(default = "default_instance_num")]
    pub instance_num: u32,
}

/// 复制配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// 全量同步线程数（长任务，宜小）
    #[serde(default = "default_full_pusher_workers")]
    pub full_pusher_workers: usize,

    /// 全量同步排队上限
    #[serde(default = "default_full_pusher_queue")]
    pub full_pusher_queue: usize,

    /// 增量推送线程数（短任务，宜大）
    #[serde(default = "default_incr_pusher_workers")]
    pub incr_pusher_workers: usize,

    /// 增量推送排队上限
    #[serde(default = "default_incr_pusher_queue")]
    pub incr_pusher_queue: usize,

    /// 调度 tick 间隔（毫秒）
    #[serde(default = "default_sched_interval")]
    pub sched_interval_ms: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            full_pusher_workers: 2,
            full_pusher_queue: 2,
            incr_pusher_workers: 8,
            incr_pusher_queue: 64,
            sched_interval_ms: 100,
        }
    }
}

// 默认值函数
fn default_instance_num() -> u32 { 10 }
fn default_full_pusher_workers() -> usize { 2 }
fn default_full_pusher_queue() -> usize { 2 }
fn default_incr_pusher_workers() -> usize { 8 }
fn default_incr_pusher_queue() -> usize { 64 }
fn default_sched_interval() -> u64 { 100 }

impl QakvConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, String> {
        let content = fs::read_to_string(path.as_ref())
            .map_err(|e| format!("Failed to read config file: {}", e))?;
        toml::from_str(&content).map_err(|e| format!("Failed to parse config file: {}", e))
    }

    pub fn load_default() -> Result<Self, String> {
        Self::load_from_file("config/qakv.toml")
    }
}

impl Default for QakvConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                name: "QAKV".to_string(),
                environment: "development".to_string(),
                log_level: "info".to_string(),
            },
            listen: ListenConfig {
                host: "127.0.0.1".to_string(),
                port: 6479,
            },
            storage: StorageConfig {
                base_path: "/tmp/qakv/storage".to_string(),
                instance_num: default_instance_num(),
            },
            replication: ReplicationConfig::default(),
        }
    }
}
