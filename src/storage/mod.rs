//! 持久化存储模块

// Binlog 记录模型
pub mod binlog;

// 单实例存储（内存表 + binlog + 快照）
pub mod instance;

pub use binlog::{ReplLog, ReplLogKey, ReplLogValue};
pub use instance::{BackupInfo, BinlogCursor, KvInstance, ReadTxn};

use std::sync::Arc;

/// 多实例存储管理器：固定数量的独立实例，按 store_id 寻址
pub struct KvStoreManager {
    instances: Vec<Arc<KvInstance>>,
}

impl KvStoreManager {
    /// 创建（或恢复）全部实例
    pub fn new(base_path: &str, instance_num: u32) -> Result<Self, String> {
        let mut instances = Vec::with_capacity(instance_num as usize);
        for store_id in 0..instance_num {
            instances.push(Arc::new(KvInstance::create(store_id, base_path)?));
        }

        log::info!("Storage initialized: {} instances at {}", instance_num, base_path);
        Ok(Self { instances })
    }

    /// 按 store_id 取实例；越界返回 None
    pub fn get(&self, store_id: u32) -> Option<Arc<KvInstance>> {
        self.instances.get(store_id as usize).cloned()
    }

    /// 实例数量（store_id 的上界）
    pub fn instance_num(&self) -> u32 {
        self.instances.len() as u32
    }
}
