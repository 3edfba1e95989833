// Binlog 记录数据结构
//
// 每个实例的 binlog 是按 txn_id 有序的已提交变更日志：
//
// ┌──────────────────────────────────────────────────────────┐
// │                    ReplLog (一条 binlog 记录)             │
// │                                                          │
// │  ReplLogKey   { txn_id, local_id, timestamp }            │
// │  ReplLogValue { Put { key, value } | Del { key } }       │
// └──────────────────────────────────────────────────────────┘
//
// 语义：
// - txn_id 单调递增（64 位）；同一次提交的所有记录共享同一 txn_id
// - local_id 是记录在事务内的序号，保证事务内顺序可重建
// - 一个事务 = txn_id 相同的最大连续记录段；推送时不允许跨批切分
//
// 线上格式：
// - 每条记录编码为 (key_bytes, value_bytes) 一对不透明字节串，
//   由 rkyv 序列化；对端用 check_archived_root 校验后反序列化

use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};

/// binlog 记录键
#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct ReplLogKey {
    /// 提交事务 ID（单调递增）
    pub txn_id: u64,
    /// 事务内序号
    pub local_id: u32,
    /// 提交时间戳（纳秒）
    pub timestamp: i64,
}

/// binlog 记录值（变更操作）
#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub enum ReplLogValue {
    Put { key: Vec<u8>, value: Vec<u8> },
    Del { key: Vec<u8> },
}

impl ReplLogValue {
    /// 值字节数（批次字节预算只按值侧估算，key 不计入）
    pub fn value_size(&self) -> usize {
        match self {
            ReplLogValue::Put { value, .. } => value.len(),
            ReplLogValue::Del { .. } => 0,
        }
    }
}

/// 一条完整的 binlog 记录
#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct ReplLog {
    pub key: ReplLogKey,
    pub value: ReplLogValue,
}

impl ReplLog {
    pub fn new(txn_id: u64, local_id: u32, timestamp: i64, value: ReplLogValue) -> Self {
        Self {
            key: ReplLogKey {
                txn_id,
                local_id,
                timestamp,
            },
            value,
        }
    }

    pub fn txn_id(&self) -> u64 {
        self.key.txn_id
    }

    /// 编码为线上格式 (key_bytes, value_bytes)
    pub fn encode(&self) -> Result<(Vec<u8>, Vec<u8>), String> {
        let key_bytes = rkyv::to_bytes::<_, 64>(&self.key)
            .map_err(|e| format!("Serialize binlog key failed: {}", e))?
            .to_vec();
        let value_bytes = rkyv::to_bytes::<_, 1024>(&self.value)
            .map_err(|e| format!("Serialize binlog value failed: {}", e))?
            .to_vec();
        Ok((key_bytes, value_bytes))
    }

    /// 从线上格式解码（副本应用侧）
    pub fn decode(key_bytes: &[u8], value_bytes: &[u8]) -> Result<Self, String> {
        let archived_key = rkyv::check_archived_root::<ReplLogKey>(key_bytes)
            .map_err(|e| format!("Deserialize binlog key failed: {}", e))?;
        let key: ReplLogKey = archived_key
            .deserialize(&mut rkyv::Infallible)
            .map_err(|e| format!("Deserialize binlog key failed: {:?}", e))?;

        let archived_value = rkyv::check_archived_root::<ReplLogValue>(value_bytes)
            .map_err(|e| format!("Deserialize binlog value failed: {}", e))?;
        let value: ReplLogValue = archived_value
            .deserialize(&mut rkyv::Infallible)
            .map_err(|e| format!("Deserialize binlog value failed: {:?}", e))?;

        Ok(Self { key, value })
    }

    /// 文件存储编码（整条记录一段字节）
    pub fn to_bytes(&self) -> Result<Vec<u8>, String> {
        Ok(rkyv::to_bytes::<_, 1024>(self)
            .map_err(|e| format!("Serialize binlog entry failed: {}", e))?
            .to_vec())
    }

    /// 文件存储解码
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, String> {
        let archived = rkyv::check_archived_root::<ReplLog>(bytes)
            .map_err(|e| format!("Deserialize binlog entry failed: {}", e))?;
        archived
            .deserialize(&mut rkyv::Infallible)
            .map_err(|e| format!("Deserialize binlog entry failed: {:?}", e))
    }
}
