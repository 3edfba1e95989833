// 单实例存储 - 内存表 + 追加式 binlog + 快照备份
//
// 每个实例独立拥有：
// - 内存表（key → value）
// - binlog 文件：统一的"u32 长度前缀 + rkyv 记录"帧，首帧是文件头，
//   其后都是数据记录；启动时回放恢复
// - 单调 txn_id 生成器：一次 write_batch 的所有记录共享同一 txn_id
// - 保留下限 first_binlog_id：truncate_binlog 之后早于该位置的记录不再可供
// - 备份 API：backup() 物化快照目录（文件清单 + commit_id），release_backup() 释放

use super::binlog::{ReplLog, ReplLogValue};
use parking_lot::{Mutex, RwLock};
use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

const BINLOG_MAGIC: u64 = u64::from_le_bytes(*b"QAKVBLG1");
const BINLOG_VERSION: u32 = 1;

/// binlog 文件头：文件首帧，与数据记录走同一套帧编码
#[derive(Debug, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
struct BinlogFileHeader {
    magic: u64,
    version: u32,
    store_id: u32,
    start_txn_id: u64,
    created_at: i64,
}

impl BinlogFileHeader {
    fn new(store_id: u32, start_txn_id: u64) -> Self {
        Self {
            magic: BINLOG_MAGIC,
            version: BINLOG_VERSION,
            store_id,
            start_txn_id,
            created_at: chrono::Utc::now().timestamp(),
        }
    }

    fn validate(&self) -> Result<(), String> {
        if self.magic != BINLOG_MAGIC {
            return Err("Invalid binlog magic".to_string());
        }
        if self.version != BINLOG_VERSION {
            return Err(format!("Unsupported binlog version {}", self.version));
        }
        Ok(())
    }
}

/// 快照文件内容（backup 时整表物化）
#[derive(Debug, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct SnapshotFile {
    pub entries: Vec<SnapshotEntry>,
}

#[derive(Debug, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct SnapshotEntry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// 备份信息：快照目录 + 文件清单 + 快照提交位置
///
/// commit_id 是快照物化时刻已提交的最大 txn_id，与副本 binlog_pos
/// 语义一致（"已应用的最大 txn_id"）。
#[derive(Debug, Clone)]
pub struct BackupInfo {
    pub dir: PathBuf,
    /// (文件名, 字节数)，按文件名排序；传输顺序与清单一致
    pub file_list: Vec<(String, u64)>,
    pub commit_id: u64,
}

/// 单实例存储
pub struct KvInstance {
    store_id: u32,
    dir: PathBuf,

    /// 内存表
    data: RwLock<HashMap<Vec<u8>, Vec<u8>>>,

    /// 内存中的 binlog（按 (txn_id, local_id) 有序），游标从这里读取
    binlog: Arc<RwLock<Vec<ReplLog>>>,

    /// binlog 追加文件
    binlog_file: Mutex<File>,

    /// 下一个待分配的 txn_id
    next_txn_id: AtomicU64,

    /// 保留下限：已丢弃的最大 txn_id；副本 binlog_pos 不得低于它
    first_binlog_id: AtomicU64,

    running: AtomicBool,
    backing_up: AtomicBool,
}

impl KvInstance {
    /// 创建（或恢复）一个实例
    pub fn create(store_id: u32, base_path: &str) -> Result<Self, String> {
        let dir = PathBuf::from(base_path).join(format!("store_{}", store_id));
        std::fs::create_dir_all(&dir)
            .map_err(|e| format!("Create store dir failed: {}", e))?;

        let binlog_path = dir.join("binlog.log");
        let existed = binlog_path.exists();

        let mut data = HashMap::new();
        let mut binlog = Vec::new();
        let mut max_txn_id = 0u64;

        if existed {
            Self::replay(&binlog_path, |log| {
                match &log.value {
                    ReplLogValue::Put { key, value } => {
                        data.insert(key.clone(), value.clone());
                    }
                    ReplLogValue::Del { key } => {
                        data.remove(key);
                    }
                }
                max_txn_id = max_txn_id.max(log.txn_id());
                binlog.push(log);
                Ok(())
            })?;
            log::info!(
                "[store {}] Recovered {} binlog entries, last txn {}",
                store_id,
                binlog.len(),
                max_txn_id
            );
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&binlog_path)
            .map_err(|e| format!("Open binlog file failed: {}", e))?;

        if !existed {
            let header = BinlogFileHeader::new(store_id, 1);
            let header_bytes = rkyv::to_bytes::<_, 64>(&header)
                .map_err(|e| format!("Serialize binlog header failed: {}", e))?;
            Self::write_frame(&mut file, &header_bytes)?;
            file.sync_all()
                .map_err(|e| format!("Sync binlog header failed: {}", e))?;
        }

        Ok(Self {
            store_id,
            dir,
            data: RwLock::new(data),
            binlog: Arc::new(RwLock::new(binlog)),
            binlog_file: Mutex::new(file),
            next_txn_id: AtomicU64::new(max_txn_id + 1),
            first_binlog_id: AtomicU64::new(0),
            running: AtomicBool::new(true),
            backing_up: AtomicBool::new(false),
        })
    }

    /// 回放 binlog 文件：首帧必须是合法文件头，其后全部是数据记录
    fn replay<F>(path: &PathBuf, mut callback: F) -> Result<(), String>
    where
        F: FnMut(ReplLog) -> Result<(), String>,
    {
        let file = File::open(path).map_err(|e| format!("Open binlog failed: {}", e))?;
        let mut reader = BufReader::new(file);

        let header_bytes = Self::read_frame(&mut reader)?
            .ok_or_else(|| "Binlog missing header frame".to_string())?;
        let archived = rkyv::check_archived_root::<BinlogFileHeader>(&header_bytes)
            .map_err(|e| format!("Deserialize binlog header failed: {}", e))?;
        let header: BinlogFileHeader = archived
            .deserialize(&mut rkyv::Infallible)
            .map_err(|e| format!("Deserialize binlog header failed: {:?}", e))?;
        header.validate()?;

        while let Some(entry_bytes) = Self::read_frame(&mut reader)? {
            callback(ReplLog::from_bytes(&entry_bytes)?)?;
        }

        Ok(())
    }

    /// 写一帧：u32 长度前缀 + 负载
    fn write_frame(file: &mut File, bytes: &[u8]) -> Result<(), String> {
        let length = bytes.len() as u32;
        file.write_all(&length.to_le_bytes())
            .map_err(|e| format!("Binlog write failed: {}", e))?;
        file.write_all(bytes)
            .map_err(|e| format!("Binlog write failed: {}", e))
    }

    /// 读一帧；干净的文件尾返回 Ok(None)
    fn read_frame(reader: &mut BufReader<File>) -> Result<Option<Vec<u8>>, String> {
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf) {
            Ok(_) => {}
            Err(ref e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(format!("Read frame length failed: {}", e)),
        }

        let length = u32::from_le_bytes(len_buf) as usize;
        let mut buf = vec![0u8; length];
        reader
            .read_exact(&mut buf)
            .map_err(|e| format!("Read frame data failed: {}", e))?;
        Ok(Some(buf))
    }

    pub fn store_id(&self) -> u32 {
        self.store_id
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    /// 读取单个 key（内存表）
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.data.read().get(key).cloned()
    }

    /// 已提交的最大 txn_id（无提交时为 0）
    pub fn last_committed_txn(&self) -> u64 {
        self.binlog.read().last().map(|e| e.txn_id()).unwrap_or(0)
    }

    /// 保留下限
    pub fn first_binlog_id(&self) -> u64 {
        self.first_binlog_id.load(Ordering::Relaxed)
    }

    /// 提交一批变更：所有记录共享同一 txn_id，先落 binlog 文件再应用到内存表
    pub fn write_batch(&self, ops: Vec<ReplLogValue>) -> Result<u64, String> {
        if ops.is_empty() {
            return Err("Empty write batch".to_string());
        }

        // 整个提交持有文件锁串行执行，内存 binlog 才能保持
        // (txn_id, local_id) 有序追加（游标依赖这一顺序）
        let mut file = self.binlog_file.lock();

        let txn_id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        let timestamp = chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0);

        let entries: Vec<ReplLog> = ops
            .into_iter()
            .enumerate()
            .map(|(i, op)| ReplLog::new(txn_id, i as u32, timestamp, op))
            .collect();

        for entry in &entries {
            let bytes = entry.to_bytes()?;
            Self::write_frame(&mut file, &bytes)?;
        }
        file.sync_all()
            .map_err(|e| format!("Binlog sync failed: {}", e))?;

        {
            let mut data = self.data.write();
            for entry in &entries {
                match &entry.value {
                    ReplLogValue::Put { key, value } => {
                        data.insert(key.clone(), value.clone());
                    }
                    ReplLogValue::Del { key } => {
                        data.remove(key);
                    }
                }
            }
        }

        self.binlog.write().extend(entries);
        Ok(txn_id)
    }

    /// 打开读事务（固定 binlog 可见上界）
    pub fn begin_read(&self) -> ReadTxn {
        let last_visible_txn = self.last_committed_txn();
        ReadTxn {
            log: self.binlog.clone(),
            last_visible_txn,
            first_binlog_id: self.first_binlog_id(),
        }
    }

    /// 推进保留下限：丢弃 txn_id <= up_to 的内存记录
    ///
    /// 只前移、不后退。文件段的物理回收不在此处理。
    pub fn truncate_binlog(&self, up_to: u64) -> Result<usize, String> {
        let mut binlog = self.binlog.write();
        let before = binlog.len();
        binlog.retain(|e| e.txn_id() > up_to);
        let removed = before - binlog.len();

        self.first_binlog_id.fetch_max(up_to, Ordering::SeqCst);
        if removed > 0 {
            log::info!(
                "[store {}] Truncated {} binlog entries up to txn {}",
                self.store_id,
                removed,
                up_to
            );
        }
        Ok(removed)
    }

    /// 物化快照备份
    ///
    /// 同一时刻至多一个备份；调用方负责（在所有退出路径上）release_backup()。
    pub fn backup(&self) -> Result<BackupInfo, String> {
        if self.backing_up.swap(true, Ordering::SeqCst) {
            return Err("Backup already in progress".to_string());
        }

        let result = self.do_backup();
        if result.is_err() {
            self.backing_up.store(false, Ordering::SeqCst);
        }
        result
    }

    fn do_backup(&self) -> Result<BackupInfo, String> {
        let backup_dir = self.backup_dir();
        if backup_dir.exists() {
            std::fs::remove_dir_all(&backup_dir)
                .map_err(|e| format!("Remove stale backup dir failed: {}", e))?;
        }
        std::fs::create_dir_all(&backup_dir)
            .map_err(|e| format!("Create backup dir failed: {}", e))?;

        // 数据读锁与 commit_id 捕获配对，保证快照与位点一致
        let (snapshot, commit_id) = {
            let data = self.data.read();
            let commit_id = self.last_committed_txn();
            let mut entries: Vec<SnapshotEntry> = data
                .iter()
                .map(|(k, v)| SnapshotEntry {
                    key: k.clone(),
                    value: v.clone(),
                })
                .collect();
            entries.sort_by(|a, b| a.key.cmp(&b.key));
            (SnapshotFile { entries }, commit_id)
        };

        let snapshot_bytes = rkyv::to_bytes::<_, 4096>(&snapshot)
            .map_err(|e| format!("Serialize snapshot failed: {}", e))?
            .to_vec();

        let snapshot_path = backup_dir.join("data.snapshot");
        std::fs::write(&snapshot_path, &snapshot_bytes)
            .map_err(|e| format!("Write snapshot failed: {}", e))?;

        let meta_path = backup_dir.join("backup.meta");
        let meta = format!(
            "store_id={}\ncommit_id={}\ntimestamp={}\n",
            self.store_id,
            commit_id,
            chrono::Utc::now().timestamp()
        );
        std::fs::write(&meta_path, &meta)
            .map_err(|e| format!("Write backup meta failed: {}", e))?;

        let mut file_list = Vec::new();
        for name in ["backup.meta", "data.snapshot"] {
            let size = std::fs::metadata(backup_dir.join(name))
                .map_err(|e| format!("Stat backup file failed: {}", e))?
                .len();
            file_list.push((name.to_string(), size));
        }

        log::info!(
            "[store {}] Backup materialized at {:?}, commit_id {}",
            self.store_id,
            backup_dir,
            commit_id
        );

        Ok(BackupInfo {
            dir: backup_dir,
            file_list,
            commit_id,
        })
    }

    /// 释放备份（删除快照目录）
    pub fn release_backup(&self) -> Result<(), String> {
        if !self.backing_up.swap(false, Ordering::SeqCst) {
            return Err("No backup to release".to_string());
        }

        let backup_dir = self.backup_dir();
        std::fs::remove_dir_all(&backup_dir)
            .map_err(|e| format!("Remove backup dir failed: {}", e))
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.dir.join("backup")
    }
}

/// 读事务：固定创建时刻的 binlog 可见上界
pub struct ReadTxn {
    log: Arc<RwLock<Vec<ReplLog>>>,
    last_visible_txn: u64,
    first_binlog_id: u64,
}

impl ReadTxn {
    /// 打开定位于 from_txn_id 的 binlog 游标
    ///
    /// 调用方传入"第一个未应用位置"（binlog_pos + 1）。
    pub fn binlog_cursor(&self, from_txn_id: u64) -> BinlogCursor {
        // 请求已被丢弃的区段：在 next() 上报错，由上层淘汰该客户端
        let err = if from_txn_id != 0 && from_txn_id <= self.first_binlog_id {
            Some(format!(
                "Binlog truncated: requested from {}, retained after {}",
                from_txn_id, self.first_binlog_id
            ))
        } else {
            None
        };

        BinlogCursor {
            log: self.log.clone(),
            next_txn: from_txn_id,
            next_local: 0,
            last_visible_txn: self.last_visible_txn,
            err,
        }
    }
}

/// binlog 游标
///
/// 游标按 (txn_id, local_id) 定位而不是按下标，并发截断只会让
/// 它提前读尽，不会错位。next() 返回 Ok(None) 表示读尽（不是错误）。
pub struct BinlogCursor {
    log: Arc<RwLock<Vec<ReplLog>>>,
    next_txn: u64,
    next_local: u32,
    last_visible_txn: u64,
    err: Option<String>,
}

impl BinlogCursor {
    pub fn next(&mut self) -> Result<Option<ReplLog>, String> {
        if let Some(e) = &self.err {
            return Err(e.clone());
        }

        let log = self.log.read();
        let idx = log.partition_point(|e| {
            (e.key.txn_id, e.key.local_id) < (self.next_txn, self.next_local)
        });
        if idx >= log.len() {
            return Ok(None);
        }

        let entry = log[idx].clone();
        drop(log);

        if entry.key.txn_id > self.last_visible_txn {
            return Ok(None);
        }

        self.next_txn = entry.key.txn_id;
        self.next_local = entry.key.local_id + 1;
        Ok(Some(entry))
    }
}
