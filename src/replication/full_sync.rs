// 全量同步供给例程（运行在 full_pusher 线程池上）
//
// 线上顺序：
// 1. 清单行：JSON 对象 {"<fname>": <sizeBytes>, ...}（单行 UTF-8）
// 2. 逐文件：文件名一行，然后恰好 sizeBytes 字节原始内容（分块写出）
// 3. 读一行副本回复，仅记日志，不重发
//
// 快照从取得那一刻起由作用域守卫负责释放：任何退出路径（包括
// 流式写文件中途的 panic）都会释放；释放失败只记日志，不改变
// 客户端侧的结果。

use super::FULL_FILE_CHUNK;
use crate::network::BlockingTcpClient;
use crate::storage::{KvInstance, KvStoreManager};
use std::fs::File;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

const LINE_TIMEOUT: Duration = Duration::from_secs(1);

/// 快照释放守卫
struct BackupGuard {
    store: Arc<KvInstance>,
}

impl Drop for BackupGuard {
    fn drop(&mut self) {
        if let Err(e) = self.store.release_backup() {
            log::error!(
                "Full sync end clean store:{} error: {}",
                self.store.store_id(),
                e
            );
        }
    }
}

/// 向一个副本供给全量同步
pub fn supply_full_sync_routine(
    stores: &Arc<KvStoreManager>,
    mut client: BlockingTcpClient,
    store_id: u32,
) {
    let store = match stores.get(store_id) {
        Some(s) => s,
        None => {
            let _ = client.write_line("-ERR invalid storeId", LINE_TIMEOUT);
            return;
        }
    };

    if !store.is_running() {
        let _ = client.write_line("-ERR store is not running", LINE_TIMEOUT);
        return;
    }

    let bk_info = match store.backup() {
        Ok(info) => info,
        Err(e) => {
            let _ = client.write_line(&format!("-ERR backup failed:{}", e), LINE_TIMEOUT);
            return;
        }
    };
    let _guard = BackupGuard {
        store: store.clone(),
    };

    // 清单：文件名 → 字节数，单行 JSON
    let mut manifest = serde_json::Map::new();
    for (fname, size) in &bk_info.file_list {
        manifest.insert(fname.clone(), serde_json::Value::from(*size));
    }
    let manifest_line = serde_json::Value::Object(manifest).to_string();

    if let Err(e) = client.write_line(&manifest_line, LINE_TIMEOUT) {
        log::error!("store:{} write manifest failed: {}", store_id, e);
        return;
    }

    let mut chunk: Vec<u8> = Vec::new();
    for (fname, size) in &bk_info.file_list {
        if let Err(e) = client.write_line(fname, LINE_TIMEOUT) {
            log::error!("Write fname:{} to client failed: {}", fname, e);
            return;
        }

        let path = bk_info.dir.join(fname);
        let mut file = match File::open(&path) {
            Ok(f) => f,
            Err(e) => {
                log::error!("Open file:{:?} for read failed: {}", path, e);
                return;
            }
        };

        let mut remain = *size as usize;
        while remain > 0 {
            let batch_size = remain.min(FULL_FILE_CHUNK);
            chunk.resize(batch_size, 0);
            if let Err(e) = file.read_exact(&mut chunk[..batch_size]) {
                log::error!("Read file:{:?} failed: {}", path, e);
                return;
            }
            if let Err(e) = client.write_data(&chunk[..batch_size], LINE_TIMEOUT) {
                log::error!("Write bulk to client failed: {}", e);
                return;
            }
            remain -= batch_size;
        }
    }

    match client.read_line(LINE_TIMEOUT) {
        Ok(reply) => log::info!(
            "Full sync done, read {} reply: {}",
            client.remote_repr(),
            reply
        ),
        Err(e) => log::error!(
            "Full sync done, read {} reply failed: {}",
            client.remote_repr(),
            e
        ),
    }
}
