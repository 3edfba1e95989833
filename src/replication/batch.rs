// Binlog 批量组装与推送
//
// 批次约束（按优先级）：
// 1. 不切分事务：同一 txn_id 的记录必须落在同一批
// 2. 建议条数 SUGGEST_BATCH / 建议字节 SUGGEST_BYTES：
//    只在事务边界上检查，已经开始的事务整体收完

use super::{SUGGEST_BATCH, SUGGEST_BYTES};
use crate::network::BlockingTcpClient;
use crate::protocol::resp::{fmt_bulk, fmt_multi_bulk_len};
use crate::storage::{KvInstance, ReplLog};
use std::sync::Arc;
use std::time::Duration;

/// 组装一个批次
///
/// 返回 (线上帧, 新水位, 条数)。批次为空时水位保持 from_pos 不变。
///
/// 帧格式：*N\r\n 后接 "applybinlogs"、dstStoreId（十进制），
/// 再接每条记录的 (key_bytes, value_bytes) 两个 bulk。
pub fn build_batch(
    store: &Arc<KvInstance>,
    dst_store_id: u32,
    from_pos: u64,
) -> Result<(Vec<u8>, u64, usize), String> {
    let txn = store.begin_read();
    let mut cursor = txn.binlog_cursor(from_pos + 1);

    let mut binlogs: Vec<ReplLog> = Vec::new();
    let mut count = 0usize;
    let mut now_id = 0u64;
    let mut estimate_size = 0usize;

    loop {
        match cursor.next()? {
            None => break,
            Some(log) => {
                let txn_id = log.txn_id();
                // 事务边界上达到预算即止步；游标多读出的这条下一批重读
                if now_id != 0
                    && txn_id != now_id
                    && (count >= SUGGEST_BATCH || estimate_size >= SUGGEST_BYTES)
                {
                    break;
                }
                now_id = txn_id;
                count += 1;
                estimate_size += log.value.value_size();
                binlogs.push(log);
            }
        }
    }

    let mut buf = Vec::with_capacity(estimate_size + 128);
    fmt_multi_bulk_len(&mut buf, binlogs.len() * 2 + 2);
    fmt_bulk(&mut buf, b"applybinlogs");
    fmt_bulk(&mut buf, dst_store_id.to_string().as_bytes());
    for log in &binlogs {
        let (key_bytes, value_bytes) = log.encode()?;
        fmt_bulk(&mut buf, &key_bytes);
        fmt_bulk(&mut buf, &value_bytes);
    }

    let new_pos = binlogs.last().map(|l| l.txn_id()).unwrap_or(from_pos);
    Ok((buf, new_pos, binlogs.len()))
}

/// 批次写超时：载荷越大给越久，大阈值先判
fn batch_write_timeout(payload_len: usize) -> Duration {
    let secs = if payload_len > 10 * 1024 * 1024 {
        4
    } else if payload_len > 1024 * 1024 {
        2
    } else {
        1
    };
    Duration::from_secs(secs)
}

/// 组装并推送一个批次，等待副本确认
///
/// 返回 (新水位, 条数)。任何写/读/确认失败都返回错误，由调用方淘汰该客户端。
pub fn master_send_binlog(
    client: &mut BlockingTcpClient,
    store: &Arc<KvInstance>,
    store_id: u32,
    dst_store_id: u32,
    binlog_pos: u64,
) -> Result<(u64, usize), String> {
    let (buf, new_pos, count) = build_batch(store, dst_store_id, binlog_pos)?;

    let timeout = batch_write_timeout(buf.len());
    client.write_data(&buf, timeout)?;

    let reply = client.read_line(timeout)?;
    if reply != "+OK" {
        log::warn!(
            "store:{} dst store:{} apply binlogs failed: {}",
            store_id,
            dst_store_id,
            reply
        );
        return Err(format!("Bad apply reply: {}", reply));
    }

    Ok((new_pos, count))
}
