// 主从复制端到端集成测试
//
// 测试流程：
// 1. 启动多实例存储 + 复制引擎 + TCP 服务
// 2. 以裸 TCP 客户端扮演副本，走真实线上协议
// 3. 验证握手、全量同步、增量推送、淘汰各路径

use qakv::network::BlockingTcpClient;
use qakv::protocol::resp::read_multi_bulk;
use qakv::replication::ReplManager;
use qakv::service::ReplServer;
use qakv::storage::instance::SnapshotFile;
use qakv::storage::{KvStoreManager, ReplLog, ReplLogValue};
use qakv::utils::config::ReplicationConfig;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const IO_TIMEOUT: Duration = Duration::from_secs(3);
const REPLY_TIMEOUT: Duration = Duration::from_secs(1);

struct TestServer {
    manager: Arc<ReplManager>,
    addr: String,
    _dir: TempDir,
}

/// 起一个完整的服务端（存储 + 复制引擎 + TCP 接入）
fn start_server(instance_num: u32, config: ReplicationConfig, with_scheduler: bool) -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let stores = Arc::new(KvStoreManager::new(dir.path().to_str().unwrap(), instance_num).unwrap());
    let manager = ReplManager::new(stores, &config);

    if with_scheduler {
        let _ = manager.clone().start_scheduler();
    }

    let server = ReplServer::bind("127.0.0.1:0", manager.clone()).unwrap();
    let addr = server.local_addr().unwrap().to_string();
    let _ = server.start();

    TestServer {
        manager,
        addr,
        _dir: dir,
    }
}

fn fast_config() -> ReplicationConfig {
    ReplicationConfig {
        full_pusher_workers: 1,
        full_pusher_queue: 1,
        incr_pusher_workers: 2,
        incr_pusher_queue: 16,
        sched_interval_ms: 20,
    }
}

fn connect(addr: &str) -> BlockingTcpClient {
    BlockingTcpClient::connect(addr, Duration::from_secs(2)).unwrap()
}

fn put(key: &[u8], value: &[u8]) -> ReplLogValue {
    ReplLogValue::Put {
        key: key.to_vec(),
        value: value.to_vec(),
    }
}

fn wait_until<F: Fn() -> bool>(cond: F, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    false
}

/// 读一个推送帧，校验帧头并回 +OK，返回解码后的记录
fn read_push_frame(client: &mut BlockingTcpClient, expect_dst: u32) -> Vec<ReplLog> {
    let args = read_multi_bulk(client, IO_TIMEOUT).unwrap();
    assert!(args.len() >= 2, "frame must carry command and dstStoreId");
    assert_eq!(args.len() % 2, 0);
    assert_eq!(args[0], b"applybinlogs");
    assert_eq!(args[1], expect_dst.to_string().into_bytes());

    let logs: Vec<ReplLog> = args[2..]
        .chunks(2)
        .map(|pair| ReplLog::decode(&pair[0], &pair[1]).unwrap())
        .collect();

    client.write_line("+OK", REPLY_TIMEOUT).unwrap();
    logs
}

// ========================================================================
// 握手
// ========================================================================

#[test]
fn test_incrsync_handshake_registers_client() {
    let server = start_server(4, fast_config(), false);
    let store = server.manager.stores().get(3).unwrap();
    store.truncate_binlog(50).unwrap();
    server.manager.refresh_first_binlog_ids();

    let mut replica = connect(&server.addr);
    replica
        .write_line("INCRSYNC 3 3 100", REPLY_TIMEOUT)
        .unwrap();
    assert_eq!(replica.read_line(IO_TIMEOUT).unwrap(), "+OK");
    replica.write_line("+PONG", REPLY_TIMEOUT).unwrap();

    assert!(wait_until(
        || server.manager.client_count(3) == 1,
        Duration::from_secs(3)
    ));

    let snapshot = server.manager.push_status_snapshot(3);
    assert_eq!(snapshot.len(), 1);
    let (_, binlog_pos, is_running) = snapshot[0];
    assert_eq!(binlog_pos, 100);
    assert!(!is_running);
}

#[test]
fn test_incrsync_rejects_stale_watermark() {
    let server = start_server(4, fast_config(), false);
    let store = server.manager.stores().get(3).unwrap();
    store.truncate_binlog(101).unwrap();
    server.manager.refresh_first_binlog_ids();

    let mut replica = connect(&server.addr);
    replica
        .write_line("INCRSYNC 3 3 100", REPLY_TIMEOUT)
        .unwrap();
    assert_eq!(
        replica.read_line(IO_TIMEOUT).unwrap(),
        "-ERR invalid binlogPos"
    );
    assert_eq!(server.manager.client_count(3), 0);
}

#[test]
fn test_incrsync_watermark_boundary() {
    let server = start_server(2, fast_config(), false);
    let store = server.manager.stores().get(0).unwrap();
    store.truncate_binlog(100).unwrap();
    server.manager.refresh_first_binlog_ids();

    // binlog_pos == first_binlog_id：注册成功
    let mut ok_replica = connect(&server.addr);
    ok_replica
        .write_line("INCRSYNC 0 0 100", REPLY_TIMEOUT)
        .unwrap();
    assert_eq!(ok_replica.read_line(IO_TIMEOUT).unwrap(), "+OK");
    ok_replica.write_line("+PONG", REPLY_TIMEOUT).unwrap();
    assert!(wait_until(
        || server.manager.client_count(0) == 1,
        Duration::from_secs(3)
    ));

    // binlog_pos == first_binlog_id - 1：拒绝
    let mut stale_replica = connect(&server.addr);
    stale_replica
        .write_line("INCRSYNC 0 0 99", REPLY_TIMEOUT)
        .unwrap();
    assert_eq!(
        stale_replica.read_line(IO_TIMEOUT).unwrap(),
        "-ERR invalid binlogPos"
    );
    assert_eq!(server.manager.client_count(0), 1);
}

#[test]
fn test_incrsync_parse_and_range_errors() {
    let server = start_server(4, fast_config(), false);

    let mut bad_number = connect(&server.addr);
    bad_number
        .write_line("INCRSYNC abc 0 0", REPLY_TIMEOUT)
        .unwrap();
    let reply = bad_number.read_line(IO_TIMEOUT).unwrap();
    assert!(
        reply.starts_with("-ERR parse opts failed:"),
        "unexpected reply: {}",
        reply
    );

    let mut out_of_range = connect(&server.addr);
    out_of_range
        .write_line("INCRSYNC 9 0 0", REPLY_TIMEOUT)
        .unwrap();
    assert_eq!(
        out_of_range.read_line(IO_TIMEOUT).unwrap(),
        "-ERR invalid storeId"
    );
}

#[test]
fn test_unknown_command() {
    let server = start_server(1, fast_config(), false);

    let mut client = connect(&server.addr);
    client.write_line("NOSUCHCMD 1 2", REPLY_TIMEOUT).unwrap();
    assert_eq!(
        client.read_line(IO_TIMEOUT).unwrap(),
        "-ERR unknown command"
    );
}

// ========================================================================
// 全量同步
// ========================================================================

#[test]
fn test_full_sync_wire_sequence() {
    let server = start_server(2, fast_config(), false);
    let store = server.manager.stores().get(0).unwrap();
    store.write_batch(vec![put(b"a", b"1")]).unwrap();
    store.write_batch(vec![put(b"b", b"2")]).unwrap();

    let mut replica = connect(&server.addr);
    replica.write_line("FULLSYNC 0", REPLY_TIMEOUT).unwrap();

    // 1. 清单行：JSON 对象 {"<fname>": <size>}
    let manifest_line = replica.read_line(IO_TIMEOUT).unwrap();
    let manifest: BTreeMap<String, u64> = serde_json::from_str(&manifest_line).unwrap();
    assert_eq!(manifest.len(), 2);
    assert!(manifest.contains_key("backup.meta"));
    assert!(manifest.contains_key("data.snapshot"));

    // 2. 按清单顺序：文件名一行 + 恰好 size 字节内容
    let mut files = HashMap::new();
    for (expect_name, size) in &manifest {
        let fname = replica.read_line(IO_TIMEOUT).unwrap();
        assert_eq!(&fname, expect_name);
        let content = replica.read_data(*size as usize, IO_TIMEOUT).unwrap();
        files.insert(fname, content);
    }

    // 3. 回一行，连接结束
    replica.write_line("+OK", REPLY_TIMEOUT).unwrap();

    // 快照内容与 master 一致
    let snapshot_bytes = &files["data.snapshot"];
    let archived = rkyv::check_archived_root::<SnapshotFile>(snapshot_bytes).unwrap();
    use rkyv::Deserialize;
    let snapshot: SnapshotFile = archived.deserialize(&mut rkyv::Infallible).unwrap();
    assert_eq!(snapshot.entries.len(), 2);
    assert_eq!(snapshot.entries[0].key, b"a".to_vec());
    assert_eq!(snapshot.entries[0].value, b"1".to_vec());

    // 元数据携带快照位点
    let meta = String::from_utf8(files["backup.meta"].clone()).unwrap();
    assert!(meta.contains("commit_id=2"), "meta: {}", meta);

    // 快照在所有退出路径上都被释放
    assert!(wait_until(
        || !store.backup_dir().exists(),
        Duration::from_secs(3)
    ));
}

#[test]
fn test_full_sync_store_not_running() {
    let server = start_server(2, fast_config(), false);
    server.manager.stores().get(1).unwrap().stop();

    let mut replica = connect(&server.addr);
    replica.write_line("FULLSYNC 1", REPLY_TIMEOUT).unwrap();
    assert_eq!(
        replica.read_line(IO_TIMEOUT).unwrap(),
        "-ERR store is not running"
    );
}

#[test]
fn test_full_sync_invalid_store() {
    let server = start_server(2, fast_config(), false);

    let mut replica = connect(&server.addr);
    replica.write_line("FULLSYNC 7", REPLY_TIMEOUT).unwrap();
    assert_eq!(
        replica.read_line(IO_TIMEOUT).unwrap(),
        "-ERR invalid storeId"
    );
}

#[test]
fn test_full_sync_admission_when_pool_full() {
    // 1 worker + 1 队列位：两个在途任务之后第三个必须被拒之门外
    let server = start_server(1, fast_config(), false);

    // 前两个连接不回最后一行，把 worker 钉在收尾读上（1s 超时窗口）
    let mut busy1 = connect(&server.addr);
    busy1.write_line("FULLSYNC 0", REPLY_TIMEOUT).unwrap();
    std::thread::sleep(Duration::from_millis(200));

    let mut busy2 = connect(&server.addr);
    busy2.write_line("FULLSYNC 0", REPLY_TIMEOUT).unwrap();
    std::thread::sleep(Duration::from_millis(100));

    let mut rejected = connect(&server.addr);
    rejected.write_line("FULLSYNC 0", REPLY_TIMEOUT).unwrap();
    assert_eq!(
        rejected.read_line(IO_TIMEOUT).unwrap(),
        "-ERR workerpool full"
    );
}

// ========================================================================
// 增量推送
// ========================================================================

#[test]
fn test_incremental_push_delivers_in_order() {
    let server = start_server(2, fast_config(), true);
    let store = server.manager.stores().get(1).unwrap();

    let mut replica = connect(&server.addr);
    replica
        .write_line("INCRSYNC 1 1 0", REPLY_TIMEOUT)
        .unwrap();
    assert_eq!(replica.read_line(IO_TIMEOUT).unwrap(), "+OK");
    replica.write_line("+PONG", REPLY_TIMEOUT).unwrap();

    // 三个事务共 6 条记录
    store.write_batch(vec![put(b"a", b"1"), put(b"b", b"2")]).unwrap();
    store.write_batch(vec![put(b"c", b"3")]).unwrap();
    store
        .write_batch(vec![
            put(b"d", b"4"),
            put(b"e", b"5"),
            ReplLogValue::Del { key: b"a".to_vec() },
        ])
        .unwrap();

    // 批次可能夹着空帧到来；收满 6 条为止
    let mut received: Vec<ReplLog> = Vec::new();
    let mut frames: Vec<Vec<u64>> = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(10);
    while received.len() < 6 {
        assert!(Instant::now() < deadline, "pushes never arrived");
        let logs = read_push_frame(&mut replica, 1);
        if !logs.is_empty() {
            frames.push(logs.iter().map(|l| l.txn_id()).collect());
            received.extend(logs);
        }
    }

    // 顺序：(txn_id, local_id) 严格按游标序
    let keys: Vec<(u64, u32)> = received
        .iter()
        .map(|l| (l.key.txn_id, l.key.local_id))
        .collect();
    assert_eq!(
        keys,
        vec![(1, 0), (1, 1), (2, 0), (3, 0), (3, 1), (3, 2)]
    );

    // 事务不跨帧：相邻非空帧首尾 txn_id 不同
    for pair in frames.windows(2) {
        assert_ne!(pair[0].last(), pair[1].first());
    }

    // 水位推进到 3 且单调
    assert!(wait_until(
        || {
            server
                .manager
                .push_status_snapshot(1)
                .first()
                .map(|(_, pos, _)| *pos == 3)
                .unwrap_or(false)
        },
        Duration::from_secs(5)
    ));

    assert!(wait_until(
        || {
            let stats = server.manager.stats();
            stats.batches_shipped.load(std::sync::atomic::Ordering::Relaxed) >= 1
                && stats.entries_shipped.load(std::sync::atomic::Ordering::Relaxed) == 6
        },
        Duration::from_secs(3)
    ));
}

#[test]
fn test_incremental_push_resumes_from_watermark() {
    let server = start_server(2, fast_config(), true);
    let store = server.manager.stores().get(0).unwrap();

    for i in 0..5u32 {
        store
            .write_batch(vec![put(format!("k{}", i).as_bytes(), b"v")])
            .unwrap();
    }

    // 副本声称已应用到 txn 3：只应收到 4、5
    let mut replica = connect(&server.addr);
    replica
        .write_line("INCRSYNC 0 0 3", REPLY_TIMEOUT)
        .unwrap();
    assert_eq!(replica.read_line(IO_TIMEOUT).unwrap(), "+OK");
    replica.write_line("+PONG", REPLY_TIMEOUT).unwrap();

    let mut received = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(10);
    while received.len() < 2 {
        assert!(Instant::now() < deadline, "pushes never arrived");
        received.extend(read_push_frame(&mut replica, 0));
    }

    let txns: Vec<u64> = received.iter().map(|l| l.txn_id()).collect();
    assert_eq!(txns, vec![4, 5]);
}

#[test]
fn test_disconnected_replica_is_evicted() {
    let server = start_server(1, fast_config(), true);

    let mut replica = connect(&server.addr);
    replica
        .write_line("INCRSYNC 0 0 0", REPLY_TIMEOUT)
        .unwrap();
    assert_eq!(replica.read_line(IO_TIMEOUT).unwrap(), "+OK");
    replica.write_line("+PONG", REPLY_TIMEOUT).unwrap();

    assert!(wait_until(
        || server.manager.client_count(0) == 1,
        Duration::from_secs(3)
    ));

    // 断开连接：下一次推送失败即淘汰，连接句柄同步释放
    drop(replica);

    assert!(wait_until(
        || server.manager.client_count(0) == 0,
        Duration::from_secs(10)
    ));
    assert!(
        server
            .manager
            .stats()
            .clients_evicted
            .load(std::sync::atomic::Ordering::Relaxed)
            >= 1
    );
}

// ========================================================================
// 全量 + 增量衔接
// ========================================================================

#[test]
fn test_full_then_incremental_reaches_master_state() {
    let server = start_server(1, fast_config(), true);
    let store = server.manager.stores().get(0).unwrap();

    store.write_batch(vec![put(b"a", b"1"), put(b"b", b"2")]).unwrap();
    store.write_batch(vec![put(b"c", b"3")]).unwrap();

    // 1. 全量同步：重建副本表
    let mut replica_state: HashMap<Vec<u8>, Vec<u8>> = HashMap::new();
    let mut commit_id = 0u64;
    {
        let mut conn = connect(&server.addr);
        conn.write_line("FULLSYNC 0", REPLY_TIMEOUT).unwrap();
        let manifest_line = conn.read_line(IO_TIMEOUT).unwrap();
        let manifest: BTreeMap<String, u64> = serde_json::from_str(&manifest_line).unwrap();

        for (_, size) in &manifest {
            let fname = conn.read_line(IO_TIMEOUT).unwrap();
            let content = conn.read_data(*size as usize, IO_TIMEOUT).unwrap();
            match fname.as_str() {
                "data.snapshot" => {
                    let archived = rkyv::check_archived_root::<SnapshotFile>(&content).unwrap();
                    use rkyv::Deserialize;
                    let snapshot: SnapshotFile =
                        archived.deserialize(&mut rkyv::Infallible).unwrap();
                    for entry in snapshot.entries {
                        replica_state.insert(entry.key, entry.value);
                    }
                }
                "backup.meta" => {
                    let meta = String::from_utf8(content).unwrap();
                    for line in meta.lines() {
                        if let Some(v) = line.strip_prefix("commit_id=") {
                            commit_id = v.parse().unwrap();
                        }
                    }
                }
                other => panic!("unexpected file {}", other),
            }
        }
        conn.write_line("+OK", REPLY_TIMEOUT).unwrap();
    }
    assert_eq!(commit_id, 2);
    assert_eq!(replica_state.len(), 3);

    // 2. 从快照位点接续增量
    let mut conn = connect(&server.addr);
    conn.write_line(&format!("INCRSYNC 0 0 {}", commit_id), REPLY_TIMEOUT)
        .unwrap();
    assert_eq!(conn.read_line(IO_TIMEOUT).unwrap(), "+OK");
    conn.write_line("+PONG", REPLY_TIMEOUT).unwrap();

    store
        .write_batch(vec![put(b"d", b"4"), ReplLogValue::Del { key: b"a".to_vec() }])
        .unwrap();

    let mut applied = 0;
    let deadline = Instant::now() + Duration::from_secs(10);
    while applied < 2 {
        assert!(Instant::now() < deadline, "pushes never arrived");
        for log in read_push_frame(&mut conn, 0) {
            match log.value {
                ReplLogValue::Put { key, value } => {
                    replica_state.insert(key, value);
                }
                ReplLogValue::Del { key } => {
                    replica_state.remove(&key);
                }
            }
            applied += 1;
        }
    }

    // 3. 副本状态 == master 状态
    assert_eq!(replica_state.get(b"a".as_slice()), None);
    for key in [b"b".as_slice(), b"c".as_slice(), b"d".as_slice()] {
        assert_eq!(
            replica_state.get(key),
            store.get(key).as_ref(),
            "key {:?} diverged",
            key
        );
    }
}
