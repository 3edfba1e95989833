// 复制管理器 - MPOV 注册表 + 工作线程池 + 协作式推送调度
//
// 共享状态模型：
// - 单一互斥锁保护 push_status / first_binlog_id 两张注册表；
//   临界区只做标量快照或单条插删，任何 I/O 都在锁外
// - client_id_gen 为原子计数器，进程生命周期内唯一
// - 每个 (store_id, client_id) 同一时刻至多一个推送任务在途，
//   由 is_running 标志保证；因此 MPovStatus 里的 TCP 连接只会被
//   它唯一的执行中任务触碰，无需再加锁
//
// 淘汰即摘除：注册表里条目的消失是唯一的淘汰信号，推送任务与
// 调度 tick 都必须容忍条目不存在（视作已淘汰）。

use super::batch::master_send_binlog;
use super::full_sync::supply_full_sync_routine;
use crate::network::BlockingTcpClient;
use crate::storage::KvStoreManager;
use crate::utils::config::ReplicationConfig;
use crate::utils::workerpool::WorkerPool;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(1);
const IDLE_BACKOFF: Duration = Duration::from_secs(1);

/// 推送流状态（MPOV：master 对单个副本的视角），每副本一条
pub struct MPovStatus {
    /// 是否有推送任务已调度或执行中
    pub is_running: bool,
    /// 副本侧目标实例
    pub dst_store_id: u32,
    /// 水位：副本已应用的最大 txn_id
    pub binlog_pos: u64,
    /// 最早可再次调度的时间
    pub next_sched_time: Instant,
    /// 连接句柄；推送期间被执行中的任务临时取走（is_running 保证独占）
    pub client: Option<BlockingTcpClient>,
    pub client_id: u64,
}

/// 注册表（单锁保护）
#[derive(Default)]
struct Registry {
    /// store_id → client_id → MPovStatus
    push_status: HashMap<u32, HashMap<u64, MPovStatus>>,
    /// store_id → 保留下限（存储侧的只读镜像）
    first_binlog_id: HashMap<u32, u64>,
}

/// 复制统计
#[derive(Debug, Default)]
pub struct ReplStats {
    pub batches_shipped: AtomicU64,
    pub entries_shipped: AtomicU64,
    pub full_syncs_served: AtomicU64,
    pub clients_evicted: AtomicU64,
}

/// 复制管理器
pub struct ReplManager {
    stores: Arc<KvStoreManager>,
    registry: Mutex<Registry>,
    client_id_gen: AtomicU64,

    /// 全量同步线程池（长任务，量小）
    full_pusher: WorkerPool,
    /// 增量推送线程池（短任务，量大）
    incr_pusher: WorkerPool,

    stats: ReplStats,
    sched_interval: Duration,
    shutdown: AtomicBool,
}

impl ReplManager {
    pub fn new(stores: Arc<KvStoreManager>, config: &ReplicationConfig) -> Arc<Self> {
        let full_pusher = WorkerPool::new(
            "full-pusher",
            config.full_pusher_workers,
            config.full_pusher_queue,
        );
        let incr_pusher = WorkerPool::new(
            "incr-pusher",
            config.incr_pusher_workers,
            config.incr_pusher_queue,
        );

        let manager = Arc::new(Self {
            stores,
            registry: Mutex::new(Registry::default()),
            client_id_gen: AtomicU64::new(0),
            full_pusher,
            incr_pusher,
            stats: ReplStats::default(),
            sched_interval: Duration::from_millis(config.sched_interval_ms),
            shutdown: AtomicBool::new(false),
        });

        manager.refresh_first_binlog_ids();
        manager
    }

    pub fn stores(&self) -> &Arc<KvStoreManager> {
        &self.stores
    }

    pub fn stats(&self) -> &ReplStats {
        &self.stats
    }

    /// 全量同步池是否满载（准入短路用；结果天然有竞态，池本身才是权威上限）
    pub fn is_full_supplier_full(&self) -> bool {
        self.full_pusher.is_full()
    }

    // ------------------------------------------------------------------
    // 入口：FULLSYNC
    // ------------------------------------------------------------------

    /// 接管一个 FULLSYNC 连接：准入检查后投给 full_pusher
    pub fn supply_full_sync(self: Arc<Self>, mut client: BlockingTcpClient, store_id_arg: &str) {
        // 这个判断不精确：通过之后、投递之前池仍可能被塞满，
        // 这里只短路常见的过载情形
        if self.is_full_supplier_full() {
            let _ = client.write_line("-ERR workerpool full", HANDSHAKE_TIMEOUT);
            return;
        }

        let store_id: u32 = match store_id_arg.parse() {
            Ok(id) => id,
            Err(_) => {
                let _ = client.write_line("-ERR invalid storeId", HANDSHAKE_TIMEOUT);
                return;
            }
        };
        if store_id >= self.stores.instance_num() {
            let _ = client.write_line("-ERR invalid storeId", HANDSHAKE_TIMEOUT);
            return;
        }

        let manager = self.clone();
        let scheduled = self.full_pusher.schedule(move || {
            supply_full_sync_routine(&manager.stores, client, store_id);
            manager.stats.full_syncs_served.fetch_add(1, Ordering::Relaxed);
        });
        if let Err(e) = scheduled {
            // 竞态下投递失败：连接随任务一起丢弃，副本收到断连后重试
            log::warn!("Schedule full sync for store {} failed: {}", store_id, e);
        }
    }

    // ------------------------------------------------------------------
    // 入口：INCRSYNC 握手 + 注册
    // ------------------------------------------------------------------

    //  1) s->m INCRSYNC <storeId> <dstStoreId> <binlogPos>
    //  2) m->s +OK
    //  3) s->m +PONG
    //  4) m->s 周期推送 binlog 批次
    pub fn register_incr_sync(
        &self,
        mut client: BlockingTcpClient,
        store_id_arg: &str,
        dst_store_id_arg: &str,
        binlog_pos_arg: &str,
    ) {
        let parsed = (|| -> Result<(u64, u64, u64), String> {
            let store_id = store_id_arg
                .parse::<u64>()
                .map_err(|e| e.to_string())?;
            let dst_store_id = dst_store_id_arg
                .parse::<u64>()
                .map_err(|e| e.to_string())?;
            let binlog_pos = binlog_pos_arg
                .parse::<u64>()
                .map_err(|e| e.to_string())?;
            Ok((store_id, dst_store_id, binlog_pos))
        })();

        let (store_id, dst_store_id, binlog_pos) = match parsed {
            Ok(v) => v,
            Err(e) => {
                let _ = client.write_line(
                    &format!("-ERR parse opts failed:{}", e),
                    HANDSHAKE_TIMEOUT,
                );
                return;
            }
        };

        let instance_num = self.stores.instance_num() as u64;
        if store_id >= instance_num || dst_store_id >= instance_num {
            let _ = client.write_line("-ERR invalid storeId", HANDSHAKE_TIMEOUT);
            return;
        }
        let store_id = store_id as u32;
        let dst_store_id = dst_store_id as u32;

        let first_pos = {
            let registry = self.registry.lock();
            registry
                .first_binlog_id
                .get(&store_id)
                .copied()
                .unwrap_or(0)
        };

        // 这个检查不精确（与 push_status 的修改不在同一临界区），
        // 但不损害正确性；插入前还会在锁内复查一次
        if first_pos > binlog_pos {
            let _ = client.write_line("-ERR invalid binlogPos", HANDSHAKE_TIMEOUT);
            return;
        }

        if let Err(e) = client.write_line("+OK", HANDSHAKE_TIMEOUT) {
            log::warn!("Slave incrsync handshake write failed: {}", e);
            return;
        }
        match client.read_line(HANDSHAKE_TIMEOUT) {
            Ok(pong) if pong == "+PONG" => {}
            Ok(other) => {
                log::warn!("Slave incrsync handshake not +PONG: {}", other);
                return;
            }
            Err(e) => {
                log::warn!("Slave incrsync handshake failed: {}", e);
                return;
            }
        }

        let remote = client.remote_repr();
        let registered = {
            let mut registry = self.registry.lock();
            // 保留下限可能已前移：最终裁决在锁内
            if registry.first_binlog_id.get(&store_id).copied().unwrap_or(0) > binlog_pos {
                false
            } else {
                let client_id = self.client_id_gen.fetch_add(1, Ordering::SeqCst);
                registry.push_status.entry(store_id).or_default().insert(
                    client_id,
                    MPovStatus {
                        is_running: false,
                        dst_store_id,
                        binlog_pos,
                        next_sched_time: Instant::now(),
                        client: Some(client),
                        client_id,
                    },
                );
                true
            }
        };

        log::info!(
            "slave:{} register_incr_sync {}",
            remote,
            if registered { "ok" } else { "failed" }
        );
    }

    // ------------------------------------------------------------------
    // 推送调度
    // ------------------------------------------------------------------

    /// 启动调度线程：周期检视注册表，把到期且未在途的条目投给 incr_pusher
    pub fn start_scheduler(self: Arc<Self>) -> std::thread::JoinHandle<()> {
        std::thread::Builder::new()
            .name("repl-scheduler".to_string())
            .spawn(move || {
                log::info!("Replication scheduler started");
                while !self.shutdown.load(Ordering::Relaxed) {
                    self.refresh_first_binlog_ids();
                    Self::schedule_due_pushes(&self);
                    std::thread::sleep(self.sched_interval);
                }
                log::info!("Replication scheduler stopped");
            })
            .expect("Failed to spawn scheduler thread")
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// 把存储侧的保留下限镜像进注册表
    pub fn refresh_first_binlog_ids(&self) {
        let mut floors = Vec::with_capacity(self.stores.instance_num() as usize);
        for store_id in 0..self.stores.instance_num() {
            if let Some(store) = self.stores.get(store_id) {
                floors.push((store_id, store.first_binlog_id()));
            }
        }

        let mut registry = self.registry.lock();
        for (store_id, floor) in floors {
            registry.first_binlog_id.insert(store_id, floor);
        }
    }

    /// 单次调度：到期条目翻转 is_running 后投递，一次到期恰好投递一次
    fn schedule_due_pushes(manager: &Arc<Self>) {
        let now = Instant::now();
        let due: Vec<(u32, u64)> = {
            let mut registry = manager.registry.lock();
            let mut due = Vec::new();
            for (store_id, clients) in registry.push_status.iter_mut() {
                for (client_id, status) in clients.iter_mut() {
                    if !status.is_running && now >= status.next_sched_time {
                        status.is_running = true;
                        due.push((*store_id, *client_id));
                    }
                }
            }
            due
        };

        for (store_id, client_id) in due {
            let job_manager = manager.clone();
            let scheduled = manager
                .incr_pusher
                .schedule(move || job_manager.master_push_routine(store_id, client_id));

            if let Err(e) = scheduled {
                log::warn!(
                    "Schedule push for store {} client {} failed: {}",
                    store_id,
                    client_id,
                    e
                );
                // 投递失败要把翻转回滚，否则该条目永远不会再被调度
                let mut registry = manager.registry.lock();
                if let Some(status) = registry
                    .push_status
                    .get_mut(&store_id)
                    .and_then(|m| m.get_mut(&client_id))
                {
                    status.is_running = false;
                    status.next_sched_time = Instant::now() + IDLE_BACKOFF;
                }
            }
        }
    }

    /// 单次推送例程（运行在 incr_pusher 线程池上）
    pub fn master_push_routine(self: Arc<Self>, store_id: u32, client_id: u64) {
        let mut cleanup = PushCleanup {
            manager: self.as_ref(),
            store_id,
            client_id,
            next_sched: Instant::now(),
        };

        let (binlog_pos, mut client, dst_store_id) = {
            let mut registry = self.registry.lock();
            match registry
                .push_status
                .get_mut(&store_id)
                .and_then(|m| m.get_mut(&client_id))
            {
                None => {
                    // 调度 tick 与淘汰赛跑：条目已不在
                    cleanup.next_sched = Instant::now() + IDLE_BACKOFF;
                    return;
                }
                Some(status) => {
                    let client = status
                        .client
                        .take()
                        .expect("push job found no owned client");
                    (status.binlog_pos, client, status.dst_store_id)
                }
            }
        };

        let store = match self.stores.get(store_id) {
            Some(s) => s,
            None => {
                log::error!("Push routine: store {} missing", store_id);
                self.evict(store_id, client_id);
                return;
            }
        };

        match master_send_binlog(&mut client, &store, store_id, dst_store_id, binlog_pos) {
            Err(e) => {
                log::warn!(
                    "Master send binlog to client:{} failed: {}",
                    client.remote_repr(),
                    e
                );
                // 摘除条目即淘汰；连接随本作用域释放
                self.evict(store_id, client_id);
            }
            Ok((new_pos, count)) => {
                let mut registry = self.registry.lock();
                match registry
                    .push_status
                    .get_mut(&store_id)
                    .and_then(|m| m.get_mut(&client_id))
                {
                    Some(status) => {
                        status.client = Some(client);
                        status.binlog_pos = new_pos;
                        // 有进展说明多半还有积压，立刻再来；否则退避
                        cleanup.next_sched = if new_pos > binlog_pos {
                            Instant::now()
                        } else {
                            Instant::now() + IDLE_BACKOFF
                        };
                    }
                    None => {
                        // 推送期间被外部摘除：连接随本作用域释放
                    }
                }
                drop(registry);

                if new_pos > binlog_pos {
                    self.stats.batches_shipped.fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .entries_shipped
                        .fetch_add(count as u64, Ordering::Relaxed);
                }
            }
        }
    }

    fn evict(&self, store_id: u32, client_id: u64) {
        let mut registry = self.registry.lock();
        let removed = registry
            .push_status
            .get_mut(&store_id)
            .and_then(|m| m.remove(&client_id));
        drop(registry);

        if removed.is_some() {
            self.stats.clients_evicted.fetch_add(1, Ordering::Relaxed);
        }
    }

    // ------------------------------------------------------------------
    // 观测
    // ------------------------------------------------------------------

    /// 某实例当前挂接的副本数
    pub fn client_count(&self, store_id: u32) -> usize {
        self.registry
            .lock()
            .push_status
            .get(&store_id)
            .map(|m| m.len())
            .unwrap_or(0)
    }

    /// 某实例全部推送流的 (client_id, binlog_pos, is_running) 快照
    pub fn push_status_snapshot(&self, store_id: u32) -> Vec<(u64, u64, bool)> {
        self.registry
            .lock()
            .push_status
            .get(&store_id)
            .map(|m| {
                m.values()
                    .map(|s| (s.client_id, s.binlog_pos, s.is_running))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// 注册表里的保留下限镜像
    pub fn first_binlog_id(&self, store_id: u32) -> u64 {
        self.registry
            .lock()
            .first_binlog_id
            .get(&store_id)
            .copied()
            .unwrap_or(0)
    }
}

/// 推送例程的作用域清理：任何退出路径都复位 is_running 并记录下次调度时间
struct PushCleanup<'a> {
    manager: &'a ReplManager,
    store_id: u32,
    client_id: u64,
    next_sched: Instant,
}

impl Drop for PushCleanup<'_> {
    fn drop(&mut self) {
        let mut registry = self.manager.registry.lock();
        if let Some(status) = registry
            .push_status
            .get_mut(&self.store_id)
            .and_then(|m| m.get_mut(&self.client_id))
        {
            assert!(status.is_running, "push cleanup found job not running");
            status.is_running = false;
            status.next_sched_time = self.next_sched;
        }
        // 条目不在：已被淘汰，清理无事可做
    }
}
