//! QAKV 存储服务器
//!
//! 集成功能：
//! 1. 多实例存储（启动时回放 binlog 恢复）
//! 2. 主从复制引擎（全量同步 + 增量推送）
//! 3. TCP 接入与命令分发
//!
//! 运行: cargo run --bin qakv-server

use qakv::replication::ReplManager;
use qakv::service::ReplServer;
use qakv::storage::KvStoreManager;
use qakv::utils::config::QakvConfig;
use std::sync::Arc;

fn print_startup_banner(config: &QakvConfig) {
    println!("\n╔═══════════════════════════════════════════════╗");
    println!("║            QAKV Server Started                ║");
    println!("╚═══════════════════════════════════════════════╝\n");

    println!("  • Listen:    {}", config.listen.bind_address());
    println!("  • Storage:   {}", config.storage.base_path);
    println!("  • Instances: {}", config.storage.instance_num);
    println!(
        "  • Pushers:   full={} incr={}",
        config.replication.full_pusher_workers, config.replication.incr_pusher_workers
    );
    println!("\n  Replication commands:");
    println!("    FULLSYNC <storeId>");
    println!("    INCRSYNC <storeId> <dstStoreId> <binlogPos>");
    println!("\n  Server is running. Press Ctrl+C to stop.\n");
}

fn main() {
    // 初始化日志
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // 1. 加载配置文件，失败时退回默认值
    let mut config = match QakvConfig::load_default() {
        Ok(cfg) => cfg,
        Err(e) => {
            log::warn!("Failed to load config file: {}, using defaults", e);
            QakvConfig::default()
        }
    };

    // 2. 命令行覆盖
    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--listen" | "-l" => {
                if i + 1 < args.len() {
                    if let Some((host, port)) = args[i + 1].rsplit_once(':') {
                        config.listen.host = host.to_string();
                        config.listen.port = port.parse().unwrap_or(config.listen.port);
                    }
                    i += 1;
                }
            }
            "--storage" | "-s" => {
                if i + 1 < args.len() {
                    config.storage.base_path = args[i + 1].clone();
                    i += 1;
                }
            }
            "--instances" | "-n" => {
                if i + 1 < args.len() {
                    config.storage.instance_num =
                        args[i + 1].parse().unwrap_or(config.storage.instance_num);
                    i += 1;
                }
            }
            _ => {}
        }
        i += 1;
    }

    log::info!("Configuration loaded");
    log::info!("  Storage path: {}", config.storage.base_path);
    log::info!("  Instances: {}", config.storage.instance_num);

    // 3. 初始化存储（含恢复）
    let stores = match KvStoreManager::new(&config.storage.base_path, config.storage.instance_num) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            log::error!("Storage init failed: {}", e);
            std::process::exit(1);
        }
    };

    // 4. 启动复制引擎
    let manager = ReplManager::new(stores, &config.replication);
    let _scheduler_handle = manager.clone().start_scheduler();

    // 5. 启动 TCP 服务
    let server = match ReplServer::bind(&config.listen.bind_address(), manager) {
        Ok(s) => s,
        Err(e) => {
            log::error!("Server bind failed: {}", e);
            std::process::exit(1);
        }
    };

    print_startup_banner(&config);

    let handle = server.start();
    if let Err(e) = handle.join() {
        log::error!("Server thread panicked: {:?}", e);
    }
}
