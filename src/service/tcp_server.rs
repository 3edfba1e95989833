// TCP 接入与命令分发
//
// 每个连接读一条 inline 命令，然后把整个 socket 移交给对应的
// 复制入口（FULLSYNC / INCRSYNC）；之后连接的生命周期由复制
// 引擎接管（全量：供给例程结束即关闭；增量：随 MPovStatus 存活）。

use crate::network::BlockingTcpClient;
use crate::protocol::resp::parse_inline;
use crate::replication::ReplManager;
use crate::{KvError, Result};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const REPLY_TIMEOUT: Duration = Duration::from_secs(1);

/// 复制服务器
pub struct ReplServer {
    listener: TcpListener,
    manager: Arc<ReplManager>,
    shutdown: Arc<AtomicBool>,
}

impl ReplServer {
    pub fn bind(addr: &str, manager: Arc<ReplManager>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .map_err(|e| KvError::NetworkError(format!("Bind {} failed: {}", addr, e)))?;
        Ok(Self {
            listener,
            manager,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| KvError::NetworkError(format!("Local addr failed: {}", e)))
    }

    /// 停机句柄：置位后下一次 accept 返回时退出接入循环
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// 启动接入循环（独立线程）
    pub fn start(self) -> std::thread::JoinHandle<()> {
        std::thread::Builder::new()
            .name("repl-acceptor".to_string())
            .spawn(move || {
                match self.listener.local_addr() {
                    Ok(addr) => log::info!("Replication server listening at {}", addr),
                    Err(_) => log::info!("Replication server listening"),
                }

                for stream in self.listener.incoming() {
                    if self.shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                    match stream {
                        Ok(stream) => {
                            let manager = self.manager.clone();
                            let spawned = std::thread::Builder::new()
                                .name("repl-session".to_string())
                                .spawn(move || handle_connection(manager, stream));
                            if let Err(e) = spawned {
                                log::error!("Spawn session thread failed: {}", e);
                            }
                        }
                        Err(e) => log::warn!("Accept failed: {}", e),
                    }
                }

                log::info!("Replication server stopped");
            })
            .expect("Failed to spawn acceptor thread")
    }
}

/// 处理一个新连接：读一条命令并移交
fn handle_connection(manager: Arc<ReplManager>, stream: TcpStream) {
    let mut client = match BlockingTcpClient::from_stream(stream) {
        Ok(c) => c,
        Err(e) => {
            log::warn!("Wrap connection failed: {}", e);
            return;
        }
    };

    let line = match client.read_line(REQUEST_TIMEOUT) {
        Ok(l) => l,
        Err(e) => {
            log::debug!("Read request failed: {}", e);
            return;
        }
    };

    let args = parse_inline(&line);
    if args.is_empty() {
        let _ = client.write_line("-ERR empty command", REPLY_TIMEOUT);
        return;
    }

    match (args[0].to_ascii_uppercase().as_str(), args.len()) {
        ("FULLSYNC", 2) => manager.supply_full_sync(client, &args[1]),
        ("INCRSYNC", 4) => {
            manager.register_incr_sync(client, &args[1], &args[2], &args[3]);
        }
        _ => {
            log::debug!("Unknown command from {}: {}", client.remote_repr(), line);
            let _ = client.write_line("-ERR unknown command", REPLY_TIMEOUT);
        }
    }
}
