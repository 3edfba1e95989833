// 有界工作线程池
//
// 职责：
// 1. 固定数量的工作线程消费任务队列
// 2. 队列有界，满载时拒绝新任务（调用方决定如何回应）
// 3. 停机时 drain 队列并等待所有线程退出

use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// 有界工作线程池
///
/// `is_full()` 仅反映队列瞬时状态，调用方用它做准入短路；
/// 真正的上限由 `schedule()` 的有界队列保证。
pub struct WorkerPool {
    name: String,
    sender: Sender<Job>,
    shutdown: Arc<AtomicBool>,
    handles: Vec<std::thread::JoinHandle<()>>,
}

impl WorkerPool {
    /// 创建并启动线程池
    pub fn new(name: &str, worker_count: usize, queue_capacity: usize) -> Self {
        let (sender, receiver) = bounded::<Job>(queue_capacity);
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut handles = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let receiver: Receiver<Job> = receiver.clone();
            let shutdown = shutdown.clone();
            let thread_name = format!("{}-{}", name, worker_id);

            let handle = std::thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || {
                    log::debug!("Worker {} started", thread_name);
                    loop {
                        match receiver.recv_timeout(std::time::Duration::from_millis(200)) {
                            Ok(job) => job(),
                            Err(crossbeam::channel::RecvTimeoutError::Timeout) => {
                                if shutdown.load(Ordering::Relaxed) {
                                    break;
                                }
                            }
                            Err(crossbeam::channel::RecvTimeoutError::Disconnected) => break,
                        }
                    }
                    log::debug!("Worker {} stopped", thread_name);
                })
                .expect("Failed to spawn worker thread");

            handles.push(handle);
        }

        Self {
            name: name.to_string(),
            sender,
            shutdown,
            handles,
        }
    }

    /// 提交任务；队列满时返回错误，任务被丢弃
    pub fn schedule<F>(&self, job: F) -> Result<(), String>
    where
        F: FnOnce() + Send + 'static,
    {
        match self.sender.try_send(Box::new(job)) {
            Ok(_) => Ok(()),
            Err(TrySendError::Full(_)) => Err(format!("worker pool {} full", self.name)),
            Err(TrySendError::Disconnected(_)) => {
                Err(format!("worker pool {} stopped", self.name))
            }
        }
    }

    /// 队列是否已满
    pub fn is_full(&self) -> bool {
        self.sender.is_full()
    }

    /// 队列中待执行的任务数
    pub fn pending(&self) -> usize {
        self.sender.len()
    }

    /// 停机（阻塞直到所有线程退出；队列中剩余任务仍会被执行）
    pub fn stop(self) {
        log::info!("Stopping worker pool {}...", self.name);
        self.shutdown.store(true, Ordering::Relaxed);
        drop(self.sender);

        for handle in self.handles {
            if let Err(e) = handle.join() {
                log::error!("Worker thread panicked: {:?}", e);
            }
        }
    }
}
