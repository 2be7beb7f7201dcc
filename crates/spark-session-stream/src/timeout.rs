use std::{
    io,
    sync::{
        Arc, Weak,
        mpsc::{self, RecvTimeoutError},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use tracing::debug;

use crate::session::Shared;

/// 建连超时守卫。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 解析失败时通道永远缺失，后台循环不会产生任何事件；超时守卫是此时唯一的失败信号；
/// - 守卫运行在独立线程上，不依赖后台循环是否被阻塞或运行时是否构建成功。
///
/// ## 逻辑（How）
/// - 线程以 `recv_timeout` 等待取消信号；收到信号或发送端被释放即视为取消；
/// - 到期后将弱引用升级为共享状态，调用 [`Shared::connect_timeout`]，它只读取就绪标志。
///
/// ## 契约（What）
/// - 到期检查至多执行一次；已完全就绪时检查为空操作；
/// - 释放守卫即取消，并等待守卫线程结束：正在进行的 `on_ready(false)` 返回之后，
///   后台循环才会结束；
/// - 守卫线程的标识记录在共享状态中，委托在 `on_ready(false)` 内释放会话流时据此跳过等待。
pub(crate) struct TimeoutGuard {
    cancel: Option<mpsc::Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl TimeoutGuard {
    pub(crate) fn arm(shared: &Arc<Shared>, timeout: Duration) -> io::Result<Self> {
        let (cancel, cancelled) = mpsc::channel::<()>();
        let weak: Weak<Shared> = Arc::downgrade(shared);
        let label = shared.label().to_owned();
        let worker = thread::Builder::new()
            .name(format!("{label}.timeout"))
            .spawn(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.record_timer_thread(thread::current().id());
                }
                match cancelled.recv_timeout(timeout) {
                    Err(RecvTimeoutError::Timeout) => {
                        if let Some(shared) = weak.upgrade() {
                            shared.connect_timeout();
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                        debug!(label = %label, "session stream timeout guard cancelled");
                    }
                }
            })?;
        Ok(Self {
            cancel: Some(cancel),
            worker: Some(worker),
        })
    }
}

impl Drop for TimeoutGuard {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
        if let Some(worker) = self.worker.take()
            && worker.thread().id() != thread::current().id()
        {
            let _ = worker.join();
        }
    }
}
