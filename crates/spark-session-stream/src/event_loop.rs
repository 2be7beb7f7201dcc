use std::{
    io,
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};

use tokio::{
    runtime::Builder,
    time::{self, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use crate::{
    channel::ChannelPair,
    config::SessionStreamConfig,
    event::{ChannelSide, StreamEvent},
    readiness::{EventCorrelator, Notification},
    session::{Shared, StreamHandle},
    timeout::TimeoutGuard,
};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// 会话流的后台事件循环线程。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 通道的打开、读写、事件分发与关闭都限定在同一条线程上，就绪标志因此只有一个写入者；
/// - 线程以 [`SessionStreamConfig::queue_label`](crate::SessionStreamConfig::queue_label)
///   命名，同一进程内不同主机/端口的会话流互不冲突。
///
/// ## 逻辑（How）
/// 1. 按需启动超时守卫（独立线程，不依赖运行时）；
/// 2. 构建仅启用 IO 与计时器的单线程 Tokio 运行时；
/// 3. `select!`（`biased`）依次等待拆除信号、通道对的下一个事件、停止节拍；
///    每轮检查退出标志，事件经 [`EventCorrelator`] 折叠后投递给委托；
/// 4. 退出后关闭通道对并撤回写能力，再取消并等待超时守卫。
///
/// ## 风险与权衡（Trade-offs）
/// - 运行时构建失败时线程退化为按节拍空转直至退出，会话流永远不会就绪，由超时守卫报告失败；
/// - 委托回调在本线程同步执行，耗时回调会推迟后续事件。
pub(crate) struct EventLoop {
    shared: Arc<Shared>,
    config: SessionStreamConfig,
}

impl EventLoop {
    pub(crate) fn new(shared: Arc<Shared>, config: SessionStreamConfig) -> Self {
        Self { shared, config }
    }

    pub(crate) fn spawn(self) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name(self.shared.label().to_owned())
            .spawn(move || self.run())
    }

    fn run(self) {
        let Self { shared, config } = self;
        let label = shared.label().to_owned();
        let poll_interval = config.poll_interval();
        let timeout = config.connect_timeout();

        let _guard = if timeout.is_zero() {
            None
        } else {
            match TimeoutGuard::arm(&shared, timeout) {
                Ok(guard) => Some(guard),
                Err(err) => {
                    warn!(label = %label, error = %err, "session stream timeout guard unavailable");
                    None
                }
            }
        };

        let runtime = match Builder::new_current_thread().enable_io().enable_time().build() {
            Ok(runtime) => runtime,
            Err(err) => {
                error!(label = %label, error = %err, "session stream runtime unavailable");
                idle(&shared, poll_interval);
                return;
            }
        };

        debug!(label = %label, "session stream loop started");
        runtime.block_on(drive(&shared, config, poll_interval));
        // 解析可能仍占用阻塞线程，不无限等待它。
        runtime.shutdown_timeout(SHUTDOWN_GRACE);
        info!(label = %label, "session stream loop exited");
    }
}

fn idle(shared: &Shared, poll_interval: Duration) {
    while !shared.exit_requested() {
        thread::sleep(poll_interval);
    }
}

async fn drive(shared: &Arc<Shared>, config: SessionStreamConfig, poll_interval: Duration) {
    let mut pair = ChannelPair::open(shared.label().to_owned(), config);
    let mut ticker = time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    while !shared.exit_requested() {
        let event = tokio::select! {
            biased;
            _ = shared.teardown.notified() => break,
            event = pair.next_event() => Some(event),
            _ = ticker.tick() => None,
        };
        if let Some((side, event)) = event {
            dispatch(shared, &mut pair, side, event);
        }
    }

    pair.close().await;
    shared.publish_output(None);
}

fn dispatch(shared: &Arc<Shared>, pair: &mut ChannelPair, side: ChannelSide, event: StreamEvent) {
    let label = shared.label();
    debug!(label, %side, event = event.name(), "session stream event");

    if side == ChannelSide::Output && matches!(event, StreamEvent::OpenCompleted) {
        shared.publish_output(pair.output_buffer());
    }

    let Some(notification) = EventCorrelator::new(&shared.readiness).handle(side, event) else {
        return;
    };
    let handle = StreamHandle::new(Arc::clone(shared));
    match notification {
        Notification::Ready => {
            info!(label, "session stream ready");
            if let Some(delegate) = shared.delegate.get() {
                delegate.on_ready(&handle, true);
            }
        }
        Notification::Error(err) => {
            warn!(label, %side, code = err.code(), error = %err, "session stream channel error");
            if let Some(delegate) = shared.delegate.get() {
                delegate.on_error(&handle, &err);
            }
        }
        Notification::Received => {
            let (Some(delegate), Some(mut reader)) = (shared.delegate.get(), pair.reader()) else {
                return;
            };
            delegate.on_received(&handle, &mut reader);
        }
    }
}
