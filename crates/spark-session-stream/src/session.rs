use std::{
    fmt,
    sync::{
        Arc, OnceLock, Weak,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle, ThreadId},
};

use arc_swap::ArcSwapOption;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::{
    channel::{OutputBuffer, StreamWriter},
    config::SessionStreamConfig,
    delegate::{DelegateSlot, SessionStreamDelegate},
    error::{SPAWN, StreamError, map_io_error},
    event_loop::EventLoop,
    readiness::{Readiness, ReadinessState},
};

/// 会话流在调用方、后台循环与超时守卫之间共享的状态。
pub(crate) struct Shared {
    label: String,
    pub(crate) delegate: DelegateSlot,
    pub(crate) readiness: Readiness,
    exit_requested: AtomicBool,
    pub(crate) teardown: Notify,
    output: ArcSwapOption<OutputBuffer>,
    timer: OnceLock<ThreadId>,
}

impl Shared {
    fn new(label: String, delegate: Weak<dyn SessionStreamDelegate>) -> Self {
        Self {
            label,
            delegate: DelegateSlot::new(delegate),
            readiness: Readiness::default(),
            exit_requested: AtomicBool::new(false),
            teardown: Notify::new(),
            output: ArcSwapOption::empty(),
            timer: OnceLock::new(),
        }
    }

    pub(crate) fn label(&self) -> &str {
        &self.label
    }

    pub(crate) fn request_exit(&self) {
        self.exit_requested.store(true, Ordering::Release);
    }

    pub(crate) fn exit_requested(&self) -> bool {
        self.exit_requested.load(Ordering::Acquire)
    }

    pub(crate) fn record_timer_thread(&self, id: ThreadId) {
        let _ = self.timer.set(id);
    }

    fn is_timer_thread(&self, id: ThreadId) -> bool {
        self.timer.get() == Some(&id)
    }

    pub(crate) fn publish_output(&self, buffer: Option<Arc<OutputBuffer>>) {
        self.output.store(buffer);
    }

    /// 写能力只在输出通道存在、已就绪且尚未关闭时发放。
    fn writer(&self) -> Option<StreamWriter> {
        if !self.readiness.output_ready() {
            return None;
        }
        let buffer = self.output.load_full()?;
        if buffer.is_closed() {
            return None;
        }
        Some(StreamWriter::new(buffer))
    }

    /// 超时守卫到期时的检查：尚未完全就绪则通知一次 `ready=false`。
    pub(crate) fn connect_timeout(self: &Arc<Self>) {
        let state = self.readiness.state();
        if state.is_ready() {
            debug!(label = %self.label, "session stream ready before deadline");
            return;
        }
        warn!(label = %self.label, ?state, "session stream connect timed out");
        if let Some(delegate) = self.delegate.get() {
            let handle = StreamHandle::new(Arc::clone(self));
            delegate.on_ready(&handle, false);
        }
    }
}

/// 交给委托回调的会话流视图。
///
/// 句柄只共享状态，不拥有后台线程；释放句柄不会停止会话流。
#[derive(Clone)]
pub struct StreamHandle {
    shared: Arc<Shared>,
}

impl StreamHandle {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// 写能力；输出通道尚未就绪、不存在或已关闭时为 `None`。
    pub fn writer(&self) -> Option<StreamWriter> {
        self.shared.writer()
    }

    /// 请求后台循环退出，最迟在一个停止节拍后生效。
    pub fn stop(&self) {
        debug!(label = %self.shared.label, "session stream stop requested");
        self.shared.request_exit();
    }

    pub fn label(&self) -> &str {
        &self.shared.label
    }

    pub fn readiness(&self) -> ReadinessState {
        self.shared.readiness.state()
    }
}

impl fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHandle")
            .field("label", &self.shared.label)
            .field("readiness", &self.readiness())
            .finish()
    }
}

/// 双半通道会话流。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 为上层协议客户端提供“给定主机/端口/是否 TLS/客户端证书/超时与委托即可建连”的入口，
///   构造立即返回，建连、握手、读写全部在专属后台线程上进行；
/// - 把两个半双工通道的独立事件折叠为 `on_ready`/`on_error`/`on_received` 三个通知。
///
/// ## 逻辑（How）
/// 1. `connect` 以 [`SessionStreamConfig::queue_label`] 命名并启动后台线程；
/// 2. 后台线程启动超时守卫与单线程 Tokio 运行时；
/// 3. 在运行时上构建 TLS 连接器、打开通道并分发事件，直至收到退出请求；
/// 4. 退出后关闭通道、撤回写能力，线程结束。
///
/// ## 契约（What）
/// - [`writer`](Self::writer) 在输出通道就绪前返回 `None`；
/// - [`stop`](Self::stop) 只设置退出标志，不打断正在进行的 IO；
/// - `Drop` 先清除委托、再请求退出并唤醒循环、最后等待线程结束；循环线程退出前
///   会等待超时守卫，因此 `Drop` 返回后不会再有任何通知；
/// - 在委托回调内（后台线程或超时守卫线程上）释放会话流时不等待线程，线程随后自行退出。
///
/// ## 风险与权衡（Trade-offs）
/// - 会话流从不重连；错误与超时之后是否重建由调用方决定；
/// - 每个会话流占用一个操作系统线程，面向少量长连接的客户端场景。
pub struct SessionStream {
    handle: StreamHandle,
    worker: Option<JoinHandle<()>>,
}

impl SessionStream {
    /// 启动会话流。
    ///
    /// 仅在操作系统拒绝创建线程时返回错误；TLS 材料被拒绝、解析与建连失败
    /// 都在后台线程上发生并通过委托异步报告。
    pub fn connect(
        config: SessionStreamConfig,
        delegate: Weak<dyn SessionStreamDelegate>,
    ) -> Result<Self, StreamError> {
        let label = config.queue_label();
        let shared = Arc::new(Shared::new(label.clone(), delegate));

        let worker = EventLoop::new(Arc::clone(&shared), config)
            .spawn()
            .map_err(|err| map_io_error(SPAWN, err))?;
        info!(label = %label, "session stream spawned");

        Ok(Self {
            handle: StreamHandle::new(shared),
            worker: Some(worker),
        })
    }

    pub fn writer(&self) -> Option<StreamWriter> {
        self.handle.writer()
    }

    pub fn stop(&self) {
        self.handle.stop();
    }

    pub fn label(&self) -> &str {
        self.handle.label()
    }

    pub fn readiness(&self) -> ReadinessState {
        self.handle.readiness()
    }

    /// 后台线程是否已经结束。
    pub fn is_finished(&self) -> bool {
        self.worker.as_ref().is_none_or(JoinHandle::is_finished)
    }

    pub fn handle(&self) -> StreamHandle {
        self.handle.clone()
    }
}

impl fmt::Debug for SessionStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionStream")
            .field("handle", &self.handle)
            .field("finished", &self.is_finished())
            .finish()
    }
}

impl Drop for SessionStream {
    fn drop(&mut self) {
        let shared = &self.handle.shared;
        shared.delegate.clear();
        shared.request_exit();
        shared.teardown.notify_one();

        let Some(worker) = self.worker.take() else {
            return;
        };
        let current = thread::current().id();
        if worker.thread().id() == current || shared.is_timer_thread(current) {
            // 循环线程退出时会等待超时守卫，此处再等待循环线程会互相阻塞。
            debug!(label = %shared.label(), "session stream dropped inside a callback");
            return;
        }
        if worker.join().is_err() {
            warn!(label = %shared.label(), "session stream loop thread panicked");
        }
    }
}
