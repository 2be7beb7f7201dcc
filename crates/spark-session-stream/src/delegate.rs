use std::sync::{Arc, Weak};

use arc_swap::ArcSwapOption;

use crate::{
    channel::StreamReader,
    error::StreamError,
    session::StreamHandle,
};

/// 会话流的消费者契约。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 会话流只负责字节与事件，报文编解码、重连策略都留给上层协议客户端；
///   三个回调就是两者之间唯一的交互面。
///
/// ## 契约（What）
/// - `on_ready(true)` 在同一连接尝试内至多一次，发生在输入/输出都就绪的那一刻；
///   `on_ready(false)` 至多一次，由建连超时守卫发出；
/// - `on_error` 对每一次通道错误（含携带错误的流结束）调用一次，会话流不会因此自行停止；
/// - `on_received` 每当输入通道有新字节时调用，`reader` 只暴露当前已缓冲的字节；
/// - `on_ready(true)`/`on_error`/`on_received` 在后台循环线程上调用，`on_ready(false)` 在超时守卫线程上调用，
///   回调必须快速返回且不得阻塞。
///
/// ## 风险与权衡（Trade-offs）
/// - 回调内调用 `stream.stop()` 是安全的；在回调内释放最后一个 [`SessionStream`](crate::SessionStream)
///   同样安全，此时后台线程不会等待自身结束。
pub trait SessionStreamDelegate: Send + Sync {
    fn on_ready(&self, stream: &StreamHandle, ready: bool);

    fn on_error(&self, stream: &StreamHandle, error: &StreamError);

    fn on_received(&self, stream: &StreamHandle, reader: &mut StreamReader<'_>);
}

/// 委托弱引用槽位。
///
/// 会话流从不延长委托的生命周期；拆除时先 `clear`，此后任何线程都取不到委托。
pub(crate) struct DelegateSlot {
    inner: ArcSwapOption<Weak<dyn SessionStreamDelegate>>,
}

impl DelegateSlot {
    pub(crate) fn new(delegate: Weak<dyn SessionStreamDelegate>) -> Self {
        Self {
            inner: ArcSwapOption::from_pointee(delegate),
        }
    }

    /// 取得仍然存活的委托；已清除或已释放时返回 `None`。
    pub(crate) fn get(&self) -> Option<Arc<dyn SessionStreamDelegate>> {
        self.inner.load_full().and_then(|weak| weak.upgrade())
    }

    pub(crate) fn clear(&self) {
        self.inner.store(None);
    }

    pub(crate) fn is_attached(&self) -> bool {
        self.inner.load().is_some()
    }
}

impl std::fmt::Debug for DelegateSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelegateSlot")
            .field("attached", &self.is_attached())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Silent;

    impl SessionStreamDelegate for Silent {
        fn on_ready(&self, _: &StreamHandle, _: bool) {}
        fn on_error(&self, _: &StreamHandle, _: &StreamError) {}
        fn on_received(&self, _: &StreamHandle, _: &mut StreamReader<'_>) {}
    }

    #[test]
    fn slot_never_keeps_the_delegate_alive() {
        let delegate: Arc<dyn SessionStreamDelegate> = Arc::new(Silent);
        let slot = DelegateSlot::new(Arc::downgrade(&delegate));
        assert!(slot.get().is_some());
        drop(delegate);
        assert!(slot.get().is_none());
        assert!(slot.is_attached());
    }

    #[test]
    fn cleared_slot_yields_nothing() {
        let delegate: Arc<dyn SessionStreamDelegate> = Arc::new(Silent);
        let slot = DelegateSlot::new(Arc::downgrade(&delegate));
        slot.clear();
        assert!(slot.get().is_none());
        assert!(!slot.is_attached());
    }
}
