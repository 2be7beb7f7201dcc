#![doc = r#"
# spark-session-stream

## 设计动机（Why）
- **单一入口**：为上层协议客户端提供明文/TLS 双半通道连接，协议层只接触“写能力 + 三个回调”；
- **就绪关联**：输入侧“打开完成”与输出侧“可写空间”到达顺序不定，只在两者都满足的边沿通知一次就绪；
- **可控生命周期**：每个会话流拥有一条以主机/端口命名的后台线程，协作式停止，释放时保证不再回调。

## 核心契约（What）
- [`SessionStream::connect`]：立即返回，解析、建连、握手与读写都在后台线程上进行；
- [`SessionStreamDelegate`]：`on_ready` / `on_error` / `on_received`，以弱引用持有，释放时最先清除；
- [`StreamWriter`]：仅在输出通道就绪后发放，非阻塞，可能只接受部分字节；
- [`StreamReader`]：在 `on_received` 内借用，只暴露当前已到达的字节；
- [`StreamError`]：携带 `spark.session_stream.*` 稳定错误码与 [`ErrorCategory`]。

## 实现策略（How）
- 后台线程运行单线程 Tokio 运行时，`select!` 等待拆除信号、通道事件与停止节拍；
- 通道对以 `tokio-rustls` 完成可选 TLS 升级，再以 `tokio::io::split` 拆为读/写半部；
- 建连超时守卫运行在独立线程上，只读取就绪标志；
- 写能力与后台循环经有界暂存区交汇，委托槽位与写能力发布使用 `arc-swap`。

## 风险与考量（Trade-offs）
- 会话流从不重试或重连，所有失败都交给调用方决策；
- 停止请求最迟在一个停止节拍（默认 50ms）后被观察到；
- 每个会话流独占一条线程，适用于少量长连接的客户端场景。
"#]

mod channel;
mod config;
mod delegate;
mod error;
mod event;
mod event_loop;
mod readiness;
mod session;
mod timeout;
mod tls;

pub use channel::{StreamReader, StreamWriter};
pub use config::{
    DEFAULT_POLL_INTERVAL, DEFAULT_READ_CHUNK, DEFAULT_WRITE_CAPACITY, SessionStreamConfig,
};
pub use delegate::SessionStreamDelegate;
pub use error::{CHANNEL_CLOSED, ErrorCategory, RetryAdvice, SecurityClass, StreamError};
pub use readiness::ReadinessState;
pub use session::{SessionStream, StreamHandle};
pub use tls::{ClientIdentity, TlsSettings};
