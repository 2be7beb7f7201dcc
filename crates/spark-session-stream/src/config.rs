use std::{io, time::Duration};

use socket2::SockRef;
use tokio::net::TcpStream;

use crate::tls::TlsSettings;

/// 后台循环观察停止标志的默认节拍。
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);
/// 输出通道默认可暂存的字节数。
pub const DEFAULT_WRITE_CAPACITY: usize = 64 * 1024;
/// 输入通道每次读取预留的字节数。
pub const DEFAULT_READ_CHUNK: usize = 8 * 1024;

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// 会话流的构造参数。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 把“目标主机、端口、是否 TLS、客户端证书、建连超时”这组构造参数收敛为值对象，
///   与 TCP 传输层的 `TcpSocketConfig` 一样以 `with_*` 方法显式声明；
/// - 额外暴露停止节拍、写缓冲容量、读块大小与套接字选项，供上层协议按负载调优。
///
/// ## 契约（What）
/// - `connect_timeout` 为 `Duration::ZERO` 时不启用超时守卫；
/// - `poll_interval` 最小 1ms，`write_capacity`/`read_chunk` 最小为 1；
/// - `tls` 为 `Some` 即表示 TLS 建连；
/// - [`queue_label`](Self::queue_label) 为后台线程名与日志 `label` 字段。
///
/// ## 注意事项（Trade-offs）
/// - `linger` 经 `socket2::SockRef::set_linger` 落地，Linux 上精度为秒；
/// - `write_capacity` 过小会让写能力频繁返回短写，需要上层循环补写。
#[derive(Clone, Debug)]
pub struct SessionStreamConfig {
    host: String,
    port: u16,
    tls: Option<TlsSettings>,
    connect_timeout: Duration,
    poll_interval: Duration,
    write_capacity: usize,
    read_chunk: usize,
    nodelay: bool,
    linger: Option<Duration>,
}

impl SessionStreamConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            tls: None,
            connect_timeout: Duration::ZERO,
            poll_interval: DEFAULT_POLL_INTERVAL,
            write_capacity: DEFAULT_WRITE_CAPACITY,
            read_chunk: DEFAULT_READ_CHUNK,
            nodelay: true,
            linger: None,
        }
    }

    /// 以 TLS 建连。
    pub fn with_tls(mut self, tls: TlsSettings) -> Self {
        self.tls = Some(tls);
        self
    }

    /// 设置建连超时；`Duration::ZERO` 关闭超时守卫。
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(MIN_POLL_INTERVAL);
        self
    }

    pub fn with_write_capacity(mut self, capacity: usize) -> Self {
        self.write_capacity = capacity.max(1);
        self
    }

    pub fn with_read_chunk(mut self, chunk: usize) -> Self {
        self.read_chunk = chunk.max(1);
        self
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    /// 设置 `SO_LINGER` 超时时长。
    pub fn with_linger(mut self, linger: Option<Duration>) -> Self {
        self.linger = linger;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn tls(&self) -> Option<&TlsSettings> {
        self.tls.as_ref()
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn write_capacity(&self) -> usize {
        self.write_capacity
    }

    pub fn read_chunk(&self) -> usize {
        self.read_chunk
    }

    pub fn nodelay(&self) -> bool {
        self.nodelay
    }

    pub fn linger(&self) -> Option<Duration> {
        self.linger
    }

    /// 后台线程标签：主机名分段倒序拼接，再追加 `.stream<port>`。
    ///
    /// 例如 `broker.example.com:8883` 得到 `com.example.broker.stream8883`。
    pub fn queue_label(&self) -> String {
        let mut label = self.host.rsplit('.').collect::<Vec<_>>().join(".");
        label.push_str(".stream");
        label.push_str(&self.port.to_string());
        label
    }

    pub(crate) fn apply_socket_options(&self, stream: &TcpStream) -> io::Result<()> {
        stream.set_nodelay(self.nodelay)?;
        SockRef::from(stream).set_linger(self.linger)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_reverses_host_components() {
        let config = SessionStreamConfig::new("broker.example.com", 8883);
        assert_eq!(config.queue_label(), "com.example.broker.stream8883");
        assert_eq!(
            SessionStreamConfig::new("localhost", 1883).queue_label(),
            "localhost.stream1883"
        );
    }

    #[test]
    fn defaults_disable_timeout_and_tls() {
        let config = SessionStreamConfig::new("localhost", 1883);
        assert!(config.connect_timeout().is_zero());
        assert!(!config.is_tls());
        assert_eq!(config.poll_interval(), DEFAULT_POLL_INTERVAL);
        assert_eq!(config.write_capacity(), DEFAULT_WRITE_CAPACITY);
        assert!(config.nodelay());
        assert_eq!(config.linger(), None);
    }

    #[test]
    fn degenerate_values_are_clamped() {
        let config = SessionStreamConfig::new("localhost", 1883)
            .with_poll_interval(Duration::ZERO)
            .with_write_capacity(0)
            .with_read_chunk(0);
        assert_eq!(config.poll_interval(), MIN_POLL_INTERVAL);
        assert_eq!(config.write_capacity(), 1);
        assert_eq!(config.read_chunk(), 1);
    }
}
