use std::{borrow::Cow, io, sync::Arc, time::Duration};

use rustls::{AlertDescription, Error as RustlsError};
use thiserror::Error;

/// 会话流错误映射模块。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 将 IO 与 `rustls` 层的错误统一为携带稳定错误码的 [`StreamError`]，委托方无需解析底层库细节
///   即可判断“重试 / 安全告警 / 放弃”；
/// - 会话流本身从不重试，分类信息只是交给上层重连策略的输入。
///
/// ## 逻辑（How）
/// - [`OperationKind`] 描述一类操作（解析/建连/握手/读写/刷新）的错误码与默认文案；
/// - `map_io_error`/`map_stream_error` 根据 `io::Error`（可能嵌套 `rustls::Error`）推导 [`ErrorCategory`]；
/// - `alert_to_category` 对 TLS Alert 做进一步细化。
///
/// ## 契约（What）
/// - 所有映射函数返回的 [`StreamError`] 均携带 `spark.session_stream.*` 前缀的稳定错误码；
/// - [`StreamError`] 可克隆，底层 `io::Error` 以 `Arc` 共享，便于同一错误同时记录日志与通知委托。
///
/// ## 风险与权衡（Trade-offs）
/// - 未穷举的 Alert 与 `rustls` 错误默认视为可重试，避免误报安全事件。
#[derive(Clone, Copy, Debug)]
pub(crate) struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

pub(crate) const RESOLVE: OperationKind = OperationKind {
    code: "spark.session_stream.resolve_failed",
    message: "session stream resolve",
};
pub(crate) const CONNECT: OperationKind = OperationKind {
    code: "spark.session_stream.connect_failed",
    message: "session stream connect",
};
pub(crate) const CONFIGURE: OperationKind = OperationKind {
    code: "spark.session_stream.configure_failed",
    message: "session stream configure",
};
pub(crate) const HANDSHAKE: OperationKind = OperationKind {
    code: "spark.session_stream.handshake_failed",
    message: "session stream tls handshake",
};
pub(crate) const READ: OperationKind = OperationKind {
    code: "spark.session_stream.read_failed",
    message: "session stream read",
};
pub(crate) const WRITE: OperationKind = OperationKind {
    code: "spark.session_stream.write_failed",
    message: "session stream write",
};
pub(crate) const FLUSH: OperationKind = OperationKind {
    code: "spark.session_stream.flush_failed",
    message: "session stream flush",
};
pub(crate) const SPAWN: OperationKind = OperationKind {
    code: "spark.session_stream.spawn_failed",
    message: "session stream spawn",
};

/// 通道已关闭时读写能力返回的错误码。
pub const CHANNEL_CLOSED: &str = "spark.session_stream.channel_closed";

/// 退避建议，仅描述“多久之后值得再试”。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryAdvice {
    wait: Duration,
}

impl RetryAdvice {
    pub const fn after(wait: Duration) -> Self {
        Self { wait }
    }

    pub fn wait(&self) -> Duration {
        self.wait
    }
}

/// 安全类错误的细分。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum SecurityClass {
    Authentication,
    Authorization,
    Integrity,
    Unknown,
}

/// 错误分类，供上层重连策略决策。
///
/// - `Retryable`：瞬时故障，附带退避建议；
/// - `Security`：证书或握手违规，通常不应盲目重连；
/// - `Closed`：通道已经关闭，读写能力不再可用。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorCategory {
    Retryable(RetryAdvice),
    NonRetryable,
    Security(SecurityClass),
    Timeout,
    Closed,
}

/// 会话流对外暴露的唯一错误类型。
///
/// # 契约说明（What）
/// - `code`：稳定错误码，形如 `spark.session_stream.<reason>`；
/// - `message`：面向排障人员的描述，包含底层错误文本；
/// - `category`：结构化分类，默认 [`ErrorCategory::NonRetryable`]；
/// - `source()`：若由 IO/TLS 故障产生，返回共享的底层 `io::Error`。
#[derive(Clone, Debug, Error)]
#[error("[{code}] {message}")]
pub struct StreamError {
    code: &'static str,
    message: Cow<'static, str>,
    category: ErrorCategory,
    #[source]
    cause: Option<Arc<io::Error>>,
}

impl StreamError {
    pub fn new(code: &'static str, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code,
            message: message.into(),
            category: ErrorCategory::NonRetryable,
            cause: None,
        }
    }

    pub fn with_category(mut self, category: ErrorCategory) -> Self {
        self.category = category;
        self
    }

    pub fn with_cause(mut self, cause: io::Error) -> Self {
        self.cause = Some(Arc::new(cause));
        self
    }

    /// 获取稳定错误码。
    pub fn code(&self) -> &'static str {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn category(&self) -> ErrorCategory {
        self.category
    }

    /// 底层 IO 错误的种类；非 IO 来源的错误返回 `None`。
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        self.cause.as_ref().map(|cause| cause.kind())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.category, ErrorCategory::Retryable(_))
    }
}

/// 将 IO 错误映射为会话流错误，并附带错误分类。
pub(crate) fn map_io_error(kind: OperationKind, error: io::Error) -> StreamError {
    let category = categorize_io_error(&error);
    StreamError::new(
        kind.code,
        Cow::Owned(format!("{}: {}", kind.message, error)),
    )
    .with_category(category)
    .with_cause(error)
}

/// 将可能嵌套 `rustls::Error` 的 IO 错误映射为会话流错误。
pub(crate) fn map_stream_error(kind: OperationKind, error: io::Error) -> StreamError {
    let category = categorize_with_rustls(&error);
    StreamError::new(
        kind.code,
        Cow::Owned(format!("{}: {}", kind.message, error)),
    )
    .with_category(category)
    .with_cause(error)
}

/// 构造 TLS 配置阶段（证书、SNI）的错误。
pub(crate) fn configure_error(detail: impl std::fmt::Display) -> StreamError {
    StreamError::new(
        CONFIGURE.code,
        Cow::Owned(format!("{}: {}", CONFIGURE.message, detail)),
    )
    .with_category(ErrorCategory::NonRetryable)
}

/// 读写能力在通道关闭后返回的错误。
pub(crate) fn closed_error(side: &'static str) -> StreamError {
    StreamError::new(CHANNEL_CLOSED, format!("{side} channel closed"))
        .with_category(ErrorCategory::Closed)
}

fn categorize_with_rustls(error: &io::Error) -> ErrorCategory {
    if let Some(source) = error.get_ref()
        && let Some(rustls_error) = source.downcast_ref::<RustlsError>()
    {
        return categorize_rustls_error(rustls_error);
    }
    categorize_io_error(error)
}

fn categorize_rustls_error(error: &RustlsError) -> ErrorCategory {
    use RustlsError::*;
    match error {
        InappropriateMessage { .. }
        | InappropriateHandshakeMessage { .. }
        | InvalidMessage(_)
        | PeerMisbehaved(_)
        | DecryptError
        | EncryptError
        | PeerSentOversizedRecord => ErrorCategory::Security(SecurityClass::Integrity),
        NoCertificatesPresented | InvalidCertificate(_) | UnsupportedNameType => {
            ErrorCategory::Security(SecurityClass::Authentication)
        }
        AlertReceived(alert) => alert_to_category(alert),
        NoApplicationProtocol => ErrorCategory::Security(SecurityClass::Unknown),
        PeerIncompatible(_) | HandshakeNotComplete | General(_) => {
            retryable(Duration::from_millis(80))
        }
        _ => retryable(Duration::from_millis(60)),
    }
}

fn alert_to_category(alert: &AlertDescription) -> ErrorCategory {
    use AlertDescription::*;
    match alert {
        BadCertificate
        | UnsupportedCertificate
        | CertificateRevoked
        | CertificateExpired
        | CertificateUnknown
        | UnknownCA
        | NoCertificate
        | CertificateRequired => ErrorCategory::Security(SecurityClass::Authentication),
        AccessDenied => ErrorCategory::Security(SecurityClass::Authorization),
        CloseNotify | UserCanceled => retryable(Duration::from_millis(30)),
        DecodeError
        | DecryptError
        | HandshakeFailure
        | IllegalParameter
        | RecordOverflow
        | BadRecordMac
        | UnexpectedMessage
        | InsufficientSecurity
        | InternalError
        | ProtocolVersion => ErrorCategory::Security(SecurityClass::Integrity),
        _ => retryable(Duration::from_millis(40)),
    }
}

fn categorize_io_error(error: &io::Error) -> ErrorCategory {
    use io::ErrorKind;
    match error.kind() {
        ErrorKind::TimedOut => ErrorCategory::Timeout,
        ErrorKind::WouldBlock | ErrorKind::Interrupted => retryable(Duration::from_millis(5)),
        ErrorKind::ConnectionRefused
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::NotConnected
        | ErrorKind::AddrNotAvailable
        | ErrorKind::BrokenPipe
        | ErrorKind::UnexpectedEof => retryable(Duration::from_millis(50)),
        ErrorKind::WriteZero => retryable(Duration::from_millis(10)),
        _ => ErrorCategory::NonRetryable,
    }
}

fn retryable(wait: Duration) -> ErrorCategory {
    ErrorCategory::Retryable(RetryAdvice::after(wait))
}
