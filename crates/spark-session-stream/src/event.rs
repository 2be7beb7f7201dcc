use std::fmt;

use crate::error::StreamError;

/// 事件来源：会话流的两个半双工通道之一。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) enum ChannelSide {
    Input,
    Output,
}

impl ChannelSide {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            ChannelSide::Input => "input",
            ChannelSide::Output => "output",
        }
    }
}

impl fmt::Display for ChannelSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 通道在后台循环上产生的底层事件。
///
/// - `OpenCompleted`：通道打开完成（TCP 建连与可选 TLS 握手均已结束）；
/// - `HasBytesAvailable`：输入通道缓冲区中有新到达的字节；
/// - `HasSpaceAvailable`：输出通道可以接受数据；
/// - `ErrorOccurred`：传输层报告错误；
/// - `EndEncountered`：流结束，若伴随错误则携带之。
#[derive(Clone, Debug)]
pub(crate) enum StreamEvent {
    OpenCompleted,
    HasBytesAvailable,
    HasSpaceAvailable,
    ErrorOccurred(StreamError),
    EndEncountered(Option<StreamError>),
}

impl StreamEvent {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            StreamEvent::OpenCompleted => "open_completed",
            StreamEvent::HasBytesAvailable => "has_bytes_available",
            StreamEvent::HasSpaceAvailable => "has_space_available",
            StreamEvent::ErrorOccurred(_) => "error_occurred",
            StreamEvent::EndEncountered(_) => "end_encountered",
        }
    }
}
