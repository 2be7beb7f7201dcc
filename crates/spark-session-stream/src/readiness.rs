use std::sync::atomic::{AtomicBool, Ordering};

use crate::{
    error::StreamError,
    event::{ChannelSide, StreamEvent},
};

/// 会话流就绪状态快照。
///
/// 两个标志各自单调地由 `false` 变为 `true`，因此状态只会沿
/// `Idle → {InputReady | OutputReady} → BothReady` 前进。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadinessState {
    Idle,
    InputReady,
    OutputReady,
    BothReady,
}

impl ReadinessState {
    pub fn is_ready(self) -> bool {
        self == ReadinessState::BothReady
    }
}

/// 输入/输出就绪标志。
///
/// 写入方只有后台循环；超时守卫与写能力只读。
#[derive(Debug, Default)]
pub(crate) struct Readiness {
    input: AtomicBool,
    output: AtomicBool,
}

impl Readiness {
    pub(crate) fn input_ready(&self) -> bool {
        self.input.load(Ordering::Acquire)
    }

    pub(crate) fn output_ready(&self) -> bool {
        self.output.load(Ordering::Acquire)
    }

    pub(crate) fn state(&self) -> ReadinessState {
        match (self.input_ready(), self.output_ready()) {
            (false, false) => ReadinessState::Idle,
            (true, false) => ReadinessState::InputReady,
            (false, true) => ReadinessState::OutputReady,
            (true, true) => ReadinessState::BothReady,
        }
    }

    /// 置位一侧标志，仅当本次置位使状态进入 `BothReady` 时返回 `true`。
    fn mark(&self, side: ChannelSide) -> bool {
        let was_ready = self.state().is_ready();
        match side {
            ChannelSide::Input => self.input.store(true, Ordering::Release),
            ChannelSide::Output => self.output.store(true, Ordering::Release),
        }
        !was_ready && self.state().is_ready()
    }
}

/// 关联器处理一个事件后需要投递给委托的通知。
#[derive(Debug)]
pub(crate) enum Notification {
    Ready,
    Error(StreamError),
    Received,
}

/// 就绪关联器：把两个通道的独立事件折叠成一个状态机。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 输入侧以“打开完成”、输出侧以“可写空间”宣告就绪，二者到达顺序不定；
///   委托只应在两者都满足的那一刻收到一次 `ready=true`。
///
/// ## 逻辑（How）
/// - 事件按到达顺序逐个处理，就绪标志的置位在后台循环上单线程完成；
/// - 每次置位前后比较 `BothReady`，只有边沿（后到的那一侧）返回 [`Notification::Ready`]；
/// - 错误与携带错误的流结束原样转交，不影响就绪标志；
/// - 来源不匹配的事件（如输出侧的“有字节可读”）以及其他事件一律忽略。
///
/// ## 契约（What）
/// - 同一次连接尝试内 `Ready` 至多出现一次，且只在两类就绪事件都至少出现一次之后；
/// - `Received` 只由输入侧的 `HasBytesAvailable` 产生。
pub(crate) struct EventCorrelator<'a> {
    readiness: &'a Readiness,
}

impl<'a> EventCorrelator<'a> {
    pub(crate) fn new(readiness: &'a Readiness) -> Self {
        Self { readiness }
    }

    pub(crate) fn handle(&self, side: ChannelSide, event: StreamEvent) -> Option<Notification> {
        match (side, event) {
            (ChannelSide::Input, StreamEvent::OpenCompleted) => self.edge(ChannelSide::Input),
            // 输出侧的就绪以可写空间为准，打开完成仅供参考。
            (ChannelSide::Output, StreamEvent::OpenCompleted) => None,
            (ChannelSide::Input, StreamEvent::HasBytesAvailable) => Some(Notification::Received),
            (ChannelSide::Output, StreamEvent::HasSpaceAvailable) => {
                self.edge(ChannelSide::Output)
            }
            (_, StreamEvent::ErrorOccurred(error)) => Some(Notification::Error(error)),
            (_, StreamEvent::EndEncountered(Some(error))) => Some(Notification::Error(error)),
            _ => None,
        }
    }

    fn edge(&self, side: ChannelSide) -> Option<Notification> {
        self.readiness.mark(side).then_some(Notification::Ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::closed_error;
    use proptest::prelude::*;

    fn feed(readiness: &Readiness, events: &[(ChannelSide, StreamEvent)]) -> Vec<Notification> {
        let correlator = EventCorrelator::new(readiness);
        events
            .iter()
            .cloned()
            .filter_map(|(side, event)| correlator.handle(side, event))
            .collect()
    }

    fn ready_count(notifications: &[Notification]) -> usize {
        notifications
            .iter()
            .filter(|n| matches!(n, Notification::Ready))
            .count()
    }

    #[test]
    fn first_readiness_source_does_not_notify_alone() {
        let readiness = Readiness::default();
        let out = feed(&readiness, &[(ChannelSide::Input, StreamEvent::OpenCompleted)]);
        assert!(out.is_empty());
        assert_eq!(readiness.state(), ReadinessState::InputReady);
    }

    #[test]
    fn second_readiness_source_notifies_once() {
        let readiness = Readiness::default();
        let out = feed(
            &readiness,
            &[
                (ChannelSide::Output, StreamEvent::HasSpaceAvailable),
                (ChannelSide::Output, StreamEvent::OpenCompleted),
                (ChannelSide::Input, StreamEvent::OpenCompleted),
                (ChannelSide::Output, StreamEvent::HasSpaceAvailable),
                (ChannelSide::Input, StreamEvent::OpenCompleted),
            ],
        );
        assert_eq!(ready_count(&out), 1);
        assert!(readiness.state().is_ready());
    }

    #[test]
    fn output_open_is_informational() {
        let readiness = Readiness::default();
        let out = feed(
            &readiness,
            &[
                (ChannelSide::Input, StreamEvent::OpenCompleted),
                (ChannelSide::Output, StreamEvent::OpenCompleted),
            ],
        );
        assert!(out.is_empty());
        assert_eq!(readiness.state(), ReadinessState::InputReady);
    }

    #[test]
    fn errors_are_forwarded_without_touching_flags() {
        let readiness = Readiness::default();
        let out = feed(
            &readiness,
            &[
                (
                    ChannelSide::Input,
                    StreamEvent::ErrorOccurred(closed_error("input")),
                ),
                (ChannelSide::Output, StreamEvent::EndEncountered(None)),
                (
                    ChannelSide::Output,
                    StreamEvent::EndEncountered(Some(closed_error("output"))),
                ),
            ],
        );
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|n| matches!(n, Notification::Error(_))));
        assert_eq!(readiness.state(), ReadinessState::Idle);
    }

    #[test]
    fn mismatched_sources_are_ignored() {
        let readiness = Readiness::default();
        let out = feed(
            &readiness,
            &[
                (ChannelSide::Output, StreamEvent::HasBytesAvailable),
                (ChannelSide::Input, StreamEvent::HasSpaceAvailable),
            ],
        );
        assert!(out.is_empty());
        assert_eq!(readiness.state(), ReadinessState::Idle);
    }

    #[test]
    fn each_bytes_event_is_one_received() {
        let readiness = Readiness::default();
        let events = vec![(ChannelSide::Input, StreamEvent::HasBytesAvailable); 3];
        let out = feed(&readiness, &events);
        assert_eq!(out.len(), 3);
        assert!(out.iter().all(|n| matches!(n, Notification::Received)));
    }

    fn arb_event() -> impl Strategy<Value = (ChannelSide, StreamEvent)> {
        let side = prop_oneof![Just(ChannelSide::Input), Just(ChannelSide::Output)];
        let event = prop_oneof![
            Just(StreamEvent::OpenCompleted),
            Just(StreamEvent::HasBytesAvailable),
            Just(StreamEvent::HasSpaceAvailable),
            Just(StreamEvent::EndEncountered(None)),
            Just(StreamEvent::ErrorOccurred(closed_error("input"))),
        ];
        (side, event)
    }

    proptest! {
        #[test]
        fn ready_fires_exactly_on_the_completing_event(
            events in proptest::collection::vec(arb_event(), 0..32)
        ) {
            let readiness = Readiness::default();
            let correlator = EventCorrelator::new(&readiness);
            let mut seen_input = false;
            let mut seen_output = false;
            let mut ready_at = Vec::new();

            for (index, (side, event)) in events.iter().cloned().enumerate() {
                match (side, &event) {
                    (ChannelSide::Input, StreamEvent::OpenCompleted) => seen_input = true,
                    (ChannelSide::Output, StreamEvent::HasSpaceAvailable) => seen_output = true,
                    _ => {}
                }
                if let Some(Notification::Ready) = correlator.handle(side, event) {
                    prop_assert!(seen_input && seen_output);
                    ready_at.push(index);
                }
            }

            if seen_input && seen_output {
                prop_assert_eq!(ready_at.len(), 1);
                prop_assert!(readiness.state().is_ready());
            } else {
                prop_assert!(ready_at.is_empty());
                prop_assert!(!readiness.state().is_ready());
            }
        }
    }
}
