use std::{
    cmp,
    collections::VecDeque,
    fmt,
    future::{Future, pending},
    io,
    net::SocketAddr,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use bytes::{Buf, Bytes, BytesMut};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf},
    net::{TcpStream, lookup_host},
    sync::Notify,
};
use tracing::{debug, warn};

use crate::{
    config::SessionStreamConfig,
    error::{
        self, CONFIGURE, CONNECT, FLUSH, HANDSHAKE, READ, RESOLVE, StreamError, WRITE,
        map_io_error, map_stream_error,
    },
    event::{ChannelSide, StreamEvent},
    tls::TlsPlan,
};

/// 关闭输出通道时等待残余数据写出与 `shutdown` 完成的上限。
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// 明文 TCP 与 TLS 流的统一抽象。
pub(crate) trait Connection: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> Connection for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

type BoxedConnection = Box<dyn Connection>;
type Opening = Pin<Box<dyn Future<Output = Result<BoxedConnection, OpenFailure>>>>;

/// 打开通道对失败的两类原因。
///
/// 解析失败不属于通道级错误：通道句柄保持缺失，只有超时守卫会报告失败。
#[derive(Debug)]
enum OpenFailure {
    Unresolved(StreamError),
    Channel(StreamError),
}

/// 输出通道的共享暂存区，写能力与后台循环之间唯一的交汇点。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 写能力可能在任意线程被调用，而真正的套接字写入必须留在后台循环上；
///   暂存区把“接受字节”与“驱动通道”分开，调用方永远不会阻塞。
///
/// ## 逻辑（How）
/// - `outstanding` 统计已接受但尚未写出的字节（含后台循环正在写的部分），容量按它计算；
/// - 写能力接受 `min(空闲容量, 请求长度)` 字节，短写时置 `saturated`；
/// - 后台循环写出字节后回收容量，若此前饱和则报告一次“有可写空间”；
/// - `wake` 在新字节入队时唤醒空闲的后台循环。
///
/// ## 契约（What）
/// - `offer` 非阻塞，可能返回 0；关闭后返回 `channel_closed` 错误；
/// - `close` 之后暂存内容被丢弃，`outstanding` 归零。
pub(crate) struct OutputBuffer {
    state: Mutex<OutputState>,
    capacity: usize,
    wake: Notify,
}

#[derive(Debug, Default)]
struct OutputState {
    queued: BytesMut,
    outstanding: usize,
    saturated: bool,
    closed: bool,
}

impl OutputBuffer {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(OutputState::default()),
            capacity,
            wake: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, OutputState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn offer(&self, buf: &[u8]) -> Result<usize, StreamError> {
        let mut state = self.lock();
        if state.closed {
            return Err(error::closed_error("output"));
        }
        let room = self.capacity.saturating_sub(state.outstanding);
        let accepted = cmp::min(room, buf.len());
        if accepted < buf.len() {
            state.saturated = true;
        }
        if accepted > 0 {
            state.queued.extend_from_slice(&buf[..accepted]);
            state.outstanding += accepted;
        }
        drop(state);
        if accepted > 0 {
            self.wake.notify_one();
        }
        Ok(accepted)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.lock().outstanding
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    fn take_queued(&self) -> BytesMut {
        self.lock().queued.split()
    }

    /// 回收已写出的容量；返回本次回收是否解除了饱和状态。
    fn complete(&self, written: usize) -> bool {
        let mut state = self.lock();
        state.outstanding = state.outstanding.saturating_sub(written);
        if state.saturated && written > 0 {
            state.saturated = false;
            return true;
        }
        false
    }

    fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.queued.clear();
        state.outstanding = 0;
        drop(state);
        self.wake.notify_one();
    }
}

impl fmt::Debug for OutputBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputBuffer")
            .field("capacity", &self.capacity)
            .field("outstanding", &self.outstanding())
            .finish_non_exhaustive()
    }
}

/// 写能力：仅在输出通道存在且就绪时由会话流发放。
///
/// `write` 非阻塞，返回实际接受的字节数，可能少于请求长度（包括 0）；
/// 未被接受的部分由上层协议自行缓冲重试。
#[derive(Clone, Debug)]
pub struct StreamWriter {
    buffer: Arc<OutputBuffer>,
}

impl StreamWriter {
    pub(crate) fn new(buffer: Arc<OutputBuffer>) -> Self {
        Self { buffer }
    }

    pub fn write(&self, buf: &[u8]) -> Result<usize, StreamError> {
        self.buffer.offer(buf)
    }

    /// 已接受但尚未写出到套接字的字节数。
    pub fn pending(&self) -> usize {
        self.buffer.outstanding()
    }

    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }
}

/// 读能力：在 `on_received` 回调期间借用输入通道的接收缓冲区。
///
/// `read` 只返回当前已到达的字节，没有数据时返回 0；未读完的字节保留到下一次回调。
pub struct StreamReader<'a> {
    buffer: &'a mut BytesMut,
    ended: bool,
}

impl<'a> StreamReader<'a> {
    fn new(buffer: &'a mut BytesMut, ended: bool) -> Self {
        Self { buffer, ended }
    }

    pub fn available(&self) -> usize {
        self.buffer.len()
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, StreamError> {
        if self.buffer.is_empty() {
            if self.ended {
                return Err(error::closed_error("input"));
            }
            return Ok(0);
        }
        let count = cmp::min(buf.len(), self.buffer.len());
        buf[..count].copy_from_slice(&self.buffer[..count]);
        self.buffer.advance(count);
        Ok(count)
    }

    /// 取走当前缓冲的全部字节。
    pub fn read_available(&mut self) -> Bytes {
        self.buffer.split().freeze()
    }
}

impl fmt::Debug for StreamReader<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamReader")
            .field("available", &self.buffer.len())
            .field("ended", &self.ended)
            .finish()
    }
}

struct InputChannel {
    reader: ReadHalf<BoxedConnection>,
    buffer: BytesMut,
    chunk: usize,
    ended: bool,
}

impl InputChannel {
    async fn fill(&mut self) -> io::Result<usize> {
        if self.buffer.capacity() - self.buffer.len() < self.chunk {
            self.buffer.reserve(self.chunk);
        }
        self.reader.read_buf(&mut self.buffer).await
    }

    fn on_read(&mut self, result: io::Result<usize>) -> StreamEvent {
        match result {
            Ok(0) => {
                self.ended = true;
                StreamEvent::EndEncountered(None)
            }
            Ok(_) => StreamEvent::HasBytesAvailable,
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                self.ended = true;
                StreamEvent::EndEncountered(Some(map_stream_error(READ, err)))
            }
            Err(err) => {
                self.ended = true;
                StreamEvent::ErrorOccurred(map_stream_error(READ, err))
            }
        }
    }
}

struct OutputChannel {
    writer: WriteHalf<BoxedConnection>,
    buffer: Arc<OutputBuffer>,
    inflight: BytesMut,
    needs_flush: bool,
    failed: bool,
}

enum OutputStep {
    Written(usize),
    Flushed,
    Woken,
}

impl OutputChannel {
    fn refill(&mut self) {
        if self.inflight.is_empty() {
            self.inflight = self.buffer.take_queued();
        }
    }

    /// 推进输出一步：写一块、刷新或等待新数据。
    ///
    /// 每个挂起点之后的状态更新都在下一次挂起前同步完成，因此被 `select!` 取消不会丢失进度。
    async fn advance(&mut self) -> Result<OutputStep, StreamError> {
        if !self.inflight.is_empty() {
            let written = self
                .writer
                .write(&self.inflight)
                .await
                .map_err(|err| map_stream_error(WRITE, err))?;
            if written == 0 {
                return Err(map_io_error(
                    WRITE,
                    io::Error::new(io::ErrorKind::WriteZero, "connection accepted no bytes"),
                ));
            }
            self.inflight.advance(written);
            self.needs_flush = true;
            return Ok(OutputStep::Written(written));
        }
        if self.needs_flush {
            self.writer
                .flush()
                .await
                .map_err(|err| map_stream_error(FLUSH, err))?;
            self.needs_flush = false;
            return Ok(OutputStep::Flushed);
        }
        self.buffer.wake.notified().await;
        Ok(OutputStep::Woken)
    }

    fn on_step(&mut self, result: Result<OutputStep, StreamError>) -> Option<StreamEvent> {
        match result {
            Ok(OutputStep::Written(written)) => self
                .buffer
                .complete(written)
                .then_some(StreamEvent::HasSpaceAvailable),
            Ok(OutputStep::Flushed) | Ok(OutputStep::Woken) => None,
            Err(err) => {
                self.failed = true;
                self.inflight.clear();
                self.buffer.close();
                Some(StreamEvent::ErrorOccurred(err))
            }
        }
    }

    async fn close(&mut self, label: &str) {
        self.buffer.close();
        if self.failed {
            return;
        }
        let outcome = tokio::time::timeout(CLOSE_GRACE, async {
            self.writer.write_all(&self.inflight).await?;
            self.writer.shutdown().await
        })
        .await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => debug!(label, error = %err, "session stream output shutdown failed"),
            Err(_) => debug!(label, "session stream output shutdown timed out"),
        }
        self.inflight.clear();
    }
}

enum PairState {
    Opening(Opening),
    Open {
        input: InputChannel,
        output: OutputChannel,
    },
    Absent,
    Closed,
}

/// 双半通道对：绑定同一远端的输入/输出通道，只在后台循环线程上被驱动。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 把“解析 → 建连 → 可选 TLS 握手 → 拆分为读/写半部”的过程与之后的读写驱动
///   收敛为一个事件源，后台循环每次只需等待“下一个事件”；
/// - 通道缺失（解析失败）、失败与关闭都以显式状态表达，而非空指针式的哨兵值。
///
/// ## 逻辑 (How)
/// - `Opening` 状态持有装箱的建连 Future，被 `select!` 取消后下一轮继续推进；
/// - 建连成功后依序排出 `OpenCompleted(Input)`、`OpenCompleted(Output)`、
///   `HasSpaceAvailable(Output)`；
/// - `Open` 状态下并发等待输入读取与输出推进，两者都是取消安全的；
/// - 建连失败只产生一次 `ErrorOccurred(Input)`，解析失败不产生事件。
///
/// ## 契约 (What)
/// - `next_event` 只在有事件时完成；通道缺失或关闭后永远挂起；
/// - `close` 写出残余字节并关闭写半部（上限 1 秒），随后释放两个半部。
///
/// ## 注意事项 (Trade-offs)
/// - 接收缓冲区不设上限：委托未读完的字节会一直保留到下一次回调。
pub(crate) struct ChannelPair {
    label: String,
    read_chunk: usize,
    write_capacity: usize,
    state: PairState,
    pending: VecDeque<(ChannelSide, StreamEvent)>,
}

impl ChannelPair {
    pub(crate) fn open(label: String, config: SessionStreamConfig) -> Self {
        Self {
            label,
            read_chunk: config.read_chunk(),
            write_capacity: config.write_capacity(),
            state: PairState::Opening(Box::pin(establish(config))),
            pending: VecDeque::new(),
        }
    }

    pub(crate) async fn next_event(&mut self) -> (ChannelSide, StreamEvent) {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return event;
            }
            match &mut self.state {
                PairState::Opening(opening) => {
                    let outcome = opening.as_mut().await;
                    self.settle(outcome);
                }
                PairState::Open { input, output } => {
                    if input.ended && output.failed {
                        pending::<()>().await;
                    }
                    if let Some(event) = drive_open(input, output).await {
                        return event;
                    }
                }
                PairState::Absent | PairState::Closed => pending::<()>().await,
            }
        }
    }

    /// 发给写能力的共享暂存区；通道尚未打开或已关闭时为 `None`。
    pub(crate) fn output_buffer(&self) -> Option<Arc<OutputBuffer>> {
        match &self.state {
            PairState::Open { output, .. } => Some(Arc::clone(&output.buffer)),
            _ => None,
        }
    }

    pub(crate) fn reader(&mut self) -> Option<StreamReader<'_>> {
        match &mut self.state {
            PairState::Open { input, .. } => {
                Some(StreamReader::new(&mut input.buffer, input.ended))
            }
            _ => None,
        }
    }

    pub(crate) async fn close(&mut self) {
        if let PairState::Open { input, mut output } =
            std::mem::replace(&mut self.state, PairState::Closed)
        {
            output.close(&self.label).await;
            drop(input);
            debug!(label = %self.label, "session stream channels closed");
        }
        self.pending.clear();
    }

    fn settle(&mut self, outcome: Result<BoxedConnection, OpenFailure>) {
        match outcome {
            Ok(connection) => {
                let (reader, writer) = tokio::io::split(connection);
                self.state = PairState::Open {
                    input: InputChannel {
                        reader,
                        buffer: BytesMut::with_capacity(self.read_chunk),
                        chunk: self.read_chunk,
                        ended: false,
                    },
                    output: OutputChannel {
                        writer,
                        buffer: Arc::new(OutputBuffer::new(self.write_capacity)),
                        inflight: BytesMut::new(),
                        needs_flush: false,
                        failed: false,
                    },
                };
                self.pending.extend([
                    (ChannelSide::Input, StreamEvent::OpenCompleted),
                    (ChannelSide::Output, StreamEvent::OpenCompleted),
                    (ChannelSide::Output, StreamEvent::HasSpaceAvailable),
                ]);
                debug!(label = %self.label, "session stream channels opened");
            }
            Err(OpenFailure::Unresolved(err)) => {
                warn!(
                    label = %self.label,
                    error = %err,
                    "session stream target unresolved, channels stay absent"
                );
                self.state = PairState::Absent;
            }
            Err(OpenFailure::Channel(err)) => {
                self.state = PairState::Absent;
                self.pending
                    .push_back((ChannelSide::Input, StreamEvent::ErrorOccurred(err)));
            }
        }
    }
}

async fn drive_open(
    input: &mut InputChannel,
    output: &mut OutputChannel,
) -> Option<(ChannelSide, StreamEvent)> {
    output.refill();
    let can_read = !input.ended;
    let can_write = !output.failed;
    tokio::select! {
        read = input.fill(), if can_read => Some((ChannelSide::Input, input.on_read(read))),
        step = output.advance(), if can_write => {
            output.on_step(step).map(|event| (ChannelSide::Output, event))
        }
        else => None,
    }
}

async fn establish(config: SessionStreamConfig) -> Result<BoxedConnection, OpenFailure> {
    // 身份材料或 SNI 被拒绝属于通道级错误，与握手失败一样经委托报告。
    let tls = config
        .tls()
        .map(|settings| settings.build(config.host()))
        .transpose()
        .map_err(OpenFailure::Channel)?;
    let addrs: Vec<SocketAddr> = lookup_host((config.host(), config.port()))
        .await
        .map_err(|err| OpenFailure::Unresolved(map_io_error(RESOLVE, err)))?
        .collect();
    if addrs.is_empty() {
        return Err(OpenFailure::Unresolved(map_io_error(
            RESOLVE,
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no address for {}", config.host()),
            ),
        )));
    }

    let stream = connect_any(&addrs)
        .await
        .map_err(|err| OpenFailure::Channel(map_io_error(CONNECT, err)))?;
    config
        .apply_socket_options(&stream)
        .map_err(|err| OpenFailure::Channel(map_io_error(CONFIGURE, err)))?;

    match tls {
        None => Ok(Box::new(stream)),
        Some(TlsPlan {
            connector,
            server_name,
        }) => {
            let stream = connector
                .connect(server_name, stream)
                .await
                .map_err(|err| OpenFailure::Channel(map_stream_error(HANDSHAKE, err)))?;
            Ok(Box::new(stream))
        }
    }
}

async fn connect_any(addrs: &[SocketAddr]) -> io::Result<TcpStream> {
    let mut last_error = None;
    for addr in addrs {
        match TcpStream::connect(*addr).await {
            Ok(stream) => return Ok(stream),
            Err(err) => last_error = Some(err),
        }
    }
    Err(last_error
        .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no address to connect")))
}
