use std::{
    fmt, io,
    net::Shutdown,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    task::{Context, Poll},
};

use bytes::{Bytes, BytesMut};
use socket2::{SockRef, Socket};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf},
    net::TcpStream,
    sync::{Mutex as AsyncMutex, watch},
};
use tokio_rustls::{client, server};
use tracing::debug;

use super::{
    CloseHook, CloseHookSlot, ConnectionId, ConnectionMetadata, ConnectionSettings, Tracked,
    decode_frame, encode_frame,
};
use crate::collaborators::{EndpointEvent, MessageEnvelope};

/// 非阻塞模式下的字节流：Tokio 明文流或 `tokio-rustls` 加密流。
pub enum AsyncStream {
    Plain(TcpStream),
    TlsServer(Box<server::TlsStream<TcpStream>>),
    TlsClient(Box<client::TlsStream<TcpStream>>),
}

impl AsyncStream {
    pub fn tcp(&self) -> &TcpStream {
        match self {
            AsyncStream::Plain(stream) => stream,
            AsyncStream::TlsServer(stream) => stream.get_ref().0,
            AsyncStream::TlsClient(stream) => stream.get_ref().0,
        }
    }

    pub fn is_secure(&self) -> bool {
        !matches!(self, AsyncStream::Plain(_))
    }
}

impl AsyncRead for AsyncStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            AsyncStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            AsyncStream::TlsServer(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
            AsyncStream::TlsClient(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for AsyncStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            AsyncStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            AsyncStream::TlsServer(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
            AsyncStream::TlsClient(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            AsyncStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            AsyncStream::TlsServer(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
            AsyncStream::TlsClient(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            AsyncStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            AsyncStream::TlsServer(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
            AsyncStream::TlsClient(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

impl fmt::Debug for AsyncStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            AsyncStream::Plain(_) => "plain",
            AsyncStream::TlsServer(_) => "tls-server",
            AsyncStream::TlsClient(_) => "tls-client",
        };
        f.debug_struct("AsyncStream")
            .field("kind", &kind)
            .field("peer", &self.tcp().peer_addr().ok())
            .finish()
    }
}

struct AsyncReader {
    half: ReadHalf<AsyncStream>,
    buffer: BytesMut,
}

impl AsyncReader {
    async fn next_frame(&mut self, settings: &ConnectionSettings) -> io::Result<Option<Bytes>> {
        loop {
            if let Some(frame) = decode_frame(settings, &mut self.buffer)? {
                return Ok(Some(frame));
            }
            self.buffer.reserve(settings.read_chunk());
            let read = self.half.read_buf(&mut self.buffer).await?;
            if read == 0 {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed with a partial frame buffered",
                ));
            }
        }
    }
}

/// 非阻塞连接。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 为非阻塞端点提供异步收发能力，TLS 与明文共用一套 API；
///
/// ## 逻辑 (How)
/// - 流经 `tokio::io::split` 拆为读写两半，各自由 `tokio::sync::Mutex` 保护，
///   挂起的 `receive` 不会挡住同一连接上的 `send`；
/// - 关闭信号通过 `watch` 通道广播，阻塞在 `receive` 上的任务会立即返回 `NotConnected`；
/// - `close` 为优雅关闭（TLS 发送 `close_notify`），`abort` 为同步强制关闭，
///   直接作用于打开时克隆出的套接字句柄，不需要获取任何一半的锁。
///
/// ## 契约 (What)
/// - 与 [`BlockingConnection`](super::BlockingConnection) 保持一致的单次使用与事件语义；
/// - 连接所依附的 I/O 驱动由接入它的运行时提供，端点停止后连接不再可用。
pub struct NonBlockingConnection {
    metadata: ConnectionMetadata,
    settings: Arc<ConnectionSettings>,
    reader: AsyncMutex<AsyncReader>,
    writer: AsyncMutex<WriteHalf<AsyncStream>>,
    shutdown_handle: Socket,
    open: AtomicBool,
    closed: watch::Sender<bool>,
    sequence: AtomicU64,
    close_hook: CloseHookSlot,
}

impl NonBlockingConnection {
    /// 包装一个已建立（且已完成 TLS 握手）的流，执行拦截器并发布打开事件。
    pub fn open(stream: AsyncStream, settings: Arc<ConnectionSettings>) -> io::Result<Self> {
        let tcp = stream.tcp();
        let peer_addr = tcp.peer_addr()?;
        let local_addr = tcp.local_addr()?;
        let shutdown_handle = SockRef::from(tcp).try_clone()?;
        let metadata = settings.metadata(peer_addr, local_addr, stream.is_secure());

        if let Err(err) = settings.interceptors.run_open(&metadata) {
            let _ = shutdown_handle.shutdown(Shutdown::Both);
            return Err(err);
        }

        settings.publish(EndpointEvent::ConnectionOpened {
            endpoint: settings.endpoint_name.clone(),
            connection_id: metadata.id.clone(),
        });
        let buffer = BytesMut::with_capacity(settings.initial_buffer_capacity());
        let (closed, _) = watch::channel(false);
        let (half, writer) = tokio::io::split(stream);
        Ok(Self {
            metadata,
            reader: AsyncMutex::new(AsyncReader { half, buffer }),
            writer: AsyncMutex::new(writer),
            shutdown_handle,
            settings,
            open: AtomicBool::new(true),
            closed,
            sequence: AtomicU64::new(0),
            close_hook: CloseHookSlot::default(),
        })
    }

    pub fn metadata(&self) -> &ConnectionMetadata {
        &self.metadata
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub async fn send(&self, payload: &[u8]) -> io::Result<()> {
        self.ensure_open()?;
        let frame = encode_frame(&self.settings, payload)?;
        {
            let mut writer = self.writer.lock().await;
            writer.write_all(&frame).await?;
            writer.flush().await?;
        }
        if self.settings.closes_after_send() {
            self.close().await;
        }
        Ok(())
    }

    pub async fn receive(&self) -> io::Result<Option<Bytes>> {
        self.ensure_open()?;
        let mut closed = self.closed.subscribe();
        let frame = {
            let mut reader = self.reader.lock().await;
            tokio::select! {
                biased;
                _ = closed.wait_for(|closed| *closed) => Err(self.closed_error()),
                frame = reader.next_frame(&self.settings) => frame,
            }
        }?;
        match frame {
            Some(frame) => {
                if self.settings.closes_after_receive() {
                    self.close().await;
                }
                Ok(Some(frame))
            }
            None => {
                self.close().await;
                Ok(None)
            }
        }
    }

    pub async fn receive_message(&self) -> io::Result<Option<MessageEnvelope>> {
        let payload = self.receive().await?;
        Ok(payload.map(|payload| {
            self.settings
                .mapper
                .to_envelope(payload, &self.metadata, &self.sequence)
        }))
    }

    /// 优雅关闭：唤醒读方、发送 TLS `close_notify` 并关闭写半部。
    pub async fn close(&self) {
        if !self.mark_closed() {
            return;
        }
        let mut writer = self.writer.lock().await;
        if let Err(err) = writer.shutdown().await {
            debug!(connection_id = %self.metadata.id, error = %err, "graceful shutdown failed");
        }
        drop(writer);
        self.finish_close();
    }

    /// 同步强制关闭，直接对底层套接字执行双向 `shutdown`。
    pub fn abort(&self) {
        if !self.mark_closed() {
            return;
        }
        if let Err(err) = self.shutdown_handle.shutdown(Shutdown::Both) {
            debug!(connection_id = %self.metadata.id, error = %err, "socket already shut down");
        }
        self.finish_close();
    }

    fn mark_closed(&self) -> bool {
        if !self.open.swap(false, Ordering::AcqRel) {
            return false;
        }
        self.closed.send_replace(true);
        true
    }

    fn finish_close(&self) {
        self.settings.interceptors.run_close(&self.metadata);
        self.settings.publish(EndpointEvent::ConnectionClosed {
            endpoint: self.settings.endpoint_name.clone(),
            connection_id: self.metadata.id.clone(),
        });
        self.close_hook.fire();
    }

    fn ensure_open(&self) -> io::Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(self.closed_error())
        }
    }

    fn closed_error(&self) -> io::Error {
        io::Error::new(
            io::ErrorKind::NotConnected,
            format!("connection {} is closed", self.metadata.id),
        )
    }
}

impl Tracked for NonBlockingConnection {
    fn tracked_id(&self) -> &ConnectionId {
        &self.metadata.id
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn on_close(&self, hook: CloseHook) {
        self.close_hook.set(hook);
    }
}

impl fmt::Debug for NonBlockingConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NonBlockingConnection")
            .field("metadata", &self.metadata)
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}
