use std::{
    fmt,
    io::{self, Read, Write},
    net::{Shutdown, TcpStream},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use rustls::{ClientConnection, ServerConnection, StreamOwned};
use tracing::debug;

use super::{
    CloseHook, CloseHookSlot, ConnectionId, ConnectionMetadata, ConnectionSettings, Tracked,
    decode_frame, encode_frame,
};
use crate::collaborators::{EndpointEvent, MessageEnvelope};

/// 阻塞模式下的字节流：明文或经 `rustls` 包装的 TLS 流。
pub enum NetStream {
    Plain(TcpStream),
    TlsServer(Box<StreamOwned<ServerConnection, TcpStream>>),
    TlsClient(Box<StreamOwned<ClientConnection, TcpStream>>),
}

impl NetStream {
    /// 底层 TCP 套接字。
    pub fn tcp(&self) -> &TcpStream {
        match self {
            NetStream::Plain(stream) => stream,
            NetStream::TlsServer(stream) => stream.get_ref(),
            NetStream::TlsClient(stream) => stream.get_ref(),
        }
    }

    pub fn is_secure(&self) -> bool {
        !matches!(self, NetStream::Plain(_))
    }

    /// 拆出底层套接字与 TLS 会话状态，读写两侧由连接分别持有。
    fn into_parts(self) -> (TcpStream, Option<rustls::Connection>) {
        match self {
            NetStream::Plain(stream) => (stream, None),
            NetStream::TlsServer(stream) => {
                let StreamOwned { conn, sock } = *stream;
                (sock, Some(conn.into()))
            }
            NetStream::TlsClient(stream) => {
                let StreamOwned { conn, sock } = *stream;
                (sock, Some(conn.into()))
            }
        }
    }
}

impl fmt::Debug for NetStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            NetStream::Plain(_) => "plain",
            NetStream::TlsServer(_) => "tls-server",
            NetStream::TlsClient(_) => "tls-client",
        };
        f.debug_struct("NetStream")
            .field("kind", &kind)
            .field("peer", &self.tcp().peer_addr().ok())
            .finish()
    }
}

/// 单次读取的密文上限，与 `rustls` 默认的明文缓冲上限一致，保证一轮解密不会溢出。
const TLS_READ_LIMIT: usize = 16 * 1024;

struct ReadHalf {
    socket: TcpStream,
    buffer: BytesMut,
    chunk: Vec<u8>,
}

fn tls_error(err: rustls::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

/// 把会话中待发送的 TLS 记录全部写出。
fn flush_tls(session: &mut rustls::Connection, socket: &mut TcpStream) -> io::Result<()> {
    while session.wants_write() {
        session.write_tls(socket)?;
    }
    socket.flush()
}

/// 阻塞连接。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 为阻塞端点提供“一个连接 + 一条处理线程”的同步收发能力；
/// - 编解码、映射与拦截器均来自端点冻结的 [`ConnectionSettings`]，连接本身不持有端点引用。
///
/// ## 逻辑 (How)
/// - 读写两侧各持一个克隆出的套接字句柄与各自的锁，等待入站帧的线程不会挡住 `send`；
/// - TLS 会话状态单独加锁，只在解密或加密的瞬间持有，阻塞读取套接字时不持有；
/// - `close` 通过第三个句柄执行 `shutdown`，从而唤醒阻塞在 `read` 上的线程；
/// - 单次使用连接：服务端在 `send` 后关闭，客户端在 `receive` 后关闭。
///
/// ## 契约 (What)
/// - `receive` 返回 `Ok(None)` 表示对端正常关闭，此时连接已被关闭；
/// - 关闭后的 `send`/`receive` 返回 `io::ErrorKind::NotConnected`；
/// - `close` 幂等，只会触发一次 `on_close` 与 `ConnectionClosed` 事件。
///
/// ## 风险 (Trade-offs)
/// - 锁顺序固定为“TLS 会话 → 写句柄”，读路径需要回写握手后消息时同样遵守。
pub struct BlockingConnection {
    metadata: ConnectionMetadata,
    settings: Arc<ConnectionSettings>,
    reader: Mutex<ReadHalf>,
    writer: Mutex<TcpStream>,
    session: Option<Mutex<rustls::Connection>>,
    shutdown_handle: TcpStream,
    open: AtomicBool,
    sequence: AtomicU64,
    close_hook: CloseHookSlot,
}

impl BlockingConnection {
    /// 包装一个已建立（且已完成 TLS 握手）的流，执行拦截器并发布打开事件。
    pub fn open(stream: NetStream, settings: Arc<ConnectionSettings>) -> io::Result<Self> {
        let secure = stream.is_secure();
        let (socket, session) = stream.into_parts();
        let peer_addr = socket.peer_addr()?;
        let local_addr = socket.local_addr()?;
        let shutdown_handle = socket.try_clone()?;
        let writer = socket.try_clone()?;
        let metadata = settings.metadata(peer_addr, local_addr, secure);

        if let Err(err) = settings.interceptors.run_open(&metadata) {
            let _ = shutdown_handle.shutdown(Shutdown::Both);
            return Err(err);
        }

        settings.publish(EndpointEvent::ConnectionOpened {
            endpoint: settings.endpoint_name.clone(),
            connection_id: metadata.id.clone(),
        });
        let reader = ReadHalf {
            socket,
            buffer: BytesMut::with_capacity(settings.initial_buffer_capacity()),
            chunk: vec![0u8; settings.read_chunk()],
        };
        Ok(Self {
            metadata,
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            session: session.map(Mutex::new),
            settings,
            shutdown_handle,
            open: AtomicBool::new(true),
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

    /// 编码并发送一条消息。
    pub fn send(&self, payload: &[u8]) -> io::Result<()> {
        self.ensure_open()?;
        let frame = encode_frame(&self.settings, payload)?;
        match &self.session {
            None => {
                let mut writer = self.writer.lock();
                writer.write_all(&frame)?;
                writer.flush()?;
            }
            Some(session) => {
                let mut session = session.lock();
                session.writer().write_all(&frame)?;
                flush_tls(&mut session, &mut self.writer.lock())?;
            }
        }
        if self.settings.closes_after_send() {
            self.close();
        }
        Ok(())
    }

    /// 读取下一条完整消息。
    pub fn receive(&self) -> io::Result<Option<Bytes>> {
        self.ensure_open()?;
        match self.next_frame()? {
            Some(frame) => {
                if self.settings.closes_after_receive() {
                    self.close();
                }
                Ok(Some(frame))
            }
            None => {
                self.close();
                Ok(None)
            }
        }
    }

    /// 读取下一条消息并经映射器转换为信封。
    pub fn receive_message(&self) -> io::Result<Option<MessageEnvelope>> {
        let payload = self.receive()?;
        Ok(payload.map(|payload| {
            self.settings
                .mapper
                .to_envelope(payload, &self.metadata, &self.sequence)
        }))
    }

    /// 关闭连接；重复调用无副作用。
    pub fn close(&self) {
        if !self.open.swap(false, Ordering::AcqRel) {
            return;
        }
        self.send_close_notify();
        if let Err(err) = self.shutdown_handle.shutdown(Shutdown::Both) {
            debug!(connection_id = %self.metadata.id, error = %err, "socket already shut down");
        }
        self.settings.interceptors.run_close(&self.metadata);
        self.settings.publish(EndpointEvent::ConnectionClosed {
            endpoint: self.settings.endpoint_name.clone(),
            connection_id: self.metadata.id.clone(),
        });
        self.close_hook.fire();
    }

    fn next_frame(&self) -> io::Result<Option<Bytes>> {
        let mut reader = self.reader.lock();
        loop {
            if let Some(frame) = decode_frame(&self.settings, &mut reader.buffer)? {
                return Ok(Some(frame));
            }
            let read = match &self.session {
                None => self.fill_plain(&mut reader),
                Some(session) => self.fill_tls(session, &mut reader),
            };
            let read = match read {
                Ok(read) => read,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            };
            if read == 0 {
                if reader.buffer.is_empty() {
                    return Ok(None);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed with a partial frame buffered",
                ));
            }
        }
    }

    fn fill_plain(&self, reader: &mut ReadHalf) -> io::Result<usize> {
        let ReadHalf {
            socket,
            buffer,
            chunk,
        } = reader;
        let read = socket.read(chunk)?;
        buffer.extend_from_slice(&chunk[..read]);
        Ok(read)
    }

    /// 取出一段明文；会话中没有明文时先在锁外读取密文，再加锁解密。
    fn fill_tls(
        &self,
        session: &Mutex<rustls::Connection>,
        reader: &mut ReadHalf,
    ) -> io::Result<usize> {
        let ReadHalf {
            socket,
            buffer,
            chunk,
        } = reader;
        loop {
            {
                let mut session = session.lock();
                match session.reader().read(chunk) {
                    Ok(read) => {
                        buffer.extend_from_slice(&chunk[..read]);
                        return Ok(read);
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                    // 对端未发送 close_notify 即断开，按普通 EOF 处理。
                    Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(0),
                    Err(err) => return Err(err),
                }
            }

            let limit = chunk.len().min(TLS_READ_LIMIT);
            let read = socket.read(&mut chunk[..limit])?;
            let mut session = session.lock();
            let mut ciphertext = &chunk[..read];
            loop {
                session.read_tls(&mut ciphertext)?;
                session.process_new_packets().map_err(tls_error)?;
                if ciphertext.is_empty() {
                    break;
                }
            }
            if session.wants_write() {
                flush_tls(&mut session, &mut self.writer.lock())?;
            }
        }
    }

    fn send_close_notify(&self) {
        let Some(session) = &self.session else {
            return;
        };
        let Some(mut session) = session.try_lock() else {
            return;
        };
        session.send_close_notify();
        if let Some(mut writer) = self.writer.try_lock() {
            if let Err(err) = flush_tls(&mut session, &mut writer) {
                debug!(connection_id = %self.metadata.id, error = %err, "tls close_notify not delivered");
            }
        }
    }

    fn ensure_open(&self) -> io::Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::NotConnected,
                format!("connection {} is closed", self.metadata.id),
            ))
        }
    }
}

impl Tracked for BlockingConnection {
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

impl fmt::Debug for BlockingConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockingConnection")
            .field("metadata", &self.metadata)
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::Deserializer;
    use std::{
        net::TcpListener,
        sync::{atomic::AtomicUsize, mpsc},
        thread,
        time::Duration,
    };

    #[derive(Debug)]
    struct LineCodec;

    impl Deserializer for LineCodec {
        fn deserialize(&self, src: &mut BytesMut) -> io::Result<Option<Bytes>> {
            match src.iter().position(|byte| *byte == b'\n') {
                Some(index) => {
                    let line = src.split_to(index + 1);
                    Ok(Some(line.freeze().slice(..index)))
                }
                None => Ok(None),
            }
        }
    }

    fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let client = TcpStream::connect(listener.local_addr().expect("addr")).expect("connect");
        let (server, _) = listener.accept().expect("accept");
        (server, client)
    }

    #[test]
    fn receive_splits_frames_with_deserializer() {
        let (server, mut client) = pair();
        let mut settings = ConnectionSettings::new("server", true);
        settings.deserializer = Some(Arc::new(LineCodec));
        let connection =
            BlockingConnection::open(NetStream::Plain(server), Arc::new(settings)).expect("open");

        client.write_all(b"first\nsecond\n").expect("write");
        assert_eq!(
            connection.receive().expect("frame"),
            Some(Bytes::from_static(b"first"))
        );
        assert_eq!(
            connection.receive().expect("frame"),
            Some(Bytes::from_static(b"second"))
        );

        drop(client);
        assert_eq!(connection.receive().expect("eof"), None);
        assert!(!connection.is_open());
    }

    #[test]
    fn single_use_server_connection_closes_after_send() {
        let (server, mut client) = pair();
        let mut settings = ConnectionSettings::new("server", true);
        settings.single_use = true;
        let connection =
            BlockingConnection::open(NetStream::Plain(server), Arc::new(settings)).expect("open");

        connection.send(b"reply").expect("send");
        assert!(!connection.is_open());

        let mut received = Vec::new();
        client.read_to_end(&mut received).expect("read");
        assert_eq!(received, b"reply");
        let err = connection.send(b"again").expect_err("closed");
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[test]
    fn send_proceeds_while_receive_waits() {
        let (server, mut client) = pair();
        let mut settings = ConnectionSettings::new("client", false);
        settings.deserializer = Some(Arc::new(LineCodec));
        let connection = Arc::new(
            BlockingConnection::open(NetStream::Plain(server), Arc::new(settings)).expect("open"),
        );

        let pending = {
            let connection = Arc::clone(&connection);
            thread::spawn(move || connection.receive())
        };
        thread::sleep(Duration::from_millis(50));

        let (sent, done) = mpsc::channel();
        {
            let connection = Arc::clone(&connection);
            thread::spawn(move || {
                let _ = sent.send(connection.send(b"request\n").is_ok());
            });
        }
        assert!(
            done.recv_timeout(Duration::from_secs(2)).expect("send finished"),
            "等待入站帧时发送不应被阻塞"
        );

        let mut request = [0u8; 8];
        client.read_exact(&mut request).expect("read request");
        assert_eq!(&request, b"request\n");
        client.write_all(b"reply\n").expect("write reply");
        assert_eq!(
            pending.join().expect("join").expect("receive"),
            Some(Bytes::from_static(b"reply"))
        );
    }

    #[test]
    fn close_runs_hook_once() {
        let (server, _client) = pair();
        let connection = BlockingConnection::open(
            NetStream::Plain(server),
            Arc::new(ConnectionSettings::new("server", true)),
        )
        .expect("open");
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        connection.on_close(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        connection.close();
        connection.close();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
