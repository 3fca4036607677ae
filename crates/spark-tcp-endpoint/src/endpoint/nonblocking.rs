use std::{
    io,
    net::{SocketAddr, TcpListener as StdTcpListener},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
        mpsc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tokio::{
    net::{TcpListener, TcpStream},
    runtime,
    sync::{Mutex as AsyncMutex, watch},
    task::JoinSet,
};
use tracing::{debug, info, warn};

use super::attributes::{CommonAttributes, ConnectionRegistry, ServerAttributes, SocketTuning};
use crate::{
    collaborators::EndpointEvent,
    connection::{ConnectionId, ConnectionSettings, NonBlockingConnection},
    error::{self, EndpointError, OperationKind, map_io_error},
    strategy::{NonBlockingConnectionStrategy, SocketCustomizer},
};

const STOP_GRACE: Duration = Duration::from_millis(500);

/// 非阻塞端点独有的属性：握手超时与直接缓冲。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NonBlockingAttributes {
    handshake_timeout: Option<Duration>,
    direct_buffers: bool,
}

impl NonBlockingAttributes {
    pub(crate) fn set_ssl_handshake_timeout(&mut self, timeout: Duration) {
        self.handshake_timeout = Some(timeout);
    }

    pub(crate) fn set_using_direct_buffers(&mut self, direct: bool) {
        self.direct_buffers = direct;
    }

    pub fn ssl_handshake_timeout(&self) -> Option<Duration> {
        self.handshake_timeout
    }

    pub fn using_direct_buffers(&self) -> bool {
        self.direct_buffers
    }
}

#[derive(Debug)]
struct SelectorRun {
    running: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
    local_addr: SocketAddr,
    done: mpsc::Receiver<()>,
}

/// 非阻塞服务端端点。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 以单线程事件循环承载全部接入与握手，线程数不随连接数增长；
///
/// ## 逻辑 (How)
/// - `start` 同步完成绑定与监听，使地址冲突等错误直接返回给调用方；
/// - 随后创建 Tokio current-thread 运行时，连同监听器一起交给 [`TaskExecutor`](crate::TaskExecutor)
///   执行选择器循环；每个接入的连接在循环内以独立任务完成调优、定制、策略包装（TLS 握手）与登记；
/// - `stop` 通过 `watch` 通道通知循环退出，循环在退出前中止全部连接。
///
/// ## 契约 (What)
/// - 登记的连接依附于该运行时的 I/O 驱动，可在任意运行时中读写，端点停止后即失效；
/// - `start` 幂等，`stop` 在未运行时为空操作。
#[derive(Debug)]
pub struct NonBlockingServerEndpoint {
    common: CommonAttributes,
    server: ServerAttributes,
    non_blocking: NonBlockingAttributes,
    connection_strategy: Arc<dyn NonBlockingConnectionStrategy>,
    customizer: Arc<dyn SocketCustomizer>,
    registry: Arc<ConnectionRegistry<NonBlockingConnection>>,
    state: Mutex<Option<SelectorRun>>,
}

impl NonBlockingServerEndpoint {
    pub(crate) fn new(
        common: CommonAttributes,
        connection_strategy: Arc<dyn NonBlockingConnectionStrategy>,
        customizer: Arc<dyn SocketCustomizer>,
    ) -> Self {
        Self {
            common,
            server: ServerAttributes::default(),
            non_blocking: NonBlockingAttributes::default(),
            connection_strategy,
            customizer,
            registry: Arc::default(),
            state: Mutex::new(None),
        }
    }

    pub fn common(&self) -> &CommonAttributes {
        &self.common
    }

    pub(crate) fn common_mut(&mut self) -> &mut CommonAttributes {
        &mut self.common
    }

    pub fn server(&self) -> &ServerAttributes {
        &self.server
    }

    pub(crate) fn server_mut(&mut self) -> &mut ServerAttributes {
        &mut self.server
    }

    pub fn non_blocking(&self) -> &NonBlockingAttributes {
        &self.non_blocking
    }

    pub(crate) fn non_blocking_mut(&mut self) -> &mut NonBlockingAttributes {
        &mut self.non_blocking
    }

    pub fn connection_strategy(&self) -> &Arc<dyn NonBlockingConnectionStrategy> {
        &self.connection_strategy
    }

    pub fn customizer(&self) -> &Arc<dyn SocketCustomizer> {
        &self.customizer
    }

    pub fn start(&self) -> Result<(), EndpointError> {
        let mut state = self.state.lock();
        if state
            .as_ref()
            .is_some_and(|run| run.running.load(Ordering::Acquire))
        {
            return Ok(());
        }

        let addr = self
            .server
            .bind_addr(self.common.port())
            .map_err(|err| map_io_error(error::RESOLVE, err))?;
        let listener = self.listen(addr)?;
        let local_addr = listener
            .local_addr()
            .map_err(|err| map_io_error(error::BIND, err))?;
        let runtime = runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|err| map_io_error(error::CONFIGURE, err))?;

        let running = Arc::new(AtomicBool::new(true));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (done_tx, done) = mpsc::channel();
        let selector = SelectorLoop {
            listener,
            shutdown: shutdown_rx,
            context: Arc::new(SelectorContext {
                running: Arc::clone(&running),
                settings: self.common.connection_settings(
                    true,
                    self.non_blocking.handshake_timeout,
                    self.non_blocking.direct_buffers,
                ),
                tuning: self.common.tuning().clone(),
                connection_strategy: Arc::clone(&self.connection_strategy),
                customizer: Arc::clone(&self.customizer),
                registry: Arc::clone(&self.registry),
            }),
            read_delay: self.common.read_delay(),
        };
        self.common
            .task_executor()
            .execute(
                &format!("{}-selector", self.common.name()),
                Box::new(move || {
                    runtime.block_on(selector.run());
                    drop(runtime);
                    let _ = done_tx.send(());
                }),
            )
            .map_err(|err| map_io_error(error::DISPATCH, err))?;

        *state = Some(SelectorRun {
            running,
            shutdown,
            local_addr,
            done,
        });
        info!(endpoint = %self.common.name(), kind = "non-blocking-server", %local_addr, "endpoint started");
        self.common.publish(EndpointEvent::ServerListening {
            endpoint: self.common.name().to_owned(),
            local_addr,
        });
        Ok(())
    }

    fn listen(&self, addr: SocketAddr) -> Result<StdTcpListener, EndpointError> {
        let bind = |err| map_io_error(error::BIND, err);
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(bind)?;
        socket.set_reuse_address(true).map_err(bind)?;
        if let Some(bytes) = self.common.tuning().receive_buffer_bytes {
            socket.set_recv_buffer_size(bytes).map_err(bind)?;
        }
        self.customizer
            .post_process_listener(SockRef::from(&socket))
            .map_err(|err| map_io_error(error::CONFIGURE, err))?;
        socket.bind(&addr.into()).map_err(bind)?;
        socket.listen(self.server.backlog()).map_err(bind)?;
        socket.set_nonblocking(true).map_err(bind)?;
        Ok(socket.into())
    }

    pub fn stop(&self) {
        let Some(run) = self.state.lock().take() else {
            return;
        };
        run.running.store(false, Ordering::SeqCst);
        run.shutdown.send_replace(true);
        if run
            .done
            .recv_timeout(self.common.read_delay() + STOP_GRACE)
            .is_err()
        {
            debug!(endpoint = %self.common.name(), "selector loop still draining after stop");
        }
        for connection in self.registry.drain() {
            connection.abort();
        }
        info!(endpoint = %self.common.name(), kind = "non-blocking-server", "endpoint stopped");
        self.common.publish(EndpointEvent::EndpointStopped {
            endpoint: self.common.name().to_owned(),
        });
    }

    pub fn is_running(&self) -> bool {
        self.state
            .lock()
            .as_ref()
            .is_some_and(|run| run.running.load(Ordering::Acquire))
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.state.lock().as_ref().map(|run| run.local_addr)
    }

    pub fn open_connection_ids(&self) -> Vec<ConnectionId> {
        self.registry.open_ids()
    }

    pub fn connection(&self, id: &ConnectionId) -> Option<Arc<NonBlockingConnection>> {
        self.registry.get(id)
    }

    pub fn close_connection(&self, id: &ConnectionId) -> bool {
        match self.registry.remove(id) {
            Some(connection) => {
                connection.abort();
                true
            }
            None => false,
        }
    }
}

struct SelectorContext {
    running: Arc<AtomicBool>,
    settings: Arc<ConnectionSettings>,
    tuning: SocketTuning,
    connection_strategy: Arc<dyn NonBlockingConnectionStrategy>,
    customizer: Arc<dyn SocketCustomizer>,
    registry: Arc<ConnectionRegistry<NonBlockingConnection>>,
}

impl SelectorContext {
    /// 完成握手并登记；端点已停止时连接被就地中止，返回 `None`。
    async fn establish(&self, stream: TcpStream) -> io::Result<Option<Arc<NonBlockingConnection>>> {
        self.tuning.apply_non_blocking(&stream)?;
        self.customizer.post_process_stream(SockRef::from(&stream))?;
        let connection = Arc::new(
            self.connection_strategy
                .accept(stream, Arc::clone(&self.settings))
                .await?,
        );
        self.registry.register(&connection);
        if !self.running.load(Ordering::SeqCst) {
            connection.abort();
            return Ok(None);
        }
        Ok(Some(connection))
    }

    fn report_failure(&self, operation: OperationKind, peer: Option<SocketAddr>, err: &io::Error) {
        warn!(
            endpoint = %self.settings.endpoint_name,
            code = operation.code,
            peer = ?peer,
            error = %err,
            "inbound connection failed"
        );
        self.settings.publish(EndpointEvent::ConnectionFailed {
            endpoint: self.settings.endpoint_name.clone(),
            reason: format!("{}: {err}", operation.message),
        });
    }
}

struct SelectorLoop {
    listener: StdTcpListener,
    shutdown: watch::Receiver<bool>,
    context: Arc<SelectorContext>,
    read_delay: Duration,
}

impl SelectorLoop {
    async fn run(self) {
        let SelectorLoop {
            listener,
            mut shutdown,
            context,
            read_delay,
        } = self;
        let listener = match TcpListener::from_std(listener) {
            Ok(listener) => listener,
            Err(err) => {
                context.report_failure(error::CONFIGURE, None, &err);
                context.running.store(false, Ordering::SeqCst);
                return;
            }
        };

        let mut handshakes = JoinSet::new();
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let context = Arc::clone(&context);
                        handshakes.spawn(async move {
                            match context.establish(stream).await {
                                Ok(Some(connection)) => debug!(
                                    endpoint = %context.settings.endpoint_name,
                                    %peer,
                                    connection_id = %connection.metadata().id,
                                    "connection accepted"
                                ),
                                Ok(None) => debug!(
                                    endpoint = %context.settings.endpoint_name,
                                    %peer,
                                    "connection discarded after stop"
                                ),
                                Err(err) => context.report_failure(error::HANDSHAKE, Some(peer), &err),
                            }
                        });
                    }
                    Err(err) => {
                        context.report_failure(error::ACCEPT, None, &err);
                        tokio::time::sleep(read_delay).await;
                    }
                },
                Some(_) = handshakes.join_next(), if !handshakes.is_empty() => {}
            }
        }

        context.running.store(false, Ordering::SeqCst);
        handshakes.shutdown().await;
        for connection in context.registry.drain() {
            connection.abort();
        }
        debug!(endpoint = %context.settings.endpoint_name, "selector loop exited");
    }
}

/// 非阻塞客户端端点。
///
/// - [`connection`](Self::connection) 在调用方的运行时上建连，`so_timeout` 约束建连时长；
/// - 共享连接的复用规则与阻塞客户端一致。
#[derive(Debug)]
pub struct NonBlockingClientEndpoint {
    common: CommonAttributes,
    non_blocking: NonBlockingAttributes,
    connection_strategy: Arc<dyn NonBlockingConnectionStrategy>,
    customizer: Arc<dyn SocketCustomizer>,
    running: AtomicBool,
    settings: Mutex<Option<Arc<ConnectionSettings>>>,
    epoch: AtomicU64,
    opening: AsyncMutex<()>,
    shared: Mutex<Option<SharedConnection>>,
}

/// 共享连接及其所属的运行周期；`stop` 推进周期后，旧周期的连接不再被复用。
#[derive(Debug)]
struct SharedConnection {
    epoch: u64,
    connection: Arc<NonBlockingConnection>,
}

impl NonBlockingClientEndpoint {
    pub(crate) fn new(
        common: CommonAttributes,
        connection_strategy: Arc<dyn NonBlockingConnectionStrategy>,
        customizer: Arc<dyn SocketCustomizer>,
    ) -> Self {
        Self {
            common,
            non_blocking: NonBlockingAttributes::default(),
            connection_strategy,
            customizer,
            running: AtomicBool::new(false),
            settings: Mutex::new(None),
            epoch: AtomicU64::new(0),
            opening: AsyncMutex::new(()),
            shared: Mutex::new(None),
        }
    }

    pub fn common(&self) -> &CommonAttributes {
        &self.common
    }

    pub(crate) fn common_mut(&mut self) -> &mut CommonAttributes {
        &mut self.common
    }

    pub fn non_blocking(&self) -> &NonBlockingAttributes {
        &self.non_blocking
    }

    pub(crate) fn non_blocking_mut(&mut self) -> &mut NonBlockingAttributes {
        &mut self.non_blocking
    }

    pub fn connection_strategy(&self) -> &Arc<dyn NonBlockingConnectionStrategy> {
        &self.connection_strategy
    }

    pub fn customizer(&self) -> &Arc<dyn SocketCustomizer> {
        &self.customizer
    }

    pub fn start(&self) -> Result<(), EndpointError> {
        let mut settings = self.settings.lock();
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        *settings = Some(self.common.connection_settings(
            false,
            self.non_blocking.handshake_timeout,
            self.non_blocking.direct_buffers,
        ));
        info!(
            endpoint = %self.common.name(),
            kind = "non-blocking-client",
            host = ?self.common.host(),
            port = self.common.port(),
            "endpoint started"
        );
        Ok(())
    }

    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let stale = self.shared.lock().take();
        if let Some(stale) = stale {
            stale.connection.abort();
        }
        info!(endpoint = %self.common.name(), kind = "non-blocking-client", "endpoint stopped");
        self.common.publish(EndpointEvent::EndpointStopped {
            endpoint: self.common.name().to_owned(),
        });
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub async fn connection(&self) -> Result<Arc<NonBlockingConnection>, EndpointError> {
        let epoch = self.epoch.load(Ordering::SeqCst);
        let settings = self.current_settings()?;
        if self.common.single_use() {
            return self.open(settings).await;
        }
        let _opening = self.opening.lock().await;
        if let Some(current) = self.reusable(epoch) {
            return Ok(current);
        }
        let connection = self.open(settings).await?;
        let mut shared = self.shared.lock();
        // 与 `stop` 在同一把锁下交接：建连期间发生的停止或重启都会让新连接作废。
        if !self.is_running() || self.epoch.load(Ordering::SeqCst) != epoch {
            drop(shared);
            connection.abort();
            return Err(self.not_running());
        }
        *shared = Some(SharedConnection {
            epoch,
            connection: Arc::clone(&connection),
        });
        Ok(connection)
    }

    /// 取出当前周期内仍然打开的共享连接，过期或已关闭的连接被移出并中止。
    fn reusable(&self, epoch: u64) -> Option<Arc<NonBlockingConnection>> {
        let mut shared = self.shared.lock();
        let current = shared.take()?;
        if current.epoch == epoch && current.connection.is_open() {
            let connection = Arc::clone(&current.connection);
            *shared = Some(current);
            return Some(connection);
        }
        drop(shared);
        current.connection.abort();
        None
    }

    fn current_settings(&self) -> Result<Arc<ConnectionSettings>, EndpointError> {
        self.settings
            .lock()
            .clone()
            .filter(|_| self.is_running())
            .ok_or_else(|| self.not_running())
    }

    fn not_running(&self) -> EndpointError {
        EndpointError::NotRunning {
            endpoint: self.common.name().to_owned(),
        }
    }

    async fn open(
        &self,
        settings: Arc<ConnectionSettings>,
    ) -> Result<Arc<NonBlockingConnection>, EndpointError> {
        let host = self.common.host().unwrap_or_default();
        let stream = self.connect_stream(host).await?;
        let tuning = self.common.tuning();
        tuning
            .apply_non_blocking(&stream)
            .and_then(|()| self.customizer.post_process_stream(SockRef::from(&stream)))
            .map_err(|err| self.failed(error::CONFIGURE, err))?;
        let connection = self
            .connection_strategy
            .connect(stream, host, settings)
            .await
            .map_err(|err| self.failed(error::HANDSHAKE, err))?;
        debug!(
            endpoint = %self.common.name(),
            connection_id = %connection.metadata().id,
            "client connection established"
        );
        Ok(Arc::new(connection))
    }

    async fn connect_stream(&self, host: &str) -> Result<TcpStream, EndpointError> {
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, self.common.port()))
            .await
            .map_err(|err| map_io_error(error::RESOLVE, err))?
            .collect();
        let mut last_error = None;
        for addr in addrs {
            let connect = TcpStream::connect(addr);
            let attempt = match self.common.tuning().so_timeout {
                Some(limit) => match tokio::time::timeout(limit, connect).await {
                    Ok(result) => result,
                    Err(_) => Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("connect to {addr} exceeded {limit:?}"),
                    )),
                },
                None => connect.await,
            };
            match attempt {
                Ok(stream) => return Ok(stream),
                Err(err) => {
                    debug!(endpoint = %self.common.name(), %addr, error = %err, "connect attempt failed");
                    last_error = Some(err);
                }
            }
        }
        let err = last_error.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("`{host}` resolved to no address"),
            )
        });
        Err(self.failed(error::CONNECT, err))
    }

    fn failed(&self, operation: OperationKind, err: io::Error) -> EndpointError {
        self.common.publish(EndpointEvent::ConnectionFailed {
            endpoint: self.common.name().to_owned(),
            reason: err.to_string(),
        });
        map_io_error(operation, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::{DefaultNonBlockingConnectionStrategy, NoopSocketCustomizer};

    async fn accepted(listener: &TcpListener) -> (TcpStream, TcpStream) {
        let addr = listener.local_addr().expect("addr");
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (accepted.expect("accept").0, client.expect("connect"))
    }

    #[tokio::test]
    async fn handshake_finishing_after_stop_is_aborted() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let (server, _client) = accepted(&listener).await;
        let context = SelectorContext {
            running: Arc::new(AtomicBool::new(false)),
            settings: Arc::new(ConnectionSettings::new("selector-test", true)),
            tuning: SocketTuning::default(),
            connection_strategy: Arc::new(DefaultNonBlockingConnectionStrategy),
            customizer: Arc::new(NoopSocketCustomizer),
            registry: Arc::default(),
        };

        let established = context.establish(server).await.expect("establish");
        assert!(established.is_none());
        assert!(context.registry.drain().is_empty(), "停止后不应残留登记");
    }

    #[tokio::test]
    async fn stop_retires_shared_connection_while_slot_is_busy() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let peers = tokio::spawn(async move {
            let mut peers = Vec::new();
            while let Ok((peer, _)) = listener.accept().await {
                peers.push(peer);
            }
        });

        let client = NonBlockingClientEndpoint::new(
            CommonAttributes::new("shared-client".to_owned(), Some("127.0.0.1".to_owned()), port),
            Arc::new(DefaultNonBlockingConnectionStrategy),
            Arc::new(NoopSocketCustomizer),
        );
        client.start().expect("start");
        let first = client.connection().await.expect("first");
        {
            let _opening = client.opening.lock().await;
            client.stop();
        }
        assert!(!first.is_open(), "停止时共享连接必须被中止");

        client.start().expect("restart");
        let second = client.connection().await.expect("second");
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(second.is_open());

        client.stop();
        peers.abort();
    }
}
