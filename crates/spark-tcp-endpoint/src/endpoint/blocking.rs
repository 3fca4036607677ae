use std::{
    io,
    net::{SocketAddr, TcpListener, TcpStream},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
        mpsc,
    },
    thread,
    time::Duration,
};

use parking_lot::Mutex;
use socket2::{SockRef, Socket};
use tracing::{debug, info, warn};

use super::attributes::{CommonAttributes, ConnectionRegistry, ServerAttributes, SocketTuning};
use crate::{
    collaborators::{EndpointEvent, TaskExecutor},
    connection::{BlockingConnection, ConnectionId, ConnectionSettings},
    error::{self, EndpointError, OperationKind, map_io_error},
    strategy::{BlockingConnectionStrategy, SocketCustomizer, SocketFactoryStrategy},
};

/// `stop` 等待接入循环退出时，在 `read_delay` 之外额外容忍的时长。
const STOP_GRACE: Duration = Duration::from_millis(500);

struct ServerRun {
    running: Arc<AtomicBool>,
    local_addr: SocketAddr,
    done: mpsc::Receiver<()>,
}

/// 阻塞服务端端点。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 以“接入循环 + 每连接一个处理任务”的方式承载阻塞传输，循环与处理任务都交给 [`TaskExecutor`]；
///
/// ## 逻辑 (How)
/// - `start`：通过套接字工厂创建监听套接字，写入 `SO_REUSEADDR` 与接收缓冲，交给定制器后绑定、监听；
///   监听器切换为非阻塞，接入循环在无连接时以 `read_delay` 退避并检查运行标志；
/// - 接入的套接字切回阻塞模式，依次写入调优选项、执行定制器、由套接字工厂包装（TLS 在此握手）、
///   交给连接策略，最后按 id 登记；
/// - `stop`：清除运行标志，在有限时间内等待循环释放监听器，然后关闭全部连接。
///
/// ## 契约 (What)
/// - `start` 幂等；绑定失败以 `Transport` 错误返回且端点保持停止；
/// - 接入或握手失败不会终止循环，只记录 `warn!` 并发布 `ConnectionFailed`。
#[derive(Debug)]
pub struct BlockingServerEndpoint {
    common: CommonAttributes,
    server: ServerAttributes,
    socket_factory: Arc<dyn SocketFactoryStrategy>,
    connection_strategy: Arc<dyn BlockingConnectionStrategy>,
    customizer: Arc<dyn SocketCustomizer>,
    registry: Arc<ConnectionRegistry<BlockingConnection>>,
    state: Mutex<Option<ServerRun>>,
}

impl std::fmt::Debug for ServerRun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerRun")
            .field("running", &self.running.load(Ordering::Acquire))
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

impl BlockingServerEndpoint {
    pub(crate) fn new(
        common: CommonAttributes,
        socket_factory: Arc<dyn SocketFactoryStrategy>,
        connection_strategy: Arc<dyn BlockingConnectionStrategy>,
        customizer: Arc<dyn SocketCustomizer>,
    ) -> Self {
        Self {
            common,
            server: ServerAttributes::default(),
            socket_factory,
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

    pub fn socket_factory(&self) -> &Arc<dyn SocketFactoryStrategy> {
        &self.socket_factory
    }

    pub fn connection_strategy(&self) -> &Arc<dyn BlockingConnectionStrategy> {
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

        let running = Arc::new(AtomicBool::new(true));
        let (done_tx, done) = mpsc::channel();
        let accept_loop = AcceptLoop {
            listener,
            context: Arc::new(AcceptContext {
                running: Arc::clone(&running),
                settings: self.common.connection_settings(true, None, false),
                tuning: self.common.tuning().clone(),
                socket_factory: Arc::clone(&self.socket_factory),
                connection_strategy: Arc::clone(&self.connection_strategy),
                customizer: Arc::clone(&self.customizer),
                executor: Arc::clone(self.common.task_executor()),
                registry: Arc::clone(&self.registry),
            }),
            read_delay: self.common.read_delay(),
        };
        self.common
            .task_executor()
            .execute(
                &format!("{}-accept", self.common.name()),
                Box::new(move || {
                    accept_loop.run();
                    let _ = done_tx.send(());
                }),
            )
            .map_err(|err| map_io_error(error::DISPATCH, err))?;

        *state = Some(ServerRun {
            running,
            local_addr,
            done,
        });
        info!(endpoint = %self.common.name(), kind = "blocking-server", %local_addr, "endpoint started");
        self.common.publish(EndpointEvent::ServerListening {
            endpoint: self.common.name().to_owned(),
            local_addr,
        });
        Ok(())
    }

    fn listen(&self, addr: SocketAddr) -> Result<TcpListener, EndpointError> {
        let bind = |err| map_io_error(error::BIND, err);
        let socket: Socket = self.socket_factory.create_socket(&addr).map_err(bind)?;
        socket.set_reuse_address(true).map_err(bind)?;
        if let Some(bytes) = self.common.tuning().receive_buffer_bytes {
            socket.set_recv_buffer_size(bytes).map_err(bind)?;
        }
        self.customizer
            .post_process_listener(SockRef::from(&socket))
            .map_err(|err| map_io_error(error::CONFIGURE, err))?;
        socket.bind(&addr.into()).map_err(bind)?;
        socket.listen(self.server.backlog()).map_err(bind)?;
        let listener: TcpListener = socket.into();
        listener.set_nonblocking(true).map_err(bind)?;
        Ok(listener)
    }

    pub fn stop(&self) {
        let Some(run) = self.state.lock().take() else {
            return;
        };
        run.running.store(false, Ordering::SeqCst);
        if run
            .done
            .recv_timeout(self.common.read_delay() + STOP_GRACE)
            .is_err()
        {
            debug!(endpoint = %self.common.name(), "accept loop still draining after stop");
        }
        for connection in self.registry.drain() {
            connection.close();
        }
        info!(endpoint = %self.common.name(), kind = "blocking-server", "endpoint stopped");
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

    /// 运行中时返回实际监听地址（端口为 0 时可取得系统分配的端口）。
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.state.lock().as_ref().map(|run| run.local_addr)
    }

    pub fn open_connection_ids(&self) -> Vec<ConnectionId> {
        self.registry.open_ids()
    }

    pub fn connection(&self, id: &ConnectionId) -> Option<Arc<BlockingConnection>> {
        self.registry.get(id)
    }

    /// 关闭并注销指定连接，返回该连接是否存在。
    pub fn close_connection(&self, id: &ConnectionId) -> bool {
        match self.registry.remove(id) {
            Some(connection) => {
                connection.close();
                true
            }
            None => false,
        }
    }
}

struct AcceptContext {
    running: Arc<AtomicBool>,
    settings: Arc<ConnectionSettings>,
    tuning: SocketTuning,
    socket_factory: Arc<dyn SocketFactoryStrategy>,
    connection_strategy: Arc<dyn BlockingConnectionStrategy>,
    customizer: Arc<dyn SocketCustomizer>,
    executor: Arc<dyn TaskExecutor>,
    registry: Arc<ConnectionRegistry<BlockingConnection>>,
}

impl AcceptContext {
    /// 完成一条入站连接的装配并登记；端点已停止时连接被就地关闭，返回 `None`。
    fn establish(&self, stream: TcpStream) -> io::Result<Option<Arc<BlockingConnection>>> {
        stream.set_nonblocking(false)?;
        self.tuning.apply_blocking(&stream)?;
        self.customizer.post_process_stream(SockRef::from(&stream))?;
        let wrapped = self.socket_factory.wrap_accepted(stream)?;
        let connection = Arc::new(
            self.connection_strategy
                .establish(wrapped, Arc::clone(&self.settings))?,
        );
        self.registry.register(&connection);
        // `stop` 先清除标志再清空登记表，登记后复查即可覆盖握手跨越停止的连接。
        if !self.running.load(Ordering::SeqCst) {
            connection.close();
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

struct AcceptLoop {
    listener: TcpListener,
    context: Arc<AcceptContext>,
    read_delay: Duration,
}

impl AcceptLoop {
    fn run(self) {
        while self.context.running.load(Ordering::Acquire) {
            match self.listener.accept() {
                Ok((stream, peer)) => self.dispatch(stream, peer),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(self.read_delay);
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    self.context.report_failure(error::ACCEPT, None, &err);
                    thread::sleep(self.read_delay);
                }
            }
        }
        debug!(endpoint = %self.context.settings.endpoint_name, "accept loop exited");
    }

    fn dispatch(&self, stream: TcpStream, peer: SocketAddr) {
        let context = Arc::clone(&self.context);
        let name = format!("{}-connection", context.settings.endpoint_name);
        let submitted = self.context.executor.execute(
            &name,
            Box::new(move || match context.establish(stream) {
                Ok(Some(connection)) => {
                    debug!(
                        endpoint = %context.settings.endpoint_name,
                        %peer,
                        connection_id = %connection.metadata().id,
                        "connection accepted"
                    );
                }
                Ok(None) => {
                    debug!(endpoint = %context.settings.endpoint_name, %peer, "connection discarded after stop");
                }
                Err(err) => context.report_failure(error::HANDSHAKE, Some(peer), &err),
            }),
        );
        if let Err(err) = submitted {
            self.context.report_failure(error::DISPATCH, Some(peer), &err);
        }
    }
}

/// 阻塞客户端端点。
///
/// # 教案式说明
/// - **逻辑 (How)**：[`connection`](Self::connection) 解析 `host:port`，逐个候选地址以套接字工厂创建套接字、
///   写入调优选项并在 `so_timeout` 约束下建连，随后包装（TLS 握手）并交给连接策略；
/// - **契约 (What)**：非单次使用时复用同一条仍然打开的共享连接；单次使用时每次调用都新建连接；
///   未启动时返回 [`EndpointError::NotRunning`]。
#[derive(Debug)]
pub struct BlockingClientEndpoint {
    common: CommonAttributes,
    socket_factory: Arc<dyn SocketFactoryStrategy>,
    connection_strategy: Arc<dyn BlockingConnectionStrategy>,
    customizer: Arc<dyn SocketCustomizer>,
    running: AtomicBool,
    settings: Mutex<Option<Arc<ConnectionSettings>>>,
    shared: Mutex<Option<Arc<BlockingConnection>>>,
}

impl BlockingClientEndpoint {
    pub(crate) fn new(
        common: CommonAttributes,
        socket_factory: Arc<dyn SocketFactoryStrategy>,
        connection_strategy: Arc<dyn BlockingConnectionStrategy>,
        customizer: Arc<dyn SocketCustomizer>,
    ) -> Self {
        Self {
            common,
            socket_factory,
            connection_strategy,
            customizer,
            running: AtomicBool::new(false),
            settings: Mutex::new(None),
            shared: Mutex::new(None),
        }
    }

    pub fn common(&self) -> &CommonAttributes {
        &self.common
    }

    pub(crate) fn common_mut(&mut self) -> &mut CommonAttributes {
        &mut self.common
    }

    pub fn socket_factory(&self) -> &Arc<dyn SocketFactoryStrategy> {
        &self.socket_factory
    }

    pub fn connection_strategy(&self) -> &Arc<dyn BlockingConnectionStrategy> {
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
        *settings = Some(self.common.connection_settings(false, None, false));
        info!(
            endpoint = %self.common.name(),
            kind = "blocking-client",
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
        if let Some(connection) = self.shared.lock().take() {
            connection.close();
        }
        info!(endpoint = %self.common.name(), kind = "blocking-client", "endpoint stopped");
        self.common.publish(EndpointEvent::EndpointStopped {
            endpoint: self.common.name().to_owned(),
        });
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// 取得一条可用连接。
    pub fn connection(&self) -> Result<Arc<BlockingConnection>, EndpointError> {
        let settings = self
            .settings
            .lock()
            .clone()
            .filter(|_| self.is_running())
            .ok_or_else(|| EndpointError::NotRunning {
                endpoint: self.common.name().to_owned(),
            })?;

        if self.common.single_use() {
            return self.open(settings);
        }
        let mut shared = self.shared.lock();
        if let Some(connection) = shared.as_ref().filter(|connection| connection.is_open()) {
            return Ok(Arc::clone(connection));
        }
        let connection = self.open(settings)?;
        *shared = Some(Arc::clone(&connection));
        Ok(connection)
    }

    fn open(&self, settings: Arc<ConnectionSettings>) -> Result<Arc<BlockingConnection>, EndpointError> {
        let stream = self.connect_stream()?;
        let server_name = self.common.host().unwrap_or_default();
        let wrapped = self
            .socket_factory
            .wrap_connected(stream, server_name)
            .map_err(|err| self.failed(error::HANDSHAKE, err))?;
        let connection = self
            .connection_strategy
            .establish(wrapped, settings)
            .map_err(|err| self.failed(error::CONNECT, err))?;
        debug!(
            endpoint = %self.common.name(),
            connection_id = %connection.metadata().id,
            "client connection established"
        );
        Ok(Arc::new(connection))
    }

    fn connect_stream(&self) -> Result<TcpStream, EndpointError> {
        let addrs = self
            .common
            .remote_addrs()
            .map_err(|err| map_io_error(error::RESOLVE, err))?;
        let mut last_error = None;
        for addr in addrs {
            match self.connect_addr(addr) {
                Ok(stream) => return Ok(stream),
                Err(err) => {
                    debug!(endpoint = %self.common.name(), %addr, error = %err, "connect attempt failed");
                    last_error = Some(err);
                }
            }
        }
        let err = last_error
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no address to connect"));
        Err(self.failed(error::CONNECT, err))
    }

    fn connect_addr(&self, addr: SocketAddr) -> io::Result<TcpStream> {
        let socket = self.socket_factory.create_socket(&addr)?;
        let tuning = self.common.tuning();
        tuning.apply(SockRef::from(&socket))?;
        self.customizer.post_process_stream(SockRef::from(&socket))?;
        match tuning.so_timeout {
            Some(timeout) => socket.connect_timeout(&addr.into(), timeout)?,
            None => socket.connect(&addr.into())?,
        }
        let stream: TcpStream = socket.into();
        tuning.apply_blocking(&stream)?;
        Ok(stream)
    }

    fn failed(&self, operation: error::OperationKind, err: io::Error) -> EndpointError {
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
    use crate::{
        collaborators::{EventPublisher, ThreadPerTaskExecutor},
        strategy::{DefaultBlockingConnectionStrategy, NoopSocketCustomizer, PlainSocketFactory},
    };
    use tracing_test::traced_test;

    #[derive(Debug, Default)]
    struct Failures(Mutex<Vec<String>>);

    impl EventPublisher for Failures {
        fn publish(&self, event: EndpointEvent) {
            if let EndpointEvent::ConnectionFailed { reason, .. } = event {
                self.0.lock().push(reason);
            }
        }
    }

    fn context(running: bool, publisher: Arc<Failures>) -> AcceptContext {
        let mut settings = ConnectionSettings::new("accept-test", true);
        settings.event_publisher = Some(publisher);
        AcceptContext {
            running: Arc::new(AtomicBool::new(running)),
            settings: Arc::new(settings),
            tuning: SocketTuning::default(),
            socket_factory: Arc::new(PlainSocketFactory),
            connection_strategy: Arc::new(DefaultBlockingConnectionStrategy),
            customizer: Arc::new(NoopSocketCustomizer),
            executor: Arc::new(ThreadPerTaskExecutor),
            registry: Arc::default(),
        }
    }

    fn accepted() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let client = TcpStream::connect(listener.local_addr().expect("addr")).expect("connect");
        let (server, _) = listener.accept().expect("accept");
        (server, client)
    }

    #[test]
    fn connection_established_after_stop_is_closed() {
        let context = context(false, Arc::default());
        let (server, _client) = accepted();

        let established = context.establish(server).expect("establish");
        assert!(established.is_none(), "停止后完成的连接不应交给调用方");
        assert!(context.registry.open_ids().is_empty());
        assert!(context.registry.drain().is_empty());
    }

    #[test]
    fn peer_closed_connection_leaves_registry() {
        let context = context(true, Arc::default());
        let (server, client) = accepted();

        let connection = context
            .establish(server)
            .expect("establish")
            .expect("running endpoint keeps the connection");
        let id = connection.metadata().id.clone();
        assert!(context.registry.get(&id).is_some());

        drop(client);
        assert_eq!(connection.receive().expect("eof"), None);
        assert!(context.registry.get(&id).is_none());
    }

    #[traced_test]
    #[test]
    fn accept_failures_carry_accept_code() {
        let failures = Arc::new(Failures::default());
        let context = context(true, Arc::clone(&failures));

        let err = io::Error::other("too many open files");
        context.report_failure(error::ACCEPT, None, &err);

        assert!(logs_contain("spark.endpoint.tcp.accept_failed"));
        assert_eq!(
            failures.0.lock().as_slice(),
            ["tcp accept: too many open files".to_owned()]
        );
    }
}
