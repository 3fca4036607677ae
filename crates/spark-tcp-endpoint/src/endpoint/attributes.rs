use std::{
    fmt, io,
    net::{SocketAddr, TcpStream, ToSocketAddrs},
    sync::Arc,
    time::Duration,
};

use dashmap::DashMap;
use socket2::SockRef;
use tracing::debug;

use crate::{
    collaborators::{
        Deserializer, EventPublisher, InterceptorChain, MessageMapper, Serializer, TaskExecutor,
        ThreadPerTaskExecutor,
    },
    config::DEFAULT_BACKLOG,
    connection::{ConnectionId, ConnectionSettings, Tracked},
};

/// 未配置 `read_delay` 时，接入循环空闲退避的默认时长。
pub const DEFAULT_READ_DELAY: Duration = Duration::from_millis(100);

/// 连接级套接字调优参数。
///
/// # 教案式说明
/// - **契约 (What)**：`None`/`0` 表示沿用操作系统默认值；`linger` 非负时以秒为单位开启，
///   负值关闭 `SO_LINGER`；`traffic_class` 仅对 IPv4 套接字写入 `IP_TOS`，超出 `0..=255` 的取值被忽略；
/// - **风险 (Trade-offs)**：`IP_TOS` 在部分平台不可用，此时记录 `debug` 日志后跳过。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SocketTuning {
    pub so_timeout: Option<Duration>,
    pub send_buffer_bytes: Option<usize>,
    pub receive_buffer_bytes: Option<usize>,
    pub tcp_no_delay: bool,
    pub linger: Option<i32>,
    pub keep_alive: bool,
    pub traffic_class: Option<i32>,
}

impl SocketTuning {
    /// 写入与阻塞/非阻塞无关的选项。
    pub(crate) fn apply(&self, socket: SockRef<'_>) -> io::Result<()> {
        if let Some(bytes) = self.send_buffer_bytes {
            socket.set_send_buffer_size(bytes)?;
        }
        if let Some(bytes) = self.receive_buffer_bytes {
            socket.set_recv_buffer_size(bytes)?;
        }
        if self.keep_alive {
            socket.set_keepalive(true)?;
        }
        if let Some(linger) = self.linger {
            let linger = u64::try_from(linger).ok().map(Duration::from_secs);
            socket.set_linger(linger)?;
        }
        if let Some(traffic_class) = self.traffic_class {
            apply_traffic_class(&socket, traffic_class)?;
        }
        Ok(())
    }

    /// 阻塞套接字：额外写入 `TCP_NODELAY` 与读超时。
    pub(crate) fn apply_blocking(&self, stream: &TcpStream) -> io::Result<()> {
        stream.set_nodelay(self.tcp_no_delay)?;
        stream.set_read_timeout(self.so_timeout)?;
        self.apply(SockRef::from(stream))
    }

    /// 非阻塞套接字：读超时由运行时定时器承担，此处只写 `TCP_NODELAY`。
    pub(crate) fn apply_non_blocking(&self, stream: &tokio::net::TcpStream) -> io::Result<()> {
        stream.set_nodelay(self.tcp_no_delay)?;
        self.apply(SockRef::from(stream))
    }
}

#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    windows
))]
fn apply_traffic_class(socket: &SockRef<'_>, traffic_class: i32) -> io::Result<()> {
    let Ok(tos) = u8::try_from(traffic_class) else {
        debug!(traffic_class, "traffic class outside 0..=255 ignored");
        return Ok(());
    };
    match socket.local_addr().ok().and_then(|addr| addr.as_socket()) {
        Some(SocketAddr::V6(_)) => {
            debug!(traffic_class, "traffic class not applied to ipv6 socket");
            Ok(())
        }
        _ => socket.set_tos_v4(u32::from(tos)),
    }
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    windows
)))]
fn apply_traffic_class(_socket: &SockRef<'_>, traffic_class: i32) -> io::Result<()> {
    debug!(traffic_class, "traffic class unsupported on this platform");
    Ok(())
}

/// 四种端点变体共享的公共属性。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 构建器按固定顺序写入：编解码、拦截器、`lookup_host`、映射器、单次使用、套接字调优、
///   执行器、名称、事件发布器，最后是可选的 `read_delay`；
///
/// ## 契约 (What)
/// - 未写入的 `so_linger`、`traffic_class` 保持 `None`，端点不会触碰对应套接字选项；
/// - 任务执行器缺省为 [`ThreadPerTaskExecutor`]，`read_delay` 缺省为 [`DEFAULT_READ_DELAY`]；
/// - [`connection_settings`](Self::connection_settings) 在 `start` 时冻结一份连接快照。
pub struct CommonAttributes {
    name: String,
    host: Option<String>,
    port: u16,
    serializer: Option<Arc<dyn Serializer>>,
    deserializer: Option<Arc<dyn Deserializer>>,
    interceptors: InterceptorChain,
    lookup_host: bool,
    mapper: MessageMapper,
    single_use: bool,
    tuning: SocketTuning,
    task_executor: Arc<dyn TaskExecutor>,
    event_publisher: Option<Arc<dyn EventPublisher>>,
    read_delay: Duration,
}

impl CommonAttributes {
    pub(crate) fn new(default_name: String, host: Option<String>, port: u16) -> Self {
        Self {
            name: default_name,
            host,
            port,
            serializer: None,
            deserializer: None,
            interceptors: InterceptorChain::default(),
            lookup_host: true,
            mapper: MessageMapper::default(),
            single_use: false,
            tuning: SocketTuning::default(),
            task_executor: Arc::new(ThreadPerTaskExecutor),
            event_publisher: None,
            read_delay: DEFAULT_READ_DELAY,
        }
    }

    pub(crate) fn set_serializer(&mut self, serializer: Arc<dyn Serializer>) {
        self.serializer = Some(serializer);
    }

    pub(crate) fn set_deserializer(&mut self, deserializer: Arc<dyn Deserializer>) {
        self.deserializer = Some(deserializer);
    }

    pub(crate) fn set_interceptors(&mut self, interceptors: InterceptorChain) {
        self.interceptors = interceptors;
    }

    pub(crate) fn set_lookup_host(&mut self, lookup_host: bool) {
        self.lookup_host = lookup_host;
    }

    pub(crate) fn set_mapper(&mut self, mapper: MessageMapper) {
        self.mapper = mapper;
    }

    pub(crate) fn set_single_use(&mut self, single_use: bool) {
        self.single_use = single_use;
    }

    pub(crate) fn set_so_timeout(&mut self, timeout: Option<Duration>) {
        self.tuning.so_timeout = timeout;
    }

    pub(crate) fn set_so_send_buffer_size(&mut self, bytes: Option<usize>) {
        self.tuning.send_buffer_bytes = bytes;
    }

    pub(crate) fn set_so_receive_buffer_size(&mut self, bytes: Option<usize>) {
        self.tuning.receive_buffer_bytes = bytes;
    }

    pub(crate) fn set_tcp_no_delay(&mut self, no_delay: bool) {
        self.tuning.tcp_no_delay = no_delay;
    }

    pub(crate) fn set_so_linger(&mut self, linger: i32) {
        self.tuning.linger = Some(linger);
    }

    pub(crate) fn set_so_keep_alive(&mut self, keep_alive: bool) {
        self.tuning.keep_alive = keep_alive;
    }

    pub(crate) fn set_traffic_class(&mut self, traffic_class: i32) {
        self.tuning.traffic_class = Some(traffic_class);
    }

    pub(crate) fn set_task_executor(&mut self, executor: Arc<dyn TaskExecutor>) {
        self.task_executor = executor;
    }

    pub(crate) fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub(crate) fn set_event_publisher(&mut self, publisher: Arc<dyn EventPublisher>) {
        self.event_publisher = Some(publisher);
    }

    pub(crate) fn set_read_delay(&mut self, delay: Duration) {
        self.read_delay = delay;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn serializer(&self) -> Option<&Arc<dyn Serializer>> {
        self.serializer.as_ref()
    }

    pub fn deserializer(&self) -> Option<&Arc<dyn Deserializer>> {
        self.deserializer.as_ref()
    }

    pub fn interceptors(&self) -> &InterceptorChain {
        &self.interceptors
    }

    pub fn lookup_host(&self) -> bool {
        self.lookup_host
    }

    pub fn mapper(&self) -> &MessageMapper {
        &self.mapper
    }

    pub fn single_use(&self) -> bool {
        self.single_use
    }

    pub fn tuning(&self) -> &SocketTuning {
        &self.tuning
    }

    pub fn so_linger(&self) -> Option<i32> {
        self.tuning.linger
    }

    pub fn traffic_class(&self) -> Option<i32> {
        self.tuning.traffic_class
    }

    pub fn task_executor(&self) -> &Arc<dyn TaskExecutor> {
        &self.task_executor
    }

    pub fn event_publisher(&self) -> Option<&Arc<dyn EventPublisher>> {
        self.event_publisher.as_ref()
    }

    pub fn read_delay(&self) -> Duration {
        self.read_delay
    }

    pub(crate) fn connection_settings(
        &self,
        server_side: bool,
        handshake_timeout: Option<Duration>,
        direct_buffers: bool,
    ) -> Arc<ConnectionSettings> {
        Arc::new(ConnectionSettings {
            endpoint_name: self.name.clone(),
            server_side,
            host: self.host.clone(),
            lookup_host: self.lookup_host,
            single_use: self.single_use,
            handshake_timeout,
            receive_buffer_bytes: self.tuning.receive_buffer_bytes.unwrap_or(0),
            direct_buffers,
            serializer: self.serializer.clone(),
            deserializer: self.deserializer.clone(),
            mapper: self.mapper.clone(),
            interceptors: self.interceptors.clone(),
            event_publisher: self.event_publisher.clone(),
        })
    }

    pub(crate) fn publish(&self, event: crate::collaborators::EndpointEvent) {
        if let Some(publisher) = &self.event_publisher {
            publisher.publish(event);
        }
    }

    /// 客户端目标地址解析：`host:port` 的全部候选地址。
    pub(crate) fn remote_addrs(&self) -> io::Result<Vec<SocketAddr>> {
        let host = self.host.as_deref().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "client endpoint without host")
        })?;
        let addrs: Vec<SocketAddr> = (host, self.port).to_socket_addrs()?.collect();
        if addrs.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("`{host}` resolved to no address"),
            ));
        }
        Ok(addrs)
    }
}

impl fmt::Debug for CommonAttributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommonAttributes")
            .field("name", &self.name)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("lookup_host", &self.lookup_host)
            .field("single_use", &self.single_use)
            .field("tuning", &self.tuning)
            .field("read_delay", &self.read_delay)
            .field("interceptors", &self.interceptors.len())
            .finish_non_exhaustive()
    }
}

/// 服务端专属属性。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerAttributes {
    backlog: i32,
    local_address: Option<String>,
}

impl Default for ServerAttributes {
    fn default() -> Self {
        Self {
            backlog: DEFAULT_BACKLOG,
            local_address: None,
        }
    }
}

impl ServerAttributes {
    pub(crate) fn set_backlog(&mut self, backlog: i32) {
        self.backlog = backlog;
    }

    pub(crate) fn set_local_address(&mut self, address: impl Into<String>) {
        self.local_address = Some(address.into());
    }

    pub fn backlog(&self) -> i32 {
        self.backlog
    }

    pub fn local_address(&self) -> Option<&str> {
        self.local_address.as_deref()
    }

    /// 监听地址：配置的本地地址，缺省为 IPv4 通配地址。
    pub(crate) fn bind_addr(&self, port: u16) -> io::Result<SocketAddr> {
        let host = self.local_address.as_deref().unwrap_or("0.0.0.0");
        (host, port).to_socket_addrs()?.next().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("`{host}` resolved to no address"),
            )
        })
    }
}

/// 服务端登记的活动连接，以连接 id 索引。
///
/// - **契约 (What)**：经 [`register`](Self::register) 登记的连接在关闭时自行移出；
///   连接只持有登记表的弱引用，登记表释放后回调退化为空操作。
#[derive(Debug)]
pub(crate) struct ConnectionRegistry<C> {
    connections: DashMap<ConnectionId, Arc<C>>,
}

impl<C> Default for ConnectionRegistry<C> {
    fn default() -> Self {
        Self {
            connections: DashMap::new(),
        }
    }
}

impl<C: Tracked> ConnectionRegistry<C> {
    pub(crate) fn register(self: &Arc<Self>, connection: &Arc<C>) {
        let id = connection.tracked_id().clone();
        let registry = Arc::downgrade(self);
        let evicted = id.clone();
        connection.on_close(Box::new(move || {
            if let Some(registry) = registry.upgrade() {
                registry.remove(&evicted);
            }
        }));
        self.connections.insert(id.clone(), Arc::clone(connection));
        // 回调挂上之前已关闭的连接不会触发回调，在此补偿移除。
        if !connection.is_open() {
            self.remove(&id);
        }
    }

    pub(crate) fn get(&self, id: &ConnectionId) -> Option<Arc<C>> {
        self.connections
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub(crate) fn remove(&self, id: &ConnectionId) -> Option<Arc<C>> {
        self.connections.remove(id).map(|(_, connection)| connection)
    }

    /// 剔除已关闭的连接后返回仍然打开的 id，按字典序排列。
    pub(crate) fn open_ids(&self) -> Vec<ConnectionId> {
        self.connections.retain(|_, connection| connection.is_open());
        let mut ids: Vec<ConnectionId> = self
            .connections
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        ids
    }

    pub(crate) fn drain(&self) -> Vec<Arc<C>> {
        let ids: Vec<ConnectionId> = self
            .connections
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        ids.iter().filter_map(|id| self.remove(id)).collect()
    }
}
