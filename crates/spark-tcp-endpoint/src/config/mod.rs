//! 端点配置：可变的 [`EndpointConfig`] 与声明式的 [`EndpointDefinition`]。
//!
//! # 教案式注释
//!
//! ## 意图 (Why)
//! - 配置阶段允许以任意顺序写入属性，构建阶段才一次性解析为端点；
//! - 配置在交给 [`EndpointBuilder`](crate::EndpointBuilder) 时被移动，所有权转移即保证“构建后不再修改”。
//!
//! ## 契约 (What)
//! - `set_role`、`set_host`、`set_local_address` 在写入时即校验，其余 setter 为纯赋值；
//! - [`EndpointConfig::validate`] 校验角色、客户端主机与直接缓冲组合，构建器在任何实例化之前调用。

mod declarative;

pub use declarative::EndpointDefinition;

use std::{fmt, str::FromStr, sync::Arc};

use crate::{
    collaborators::{
        Deserializer, EventPublisher, InterceptorChain, MessageMapper, Serializer, TaskExecutor,
    },
    error::EndpointError,
    ssl::SslContextProvider,
    strategy::{
        BlockingConnectionStrategy, NonBlockingConnectionStrategy, SocketCustomizer,
        SocketFactoryStrategy,
    },
};

/// 端点角色。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    Server,
    Client,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Server => "server",
            Role::Client => "client",
        }
    }
}

impl FromStr for Role {
    type Err = EndpointError;

    /// 大小写不敏感地解析 `server` / `client`，不做首尾空白裁剪。
    fn from_str(token: &str) -> Result<Self, Self::Err> {
        if token.eq_ignore_ascii_case("server") {
            Ok(Role::Server)
        } else if token.eq_ignore_ascii_case("client") {
            Ok(Role::Client)
        } else {
            Err(EndpointError::invalid(
                "role",
                token,
                "expected `server` or `client`",
            ))
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 传输模式：阻塞（每连接一线程）或非阻塞（事件驱动）。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum TransportMode {
    #[default]
    Blocking,
    NonBlocking,
}

impl TransportMode {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportMode::Blocking => "blocking",
            TransportMode::NonBlocking => "non-blocking",
        }
    }
}

impl FromStr for TransportMode {
    type Err = EndpointError;

    fn from_str(token: &str) -> Result<Self, Self::Err> {
        let normalized = token.to_ascii_lowercase();
        match normalized.as_str() {
            "blocking" | "net" => Ok(TransportMode::Blocking),
            "non-blocking" | "nonblocking" | "nio" => Ok(TransportMode::NonBlocking),
            _ => Err(EndpointError::invalid(
                "transport",
                token,
                "expected `blocking`/`net` or `non-blocking`/`nio`",
            )),
        }
    }
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 默认监听队列长度。
pub const DEFAULT_BACKLOG: i32 = 5;

/// 端点的全部可配置属性。
///
/// # 教案式说明
/// - **意图 (Why)**：承载调用方在配置阶段写入的一切，包括套接字调优、可插拔策略与外部协作者；
/// - **契约 (What)**：
///   - 缓冲区与超时取 `0` 表示沿用操作系统默认值；
///   - `so_linger`、`traffic_class` 为 `None` 时不写入套接字，设置后原样保存（包括 0 与负数）；
///   - `ssl_handshake_timeout_ms` 仅对“非阻塞 + SSL”生效，其余组合下被忽略；
///   - `using_direct_buffers` 只能与非阻塞模式组合，否则 [`validate`](Self::validate) 失败。
#[derive(Debug)]
pub struct EndpointConfig {
    role: Option<Role>,
    transport: TransportMode,
    host: Option<String>,
    port: u16,
    so_timeout_ms: u64,
    so_send_buffer_bytes: usize,
    so_receive_buffer_bytes: usize,
    tcp_no_delay: bool,
    so_linger: Option<i32>,
    so_keep_alive: bool,
    traffic_class: Option<i32>,
    single_use: bool,
    backlog: i32,
    local_address: Option<String>,
    lookup_host: bool,
    apply_sequence: bool,
    read_delay_ms: Option<u64>,
    socket_factory_strategy: Option<Arc<dyn SocketFactoryStrategy>>,
    non_blocking_connection_strategy: Option<Arc<dyn NonBlockingConnectionStrategy>>,
    blocking_connection_strategy: Option<Arc<dyn BlockingConnectionStrategy>>,
    socket_customizer: Option<Arc<dyn SocketCustomizer>>,
    ssl_context_provider: Option<Arc<dyn SslContextProvider>>,
    ssl_handshake_timeout_ms: Option<u64>,
    using_direct_buffers: Option<bool>,
    serializer: Option<Arc<dyn Serializer>>,
    deserializer: Option<Arc<dyn Deserializer>>,
    message_mapper: Option<MessageMapper>,
    interceptor_chain: Option<InterceptorChain>,
    task_executor: Option<Arc<dyn TaskExecutor>>,
    event_publisher: Option<Arc<dyn EventPublisher>>,
    endpoint_name: Option<String>,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            role: None,
            transport: TransportMode::Blocking,
            host: None,
            port: 0,
            so_timeout_ms: 0,
            so_send_buffer_bytes: 0,
            so_receive_buffer_bytes: 0,
            tcp_no_delay: false,
            so_linger: None,
            so_keep_alive: false,
            traffic_class: None,
            single_use: false,
            backlog: DEFAULT_BACKLOG,
            local_address: None,
            lookup_host: true,
            apply_sequence: false,
            read_delay_ms: None,
            socket_factory_strategy: None,
            non_blocking_connection_strategy: None,
            blocking_connection_strategy: None,
            socket_customizer: None,
            ssl_context_provider: None,
            ssl_handshake_timeout_ms: None,
            using_direct_buffers: None,
            serializer: None,
            deserializer: None,
            message_mapper: None,
            interceptor_chain: None,
            task_executor: None,
            event_publisher: None,
            endpoint_name: None,
        }
    }
}

impl EndpointConfig {
    /// 以已知角色创建配置。
    pub fn new(role: Role) -> Self {
        Self {
            role: Some(role),
            ..Self::default()
        }
    }

    /// 以文本角色创建配置，非法取值立即失败。
    pub fn from_role_token(token: &str) -> Result<Self, EndpointError> {
        Ok(Self::new(token.parse()?))
    }

    pub fn set_role(&mut self, token: &str) -> Result<&mut Self, EndpointError> {
        self.role = Some(token.parse()?);
        Ok(self)
    }

    pub fn set_transport_mode(&mut self, mode: TransportMode) -> &mut Self {
        self.transport = mode;
        self
    }

    pub fn set_host(&mut self, host: &str) -> Result<&mut Self, EndpointError> {
        if host.trim().is_empty() {
            return Err(EndpointError::invalid("host", host, "host must not be empty"));
        }
        self.host = Some(host.to_owned());
        Ok(self)
    }

    pub fn set_port(&mut self, port: u16) -> &mut Self {
        self.port = port;
        self
    }

    pub fn set_so_timeout_ms(&mut self, millis: u64) -> &mut Self {
        self.so_timeout_ms = millis;
        self
    }

    pub fn set_so_send_buffer_bytes(&mut self, bytes: usize) -> &mut Self {
        self.so_send_buffer_bytes = bytes;
        self
    }

    pub fn set_so_receive_buffer_bytes(&mut self, bytes: usize) -> &mut Self {
        self.so_receive_buffer_bytes = bytes;
        self
    }

    pub fn set_tcp_no_delay(&mut self, no_delay: bool) -> &mut Self {
        self.tcp_no_delay = no_delay;
        self
    }

    pub fn set_so_linger(&mut self, linger: i32) -> &mut Self {
        self.so_linger = Some(linger);
        self
    }

    pub fn set_so_keep_alive(&mut self, keep_alive: bool) -> &mut Self {
        self.so_keep_alive = keep_alive;
        self
    }

    pub fn set_traffic_class(&mut self, traffic_class: i32) -> &mut Self {
        self.traffic_class = Some(traffic_class);
        self
    }

    pub fn set_single_use(&mut self, single_use: bool) -> &mut Self {
        self.single_use = single_use;
        self
    }

    pub fn set_backlog(&mut self, backlog: i32) -> &mut Self {
        self.backlog = backlog;
        self
    }

    pub fn set_local_address(&mut self, address: &str) -> Result<&mut Self, EndpointError> {
        if address.trim().is_empty() {
            return Err(EndpointError::invalid(
                "local_address",
                address,
                "local address must not be empty",
            ));
        }
        self.local_address = Some(address.to_owned());
        Ok(self)
    }

    pub fn set_lookup_host(&mut self, lookup_host: bool) -> &mut Self {
        self.lookup_host = lookup_host;
        self
    }

    pub fn set_apply_sequence(&mut self, apply_sequence: bool) -> &mut Self {
        self.apply_sequence = apply_sequence;
        self
    }

    pub fn set_read_delay_ms(&mut self, millis: u64) -> &mut Self {
        self.read_delay_ms = Some(millis);
        self
    }

    pub fn set_socket_factory_strategy(
        &mut self,
        strategy: Arc<dyn SocketFactoryStrategy>,
    ) -> &mut Self {
        self.socket_factory_strategy = Some(strategy);
        self
    }

    pub fn set_non_blocking_connection_strategy(
        &mut self,
        strategy: Arc<dyn NonBlockingConnectionStrategy>,
    ) -> &mut Self {
        self.non_blocking_connection_strategy = Some(strategy);
        self
    }

    pub fn set_blocking_connection_strategy(
        &mut self,
        strategy: Arc<dyn BlockingConnectionStrategy>,
    ) -> &mut Self {
        self.blocking_connection_strategy = Some(strategy);
        self
    }

    pub fn set_socket_customizer(&mut self, customizer: Arc<dyn SocketCustomizer>) -> &mut Self {
        self.socket_customizer = Some(customizer);
        self
    }

    pub fn set_ssl_context_provider(&mut self, provider: Arc<dyn SslContextProvider>) -> &mut Self {
        self.ssl_context_provider = Some(provider);
        self
    }

    pub fn set_ssl_handshake_timeout_ms(&mut self, millis: u64) -> &mut Self {
        self.ssl_handshake_timeout_ms = Some(millis);
        self
    }

    pub fn set_using_direct_buffers(&mut self, direct: bool) -> &mut Self {
        self.using_direct_buffers = Some(direct);
        self
    }

    pub fn set_serializer(&mut self, serializer: Arc<dyn Serializer>) -> &mut Self {
        self.serializer = Some(serializer);
        self
    }

    pub fn set_deserializer(&mut self, deserializer: Arc<dyn Deserializer>) -> &mut Self {
        self.deserializer = Some(deserializer);
        self
    }

    pub fn set_message_mapper(&mut self, mapper: MessageMapper) -> &mut Self {
        self.message_mapper = Some(mapper);
        self
    }

    pub fn set_interceptor_chain(&mut self, chain: InterceptorChain) -> &mut Self {
        self.interceptor_chain = Some(chain);
        self
    }

    pub fn set_task_executor(&mut self, executor: Arc<dyn TaskExecutor>) -> &mut Self {
        self.task_executor = Some(executor);
        self
    }

    pub fn set_event_publisher(&mut self, publisher: Arc<dyn EventPublisher>) -> &mut Self {
        self.event_publisher = Some(publisher);
        self
    }

    pub fn set_endpoint_name(&mut self, name: impl Into<String>) -> &mut Self {
        self.endpoint_name = Some(name.into());
        self
    }

    /// 校验跨字段约束。
    ///
    /// - 缺少角色 → `InvalidConfiguration { field: "role" }`；
    /// - 客户端缺少主机 → `InvalidConfiguration { field: "host" }`；
    /// - 阻塞模式声明了直接缓冲 → `InvalidConfiguration { field: "using_direct_buffers" }`。
    pub fn validate(&self) -> Result<(), EndpointError> {
        let role = self
            .role
            .ok_or_else(|| EndpointError::invalid("role", "<unset>", "role is required"))?;
        if role == Role::Client && self.host.as_deref().is_none_or(|host| host.trim().is_empty()) {
            return Err(EndpointError::invalid(
                "host",
                "<unset>",
                "client endpoints require a host",
            ));
        }
        if let (TransportMode::Blocking, Some(direct)) = (self.transport, self.using_direct_buffers)
        {
            return Err(EndpointError::invalid(
                "using_direct_buffers",
                direct,
                "direct buffers are only supported by non-blocking endpoints",
            ));
        }
        Ok(())
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn transport_mode(&self) -> TransportMode {
        self.transport
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn so_timeout_ms(&self) -> u64 {
        self.so_timeout_ms
    }

    pub fn so_send_buffer_bytes(&self) -> usize {
        self.so_send_buffer_bytes
    }

    pub fn so_receive_buffer_bytes(&self) -> usize {
        self.so_receive_buffer_bytes
    }

    pub fn tcp_no_delay(&self) -> bool {
        self.tcp_no_delay
    }

    pub fn so_linger(&self) -> Option<i32> {
        self.so_linger
    }

    pub fn so_keep_alive(&self) -> bool {
        self.so_keep_alive
    }

    pub fn traffic_class(&self) -> Option<i32> {
        self.traffic_class
    }

    pub fn single_use(&self) -> bool {
        self.single_use
    }

    pub fn backlog(&self) -> i32 {
        self.backlog
    }

    pub fn local_address(&self) -> Option<&str> {
        self.local_address.as_deref()
    }

    pub fn lookup_host(&self) -> bool {
        self.lookup_host
    }

    pub fn apply_sequence(&self) -> bool {
        self.apply_sequence
    }

    pub fn read_delay_ms(&self) -> Option<u64> {
        self.read_delay_ms
    }

    pub fn socket_factory_strategy(&self) -> Option<&Arc<dyn SocketFactoryStrategy>> {
        self.socket_factory_strategy.as_ref()
    }

    pub fn non_blocking_connection_strategy(
        &self,
    ) -> Option<&Arc<dyn NonBlockingConnectionStrategy>> {
        self.non_blocking_connection_strategy.as_ref()
    }

    pub fn blocking_connection_strategy(&self) -> Option<&Arc<dyn BlockingConnectionStrategy>> {
        self.blocking_connection_strategy.as_ref()
    }

    pub fn socket_customizer(&self) -> Option<&Arc<dyn SocketCustomizer>> {
        self.socket_customizer.as_ref()
    }

    pub fn ssl_context_provider(&self) -> Option<&Arc<dyn SslContextProvider>> {
        self.ssl_context_provider.as_ref()
    }

    pub fn ssl_handshake_timeout_ms(&self) -> Option<u64> {
        self.ssl_handshake_timeout_ms
    }

    pub fn using_direct_buffers(&self) -> Option<bool> {
        self.using_direct_buffers
    }

    pub fn serializer(&self) -> Option<&Arc<dyn Serializer>> {
        self.serializer.as_ref()
    }

    pub fn deserializer(&self) -> Option<&Arc<dyn Deserializer>> {
        self.deserializer.as_ref()
    }

    pub fn message_mapper(&self) -> Option<&MessageMapper> {
        self.message_mapper.as_ref()
    }

    pub fn interceptor_chain(&self) -> Option<&InterceptorChain> {
        self.interceptor_chain.as_ref()
    }

    pub fn task_executor(&self) -> Option<&Arc<dyn TaskExecutor>> {
        self.task_executor.as_ref()
    }

    pub fn event_publisher(&self) -> Option<&Arc<dyn EventPublisher>> {
        self.event_publisher.as_ref()
    }

    pub fn endpoint_name(&self) -> Option<&str> {
        self.endpoint_name.as_deref()
    }
}
