#![doc = r#"
# spark-tcp-endpoint

## 设计动机（Why）
- **定位**：把一份声明式的 TCP 端点配置（角色、传输模式、安全材料、套接字调优、可插拔策略）
  解析为唯一、完整装配、可运行的端点：阻塞服务端、阻塞客户端、非阻塞服务端、非阻塞客户端之一，可选 TLS 包装；
- **核心难点**：在配置只给出一部分的情况下，确定性地选择变体、按正确顺序写入属性、
  组合正确的策略，并且绝不产出“只配置了一半”的端点。

## 核心契约（What）
- [`EndpointConfig`]：配置阶段的可变值对象，`set_role`/`set_host`/`set_local_address` 写入即校验；
- [`EndpointDefinition`]：TOML 形式的声明式定义，经由同一组 setter 转换为配置；
- [`StrategyResolver`]：显式策略优先，其次依据 SSL 上下文是否存在选择默认实现；
- [`EndpointBuilder`]：一次性构建，并发调用也只构造一次；
- [`EndpointHandle`]：容器使用的生命周期门面，构建前调用返回 [`EndpointError::NotBuilt`]。

## 实现策略（How）
- 两阶段协议：配置被移动进构建器，所有权转移即“构建后不可修改”；
- 封闭枚举 [`Endpoint`] 表达四种变体，变体选择是对 `(Role, TransportMode)` 的穷尽匹配；
- 阻塞传输基于 `std::net` + `socket2` + `rustls::StreamOwned`，非阻塞传输基于 Tokio current-thread 运行时 + `tokio-rustls`；
- 日志统一经由 `tracing` 门面输出，库本身不安装订阅者。

## 风险与考量（Trade-offs）
- 非阻塞服务端登记的连接依附于端点内部运行时的 I/O 驱动，端点停止后连接即失效；
- `lookup_host` 不做反向 DNS：客户端连接以配置的主机名标识对端，服务端连接以对端 IP 标识；
- 重连、连接池与报文分帧不在本 crate 范围内，分帧通过 [`Serializer`]/[`Deserializer`] 注入。
"#]

mod builder;
mod collaborators;
mod config;
mod connection;
mod endpoint;
pub mod error;
mod handle;
mod ssl;
pub mod strategy;

pub use builder::EndpointBuilder;
pub use collaborators::{
    ConnectionInterceptor, Deserializer, EndpointEvent, EventPublisher, InterceptorChain,
    MessageEnvelope, MessageMapper, Serializer, TaskExecutor, ThreadPerTaskExecutor,
};
pub use config::{DEFAULT_BACKLOG, EndpointConfig, EndpointDefinition, Role, TransportMode};
pub use connection::{
    AsyncStream, BlockingConnection, ConnectionId, ConnectionMetadata, ConnectionSettings,
    NetStream, NonBlockingConnection,
};
pub use endpoint::{
    BlockingClientEndpoint, BlockingServerEndpoint, CommonAttributes, DEFAULT_READ_DELAY,
    Endpoint, EndpointKind, NonBlockingAttributes, NonBlockingClientEndpoint,
    NonBlockingServerEndpoint, ServerAttributes, SocketTuning,
};
pub use error::EndpointError;
pub use handle::{EndpointHandle, ObjectKind};
pub use ssl::{HotReloadingSslContext, SslContextProvider, StaticSslContext};
pub use strategy::StrategyResolver;
