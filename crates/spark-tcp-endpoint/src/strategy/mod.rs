//! 可插拔策略：套接字创建、连接包装与套接字定制。
//!
//! # 教案式注释
//!
//! ## 意图 (Why)
//! - 端点变体只负责“监听/建连 + 生命周期”，与“如何得到一个可用连接”解耦；
//! - 这些能力以 trait 注入，由 [`StrategyResolver`] 依据“显式配置优先、其次按 SSL 是否存在取默认”的规则挑选。
//!
//! ## 契约 (What)
//! - 每个策略都提供稳定的 [`name`](SocketFactoryStrategy::name)，用于诊断日志与结构等价性判断；
//! - 阻塞端点消费 [`SocketFactoryStrategy`] + [`BlockingConnectionStrategy`]，
//!   非阻塞端点消费 [`NonBlockingConnectionStrategy`]，二者都消费 [`SocketCustomizer`]。

mod connection;
mod resolver;
mod socket_factory;

pub use connection::{
    DEFAULT_HANDSHAKE_TIMEOUT, DefaultBlockingConnectionStrategy, DefaultNonBlockingConnectionStrategy,
    NoopSocketCustomizer, TlsNonBlockingConnectionStrategy,
};
pub use resolver::{ResolvedStrategies, StrategyResolver};
pub use socket_factory::{PlainSocketFactory, TlsSocketFactory};

use std::{
    fmt, io,
    net::{SocketAddr, TcpStream},
    sync::Arc,
};

use async_trait::async_trait;
use socket2::{Domain, Protocol, SockRef, Socket, Type};

use crate::connection::{
    BlockingConnection, ConnectionSettings, NetStream, NonBlockingConnection,
};

/// 阻塞端点的套接字工厂。
///
/// - `create_socket`：为监听或建连创建原始套接字，默认实现按地址族创建 TCP 套接字；
/// - `wrap_accepted` / `wrap_connected`：把已建立的 TCP 流包装为 [`NetStream`]，
///   TLS 实现在此完成握手，握手时长受套接字读超时约束。
pub trait SocketFactoryStrategy: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    fn create_socket(&self, addr: &SocketAddr) -> io::Result<Socket> {
        Socket::new(Domain::for_address(*addr), Type::STREAM, Some(Protocol::TCP))
    }

    fn wrap_accepted(&self, stream: TcpStream) -> io::Result<NetStream>;

    fn wrap_connected(&self, stream: TcpStream, server_name: &str) -> io::Result<NetStream>;
}

/// 阻塞连接包装策略：把握手完成的流变为 [`BlockingConnection`]。
pub trait BlockingConnectionStrategy: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    fn establish(
        &self,
        stream: NetStream,
        settings: Arc<ConnectionSettings>,
    ) -> io::Result<BlockingConnection>;
}

/// 非阻塞连接包装策略。
///
/// # 契约 (What)
/// - `accept` 处理服务端接入的流，`connect` 处理客户端建立的流；
/// - TLS 实现负责握手，并以 [`ConnectionSettings::handshake_timeout`] 为上限；
/// - 返回的连接已执行拦截器并发布 `ConnectionOpened`。
#[async_trait]
pub trait NonBlockingConnectionStrategy: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    async fn accept(
        &self,
        stream: tokio::net::TcpStream,
        settings: Arc<ConnectionSettings>,
    ) -> io::Result<NonBlockingConnection>;

    async fn connect(
        &self,
        stream: tokio::net::TcpStream,
        server_name: &str,
        settings: Arc<ConnectionSettings>,
    ) -> io::Result<NonBlockingConnection>;
}

/// 在端点写入标准套接字选项之后，对套接字做最后的定制。
pub trait SocketCustomizer: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// 监听套接字在 `bind` 之前调用。
    fn post_process_listener(&self, _socket: SockRef<'_>) -> io::Result<()> {
        Ok(())
    }

    /// 接入或建立的连接套接字在包装之前调用。
    fn post_process_stream(&self, _socket: SockRef<'_>) -> io::Result<()> {
        Ok(())
    }
}
