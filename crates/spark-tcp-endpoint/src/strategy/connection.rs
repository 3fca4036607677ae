use std::{io, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::debug;

use super::{
    BlockingConnectionStrategy, NonBlockingConnectionStrategy, SocketCustomizer,
    socket_factory::server_name_of,
};
use crate::{
    connection::{AsyncStream, BlockingConnection, ConnectionSettings, NetStream, NonBlockingConnection},
    ssl::SslContextProvider,
};

/// 未配置握手超时时，非阻塞 TLS 握手的默认上限。
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// 阻塞端点的默认连接策略：直接包装为 [`BlockingConnection`]。
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultBlockingConnectionStrategy;

impl BlockingConnectionStrategy for DefaultBlockingConnectionStrategy {
    fn name(&self) -> &'static str {
        "blocking"
    }

    fn establish(
        &self,
        stream: NetStream,
        settings: Arc<ConnectionSettings>,
    ) -> io::Result<BlockingConnection> {
        BlockingConnection::open(stream, settings)
    }
}

/// 非阻塞端点在没有 SSL 上下文时的默认策略。
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultNonBlockingConnectionStrategy;

#[async_trait]
impl NonBlockingConnectionStrategy for DefaultNonBlockingConnectionStrategy {
    fn name(&self) -> &'static str {
        "non-blocking"
    }

    async fn accept(
        &self,
        stream: TcpStream,
        settings: Arc<ConnectionSettings>,
    ) -> io::Result<NonBlockingConnection> {
        NonBlockingConnection::open(AsyncStream::Plain(stream), settings)
    }

    async fn connect(
        &self,
        stream: TcpStream,
        _server_name: &str,
        settings: Arc<ConnectionSettings>,
    ) -> io::Result<NonBlockingConnection> {
        NonBlockingConnection::open(AsyncStream::Plain(stream), settings)
    }
}

/// 感知 TLS 的非阻塞连接策略。
///
/// # 教案式说明
/// - **意图 (Why)**：在事件驱动运行时中完成握手，不占用额外线程；
/// - **逻辑 (How)**：握手前读取 [`SslContextProvider`] 的最新配置，交给 `tokio-rustls` 的
///   [`TlsAcceptor`]/[`TlsConnector`]，并以 `tokio::time::timeout` 约束握手时长；
/// - **契约 (What)**：超时返回 `io::ErrorKind::TimedOut`；上限取 [`ConnectionSettings::handshake_timeout`]，
///   未设置时为 [`DEFAULT_HANDSHAKE_TIMEOUT`]。
#[derive(Clone, Debug)]
pub struct TlsNonBlockingConnectionStrategy {
    provider: Arc<dyn SslContextProvider>,
}

impl TlsNonBlockingConnectionStrategy {
    pub fn new(provider: Arc<dyn SslContextProvider>) -> Self {
        Self { provider }
    }

    pub fn provider(&self) -> &Arc<dyn SslContextProvider> {
        &self.provider
    }
}

#[async_trait]
impl NonBlockingConnectionStrategy for TlsNonBlockingConnectionStrategy {
    fn name(&self) -> &'static str {
        "non-blocking-tls"
    }

    async fn accept(
        &self,
        stream: TcpStream,
        settings: Arc<ConnectionSettings>,
    ) -> io::Result<NonBlockingConnection> {
        let acceptor = TlsAcceptor::from(self.provider.server_config()?);
        let tls = bounded(&settings, acceptor.accept(stream)).await?;
        debug!(endpoint = %settings.endpoint_name, "tls handshake accepted");
        NonBlockingConnection::open(AsyncStream::TlsServer(Box::new(tls)), settings)
    }

    async fn connect(
        &self,
        stream: TcpStream,
        server_name: &str,
        settings: Arc<ConnectionSettings>,
    ) -> io::Result<NonBlockingConnection> {
        let connector = TlsConnector::from(self.provider.client_config()?);
        let domain = server_name_of(server_name)?;
        let tls = bounded(&settings, connector.connect(domain, stream)).await?;
        debug!(endpoint = %settings.endpoint_name, server_name, "tls handshake connected");
        NonBlockingConnection::open(AsyncStream::TlsClient(Box::new(tls)), settings)
    }
}

async fn bounded<T>(
    settings: &ConnectionSettings,
    handshake: impl Future<Output = io::Result<T>>,
) -> io::Result<T> {
    let limit = settings
        .handshake_timeout
        .unwrap_or(DEFAULT_HANDSHAKE_TIMEOUT);
    match tokio::time::timeout(limit, handshake).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("tls handshake exceeded {limit:?}"),
        )),
    }
}

/// 不做任何定制的默认套接字定制器。
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopSocketCustomizer;

impl SocketCustomizer for NoopSocketCustomizer {
    fn name(&self) -> &'static str {
        "noop"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssl::StaticSslContext;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn handshake_times_out_when_peer_stays_silent() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let _silent = TcpStream::connect(addr).await.expect("connect");
        let (accepted, _) = listener.accept().await.expect("accept");

        let mut settings = ConnectionSettings::new("tls-server", true);
        settings.handshake_timeout = Some(Duration::from_millis(50));
        let strategy = TlsNonBlockingConnectionStrategy::new(Arc::new(
            StaticSslContext::new().with_server_config(Arc::new(empty_server_config())),
        ));

        let err = strategy
            .accept(accepted, Arc::new(settings))
            .await
            .expect_err("silent peer");
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    fn empty_server_config() -> rustls::ServerConfig {
        #[derive(Debug)]
        struct NoCert;
        impl rustls::server::ResolvesServerCert for NoCert {
            fn resolve(
                &self,
                _hello: rustls::server::ClientHello<'_>,
            ) -> Option<Arc<rustls::sign::CertifiedKey>> {
                None
            }
        }
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
        rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(NoCert))
    }

    #[test]
    fn default_strategy_names_are_stable() {
        assert_eq!(DefaultBlockingConnectionStrategy.name(), "blocking");
        assert_eq!(DefaultNonBlockingConnectionStrategy.name(), "non-blocking");
        assert_eq!(NoopSocketCustomizer.name(), "noop");
    }
}
