use std::{io, net::TcpStream, ops::DerefMut, sync::Arc};

use rustls::{ClientConnection, ConnectionCommon, ServerConnection, StreamOwned, pki_types::ServerName};
use tracing::debug;

use super::SocketFactoryStrategy;
use crate::{connection::NetStream, ssl::SslContextProvider};

/// 明文套接字工厂，不做任何包装。
#[derive(Clone, Copy, Debug, Default)]
pub struct PlainSocketFactory;

impl SocketFactoryStrategy for PlainSocketFactory {
    fn name(&self) -> &'static str {
        "plain"
    }

    fn wrap_accepted(&self, stream: TcpStream) -> io::Result<NetStream> {
        Ok(NetStream::Plain(stream))
    }

    fn wrap_connected(&self, stream: TcpStream, _server_name: &str) -> io::Result<NetStream> {
        Ok(NetStream::Plain(stream))
    }
}

/// 基于 `rustls` 的阻塞 TLS 套接字工厂。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 阻塞端点在接入/建连后立即完成握手，连接对象拿到的已是可读写的加密流；
///
/// ## 逻辑 (How)
/// - 每次握手从 [`SslContextProvider`] 读取最新配置，热替换的证书对后续连接立即生效；
/// - 循环调用 `complete_io` 直到握手结束；阻塞套接字的读超时即握手上限。
///
/// ## 契约 (What)
/// - 提供者缺少对应一侧配置、证书校验失败或对端中途断开时返回 `io::Error`，连接不会被创建。
#[derive(Clone, Debug)]
pub struct TlsSocketFactory {
    provider: Arc<dyn SslContextProvider>,
}

impl TlsSocketFactory {
    pub fn new(provider: Arc<dyn SslContextProvider>) -> Self {
        Self { provider }
    }

    pub fn provider(&self) -> &Arc<dyn SslContextProvider> {
        &self.provider
    }
}

impl SocketFactoryStrategy for TlsSocketFactory {
    fn name(&self) -> &'static str {
        "tls"
    }

    fn wrap_accepted(&self, mut stream: TcpStream) -> io::Result<NetStream> {
        let config = self.provider.server_config()?;
        let mut session = ServerConnection::new(config).map_err(tls_error)?;
        drive_handshake(&mut session, &mut stream)?;
        Ok(NetStream::TlsServer(Box::new(StreamOwned::new(
            session, stream,
        ))))
    }

    fn wrap_connected(&self, mut stream: TcpStream, server_name: &str) -> io::Result<NetStream> {
        let config = self.provider.client_config()?;
        let mut session =
            ClientConnection::new(config, server_name_of(server_name)?).map_err(tls_error)?;
        drive_handshake(&mut session, &mut stream)?;
        Ok(NetStream::TlsClient(Box::new(StreamOwned::new(
            session, stream,
        ))))
    }
}

fn drive_handshake<S, Data>(session: &mut S, stream: &mut TcpStream) -> io::Result<()>
where
    S: DerefMut<Target = ConnectionCommon<Data>>,
{
    while session.is_handshaking() {
        session.complete_io(stream)?;
    }
    debug!(
        peer = ?stream.peer_addr().ok(),
        protocol = ?session.protocol_version(),
        "tls handshake completed"
    );
    Ok(())
}

pub(crate) fn server_name_of(host: &str) -> io::Result<ServerName<'static>> {
    ServerName::try_from(host.to_owned())
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))
}

pub(crate) fn tls_error(err: rustls::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssl::StaticSslContext;

    #[test]
    fn tls_factory_requires_server_material() {
        let factory = TlsSocketFactory::new(Arc::new(StaticSslContext::new()));
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let client = TcpStream::connect(listener.local_addr().expect("addr")).expect("connect");
        let (accepted, _) = listener.accept().expect("accept");
        drop(client);

        let err = factory.wrap_accepted(accepted).expect_err("no server config");
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn invalid_server_name_is_rejected() {
        let err = server_name_of("not a host name!").expect_err("invalid");
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
