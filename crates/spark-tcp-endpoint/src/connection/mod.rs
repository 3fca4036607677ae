//! 端点产出的连接对象。
//!
//! - [`BlockingConnection`]：同步套接字（可选 TLS），每连接一个处理线程；
//! - [`NonBlockingConnection`]：Tokio 套接字（可选 TLS），由事件驱动运行时复用。
//!
//! 两者共享 [`ConnectionMetadata`] 与 [`ConnectionSettings`]，保证连接语义与端点变体无关。

mod blocking;
mod nonblocking;

pub use blocking::{BlockingConnection, NetStream};
pub use nonblocking::{AsyncStream, NonBlockingConnection};

use std::{
    fmt, io,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

use crate::collaborators::{
    Deserializer, EndpointEvent, EventPublisher, InterceptorChain, MessageMapper, Serializer,
};

/// 连接标识，格式为 `ip:peer_port:local_port:seq`。
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Arc<str>);

impl ConnectionId {
    pub(crate) fn next(peer: SocketAddr, local: SocketAddr) -> Self {
        static SEQUENCE: AtomicU64 = AtomicU64::new(0);
        let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed) + 1;
        Self(Arc::from(format!(
            "{}:{}:{}:{seq}",
            peer.ip(),
            peer.port(),
            local.port()
        )))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ConnectionId {
    fn from(value: &str) -> Self {
        Self(Arc::from(value))
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 连接关闭时执行一次的回调。
pub(crate) type CloseHook = Box<dyn FnOnce() + Send>;

/// 至多保存一个关闭回调；`fire` 取出后在锁外执行，重复调用无效果。
#[derive(Default)]
pub(crate) struct CloseHookSlot(Mutex<Option<CloseHook>>);

impl CloseHookSlot {
    pub(crate) fn set(&self, hook: CloseHook) {
        *self.0.lock() = Some(hook);
    }

    pub(crate) fn fire(&self) {
        let hook = self.0.lock().take();
        if let Some(hook) = hook {
            hook();
        }
    }
}

/// 可被服务端登记表跟踪的连接。
///
/// - **契约 (What)**：`on_close` 注册的回调在连接首次关闭时执行一次；
///   连接已关闭后才注册的回调不会执行，调用方需要自行复查 `is_open`。
pub(crate) trait Tracked: Send + Sync + 'static {
    fn tracked_id(&self) -> &ConnectionId;

    fn is_open(&self) -> bool;

    fn on_close(&self, hook: CloseHook);
}

/// 连接的只读元数据。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionMetadata {
    pub id: ConnectionId,
    pub peer_addr: SocketAddr,
    pub local_addr: SocketAddr,
    /// 对端标识：开启 `lookup_host` 的客户端连接使用配置的主机名，其余情况为对端 IP 文本。
    pub host_name: String,
    pub server_side: bool,
    pub single_use: bool,
    pub secure: bool,
}

/// 同一端点下所有连接共享的运行参数。
///
/// # 教案式说明
/// - **意图 (Why)**：端点在 `start` 时把构建阶段写入的公共属性冻结为一份快照，
///   交给连接策略与连接对象使用，避免连接反向持有端点；
/// - **契约 (What)**：字段在端点运行期间不可变；`handshake_timeout` 仅对非阻塞 TLS 策略有意义；
///   `direct_buffers` 为真时连接预分配 `receive_buffer_bytes` 大小的接收缓冲。
#[derive(Clone, Debug)]
pub struct ConnectionSettings {
    pub endpoint_name: String,
    pub server_side: bool,
    pub host: Option<String>,
    pub lookup_host: bool,
    pub single_use: bool,
    pub handshake_timeout: Option<Duration>,
    pub receive_buffer_bytes: usize,
    pub direct_buffers: bool,
    pub serializer: Option<Arc<dyn Serializer>>,
    pub deserializer: Option<Arc<dyn Deserializer>>,
    pub mapper: MessageMapper,
    pub interceptors: InterceptorChain,
    pub event_publisher: Option<Arc<dyn EventPublisher>>,
}

const DEFAULT_READ_CHUNK: usize = 8 * 1024;

impl ConnectionSettings {
    /// 以端点名称创建最小设置，其余字段取默认值。
    pub fn new(endpoint_name: impl Into<String>, server_side: bool) -> Self {
        Self {
            endpoint_name: endpoint_name.into(),
            server_side,
            host: None,
            lookup_host: true,
            single_use: false,
            handshake_timeout: None,
            receive_buffer_bytes: 0,
            direct_buffers: false,
            serializer: None,
            deserializer: None,
            mapper: MessageMapper::default(),
            interceptors: InterceptorChain::default(),
            event_publisher: None,
        }
    }

    pub(crate) fn metadata(
        &self,
        peer_addr: SocketAddr,
        local_addr: SocketAddr,
        secure: bool,
    ) -> ConnectionMetadata {
        let host_name = match (&self.host, self.lookup_host && !self.server_side) {
            (Some(host), true) => host.clone(),
            _ => peer_addr.ip().to_string(),
        };
        ConnectionMetadata {
            id: ConnectionId::next(peer_addr, local_addr),
            peer_addr,
            local_addr,
            host_name,
            server_side: self.server_side,
            single_use: self.single_use,
            secure,
        }
    }

    pub(crate) fn read_chunk(&self) -> usize {
        if self.receive_buffer_bytes > 0 {
            self.receive_buffer_bytes
        } else {
            DEFAULT_READ_CHUNK
        }
    }

    pub(crate) fn initial_buffer_capacity(&self) -> usize {
        if self.direct_buffers {
            self.read_chunk()
        } else {
            0
        }
    }

    pub(crate) fn publish(&self, event: EndpointEvent) {
        if let Some(publisher) = &self.event_publisher {
            publisher.publish(event);
        }
    }

    /// 单次交换结束后是否应关闭：服务端在发送后关闭，客户端在接收后关闭。
    pub(crate) fn closes_after_send(&self) -> bool {
        self.single_use && self.server_side
    }

    pub(crate) fn closes_after_receive(&self) -> bool {
        self.single_use && !self.server_side
    }
}

/// 使用序列化器编码一帧；未配置序列化器时原样透传。
pub(crate) fn encode_frame(settings: &ConnectionSettings, payload: &[u8]) -> io::Result<BytesMut> {
    let mut frame = BytesMut::with_capacity(payload.len());
    match &settings.serializer {
        Some(serializer) => serializer.serialize(payload, &mut frame)?,
        None => frame.extend_from_slice(payload),
    }
    Ok(frame)
}

/// 使用反序列化器从缓冲切出一帧；未配置时把已缓冲的字节整体作为一帧。
pub(crate) fn decode_frame(
    settings: &ConnectionSettings,
    buffer: &mut BytesMut,
) -> io::Result<Option<Bytes>> {
    match &settings.deserializer {
        Some(deserializer) => deserializer.deserialize(buffer),
        None if buffer.is_empty() => Ok(None),
        None => Ok(Some(buffer.split().freeze())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_lookup_host_uses_configured_name() {
        let mut settings = ConnectionSettings::new("client", false);
        settings.host = Some("broker.internal".to_owned());
        let peer: SocketAddr = "10.0.0.7:9000".parse().expect("peer");
        let local: SocketAddr = "10.0.0.1:50000".parse().expect("local");

        assert_eq!(settings.metadata(peer, local, false).host_name, "broker.internal");

        settings.lookup_host = false;
        assert_eq!(settings.metadata(peer, local, false).host_name, "10.0.0.7");
    }

    #[test]
    fn connection_ids_are_unique() {
        let peer: SocketAddr = "127.0.0.1:1".parse().expect("peer");
        let local: SocketAddr = "127.0.0.1:2".parse().expect("local");
        let first = ConnectionId::next(peer, local);
        let second = ConnectionId::next(peer, local);
        assert_ne!(first, second);
        assert!(first.as_str().starts_with("127.0.0.1:1:2:"));
    }

    #[test]
    fn direct_buffers_preallocate_read_chunk() {
        let mut settings = ConnectionSettings::new("server", true);
        assert_eq!(settings.initial_buffer_capacity(), 0);
        settings.direct_buffers = true;
        settings.receive_buffer_bytes = 4096;
        assert_eq!(settings.initial_buffer_capacity(), 4096);
    }
}
