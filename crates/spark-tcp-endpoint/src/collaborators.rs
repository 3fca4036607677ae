//! 端点消费的外部协作者接口。
//!
//! # 教案式注释
//!
//! ## 意图 (Why)
//! - 编解码、消息映射、拦截器、任务执行器与事件发布都由端点之外的组件实现，
//!   本模块只声明它们在端点边界上的最小契约；
//! - 端点对这些协作者“按需使用、缺省容忍”：缺少事件发布器时静默跳过，缺少编解码器时按原始字节透传。
//!
//! ## 契约 (What)
//! - 所有 trait 均要求 `Send + Sync + Debug`，以便在接入线程与连接线程之间共享 `Arc<dyn _>`；
//! - [`MessageMapper`] 与 [`InterceptorChain`] 为具体值类型，构建阶段会被克隆进端点，之后与配置解耦。

use std::{
    fmt, io,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    thread,
};

use bytes::{Bytes, BytesMut};

use crate::connection::{ConnectionId, ConnectionMetadata};

/// 将一条逻辑消息编码到发送缓冲区。
pub trait Serializer: Send + Sync + fmt::Debug {
    fn serialize(&self, payload: &[u8], dst: &mut BytesMut) -> io::Result<()>;
}

/// 从接收缓冲区中切分出一条完整的逻辑消息。
///
/// - 返回 `Ok(None)` 表示数据尚不完整，端点会继续读取；
/// - 实现方负责从 `src` 中移除已消费的字节。
pub trait Deserializer: Send + Sync + fmt::Debug {
    fn deserialize(&self, src: &mut BytesMut) -> io::Result<Option<Bytes>>;
}

/// 连接级拦截器。
///
/// # 契约 (What)
/// - `on_open`：连接完成包装后调用，返回错误即拒绝该连接（连接会被立即关闭）；
/// - `on_close`：连接关闭后调用，仅作通知。
pub trait ConnectionInterceptor: Send + Sync + fmt::Debug {
    fn on_open(&self, _metadata: &ConnectionMetadata) -> io::Result<()> {
        Ok(())
    }

    fn on_close(&self, _metadata: &ConnectionMetadata) {}
}

/// 有序的拦截器链，无论端点变体如何都按登记顺序统一执行。
#[derive(Clone, Debug, Default)]
pub struct InterceptorChain {
    interceptors: Vec<Arc<dyn ConnectionInterceptor>>,
}

impl InterceptorChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一个拦截器，返回 `&mut Self` 以便链式登记。
    pub fn push(&mut self, interceptor: Arc<dyn ConnectionInterceptor>) -> &mut Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    /// 依序执行 `on_open`，遇到首个错误即停止。
    pub(crate) fn run_open(&self, metadata: &ConnectionMetadata) -> io::Result<()> {
        self.interceptors
            .iter()
            .try_for_each(|interceptor| interceptor.on_open(metadata))
    }

    pub(crate) fn run_close(&self, metadata: &ConnectionMetadata) {
        for interceptor in &self.interceptors {
            interceptor.on_close(metadata);
        }
    }
}

/// 连接处理任务的执行能力。
///
/// # 教案式说明
/// - **意图 (Why)**：阻塞端点的接入循环、非阻塞端点的选择器循环都需要脱离调用线程运行，
///   具体线程池由容器决定；
/// - **契约 (What)**：`name` 仅用于诊断（例如线程命名）；提交失败返回 `io::Error`，
///   端点会把它映射为启动失败；
/// - **风险 (Trade-offs)**：执行器若在队列满时同步执行任务，会阻塞 `start`，实现方需避免。
pub trait TaskExecutor: Send + Sync + fmt::Debug {
    fn execute(&self, name: &str, task: Box<dyn FnOnce() + Send + 'static>) -> io::Result<()>;
}

/// 为每个任务创建一条具名 OS 线程，作为未注入执行器时端点自带的默认值。
#[derive(Clone, Copy, Debug, Default)]
pub struct ThreadPerTaskExecutor;

impl TaskExecutor for ThreadPerTaskExecutor {
    fn execute(&self, name: &str, task: Box<dyn FnOnce() + Send + 'static>) -> io::Result<()> {
        thread::Builder::new()
            .name(name.to_owned())
            .spawn(task)
            .map(|_| ())
    }
}

/// 端点生命周期与连接事件。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EndpointEvent {
    /// 服务端监听已就绪。
    ServerListening { endpoint: String, local_addr: SocketAddr },
    /// 新连接完成包装并通过拦截器。
    ConnectionOpened {
        endpoint: String,
        connection_id: ConnectionId,
    },
    /// 连接已关闭。
    ConnectionClosed {
        endpoint: String,
        connection_id: ConnectionId,
    },
    /// 接入、握手或建连失败；后台循环无法把错误返回给调用方，只能以事件形式上报。
    ConnectionFailed { endpoint: String, reason: String },
    /// 端点已停止。
    EndpointStopped { endpoint: String },
}

/// 生命周期事件的接收端；端点必须容忍其缺省。
pub trait EventPublisher: Send + Sync + fmt::Debug {
    fn publish(&self, event: EndpointEvent);
}

/// 映射后的应用层消息信封。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageEnvelope {
    pub payload: Bytes,
    pub connection_id: ConnectionId,
    pub host_name: String,
    pub peer_addr: SocketAddr,
    pub sequence_number: Option<u64>,
    pub content_type: Option<String>,
}

/// 原始字节 + 连接元数据 → [`MessageEnvelope`] 的映射器。
///
/// # 教案式说明
/// - **意图 (Why)**：让上层拿到带来源信息的消息，而无需感知连接对象；
/// - **契约 (What)**：`apply_sequence` 为真时，每条消息附带所在连接内单调递增的序号（从 1 开始）；
///   构建阶段由构建器在挂载前写入该开关；
/// - **风险 (Trade-offs)**：序号是连接内的，不跨连接全局有序。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MessageMapper {
    apply_sequence: bool,
    content_type: Option<String>,
}

impl MessageMapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_apply_sequence(&mut self, apply_sequence: bool) -> &mut Self {
        self.apply_sequence = apply_sequence;
        self
    }

    pub fn apply_sequence(&self) -> bool {
        self.apply_sequence
    }

    /// 为每条消息附加固定的内容类型标注。
    pub fn set_content_type(&mut self, content_type: impl Into<String>) -> &mut Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub(crate) fn to_envelope(
        &self,
        payload: Bytes,
        metadata: &ConnectionMetadata,
        sequence: &AtomicU64,
    ) -> MessageEnvelope {
        let sequence_number = self
            .apply_sequence
            .then(|| sequence.fetch_add(1, Ordering::Relaxed) + 1);
        MessageEnvelope {
            payload,
            connection_id: metadata.id.clone(),
            host_name: metadata.host_name.clone(),
            peer_addr: metadata.peer_addr,
            sequence_number,
            content_type: self.content_type.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn metadata() -> ConnectionMetadata {
        ConnectionMetadata {
            id: ConnectionId::from("127.0.0.1:4000:5000:1"),
            peer_addr: "127.0.0.1:4000".parse().expect("peer"),
            local_addr: "127.0.0.1:5000".parse().expect("local"),
            host_name: "localhost".to_owned(),
            server_side: true,
            single_use: false,
            secure: false,
        }
    }

    #[test]
    fn mapper_numbers_messages_only_when_sequence_applied() {
        let metadata = metadata();
        let counter = AtomicU64::new(0);

        let plain = MessageMapper::new();
        let envelope = plain.to_envelope(Bytes::from_static(b"a"), &metadata, &counter);
        assert_eq!(envelope.sequence_number, None);

        let mut sequenced = MessageMapper::new();
        sequenced.set_apply_sequence(true);
        let first = sequenced.to_envelope(Bytes::from_static(b"a"), &metadata, &counter);
        let second = sequenced.to_envelope(Bytes::from_static(b"b"), &metadata, &counter);
        assert_eq!(first.sequence_number, Some(1));
        assert_eq!(second.sequence_number, Some(2));
        assert_eq!(second.host_name, "localhost");
    }

    #[derive(Debug)]
    struct Reject;

    impl ConnectionInterceptor for Reject {
        fn on_open(&self, _metadata: &ConnectionMetadata) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "rejected"))
        }
    }

    #[test]
    fn interceptor_chain_stops_at_first_rejection() {
        let mut chain = InterceptorChain::new();
        chain.push(Arc::new(Reject));
        assert_eq!(chain.len(), 1);
        let err = chain.run_open(&metadata()).expect_err("rejected");
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
    }

    #[test]
    fn thread_per_task_executor_runs_named_task() {
        let (tx, rx) = mpsc::channel();
        ThreadPerTaskExecutor
            .execute(
                "endpoint-test",
                Box::new(move || {
                    let name = thread::current().name().map(str::to_owned);
                    let _ = tx.send(name);
                }),
            )
            .expect("spawn");
        assert_eq!(
            rx.recv().expect("task ran"),
            Some("endpoint-test".to_owned())
        );
    }
}
