//! 端点构建器：把配置一次性解析为唯一的端点实例。

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use tracing::debug;

use crate::{
    config::{EndpointConfig, Role},
    endpoint::{
        BlockingClientEndpoint, BlockingServerEndpoint, CommonAttributes, Endpoint, EndpointKind,
        NonBlockingAttributes, NonBlockingClientEndpoint, NonBlockingServerEndpoint,
        ServerAttributes,
    },
    error::EndpointError,
    strategy::{ResolvedStrategies, StrategyResolver},
};

/// 端点构建器。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 配置阶段可以任意顺序写入属性，构建阶段则必须“要么得到完整端点，要么什么都不创建”；
/// - 多个调用方并发触发构建时，只允许构造一次，所有人拿到同一个 `Arc`。
///
/// ## 逻辑 (How)
/// 1. 校验角色、客户端主机与直接缓冲组合，失败立即返回，不触碰任何套接字或证书材料；
/// 2. 通过 [`StrategyResolver`] 解析策略；
/// 3. 以 `(角色, 传输模式)` 穷尽匹配选择变体，并在构造时注入对应策略；
/// 4. 依序写入公共属性、服务端属性，最后处理非阻塞专属的握手超时与直接缓冲；
/// 5. 存入一次性槽位并返回。
///
/// ## 契约 (What)
/// - `build` 幂等，成功后 [`construction_count`](Self::construction_count) 恒为 1；
/// - 校验失败不会占用槽位，修正前重复调用会得到同样的错误。
#[derive(Debug)]
pub struct EndpointBuilder {
    config: EndpointConfig,
    slot: Mutex<Option<Arc<Endpoint>>>,
    constructions: AtomicUsize,
}

impl EndpointBuilder {
    pub fn new(config: EndpointConfig) -> Self {
        Self {
            config,
            slot: Mutex::new(None),
            constructions: AtomicUsize::new(0),
        }
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    pub fn build(&self) -> Result<Arc<Endpoint>, EndpointError> {
        let mut slot = self.slot.lock();
        if let Some(endpoint) = slot.as_ref() {
            return Ok(Arc::clone(endpoint));
        }

        self.config.validate()?;
        let role = self
            .config
            .role()
            .ok_or_else(|| EndpointError::invalid("role", "<unset>", "role is required"))?;
        let strategies = StrategyResolver::resolve(&self.config);
        let endpoint = Arc::new(assemble(&self.config, role, strategies));
        self.constructions.fetch_add(1, Ordering::AcqRel);
        debug!(
            endpoint = %endpoint.common().name(),
            kind = %endpoint.kind(),
            port = endpoint.common().port(),
            "endpoint built"
        );
        *slot = Some(Arc::clone(&endpoint));
        Ok(endpoint)
    }

    /// 已构建的端点；构建前为 `None`。
    pub fn built(&self) -> Option<Arc<Endpoint>> {
        self.slot.lock().clone()
    }

    /// 实际构造端点实例的次数（0 或 1）。
    pub fn construction_count(&self) -> usize {
        self.constructions.load(Ordering::Acquire)
    }
}

fn assemble(config: &EndpointConfig, role: Role, strategies: ResolvedStrategies) -> Endpoint {
    let kind = EndpointKind::select(role, config.transport_mode());
    let host = match role {
        Role::Client => config.host().map(str::to_owned),
        Role::Server => None,
    };
    let common = CommonAttributes::new(
        format!("{kind}:{}", config.port()),
        host,
        config.port(),
    );
    let ResolvedStrategies {
        socket_factory,
        blocking_connection,
        non_blocking_connection,
        socket_customizer,
    } = strategies;

    let mut endpoint = match kind {
        EndpointKind::BlockingServer => Endpoint::BlockingServer(BlockingServerEndpoint::new(
            common,
            socket_factory,
            blocking_connection,
            socket_customizer,
        )),
        EndpointKind::BlockingClient => Endpoint::BlockingClient(BlockingClientEndpoint::new(
            common,
            socket_factory,
            blocking_connection,
            socket_customizer,
        )),
        EndpointKind::NonBlockingServer => Endpoint::NonBlockingServer(
            NonBlockingServerEndpoint::new(common, non_blocking_connection, socket_customizer),
        ),
        EndpointKind::NonBlockingClient => Endpoint::NonBlockingClient(
            NonBlockingClientEndpoint::new(common, non_blocking_connection, socket_customizer),
        ),
    };

    apply_common(config, endpoint.common_mut());
    if let Some(server) = endpoint.server_attributes_mut() {
        apply_server(config, server);
    }
    match endpoint.non_blocking_attributes_mut() {
        Some(non_blocking) => apply_non_blocking(config, non_blocking),
        None => {
            if config.ssl_handshake_timeout_ms().is_some() {
                debug!(kind = %kind, "ssl handshake timeout ignored; blocking handshakes are bounded by so_timeout");
            }
        }
    }
    endpoint
}

fn apply_common(config: &EndpointConfig, common: &mut CommonAttributes) {
    if let Some(deserializer) = config.deserializer() {
        common.set_deserializer(Arc::clone(deserializer));
    }
    if let Some(serializer) = config.serializer() {
        common.set_serializer(Arc::clone(serializer));
    }
    if let Some(chain) = config.interceptor_chain() {
        common.set_interceptors(chain.clone());
    }
    common.set_lookup_host(config.lookup_host());
    let mut mapper = config.message_mapper().cloned().unwrap_or_default();
    mapper.set_apply_sequence(config.apply_sequence());
    common.set_mapper(mapper);
    common.set_single_use(config.single_use());

    let timeout = config.so_timeout_ms();
    common.set_so_timeout((timeout > 0).then(|| Duration::from_millis(timeout)));
    let send = config.so_send_buffer_bytes();
    common.set_so_send_buffer_size((send > 0).then_some(send));
    let receive = config.so_receive_buffer_bytes();
    common.set_so_receive_buffer_size((receive > 0).then_some(receive));
    common.set_tcp_no_delay(config.tcp_no_delay());
    if let Some(linger) = config.so_linger() {
        common.set_so_linger(linger);
    }
    common.set_so_keep_alive(config.so_keep_alive());
    if let Some(traffic_class) = config.traffic_class() {
        common.set_traffic_class(traffic_class);
    }

    if let Some(executor) = config.task_executor() {
        common.set_task_executor(Arc::clone(executor));
    }
    if let Some(name) = config.endpoint_name() {
        common.set_name(name);
    }
    if let Some(publisher) = config.event_publisher() {
        common.set_event_publisher(Arc::clone(publisher));
    }
    if let Some(millis) = config.read_delay_ms() {
        common.set_read_delay(Duration::from_millis(millis));
    }
}

fn apply_server(config: &EndpointConfig, server: &mut ServerAttributes) {
    if let Some(address) = config.local_address() {
        server.set_local_address(address);
    }
    server.set_backlog(config.backlog());
}

fn apply_non_blocking(config: &EndpointConfig, non_blocking: &mut NonBlockingAttributes) {
    if let Some(millis) = config.ssl_handshake_timeout_ms() {
        if config.ssl_context_provider().is_some() {
            non_blocking.set_ssl_handshake_timeout(Duration::from_millis(millis));
        } else {
            debug!(millis, "ssl handshake timeout ignored without ssl context");
        }
    }
    if let Some(direct) = config.using_direct_buffers() {
        non_blocking.set_using_direct_buffers(direct);
    }
}
