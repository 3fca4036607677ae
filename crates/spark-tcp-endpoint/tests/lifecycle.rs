//! 端点生命周期与明文收发的集成测试。
//!
//! # 教案级导览
//!
//! - **Why**：构建只是前半程，端点必须能按契约启动、停止，并在真实回环套接字上完成收发；
//! - **How**：服务端绑定端口 0，通过 `local_addr` 取得系统分配端口，再据此配置客户端；
//!   所有等待都经由 `support::wait_until` 轮询，避免固定睡眠；
//! - **What**：覆盖句柄的构建前语义、幂等启停、阻塞与非阻塞回显、共享与单次连接、绑定冲突。

mod support;

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use spark_tcp_endpoint::{
    Endpoint, EndpointBuilder, EndpointConfig, EndpointError, EndpointEvent, EndpointHandle,
    ObjectKind, Role, TransportMode,
};
use support::{Recorder, line_codec, wait_until, wait_until_async};

const WAIT: Duration = Duration::from_secs(5);

fn server_config(mode: TransportMode, recorder: &Arc<Recorder>) -> EndpointConfig {
    let mut config = EndpointConfig::new(Role::Server);
    config
        .set_transport_mode(mode)
        .set_port(0)
        .set_read_delay_ms(10)
        .set_endpoint_name("echo-server")
        .set_serializer(line_codec())
        .set_deserializer(line_codec())
        .set_event_publisher(Arc::clone(recorder) as _);
    config
        .set_local_address("127.0.0.1")
        .expect("本地地址合法");
    config
}

fn client_config(mode: TransportMode, port: u16) -> EndpointConfig {
    let mut config = EndpointConfig::new(Role::Client);
    config
        .set_transport_mode(mode)
        .set_port(port)
        .set_so_timeout_ms(5_000)
        .set_endpoint_name("echo-client")
        .set_serializer(line_codec())
        .set_deserializer(line_codec());
    config.set_host("127.0.0.1").expect("主机合法");
    config
}

fn server_port(endpoint: &Endpoint) -> Result<u16> {
    let addr = match endpoint.kind().transport_mode() {
        TransportMode::Blocking => endpoint
            .as_blocking_server()
            .and_then(|server| server.local_addr()),
        TransportMode::NonBlocking => endpoint
            .as_non_blocking_server()
            .and_then(|server| server.local_addr()),
    };
    Ok(addr.context("服务端启动后应暴露监听地址")?.port())
}

/// ## 测试一：句柄在构建前拒绝生命周期调用
///
/// - **契约 (What)**：`start`/`stop`/`is_running` 返回 `NotBuilt` 且无副作用；
///   构建前的对象类型为 `ServerEndpoint`，构建后为具体变体。
#[test]
fn handle_rejects_lifecycle_before_build() -> Result<()> {
    let mut config = EndpointConfig::new(Role::Server);
    config.set_port(0).set_read_delay_ms(10);
    let handle = EndpointHandle::new(config);

    assert_eq!(handle.kind(), ObjectKind::ServerEndpoint);
    assert!(handle.start().expect_err("构建前").is_not_built());
    assert!(handle.stop().expect_err("构建前").is_not_built());
    assert!(handle.is_running().expect_err("构建前").is_not_built());
    assert_eq!(handle.builder().construction_count(), 0);

    handle.build()?;
    assert!(matches!(handle.kind(), ObjectKind::Endpoint(_)));
    assert!(!handle.is_running()?);
    handle.start()?;
    assert!(handle.is_running()?);
    handle.start()?;
    assert!(handle.is_running()?, "重复 start 应保持运行");
    handle.stop()?;
    assert!(!handle.is_running()?);
    handle.stop()?;
    Ok(())
}

/// ## 测试二：阻塞服务端与阻塞客户端完成一次回显
///
/// - **逻辑 (How)**：客户端发送一行，测试代替应用从服务端登记的连接读出并回写；
/// - **契约 (What)**：事件序列包含监听、连接打开、连接关闭与端点停止。
#[test]
fn blocking_echo_round_trip() -> Result<()> {
    let recorder = Arc::new(Recorder::default());
    let server = EndpointBuilder::new(server_config(TransportMode::Blocking, &recorder)).build()?;
    server.start()?;
    let port = server_port(&server)?;

    let client = EndpointBuilder::new(client_config(TransportMode::Blocking, port)).build()?;
    client.start()?;
    let client_side = client
        .as_blocking_client()
        .context("阻塞客户端")?
        .connection()?;
    client_side.send(b"ping")?;

    let blocking_server = server.as_blocking_server().context("阻塞服务端")?;
    assert!(
        wait_until(WAIT, || !blocking_server.open_connection_ids().is_empty()),
        "服务端应登记入站连接"
    );
    let id = blocking_server.open_connection_ids().remove(0);
    let server_side = blocking_server.connection(&id).context("登记的连接")?;
    assert_eq!(server_side.receive()?.as_deref(), Some(&b"ping"[..]));
    server_side.send(b"pong")?;
    assert_eq!(client_side.receive()?.as_deref(), Some(&b"pong"[..]));
    assert_eq!(client_side.metadata().host_name, "127.0.0.1");

    client.stop();
    assert!(!client_side.is_open());
    assert_eq!(server_side.receive()?, None, "对端关闭后读到 EOF");
    server.stop();
    assert!(!server.is_running());

    assert_eq!(
        recorder.count(|event| matches!(event, EndpointEvent::ServerListening { .. })),
        1
    );
    assert_eq!(
        recorder.count(|event| matches!(event, EndpointEvent::ConnectionOpened { .. })),
        1
    );
    assert!(wait_until(WAIT, || {
        recorder.count(|event| matches!(event, EndpointEvent::ConnectionClosed { .. })) == 1
    }));
    assert!(matches!(
        recorder.events().last(),
        Some(EndpointEvent::EndpointStopped { endpoint }) if endpoint == "echo-server"
    ));
    Ok(())
}

/// ## 测试三：共享连接被复用，单次使用连接每次新建
#[test]
fn shared_and_single_use_client_connections() -> Result<()> {
    let recorder = Arc::new(Recorder::default());
    let server = EndpointBuilder::new(server_config(TransportMode::Blocking, &recorder)).build()?;
    server.start()?;
    let port = server_port(&server)?;

    let shared = EndpointBuilder::new(client_config(TransportMode::Blocking, port)).build()?;
    shared.start()?;
    let shared_client = shared.as_blocking_client().context("阻塞客户端")?;
    let first = shared_client.connection()?;
    let second = shared_client.connection()?;
    assert!(Arc::ptr_eq(&first, &second));

    let mut config = client_config(TransportMode::Blocking, port);
    config.set_single_use(true);
    let single = EndpointBuilder::new(config).build()?;
    single.start()?;
    let single_client = single.as_blocking_client().context("阻塞客户端")?;
    let one = single_client.connection()?;
    let two = single_client.connection()?;
    assert!(!Arc::ptr_eq(&one, &two));
    assert_ne!(one.metadata().id, two.metadata().id);

    let blocking_server = server.as_blocking_server().context("阻塞服务端")?;
    assert!(wait_until(WAIT, || blocking_server.open_connection_ids().len() == 3));

    shared.stop();
    single.stop();
    server.stop();
    Ok(())
}

/// ## 测试四：客户端未启动时拒绝建连
#[test]
fn client_connection_requires_running_endpoint() -> Result<()> {
    let client = EndpointBuilder::new(client_config(TransportMode::Blocking, 9)).build()?;
    let err = client
        .as_blocking_client()
        .context("阻塞客户端")?
        .connection()
        .expect_err("未启动");
    assert!(matches!(err, EndpointError::NotRunning { .. }));
    assert_eq!(err.code(), "spark.endpoint.tcp.not_running");
    Ok(())
}

/// ## 测试五：端口被占用时启动失败且端点保持停止
#[cfg(target_os = "linux")]
#[test]
fn bind_conflict_reports_transport_error() -> Result<()> {
    let occupied = std::net::TcpListener::bind("127.0.0.1:0")?;
    let port = occupied.local_addr()?.port();

    let mut config = EndpointConfig::new(Role::Server);
    config.set_port(port).set_read_delay_ms(10);
    config.set_local_address("127.0.0.1")?;
    let server = EndpointBuilder::new(config).build()?;
    let err = server.start().expect_err("端口已被占用");
    assert_eq!(err.code(), "spark.endpoint.tcp.bind_failed");
    assert!(!server.is_running());
    Ok(())
}

/// ## 测试六：非阻塞服务端与非阻塞客户端完成一次回显
///
/// - **风险 (Trade-offs)**：服务端连接依附端点内部运行时的 I/O 驱动，
///   测试运行时只负责等待，因此使用多线程运行时避免两侧互相阻塞。
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn non_blocking_echo_round_trip() -> Result<()> {
    let recorder = Arc::new(Recorder::default());
    let server =
        EndpointBuilder::new(server_config(TransportMode::NonBlocking, &recorder)).build()?;
    server.start()?;
    let port = server_port(&server)?;

    let client = EndpointBuilder::new(client_config(TransportMode::NonBlocking, port)).build()?;
    client.start()?;
    let non_blocking_client = client.as_non_blocking_client().context("非阻塞客户端")?;
    let client_side = non_blocking_client.connection().await?;
    let again = non_blocking_client.connection().await?;
    assert!(Arc::ptr_eq(&client_side, &again));
    client_side.send(b"ping").await?;

    let non_blocking_server = server.as_non_blocking_server().context("非阻塞服务端")?;
    assert!(
        wait_until_async(WAIT, || !non_blocking_server.open_connection_ids().is_empty()).await,
        "服务端应登记入站连接"
    );
    let id = non_blocking_server.open_connection_ids().remove(0);
    let server_side = non_blocking_server.connection(&id).context("登记的连接")?;
    let received = tokio::time::timeout(WAIT, server_side.receive()).await??;
    assert_eq!(received.as_deref(), Some(&b"ping"[..]));
    server_side.send(b"pong").await?;
    let echoed = tokio::time::timeout(WAIT, client_side.receive()).await??;
    assert_eq!(echoed.as_deref(), Some(&b"pong"[..]));

    client.stop();
    assert!(!client_side.is_open());
    server.stop();
    assert!(!server_side.is_open(), "停止服务端会中止登记的连接");
    assert!(non_blocking_server.open_connection_ids().is_empty());
    assert_eq!(
        recorder.count(|event| matches!(event, EndpointEvent::EndpointStopped { .. })),
        1
    );
    Ok(())
}

/// ## 测试七：对端关闭的入站连接自动移出登记表
///
/// - **契约 (What)**：服务端读到 EOF 关闭连接后，`connection(&id)` 立即返回 `None`，
///   无需调用方轮询 `open_connection_ids` 才释放。
#[test]
fn peer_closed_connections_leave_registry() -> Result<()> {
    let recorder = Arc::new(Recorder::default());
    let server = EndpointBuilder::new(server_config(TransportMode::Blocking, &recorder)).build()?;
    server.start()?;
    let port = server_port(&server)?;
    let blocking_server = server.as_blocking_server().context("阻塞服务端")?;

    let peers = (0..5)
        .map(|_| std::net::TcpStream::connect(("127.0.0.1", port)))
        .collect::<std::io::Result<Vec<_>>>()?;
    assert!(wait_until(WAIT, || blocking_server.open_connection_ids().len() == 5));
    let ids = blocking_server.open_connection_ids();
    drop(peers);

    for id in &ids {
        let connection = blocking_server.connection(id).context("登记的连接")?;
        assert_eq!(connection.receive()?, None);
        assert!(blocking_server.connection(id).is_none(), "{id} 关闭后应被移出");
    }
    server.stop();
    Ok(())
}

/// ## 测试八：非阻塞客户端在等待应答时仍可发送
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn non_blocking_client_sends_while_receive_pending() -> Result<()> {
    let recorder = Arc::new(Recorder::default());
    let server =
        EndpointBuilder::new(server_config(TransportMode::NonBlocking, &recorder)).build()?;
    server.start()?;
    let port = server_port(&server)?;

    let client = EndpointBuilder::new(client_config(TransportMode::NonBlocking, port)).build()?;
    client.start()?;
    let client_side = client
        .as_non_blocking_client()
        .context("非阻塞客户端")?
        .connection()
        .await?;
    let pending = {
        let client_side = Arc::clone(&client_side);
        tokio::spawn(async move { client_side.receive().await })
    };
    tokio::task::yield_now().await;
    tokio::time::timeout(WAIT, client_side.send(b"request")).await??;

    let non_blocking_server = server.as_non_blocking_server().context("非阻塞服务端")?;
    assert!(
        wait_until_async(WAIT, || !non_blocking_server.open_connection_ids().is_empty()).await
    );
    let id = non_blocking_server.open_connection_ids().remove(0);
    let server_side = non_blocking_server.connection(&id).context("登记的连接")?;
    let request = tokio::time::timeout(WAIT, server_side.receive()).await??;
    assert_eq!(request.as_deref(), Some(&b"request"[..]));
    server_side.send(b"reply").await?;

    let reply = tokio::time::timeout(WAIT, pending).await???;
    assert_eq!(reply.as_deref(), Some(&b"reply"[..]));

    client.stop();
    server.stop();
    Ok(())
}
