//! TLS 上下文提供者。
//!
//! 端点只关心“是否存在 SSL 上下文”来决定默认策略；真正的 `rustls` 配置在握手时才读取，
//! 因此构建阶段不会触碰任何证书材料。

use std::{fmt, io, sync::Arc};

use arc_swap::ArcSwapOption;
use rustls::{ClientConfig, ServerConfig};

/// 提供协商 TLS 所需的 `rustls` 配置。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 服务端握手需要 [`ServerConfig`]，客户端握手需要 [`ClientConfig`]；同一提供者可只支持其中一侧；
/// - 以 trait 形式注入，允许容器接入证书轮换、密钥托管等外部系统。
///
/// ## 契约 (What)
/// - 返回的 `Arc` 可跨线程共享，握手期间持有的快照不受后续替换影响；
/// - 缺少对应一侧的配置时返回 `io::ErrorKind::NotFound`，该错误会作为握手失败向上传播。
pub trait SslContextProvider: Send + Sync + fmt::Debug {
    fn server_config(&self) -> io::Result<Arc<ServerConfig>>;

    fn client_config(&self) -> io::Result<Arc<ClientConfig>>;
}

fn missing(side: &'static str) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotFound,
        format!("no TLS {side} configuration available"),
    )
}

/// 固定配置的 SSL 上下文。
#[derive(Clone, Debug, Default)]
pub struct StaticSslContext {
    server: Option<Arc<ServerConfig>>,
    client: Option<Arc<ClientConfig>>,
}

impl StaticSslContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_server_config(mut self, config: Arc<ServerConfig>) -> Self {
        self.server = Some(config);
        self
    }

    pub fn with_client_config(mut self, config: Arc<ClientConfig>) -> Self {
        self.client = Some(config);
        self
    }
}

impl SslContextProvider for StaticSslContext {
    fn server_config(&self) -> io::Result<Arc<ServerConfig>> {
        self.server.clone().ok_or_else(|| missing("server"))
    }

    fn client_config(&self) -> io::Result<Arc<ClientConfig>> {
        self.client.clone().ok_or_else(|| missing("client"))
    }
}

/// 支持热替换的 SSL 上下文。
///
/// # 设计动机（Why）
/// - **零中断目标**：证书轮换时无需停止端点或重建监听器；
/// - **模式选择**：`ArcSwapOption` 读路径无锁、写路径原子替换，即 RCU 式配置广播。
///
/// # 核心契约（What）
/// - `replace_*` 立即对后续握手可见，已建立的连接继续持有旧快照；
/// - 克隆体共享同一存储，适合在端点与证书管理器之间分发。
///
/// # 风险提示（Trade-offs）
/// - 高频替换会短暂保留多个旧配置，内存峰值取决于握手并发度。
#[derive(Clone, Default)]
pub struct HotReloadingSslContext {
    server: Arc<ArcSwapOption<ServerConfig>>,
    client: Arc<ArcSwapOption<ClientConfig>>,
}

impl HotReloadingSslContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// 替换服务端配置，返回旧值便于审计或回收。
    pub fn replace_server_config(&self, next: Arc<ServerConfig>) -> Option<Arc<ServerConfig>> {
        self.server.swap(Some(next))
    }

    /// 替换客户端配置，返回旧值。
    pub fn replace_client_config(&self, next: Arc<ClientConfig>) -> Option<Arc<ClientConfig>> {
        self.client.swap(Some(next))
    }
}

impl SslContextProvider for HotReloadingSslContext {
    fn server_config(&self) -> io::Result<Arc<ServerConfig>> {
        self.server.load_full().ok_or_else(|| missing("server"))
    }

    fn client_config(&self) -> io::Result<Arc<ClientConfig>> {
        self.client.load_full().ok_or_else(|| missing("client"))
    }
}

impl fmt::Debug for HotReloadingSslContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HotReloadingSslContext")
            .field("server", &self.server.load().is_some())
            .field("client", &self.client.load().is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_side_reports_not_found() {
        let context = StaticSslContext::new();
        let err = context.server_config().expect_err("no server config");
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        let err = HotReloadingSslContext::new()
            .client_config()
            .expect_err("no client config");
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn replaced_client_config_is_visible_to_clones() {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
        let context = HotReloadingSslContext::new();
        let observer = context.clone();
        let config = Arc::new(
            ClientConfig::builder()
                .with_root_certificates(rustls::RootCertStore::empty())
                .with_no_client_auth(),
        );

        assert!(context.replace_client_config(Arc::clone(&config)).is_none());
        let current = observer.client_config().expect("replaced");
        assert!(Arc::ptr_eq(&current, &config));
        assert!(context.replace_client_config(Arc::clone(&config)).is_some());
    }
}
