use std::sync::Arc;

use tracing::debug;

use super::{
    BlockingConnectionStrategy, DefaultBlockingConnectionStrategy,
    DefaultNonBlockingConnectionStrategy, NonBlockingConnectionStrategy, NoopSocketCustomizer,
    PlainSocketFactory, SocketCustomizer, SocketFactoryStrategy, TlsNonBlockingConnectionStrategy,
    TlsSocketFactory,
};
use crate::{config::EndpointConfig, ssl::SslContextProvider};

/// 一次解析得到的完整策略组合。
#[derive(Clone, Debug)]
pub struct ResolvedStrategies {
    pub socket_factory: Arc<dyn SocketFactoryStrategy>,
    pub blocking_connection: Arc<dyn BlockingConnectionStrategy>,
    pub non_blocking_connection: Arc<dyn NonBlockingConnectionStrategy>,
    pub socket_customizer: Arc<dyn SocketCustomizer>,
}

/// 策略解析器。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 把“显式配置优先，其次依据 SSL 上下文是否存在选择默认实现”的规则集中为纯函数，
///   构建器与测试共享同一份判定。
///
/// ## 逻辑 (How)
/// - 套接字工厂：显式 → 原样；无 SSL → [`PlainSocketFactory`]；有 SSL → [`TlsSocketFactory`]；
/// - 阻塞连接：显式 → 原样；否则 [`DefaultBlockingConnectionStrategy`]；
/// - 非阻塞连接：显式 → 原样；无 SSL → [`DefaultNonBlockingConnectionStrategy`]；
///   有 SSL → [`TlsNonBlockingConnectionStrategy`]；
/// - 套接字定制器：显式 → 原样；否则 [`NoopSocketCustomizer`]。
///
/// ## 契约 (What)
/// - 无 I/O、无副作用，重复调用得到同名策略；显式策略返回同一个 `Arc`（`Arc::ptr_eq` 成立）；
/// - 永远不会覆盖显式提供的策略，即使同时配置了 SSL 上下文。
#[derive(Clone, Copy, Debug, Default)]
pub struct StrategyResolver;

impl StrategyResolver {
    pub fn resolve(config: &EndpointConfig) -> ResolvedStrategies {
        let ssl = config.ssl_context_provider();
        let resolved = ResolvedStrategies {
            socket_factory: Self::socket_factory(config.socket_factory_strategy(), ssl),
            blocking_connection: Self::blocking_connection(config.blocking_connection_strategy()),
            non_blocking_connection: Self::non_blocking_connection(
                config.non_blocking_connection_strategy(),
                ssl,
            ),
            socket_customizer: Self::socket_customizer(config.socket_customizer()),
        };
        debug!(
            socket_factory = resolved.socket_factory.name(),
            blocking_connection = resolved.blocking_connection.name(),
            non_blocking_connection = resolved.non_blocking_connection.name(),
            socket_customizer = resolved.socket_customizer.name(),
            ssl = ssl.is_some(),
            "strategies resolved"
        );
        resolved
    }

    pub fn socket_factory(
        explicit: Option<&Arc<dyn SocketFactoryStrategy>>,
        ssl: Option<&Arc<dyn SslContextProvider>>,
    ) -> Arc<dyn SocketFactoryStrategy> {
        match (explicit, ssl) {
            (Some(strategy), _) => Arc::clone(strategy),
            (None, None) => Arc::new(PlainSocketFactory),
            (None, Some(provider)) => Arc::new(TlsSocketFactory::new(Arc::clone(provider))),
        }
    }

    pub fn blocking_connection(
        explicit: Option<&Arc<dyn BlockingConnectionStrategy>>,
    ) -> Arc<dyn BlockingConnectionStrategy> {
        match explicit {
            Some(strategy) => Arc::clone(strategy),
            None => Arc::new(DefaultBlockingConnectionStrategy),
        }
    }

    pub fn non_blocking_connection(
        explicit: Option<&Arc<dyn NonBlockingConnectionStrategy>>,
        ssl: Option<&Arc<dyn SslContextProvider>>,
    ) -> Arc<dyn NonBlockingConnectionStrategy> {
        match (explicit, ssl) {
            (Some(strategy), _) => Arc::clone(strategy),
            (None, None) => Arc::new(DefaultNonBlockingConnectionStrategy),
            (None, Some(provider)) => {
                Arc::new(TlsNonBlockingConnectionStrategy::new(Arc::clone(provider)))
            }
        }
    }

    pub fn socket_customizer(
        explicit: Option<&Arc<dyn SocketCustomizer>>,
    ) -> Arc<dyn SocketCustomizer> {
        match explicit {
            Some(customizer) => Arc::clone(customizer),
            None => Arc::new(NoopSocketCustomizer),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssl::StaticSslContext;

    fn ssl() -> Arc<dyn SslContextProvider> {
        Arc::new(StaticSslContext::new())
    }

    #[test]
    fn socket_factory_follows_ssl_presence() {
        assert_eq!(StrategyResolver::socket_factory(None, None).name(), "plain");
        assert_eq!(
            StrategyResolver::socket_factory(None, Some(&ssl())).name(),
            "tls"
        );
    }

    #[test]
    fn explicit_socket_factory_wins_over_ssl() {
        let explicit: Arc<dyn SocketFactoryStrategy> = Arc::new(PlainSocketFactory);
        let resolved = StrategyResolver::socket_factory(Some(&explicit), Some(&ssl()));
        assert!(Arc::ptr_eq(&resolved, &explicit));
    }

    #[test]
    fn non_blocking_connection_follows_ssl_presence() {
        assert_eq!(
            StrategyResolver::non_blocking_connection(None, None).name(),
            "non-blocking"
        );
        assert_eq!(
            StrategyResolver::non_blocking_connection(None, Some(&ssl())).name(),
            "non-blocking-tls"
        );
    }

    #[test]
    fn defaults_for_blocking_connection_and_customizer() {
        assert_eq!(StrategyResolver::blocking_connection(None).name(), "blocking");
        assert_eq!(StrategyResolver::socket_customizer(None).name(), "noop");
    }
}
