use std::sync::Arc;

use tracing::debug;

use crate::{
    builder::EndpointBuilder,
    config::{EndpointConfig, Role},
    endpoint::{Endpoint, EndpointKind},
    error::EndpointError,
};

/// [`EndpointHandle::kind`] 报告的对象种类。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    /// 已构建，种类确定。
    Endpoint(EndpointKind),
    /// 未构建，但角色为服务端。
    ServerEndpoint,
    /// 未构建，但角色为客户端。
    ClientEndpoint,
    /// 未构建且未设置角色。
    Unresolved,
}

/// 交给宿主容器的生命周期门面。
///
/// # 教案式说明
/// - **意图 (Why)**：容器只需要“构建、启动、停止、查询状态”四个动作，不必区分端点变体；
/// - **契约 (What)**：
///   - 构建成功之前，`start`/`stop`/`is_running` 均返回 [`EndpointError::NotBuilt`] 且无副作用；
///   - 构建之后全部转发给端点：`start` 幂等，`stop` 在未运行时为空操作；
///   - [`kind`](Self::kind) 在构建前依据配置中的角色给出类别。
#[derive(Debug)]
pub struct EndpointHandle {
    builder: EndpointBuilder,
}

impl EndpointHandle {
    pub fn new(config: EndpointConfig) -> Self {
        Self {
            builder: EndpointBuilder::new(config),
        }
    }

    pub fn config(&self) -> &EndpointConfig {
        self.builder.config()
    }

    pub fn builder(&self) -> &EndpointBuilder {
        &self.builder
    }

    pub fn build(&self) -> Result<Arc<Endpoint>, EndpointError> {
        self.builder.build()
    }

    pub fn endpoint(&self) -> Option<Arc<Endpoint>> {
        self.builder.built()
    }

    pub fn start(&self) -> Result<(), EndpointError> {
        self.require_built()?.start()
    }

    pub fn stop(&self) -> Result<(), EndpointError> {
        self.require_built()?.stop();
        Ok(())
    }

    pub fn is_running(&self) -> Result<bool, EndpointError> {
        Ok(self.require_built()?.is_running())
    }

    pub fn kind(&self) -> ObjectKind {
        if let Some(endpoint) = self.builder.built() {
            return ObjectKind::Endpoint(endpoint.kind());
        }
        match self.builder.config().role() {
            Some(Role::Server) => ObjectKind::ServerEndpoint,
            Some(Role::Client) => ObjectKind::ClientEndpoint,
            None => ObjectKind::Unresolved,
        }
    }

    fn require_built(&self) -> Result<Arc<Endpoint>, EndpointError> {
        self.builder.built().ok_or_else(|| {
            debug!("lifecycle call before build");
            EndpointError::NotBuilt
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_before_build_reports_not_built() {
        let handle = EndpointHandle::new(EndpointConfig::new(Role::Server));
        assert!(handle.start().expect_err("start").is_not_built());
        assert!(handle.stop().expect_err("stop").is_not_built());
        assert!(handle.is_running().expect_err("status").is_not_built());
        assert_eq!(handle.kind(), ObjectKind::ServerEndpoint);
        assert_eq!(
            EndpointHandle::new(EndpointConfig::default()).kind(),
            ObjectKind::Unresolved
        );
    }

    #[test]
    fn kind_reports_concrete_variant_after_build() {
        let mut config = EndpointConfig::new(Role::Client);
        config.set_host("localhost").expect("host");
        let handle = EndpointHandle::new(config);
        assert_eq!(handle.kind(), ObjectKind::ClientEndpoint);
        handle.build().expect("build");
        assert_eq!(
            handle.kind(),
            ObjectKind::Endpoint(EndpointKind::BlockingClient)
        );
    }
}
