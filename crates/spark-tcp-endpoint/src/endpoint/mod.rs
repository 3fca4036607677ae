//! 四种具体端点变体及其封闭枚举 [`Endpoint`]。
//!
//! # 教案式注释
//!
//! ## 意图 (Why)
//! - `(角色 × 传输模式)` 恰好对应四个变体，以封闭枚举表达即可让编译器保证分派穷尽；
//! - 服务端专属属性只存在于服务端变体，直接缓冲与握手超时只存在于非阻塞变体，
//!   “把属性写到不该有它的变体上”在类型层面不可表达。
//!
//! ## 契约 (What)
//! - `start` 幂等；`stop` 在未运行时为空操作；`is_running` 反映实时状态；
//! - 变体字段在构建完成（被 `Arc` 共享）后不可再修改。

mod attributes;
mod blocking;
mod nonblocking;

pub use attributes::{CommonAttributes, DEFAULT_READ_DELAY, ServerAttributes, SocketTuning};
pub use blocking::{BlockingClientEndpoint, BlockingServerEndpoint};
pub use nonblocking::{NonBlockingAttributes, NonBlockingClientEndpoint, NonBlockingServerEndpoint};

use std::fmt;

use crate::{
    config::{Role, TransportMode},
    error::EndpointError,
};

/// 具体端点种类。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EndpointKind {
    BlockingServer,
    BlockingClient,
    NonBlockingServer,
    NonBlockingClient,
}

impl EndpointKind {
    /// 由角色与传输模式唯一确定变体。
    pub fn select(role: Role, mode: TransportMode) -> Self {
        match (role, mode) {
            (Role::Server, TransportMode::Blocking) => EndpointKind::BlockingServer,
            (Role::Client, TransportMode::Blocking) => EndpointKind::BlockingClient,
            (Role::Server, TransportMode::NonBlocking) => EndpointKind::NonBlockingServer,
            (Role::Client, TransportMode::NonBlocking) => EndpointKind::NonBlockingClient,
        }
    }

    pub fn role(self) -> Role {
        match self {
            EndpointKind::BlockingServer | EndpointKind::NonBlockingServer => Role::Server,
            EndpointKind::BlockingClient | EndpointKind::NonBlockingClient => Role::Client,
        }
    }

    pub fn transport_mode(self) -> TransportMode {
        match self {
            EndpointKind::BlockingServer | EndpointKind::BlockingClient => TransportMode::Blocking,
            EndpointKind::NonBlockingServer | EndpointKind::NonBlockingClient => {
                TransportMode::NonBlocking
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EndpointKind::BlockingServer => "blocking-server",
            EndpointKind::BlockingClient => "blocking-client",
            EndpointKind::NonBlockingServer => "non-blocking-server",
            EndpointKind::NonBlockingClient => "non-blocking-client",
        }
    }
}

impl fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 构建完成的端点。
#[derive(Debug)]
pub enum Endpoint {
    BlockingServer(BlockingServerEndpoint),
    BlockingClient(BlockingClientEndpoint),
    NonBlockingServer(NonBlockingServerEndpoint),
    NonBlockingClient(NonBlockingClientEndpoint),
}

impl Endpoint {
    pub fn kind(&self) -> EndpointKind {
        match self {
            Endpoint::BlockingServer(_) => EndpointKind::BlockingServer,
            Endpoint::BlockingClient(_) => EndpointKind::BlockingClient,
            Endpoint::NonBlockingServer(_) => EndpointKind::NonBlockingServer,
            Endpoint::NonBlockingClient(_) => EndpointKind::NonBlockingClient,
        }
    }

    pub fn start(&self) -> Result<(), EndpointError> {
        match self {
            Endpoint::BlockingServer(endpoint) => endpoint.start(),
            Endpoint::BlockingClient(endpoint) => endpoint.start(),
            Endpoint::NonBlockingServer(endpoint) => endpoint.start(),
            Endpoint::NonBlockingClient(endpoint) => endpoint.start(),
        }
    }

    pub fn stop(&self) {
        match self {
            Endpoint::BlockingServer(endpoint) => endpoint.stop(),
            Endpoint::BlockingClient(endpoint) => endpoint.stop(),
            Endpoint::NonBlockingServer(endpoint) => endpoint.stop(),
            Endpoint::NonBlockingClient(endpoint) => endpoint.stop(),
        }
    }

    pub fn is_running(&self) -> bool {
        match self {
            Endpoint::BlockingServer(endpoint) => endpoint.is_running(),
            Endpoint::BlockingClient(endpoint) => endpoint.is_running(),
            Endpoint::NonBlockingServer(endpoint) => endpoint.is_running(),
            Endpoint::NonBlockingClient(endpoint) => endpoint.is_running(),
        }
    }

    pub fn common(&self) -> &CommonAttributes {
        match self {
            Endpoint::BlockingServer(endpoint) => endpoint.common(),
            Endpoint::BlockingClient(endpoint) => endpoint.common(),
            Endpoint::NonBlockingServer(endpoint) => endpoint.common(),
            Endpoint::NonBlockingClient(endpoint) => endpoint.common(),
        }
    }

    /// 服务端变体返回其专属属性，客户端变体返回 `None`。
    pub fn server_attributes(&self) -> Option<&ServerAttributes> {
        match self {
            Endpoint::BlockingServer(endpoint) => Some(endpoint.server()),
            Endpoint::NonBlockingServer(endpoint) => Some(endpoint.server()),
            Endpoint::BlockingClient(_) | Endpoint::NonBlockingClient(_) => None,
        }
    }

    /// 非阻塞变体返回握手超时与直接缓冲属性。
    pub fn non_blocking_attributes(&self) -> Option<&NonBlockingAttributes> {
        match self {
            Endpoint::NonBlockingServer(endpoint) => Some(endpoint.non_blocking()),
            Endpoint::NonBlockingClient(endpoint) => Some(endpoint.non_blocking()),
            Endpoint::BlockingServer(_) | Endpoint::BlockingClient(_) => None,
        }
    }

    pub(crate) fn common_mut(&mut self) -> &mut CommonAttributes {
        match self {
            Endpoint::BlockingServer(endpoint) => endpoint.common_mut(),
            Endpoint::BlockingClient(endpoint) => endpoint.common_mut(),
            Endpoint::NonBlockingServer(endpoint) => endpoint.common_mut(),
            Endpoint::NonBlockingClient(endpoint) => endpoint.common_mut(),
        }
    }

    pub(crate) fn server_attributes_mut(&mut self) -> Option<&mut ServerAttributes> {
        match self {
            Endpoint::BlockingServer(endpoint) => Some(endpoint.server_mut()),
            Endpoint::NonBlockingServer(endpoint) => Some(endpoint.server_mut()),
            Endpoint::BlockingClient(_) | Endpoint::NonBlockingClient(_) => None,
        }
    }

    pub(crate) fn non_blocking_attributes_mut(&mut self) -> Option<&mut NonBlockingAttributes> {
        match self {
            Endpoint::NonBlockingServer(endpoint) => Some(endpoint.non_blocking_mut()),
            Endpoint::NonBlockingClient(endpoint) => Some(endpoint.non_blocking_mut()),
            Endpoint::BlockingServer(_) | Endpoint::BlockingClient(_) => None,
        }
    }

    pub fn as_blocking_server(&self) -> Option<&BlockingServerEndpoint> {
        match self {
            Endpoint::BlockingServer(endpoint) => Some(endpoint),
            _ => None,
        }
    }

    pub fn as_blocking_client(&self) -> Option<&BlockingClientEndpoint> {
        match self {
            Endpoint::BlockingClient(endpoint) => Some(endpoint),
            _ => None,
        }
    }

    pub fn as_non_blocking_server(&self) -> Option<&NonBlockingServerEndpoint> {
        match self {
            Endpoint::NonBlockingServer(endpoint) => Some(endpoint),
            _ => None,
        }
    }

    pub fn as_non_blocking_client(&self) -> Option<&NonBlockingClientEndpoint> {
        match self {
            Endpoint::NonBlockingClient(endpoint) => Some(endpoint),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_covers_every_pair() {
        for role in [Role::Server, Role::Client] {
            for mode in [TransportMode::Blocking, TransportMode::NonBlocking] {
                let kind = EndpointKind::select(role, mode);
                assert_eq!(kind.role(), role);
                assert_eq!(kind.transport_mode(), mode);
            }
        }
        assert_eq!(
            EndpointKind::select(Role::Client, TransportMode::NonBlocking).as_str(),
            "non-blocking-client"
        );
    }
}
