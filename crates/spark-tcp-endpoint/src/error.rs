//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 集中定义端点装配与生命周期的错误语义：配置非法、未构建即使用、底层传输失败；
//! - 传输层错误保持原始 [`io::Error`] 不做重分类，由上层结合错误码自行决策。
//!
//! ## 设计要求（What）
//! - `InvalidConfiguration` 必须携带字段名与违规值，且只会在 setter 或 `build` 校验阶段出现；
//! - 所有错误提供稳定错误码 [`EndpointError::code`]，前缀统一为 `spark.endpoint.tcp`。

use std::{borrow::Cow, fmt, io};

use thiserror::Error;

/// 描述一次底层操作对应的稳定错误码与默认文案。
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

impl fmt::Debug for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code)
    }
}

pub const BIND: OperationKind = OperationKind {
    code: "spark.endpoint.tcp.bind_failed",
    message: "tcp bind",
};
pub const ACCEPT: OperationKind = OperationKind {
    code: "spark.endpoint.tcp.accept_failed",
    message: "tcp accept",
};
pub const CONNECT: OperationKind = OperationKind {
    code: "spark.endpoint.tcp.connect_failed",
    message: "tcp connect",
};
pub const RESOLVE: OperationKind = OperationKind {
    code: "spark.endpoint.tcp.resolve_failed",
    message: "tcp resolve",
};
pub const CONFIGURE: OperationKind = OperationKind {
    code: "spark.endpoint.tcp.configure_failed",
    message: "tcp configure",
};
pub const HANDSHAKE: OperationKind = OperationKind {
    code: "spark.endpoint.tcp.handshake_failed",
    message: "tls handshake",
};
pub const DISPATCH: OperationKind = OperationKind {
    code: "spark.endpoint.tcp.dispatch_failed",
    message: "task dispatch",
};

const INVALID_CONFIGURATION_CODE: &str = "spark.endpoint.tcp.invalid_configuration";
const NOT_BUILT_CODE: &str = "spark.endpoint.tcp.not_built";
const NOT_RUNNING_CODE: &str = "spark.endpoint.tcp.not_running";

/// 端点装配内核的错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：把“配置错误”“生命周期误用”“传输失败”三类路径拆开，
///   让容器在启动阶段即可区分“应当修改配置”与“应当排查网络”。
/// - **契约 (What)**：
///   - `InvalidConfiguration` 仅由 setter 与构建校验产生，构建成功后不会再出现；
///   - `NotBuilt` 由 [`EndpointHandle`](crate::EndpointHandle) 的生命周期方法在构建前返回，无副作用；
///   - `Transport` 原样携带底层 [`io::Error`]，不做捕获或重解释，也不触发任何重试。
/// - **设计权衡 (Trade-offs)**：`value` 使用 `String` 保存违规值，牺牲一次分配换取可读的诊断信息。
#[derive(Debug, Error)]
pub enum EndpointError {
    /// 配置字段取值非法。
    #[error("invalid endpoint configuration: `{field}` = `{value}`: {reason}")]
    InvalidConfiguration {
        field: &'static str,
        value: String,
        reason: Cow<'static, str>,
    },

    /// 生命周期操作先于成功构建被调用。
    #[error("endpoint has not been built yet")]
    NotBuilt,

    /// 客户端端点尚未启动或已经停止，拒绝建立新连接。
    #[error("endpoint `{endpoint}` is not running")]
    NotRunning { endpoint: String },

    /// 绑定、建连、握手等底层操作失败。
    #[error("{}: {source}", .operation.message)]
    Transport {
        operation: OperationKind,
        #[source]
        source: io::Error,
    },
}

impl EndpointError {
    /// 构造配置错误，`value` 会被转换为可打印字符串。
    pub fn invalid(
        field: &'static str,
        value: impl fmt::Display,
        reason: impl Into<Cow<'static, str>>,
    ) -> Self {
        EndpointError::InvalidConfiguration {
            field,
            value: value.to_string(),
            reason: reason.into(),
        }
    }

    /// 返回稳定错误码，便于日志检索与告警聚合。
    pub fn code(&self) -> &'static str {
        match self {
            EndpointError::InvalidConfiguration { .. } => INVALID_CONFIGURATION_CODE,
            EndpointError::NotBuilt => NOT_BUILT_CODE,
            EndpointError::NotRunning { .. } => NOT_RUNNING_CODE,
            EndpointError::Transport { operation, .. } => operation.code,
        }
    }

    /// 若为配置错误，返回违规字段名。
    pub fn field(&self) -> Option<&'static str> {
        match self {
            EndpointError::InvalidConfiguration { field, .. } => Some(field),
            _ => None,
        }
    }

    pub fn is_invalid_configuration(&self) -> bool {
        matches!(self, EndpointError::InvalidConfiguration { .. })
    }

    pub fn is_not_built(&self) -> bool {
        matches!(self, EndpointError::NotBuilt)
    }
}

/// 将 IO 错误包装为传输错误，保留原始错误作为 source。
pub(crate) fn map_io_error(operation: OperationKind, source: io::Error) -> EndpointError {
    EndpointError::Transport { operation, source }
}
