use serde::Deserialize;

use super::EndpointConfig;
use crate::error::EndpointError;

/// 声明式端点定义，可从 TOML 文本解析。
///
/// # 教案式说明
/// - **意图 (Why)**：让宿主以配置文件描述端点的标量属性；策略与协作者仍以代码注入；
/// - **逻辑 (How)**：[`into_config`](Self::into_config) 逐项调用 [`EndpointConfig`] 的 setter，
///   因此 setter 上的全部校验同样适用于文件来源的取值；
/// - **契约 (What)**：字段名使用 kebab-case，出现未知字段即解析失败；
///   `transport` 缺省为阻塞模式，未知取值报告为 `InvalidConfiguration { field: "transport" }`。
///
/// ```toml
/// role = "server"
/// transport = "nio"
/// port = 7000
/// so-linger = 0
/// ```
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct EndpointDefinition {
    pub role: String,
    #[serde(default)]
    pub transport: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    pub port: u16,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub so_timeout_ms: Option<u64>,
    #[serde(default)]
    pub so_send_buffer_bytes: Option<usize>,
    #[serde(default)]
    pub so_receive_buffer_bytes: Option<usize>,
    #[serde(default)]
    pub tcp_no_delay: Option<bool>,
    #[serde(default)]
    pub so_linger: Option<i32>,
    #[serde(default)]
    pub so_keep_alive: Option<bool>,
    #[serde(default)]
    pub traffic_class: Option<i32>,
    #[serde(default)]
    pub single_use: Option<bool>,
    #[serde(default)]
    pub backlog: Option<i32>,
    #[serde(default)]
    pub local_address: Option<String>,
    #[serde(default)]
    pub lookup_host: Option<bool>,
    #[serde(default)]
    pub apply_sequence: Option<bool>,
    #[serde(default)]
    pub read_delay_ms: Option<u64>,
    #[serde(default)]
    pub ssl_handshake_timeout_ms: Option<u64>,
    #[serde(default)]
    pub using_direct_buffers: Option<bool>,
}

impl EndpointDefinition {
    pub fn from_toml_str(source: &str) -> Result<Self, EndpointError> {
        toml::from_str(source)
            .map_err(|err| EndpointError::invalid("definition", err.message(), "malformed TOML"))
    }

    /// 转换为可继续注入策略与协作者的 [`EndpointConfig`]。
    pub fn into_config(self) -> Result<EndpointConfig, EndpointError> {
        let mut config = EndpointConfig::from_role_token(&self.role)?;
        if let Some(transport) = &self.transport {
            config.set_transport_mode(transport.parse()?);
        }
        if let Some(host) = &self.host {
            config.set_host(host)?;
        }
        if let Some(address) = &self.local_address {
            config.set_local_address(address)?;
        }
        config.set_port(self.port);
        if let Some(name) = self.name {
            config.set_endpoint_name(name);
        }
        if let Some(millis) = self.so_timeout_ms {
            config.set_so_timeout_ms(millis);
        }
        if let Some(bytes) = self.so_send_buffer_bytes {
            config.set_so_send_buffer_bytes(bytes);
        }
        if let Some(bytes) = self.so_receive_buffer_bytes {
            config.set_so_receive_buffer_bytes(bytes);
        }
        if let Some(no_delay) = self.tcp_no_delay {
            config.set_tcp_no_delay(no_delay);
        }
        if let Some(linger) = self.so_linger {
            config.set_so_linger(linger);
        }
        if let Some(keep_alive) = self.so_keep_alive {
            config.set_so_keep_alive(keep_alive);
        }
        if let Some(traffic_class) = self.traffic_class {
            config.set_traffic_class(traffic_class);
        }
        if let Some(single_use) = self.single_use {
            config.set_single_use(single_use);
        }
        if let Some(backlog) = self.backlog {
            config.set_backlog(backlog);
        }
        if let Some(lookup_host) = self.lookup_host {
            config.set_lookup_host(lookup_host);
        }
        if let Some(apply_sequence) = self.apply_sequence {
            config.set_apply_sequence(apply_sequence);
        }
        if let Some(millis) = self.read_delay_ms {
            config.set_read_delay_ms(millis);
        }
        if let Some(millis) = self.ssl_handshake_timeout_ms {
            config.set_ssl_handshake_timeout_ms(millis);
        }
        if let Some(direct) = self.using_direct_buffers {
            config.set_using_direct_buffers(direct);
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Role, TransportMode};

    #[test]
    fn parses_kebab_case_definition() {
        let definition = EndpointDefinition::from_toml_str(
            r#"
            role = "Client"
            transport = "nio"
            host = "localhost"
            port = 7001
            so-linger = -1
            single-use = true
            "#,
        )
        .expect("definition");
        let config = definition.into_config().expect("config");
        assert_eq!(config.role(), Some(Role::Client));
        assert_eq!(config.transport_mode(), TransportMode::NonBlocking);
        assert_eq!(config.host(), Some("localhost"));
        assert_eq!(config.so_linger(), Some(-1));
        assert_eq!(config.traffic_class(), None);
        assert!(config.single_use());
    }

    #[test]
    fn unknown_fields_and_tokens_are_rejected() {
        let err = EndpointDefinition::from_toml_str("role = \"server\"\nport = 1\ncolour = 3")
            .expect_err("unknown field");
        assert_eq!(err.field(), Some("definition"));

        let definition =
            EndpointDefinition::from_toml_str("role = \"server\"\nport = 1\ntransport = \"udp\"")
                .expect("parses");
        let err = definition.into_config().expect_err("unknown transport");
        assert_eq!(err.field(), Some("transport"));
    }
}
