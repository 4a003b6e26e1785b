//! Builder 模式实现
//!
//! 提供链式构造并启动 [`Engine`] 的便捷方式。

use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::error::DriverError;
use crate::safety::SafetyPolicy;
use gantry_protocol::{Catalog, catalog};
use gantry_transport::{ConnectionConfig, Transport};
use std::sync::Arc;
use tracing::info;

/// Engine Builder（链式构造）
///
/// 未指定传输时按 [`ConnectionConfig`] 打开；未指定命令目录时使用
/// 进程级目录 [`catalog::global`]。网络模式下若未显式给出引擎配置，
/// 使用 [`EngineConfig::for_network`]。
///
/// # Example
///
/// ```no_run
/// use gantry_driver::{EngineBuilder, SafetyPolicy};
/// use gantry_transport::{ConnectionConfig, SerialConfig};
///
/// let engine = EngineBuilder::new()
///     .connection(ConnectionConfig::Serial(SerialConfig {
///         port: "/dev/ttyACM0".to_string(),
///         ..Default::default()
///     }))
///     .safety(SafetyPolicy { safe_z: 120.0, ..Default::default() })
///     .boot_sequence(["G90", "M83"])
///     .build()
///     .unwrap();
/// ```
pub struct EngineBuilder {
    connection: ConnectionConfig,
    transport: Option<Box<dyn Transport>>,
    catalog: Option<Arc<Catalog>>,
    config: Option<EngineConfig>,
    policy: SafetyPolicy,
    boot: Vec<String>,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            transport: None,
            catalog: None,
            config: None,
            policy: SafetyPolicy::default(),
            boot: Vec::new(),
        }
    }

    /// 设置连接配置（串口或网络）
    pub fn connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }

    /// 直接使用已打开的传输（优先于连接配置）
    pub fn transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Some(Box::new(transport));
        self
    }

    pub fn catalog(mut self, catalog: Arc<Catalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn safety(mut self, policy: SafetyPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// 连接建立后逐行发送的启动序列
    pub fn boot_sequence<I, S>(mut self, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.boot = lines.into_iter().map(Into::into).collect();
        self
    }

    /// 打开传输、创建引擎并运行启动序列
    ///
    /// 启动失败时返回 [`DriverError::ConnectionFailed`]。
    pub fn build(self) -> Result<Arc<Engine>, DriverError> {
        let config = match self.config {
            Some(config) => config,
            None if self.transport.is_none() && self.connection.is_network() => {
                EngineConfig::for_network()
            },
            None => EngineConfig::default(),
        };

        let transport = match self.transport {
            Some(transport) => transport,
            None => {
                info!("Opening {} connection", self.connection.mode_name());
                self.connection
                    .open()
                    .map_err(|e| DriverError::ConnectionFailed(e.to_string()))?
            },
        };

        let catalog = self
            .catalog
            .unwrap_or_else(|| Arc::new(catalog::global().clone()));

        let engine = Engine::new(transport, catalog, config, self.policy)?;
        engine.boot(&self.boot)?;
        Ok(Arc::new(engine))
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}
