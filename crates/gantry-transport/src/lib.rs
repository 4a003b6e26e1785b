//! # Gantry Transport
//!
//! 传输抽象层：为执行引擎提供统一的 `send` / `read_line` 能力集。
//!
//! - [`SerialTransport`]：串口字节流，按行分帧
//! - [`NetworkTransport`]：HTTP 提交命令，WebSocket（或轮询）接收遥测
//!
//! 具体变体只在构造时选择一次（[`ConnectionConfig::open`]），
//! 之后引擎只通过 [`Transport`] trait 使用它。

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub mod line;
pub mod network;
pub mod serial;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use line::{LineFramer, split_lines};
pub use network::{HttpMethod, NetworkConfig, NetworkTransport, TelemetryMode};
pub use serial::{SerialConfig, SerialTransport};

#[cfg(any(test, feature = "mock"))]
pub use mock::{MockDevice, MockTransport};

/// 传输层统一错误类型
#[derive(Error, Debug)]
pub enum TransportError {
    /// 设备不可达（端口无法打开、连接被拒绝等）
    #[error("Transport unavailable: {0}")]
    Unavailable(String),
    /// 在给定窗口内没有收到任何内容
    #[error("Read timeout")]
    Timeout,
    /// 通道已关闭（接收线程退出或已调用 close）
    #[error("Transport closed")]
    Closed,
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
    /// 网络桥接器拒绝了命令提交
    #[error("Request rejected with HTTP {status}: {body}")]
    Rejected { status: u16, body: String },
}

impl TransportError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout)
    }

    /// IO 错误归类：写超时视为 [`TransportError::Timeout`]
    pub fn from_io(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::TimedOut => TransportError::Timeout,
            _ => TransportError::Io(e),
        }
    }
}

/// 行式传输通道
///
/// 传输本身不可重入：同一时刻只允许一个 `send`/`read_line` 对，
/// 由上层（执行引擎的单飞锁）保证。
pub trait Transport: Send {
    /// 发送一行命令（行尾由实现负责追加）
    fn send(&mut self, line: &str) -> Result<(), TransportError>;

    /// 阻塞读取一行，最长等待 `timeout`
    ///
    /// 超时返回 `Err(TransportError::Timeout)`。
    fn read_line(&mut self, timeout: Duration) -> Result<String, TransportError>;

    /// 非阻塞读取一行
    fn try_read_line(&mut self) -> Result<Option<String>, TransportError> {
        match self.read_line(Duration::ZERO) {
            Ok(line) => Ok(Some(line)),
            Err(TransportError::Timeout) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// 关闭通道并停止后台线程
    fn close(&mut self) {}

    /// 用于日志的简短描述
    fn describe(&self) -> String;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send(&mut self, line: &str) -> Result<(), TransportError> {
        (**self).send(line)
    }

    fn read_line(&mut self, timeout: Duration) -> Result<String, TransportError> {
        (**self).read_line(timeout)
    }

    fn try_read_line(&mut self) -> Result<Option<String>, TransportError> {
        (**self).try_read_line()
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

/// 连接配置：模式选择 + 模式相关参数
///
/// ```toml
/// [connection]
/// mode = "serial"
/// port = "/dev/ttyACM0"
/// baud_rate = 250000
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ConnectionConfig {
    Serial(SerialConfig),
    Network(NetworkConfig),
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig::Serial(SerialConfig::default())
    }
}

impl ConnectionConfig {
    pub fn mode_name(&self) -> &'static str {
        match self {
            ConnectionConfig::Serial(_) => "serial",
            ConnectionConfig::Network(_) => "network",
        }
    }

    pub fn is_network(&self) -> bool {
        matches!(self, ConnectionConfig::Network(_))
    }

    /// 打开对应的传输变体
    pub fn open(&self) -> Result<Box<dyn Transport>, TransportError> {
        match self {
            ConnectionConfig::Serial(config) => Ok(Box::new(SerialTransport::open(config)?)),
            ConnectionConfig::Network(config) => Ok(Box::new(NetworkTransport::connect(config)?)),
        }
    }
}
