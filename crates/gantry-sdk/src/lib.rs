//! Gantry SDK - G-code 点胶龙门工作站 Rust SDK
//!
//! 通过串口或 HTTP/WebSocket 桥接器驱动运行 Marlin 类固件的点胶机器人。
//!
//! # 架构设计
//!
//! 本 SDK 采用分层架构，从底层到高层：
//!
//! - **协议层** (`protocol`): 命令目录、参数模板渲染、应答行解析
//! - **传输层** (`transport`): 面向行的串口与网络桥接传输
//! - **驱动层** (`driver`): 执行引擎、遥测状态、安全抬升策略
//! - **工具层** (`tools`): 设备参数、启动脚本、位置文件
//! - **客户端层** (`client`): 机器人、泵、热板、超声仪与控制面板
//!
//! # 快速开始
//!
//! 大多数用户应该从配置文件装配整台工作站：
//!
//! ```rust,no_run
//! use gantry_sdk::prelude::*;
//!
//! # fn main() -> Result<(), ClientError> {
//! gantry_sdk::init_logging();
//! let config = AppConfig::load_from_file("gantry.toml")?;
//! let gantry = Gantry::connect(&config)?;
//! gantry.robot().move_to(50.0, 60.0, 30.0, None)?;
//! gantry.pump().dispense(1.5, None)?;
//! # Ok(())
//! # }
//! ```
//!
//! 需要直接下发目录命令的用户可以使用驱动层：
//!
//! ```rust,no_run
//! use gantry_sdk::driver::EngineBuilder;
//! use gantry_sdk::protocol::Params;
//! use std::time::Duration;
//!
//! # fn main() -> Result<(), gantry_sdk::DriverError> {
//! let engine = EngineBuilder::new().build()?;
//! let result = engine.execute("home_all", &Params::new(), Duration::from_secs(60))?;
//! println!("{:?}: {}", result.status, result.message);
//! # Ok(())
//! # }
//! ```

pub use gantry_client as client;
pub use gantry_driver as driver;
pub use gantry_protocol as protocol;
pub use gantry_tools as tools;
pub use gantry_transport as transport;

pub mod prelude;

// --- 用户以此为界 ---

// 协议层常用类型
pub use protocol::{Catalog, Params, Position, ProtocolError};

// 传输层
pub use transport::{ConnectionConfig, Transport, TransportError};

// 驱动层
pub use driver::{DriverError, Engine, EngineBuilder, ExecutionResult, ExecutionStatus};

// 客户端层（推荐入口）
pub use client::{AppConfig, ClientError, ControlPanel, Envelope, EnvelopeStatus, Gantry};

/// 默认日志过滤级别（未设置 `RUST_LOG` 时生效）
pub const DEFAULT_LOG_FILTER: &str = "info";

/// 初始化 tracing 日志输出
///
/// 过滤规则取自 `RUST_LOG`，未设置时使用 [`DEFAULT_LOG_FILTER`]。
/// 重复调用是安全的：已安装全局订阅者时直接返回 `false`。
pub fn init_logging() -> bool {
    init_logging_with(DEFAULT_LOG_FILTER)
}

/// 以指定的默认过滤规则初始化日志
pub fn init_logging_with(default_filter: &str) -> bool {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let installed = tracing_subscriber::fmt().with_env_filter(filter).try_init().is_ok();
    if installed {
        tracing::debug!("Logging initialized");
    }
    installed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_is_idempotent() {
        init_logging();
        assert!(!init_logging());
    }
}
