//! Prelude - 常用类型的便捷导入
//!
//! ```rust
//! use gantry_sdk::prelude::*;
//! ```

// 客户端层（推荐使用）
pub use crate::client::{
    AppConfig, ControlPanel, Direction, Envelope, EnvelopeStatus, Gantry, Hotplate, Pump, Robot,
    Sonicator,
};

// 驱动层
pub use crate::driver::{
    ConnectionState, Engine, EngineBuilder, EngineConfig, ExecutionResult, ExecutionStatus,
    SafetyPolicy, TelemetrySnapshot,
};

// 协议层
pub use crate::protocol::{Catalog, Params, Position};

// 传输层
pub use crate::transport::{ConnectionConfig, Transport};

// 错误类型
pub use crate::client::ClientError;
pub use crate::driver::DriverError;
pub use crate::protocol::ProtocolError;
pub use crate::transport::TransportError;
