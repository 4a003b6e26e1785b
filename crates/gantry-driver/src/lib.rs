//! # Gantry Driver
//!
//! 驱动层：命令执行引擎、遥测状态与安全策略。
//!
//! - 执行引擎（单飞锁，超时有界，完成策略驱动的等待）
//! - 状态同步（ArcSwap 无锁读取遥测快照）
//! - 安全抬升（低于安全高度的水平运动先抬升）
//! - 已保存位置表
//!
//! # 使用场景
//!
//! 需要按动作名直接驱动设备时使用本 crate；面向仪器的高层接口见
//! `gantry-client`。

mod builder;
pub mod config;
mod engine;
mod error;
pub mod safety;
pub mod state;

pub use builder::EngineBuilder;
pub use config::{AckAccounting, EngineConfig};
pub use engine::{Engine, ExecutionResult, ExecutionStatus};
pub use error::DriverError;
pub use safety::{ClearancePlan, MoveTarget, Positioning, SafetyPolicy, requires_clearance};
pub use state::*;
