//! 客户端接口模块
//!
//! 面向实验流程的仪器接口：
//! - [`Robot`]：绝对/相对运动、点动、命名位置
//! - [`Pump`]：按体积或时长泵送
//! - [`Hotplate`]：温度设定与查询
//! - [`Sonicator`]：定时超声
//! - [`ControlPanel`]：返回 JSON 信封的操作集合
//!
//! 所有仪器共享同一个执行引擎，调用会在引擎层串行化。
//! [`Gantry`] 负责按 [`AppConfig`] 装配它们。

pub mod config;
mod error;
mod gantry;
pub mod hotplate;
pub mod panel;
pub mod pump;
pub mod robot;
pub mod sonicator;

pub use config::{AppConfig, BootConfig};
pub use error::ClientError;
pub use gantry::Gantry;
pub use hotplate::Hotplate;
pub use panel::{ControlPanel, DEFAULT_STEP_MM, Envelope, EnvelopeStatus};
pub use pump::{Pump, PumpMove};
pub use robot::{Direction, Robot};
pub use sonicator::Sonicator;
