//! # Gantry Protocol
//!
//! G-code 协议层：命令目录、参数渲染与响应行解析。
//!
//! 本 crate 无状态、无 IO，只负责把语义动作翻译成协议文本，
//! 以及把设备回送的文本行分类为类型化事件。

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod catalog;
pub mod response;
pub mod template;

pub use catalog::{Catalog, CommandSpec, CompletionPolicy, ParamKind, ParamSpec};
pub use response::{AckMatcher, ParsedLine, ParserConfig, ResponseEvent, ResponseParser};
pub use template::{ParamValue, Params, Template};

/// 笛卡尔位置（毫米，单一绝对坐标系）
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Position {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "X:{:.3} Y:{:.3} Z:{:.3}", self.x, self.y, self.z)
    }
}

/// 协议层错误类型
///
/// 前三类属于调用方输入错误，在任何传输之前被拒绝。
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    /// 命令目录中不存在该动作
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    /// 必填参数既未提供也没有默认值
    #[error("Command '{command}' is missing required parameter '{param}'")]
    MissingParameter { command: String, param: String },

    /// 参数值无法格式化为槽位期望的类型
    #[error("Invalid value for parameter '{param}' of command '{command}': {reason}")]
    InvalidParameter {
        command: String,
        param: String,
        reason: String,
    },

    /// 命令目录定义本身不合法
    #[error("Invalid catalog: {0}")]
    InvalidCatalog(String),

    /// 应答识别正则无法编译
    #[error("Invalid acknowledgement pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },
}
