//! 驱动层错误类型定义

use crate::state::ConnectionState;
use gantry_protocol::ProtocolError;
use gantry_transport::TransportError;
use std::time::Duration;
use thiserror::Error;

/// 驱动层错误类型
#[derive(Error, Debug)]
pub enum DriverError {
    /// 协议错误（未知命令、缺少参数、参数非法），在任何传输之前被拒绝
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// 传输错误（设备不可达、读超时、通道关闭）
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// 设备对已发送的命令报告故障（原文）
    #[error("Device error: {0}")]
    Device(String),

    /// 等待循环超过了给定时限
    #[error("Execution timed out after {0:?}")]
    ExecutionTimeout(Duration),

    /// 启动序列失败，连接不可用
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// 引擎尚未就绪（未启动、启动中或启动失败）
    #[error("Engine not ready (state: {0})")]
    NotReady(ConnectionState),

    /// 遥测中还没有任何位置报告
    #[error("Position unknown: no position report has been parsed yet")]
    PositionUnknown,

    /// 无效输入
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl DriverError {
    /// 调用方输入错误（不应重试）
    pub fn is_caller_error(&self) -> bool {
        matches!(self, DriverError::Protocol(_) | DriverError::InvalidInput(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 测试 DriverError 的 Display 实现
    #[test]
    fn test_driver_error_display() {
        let err = DriverError::Protocol(ProtocolError::UnknownCommand("jump".into()));
        assert_eq!(format!("{}", err), "Protocol error: Unknown command: jump");
        assert!(err.is_caller_error());

        let err = DriverError::Transport(TransportError::Timeout);
        assert!(format!("{}", err).contains("Read timeout"));
        assert!(!err.is_caller_error());

        let err = DriverError::Device("Error:Printer halted".into());
        assert_eq!(format!("{}", err), "Device error: Error:Printer halted");

        let err = DriverError::NotReady(ConnectionState::Failed("boot line 1".into()));
        assert!(format!("{}", err).contains("failed: boot line 1"));

        let err = DriverError::ExecutionTimeout(Duration::from_millis(1500));
        assert_eq!(format!("{}", err), "Execution timed out after 1.5s");
    }
}
