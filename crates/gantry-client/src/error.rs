//! 客户端错误类型

use gantry_driver::{DriverError, ExecutionResult, ExecutionStatus};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    /// 引擎拒绝了请求（输入错误、未就绪、查询超时等）
    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),

    /// 命令已发出但没有成功完成
    #[error("Command '{action}' ended with {status:?}: {message}")]
    Command {
        action: String,
        status: ExecutionStatus,
        message: String,
    },

    /// 参数超出设备允许范围
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unknown location: {0}")]
    UnknownLocation(String),

    /// 位置已更新但写入文件失败
    #[error("Failed to persist locations: {0}")]
    Persist(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ClientError {
    /// 把非 `Ok` 的执行结果转为错误
    pub(crate) fn check(action: &str, result: ExecutionResult) -> Result<ExecutionResult, ClientError> {
        if result.is_ok() {
            Ok(result)
        } else {
            Err(ClientError::Command {
                action: action.to_string(),
                status: result.status,
                message: result.message,
            })
        }
    }
}
