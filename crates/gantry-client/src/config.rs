//! 应用配置
//!
//! ```toml
//! locations_file = "locations.json"
//!
//! [connection]
//! mode = "network"
//! host = "192.168.0.1"
//!
//! [engine]
//! default_timeout_ms = 60000
//!
//! [device.robot]
//! safe_z = 150.0
//!
//! [boot]
//! file = "robot_init.gcode"
//! lines = ["M83"]
//! ```

use crate::error::ClientError;
use gantry_driver::{EngineConfig, SafetyPolicy};
use gantry_tools::{DeviceConfig, load_boot_file};
use gantry_transport::ConnectionConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// 启动序列来源：先执行文件中的行，再执行内联行
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootConfig {
    pub file: Option<PathBuf>,
    pub lines: Vec<String>,
}

impl BootConfig {
    /// 合并后的启动行
    pub fn resolve(&self) -> Result<Vec<String>, ClientError> {
        let mut lines = match &self.file {
            Some(path) => load_boot_file(path).map_err(|e| ClientError::Config(format!("{:#}", e)))?,
            None => Vec::new(),
        };
        lines.extend(gantry_tools::parse_boot_script(&self.lines.join("\n")));
        Ok(lines)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub connection: ConnectionConfig,
    /// 未设置时按连接模式取默认值
    pub engine: Option<EngineConfig>,
    pub device: DeviceConfig,
    pub boot: BootConfig,
    pub locations_file: Option<PathBuf>,
}

impl AppConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ClientError> {
        let config: AppConfig =
            toml::from_str(text).map_err(|e| ClientError::Config(e.to_string()))?;
        config
            .device
            .validate()
            .map_err(|e| ClientError::Config(format!("{:#}", e)))?;
        Ok(config)
    }

    /// 从文件加载；配置中的相对路径以配置文件所在目录为基准
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ClientError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| ClientError::Config(format!("{}: {}", path.display(), e)))?;
        let mut config = Self::from_toml_str(&text)?;

        if let Some(base) = path.parent() {
            for p in [&mut config.boot.file, &mut config.locations_file]
                .into_iter()
                .flatten()
            {
                if p.is_relative() {
                    *p = base.join(&*p);
                }
            }
        }
        Ok(config)
    }

    /// 由机器人参数构造安全策略
    pub fn safety_policy(&self) -> SafetyPolicy {
        SafetyPolicy {
            safe_z: self.device.robot.safe_z,
            restore_height: self.device.robot.restore_height,
            ..SafetyPolicy::default()
        }
    }
}
