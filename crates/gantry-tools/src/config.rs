//! # 设备配置
//!
//! 机器人、泵、超声仪和加热板的参数，TOML 格式：
//!
//! ```toml
//! [robot]
//! safe_z = 150.0
//! default_feedrate = 3000.0
//!
//! [pump]
//! mm_per_ml = 1.0
//! default_rate_ml_min = 5.0
//!
//! [sonicator]
//! duration_s = 10.0
//!
//! [hotplate]
//! max_temp_c = 120.0
//! ```
//!
//! 所有字段都有默认值，缺省的节按默认值补齐。

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// 设备配置
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub robot: RobotConfig,
    pub pump: PumpConfig,
    pub sonicator: SonicatorConfig,
    pub hotplate: HotplateConfig,
}

/// 龙门参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RobotConfig {
    /// 水平移动前的安全高度（mm）
    pub safe_z: f64,
    /// 未指定速度时的进给速度（mm/min）
    pub default_feedrate: f64,
    /// 抬升后的水平运动结束时是否回到原高度
    pub restore_height: bool,
}

impl Default for RobotConfig {
    fn default() -> Self {
        Self {
            safe_z: 150.0,
            default_feedrate: 3000.0,
            restore_height: false,
        }
    }
}

/// 蠕动泵参数（由挤出机轴驱动）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PumpConfig {
    /// 每毫升对应的挤出长度（mm）
    pub mm_per_ml: f64,
    /// 未指定流速时的默认值（mL/min）
    pub default_rate_ml_min: f64,
    /// 超过该进给速度时给出警告（mm/min）
    pub max_feedrate_mm_min: f64,
    /// 单次泵送体积上限（绝对值，mL）
    pub max_volume_ml: f64,
    /// 流速上限（绝对值，mL/min）
    pub max_rate_ml_min: f64,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            mm_per_ml: 1.0,
            default_rate_ml_min: 5.0,
            max_feedrate_mm_min: 400.0,
            max_volume_ml: 50.0,
            max_rate_ml_min: 80.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SonicatorConfig {
    /// 默认运行时长（秒）
    pub duration_s: f64,
}

impl Default for SonicatorConfig {
    fn default() -> Self {
        Self { duration_s: 10.0 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HotplateConfig {
    /// 目标温度上限（摄氏度）
    pub max_temp_c: f64,
}

impl Default for HotplateConfig {
    fn default() -> Self {
        Self { max_temp_c: 120.0 }
    }
}

impl DeviceConfig {
    /// 从 TOML 文本解析并校验
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: DeviceConfig = toml::from_str(text).context("Invalid device config")?;
        config.validate()?;
        Ok(config)
    }

    /// 从文件加载配置
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read device config {}", path.display()))?;
        Self::from_toml_str(&text).with_context(|| format!("In {}", path.display()))
    }

    /// 保存配置到文件
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let text = toml::to_string_pretty(self).context("Failed to serialize device config")?;
        fs::write(path, text).with_context(|| format!("Failed to write {}", path.display()))
    }

    /// 检查数值是否合理（有限且为正）
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("robot.default_feedrate", self.robot.default_feedrate),
            ("pump.mm_per_ml", self.pump.mm_per_ml),
            ("pump.default_rate_ml_min", self.pump.default_rate_ml_min),
            ("pump.max_feedrate_mm_min", self.pump.max_feedrate_mm_min),
            ("pump.max_volume_ml", self.pump.max_volume_ml),
            ("pump.max_rate_ml_min", self.pump.max_rate_ml_min),
            ("sonicator.duration_s", self.sonicator.duration_s),
            ("hotplate.max_temp_c", self.hotplate.max_temp_c),
        ];
        for (name, value) in positive {
            if !value.is_finite() || value <= 0.0 {
                bail!("{} must be a positive number, got {}", name, value);
            }
        }
        if !self.robot.safe_z.is_finite() {
            bail!("robot.safe_z must be finite, got {}", self.robot.safe_z);
        }
        if self.pump.default_rate_ml_min > self.pump.max_rate_ml_min {
            bail!(
                "pump.default_rate_ml_min ({}) exceeds pump.max_rate_ml_min ({})",
                self.pump.default_rate_ml_min,
                self.pump.max_rate_ml_min
            );
        }
        Ok(())
    }
}
