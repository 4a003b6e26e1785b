//! 执行引擎配置

use gantry_protocol::ParserConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 应答计数方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AckAccounting {
    /// 每发送一行欠一个应答（先排空再等待的步骤需要两个）
    PerLine,
    /// 发送排空命令后 `window_ms` 内到达的应答被忽略，之后第一个应答即完成
    ///
    /// 用于会提前转发应答的网络桥接器。短于窗口的动作需要等到下一个应答。
    Settled { window_ms: u64 },
}

/// 执行引擎配置
///
/// # Example
///
/// ```
/// use gantry_driver::EngineConfig;
///
/// let config = EngineConfig {
///     read_timeout_ms: 500,
///     ..Default::default()
/// };
/// assert_eq!(config.default_timeout_ms, 120_000);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// 单次读取的超时（毫秒）
    pub read_timeout_ms: u64,
    /// 未指定时的总超时（毫秒）
    pub default_timeout_ms: u64,
    /// 启动序列每行的应答超时（毫秒）
    pub boot_line_timeout_ms: u64,
    /// 启动序列行间隔（毫秒）
    pub boot_line_gap_ms: u64,
    /// 启动序列是否逐行等待应答
    pub boot_requires_ack: bool,
    /// 排空命令（强制设备清空运动队列）
    pub drain_action: String,
    pub position_action: String,
    pub temperature_action: String,
    /// 安全抬升使用的运动命令
    pub move_action: String,
    /// 切换到绝对 / 相对定位的命令（相对模式下的抬升借用）
    pub absolute_action: String,
    pub relative_action: String,
    pub ack_accounting: AckAccounting,
    pub parser: ParserConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            read_timeout_ms: 1000,
            default_timeout_ms: 120_000,
            boot_line_timeout_ms: 5000,
            boot_line_gap_ms: 50,
            boot_requires_ack: true,
            drain_action: "wait_finish".to_string(),
            position_action: "get_position".to_string(),
            temperature_action: "get_temp".to_string(),
            move_action: "move".to_string(),
            absolute_action: "set_absolute".to_string(),
            relative_action: "set_relative".to_string(),
            ack_accounting: AckAccounting::PerLine,
            parser: ParserConfig::default(),
        }
    }
}

impl EngineConfig {
    /// 网络桥接器的默认配置
    pub fn for_network() -> Self {
        Self {
            ack_accounting: AckAccounting::Settled { window_ms: 1500 },
            ..Self::default()
        }
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms.max(1))
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn boot_line_timeout(&self) -> Duration {
        Duration::from_millis(self.boot_line_timeout_ms)
    }

    pub fn boot_line_gap(&self) -> Duration {
        Duration::from_millis(self.boot_line_gap_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.read_timeout(), Duration::from_secs(1));
        assert_eq!(config.default_timeout(), Duration::from_secs(120));
        assert_eq!(config.ack_accounting, AckAccounting::PerLine);
        assert_eq!(
            EngineConfig::for_network().ack_accounting,
            AckAccounting::Settled { window_ms: 1500 }
        );
    }

    #[test]
    fn test_from_toml() {
        let config: EngineConfig = toml::from_str(
            r#"
            read_timeout_ms = 250
            ack_accounting = { kind = "settled", window_ms = 800 }

            [parser]
            ack = [{ kind = "exact", value = "ok" }]
            "#,
        )
        .unwrap();
        assert_eq!(config.read_timeout_ms, 250);
        assert_eq!(config.ack_accounting, AckAccounting::Settled { window_ms: 800 });
        assert_eq!(config.parser.ack.len(), 1);
        assert_eq!(config.drain_action, "wait_finish");
    }
}
