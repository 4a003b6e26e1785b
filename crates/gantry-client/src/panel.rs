//! 控制面板接口
//!
//! 面向外部调用方（Web 界面、脚本编排器）的操作集合。每个操作都返回
//! 一个可直接序列化为 JSON 的 [`Envelope`]，不会向调用方抛出错误。

use crate::robot::{Direction, Robot};
use gantry_protocol::Position;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

/// 点动默认步长（mm）
pub const DEFAULT_STEP_MM: f64 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeStatus {
    Ok,
    Error,
    Warning,
    Info,
}

/// 操作结果
///
/// ```json
/// { "status": "ok", "message": "Location 'vial' saved", "locations": { ... } }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub status: EnvelopeStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locations: Option<BTreeMap<String, Position>>,
}

impl Envelope {
    fn new(status: EnvelopeStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            position: None,
            locations: None,
        }
    }

    pub fn ok(message: impl Into<String>) -> Self {
        Self::new(EnvelopeStatus::Ok, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(EnvelopeStatus::Error, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(EnvelopeStatus::Warning, message)
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(EnvelopeStatus::Info, message)
    }

    pub fn with_position(mut self, position: Option<Position>) -> Self {
        self.position = position;
        self
    }

    pub fn with_locations(mut self, locations: BTreeMap<String, Position>) -> Self {
        self.locations = Some(locations);
        self
    }

    pub fn is_ok(&self) -> bool {
        self.status == EnvelopeStatus::Ok
    }
}

/// 控制面板
#[derive(Clone)]
pub struct ControlPanel {
    robot: Robot,
}

impl ControlPanel {
    pub fn new(robot: Robot) -> Self {
        Self { robot }
    }

    /// 点动；`step` 缺省为 [`DEFAULT_STEP_MM`]
    pub fn move_step(&self, direction: &str, step: Option<f64>) -> Envelope {
        let direction: Direction = match direction.parse() {
            Ok(direction) => direction,
            Err(e) => return Envelope::error(e.to_string()),
        };
        let step = step.unwrap_or(DEFAULT_STEP_MM);

        match self.robot.jog(direction, step) {
            Ok(target) => Envelope::ok(format!("Moved {} by {} mm", direction, step))
                .with_position(Some(target)),
            Err(e) => Envelope::error(format!("Move {} failed: {}", direction, e))
                .with_position(self.robot.cached_position()),
        }
    }

    pub fn home_all(&self) -> Envelope {
        match self.robot.home() {
            Ok(()) => Envelope::ok("Homed all axes").with_position(self.robot.cached_position()),
            Err(e) => Envelope::error(format!("Homing failed: {}", e)),
        }
    }

    /// 查询位置；查询失败时退回到最近一次遥测位置
    pub fn get_position(&self) -> Envelope {
        match self.robot.position() {
            Ok(position) => Envelope::ok("Position updated").with_position(Some(position)),
            Err(e) => match self.robot.cached_position() {
                Some(cached) => {
                    warn!("Position query failed, returning last known position: {}", e);
                    Envelope::warning(format!("Could not refresh position ({}); showing last known", e))
                        .with_position(Some(cached))
                },
                None => Envelope::error(format!("Position unknown: {}", e)),
            },
        }
    }

    pub fn save_location(&self, name: &str) -> Envelope {
        if name.trim().is_empty() {
            return Envelope::error("Location name cannot be empty");
        }
        match self.robot.save_location(name) {
            Ok(saved) => Envelope::ok(format!("Location '{}' saved", saved.name))
                .with_position(Some(saved.position))
                .with_locations(self.robot.locations().as_ref().clone()),
            Err(e) => Envelope::error(format!("Failed to save location '{}': {}", name.trim(), e)),
        }
    }

    pub fn locations(&self) -> Envelope {
        let locations = self.robot.locations().as_ref().clone();
        let envelope = if locations.is_empty() {
            Envelope::info("No saved locations")
        } else {
            Envelope::ok(format!("{} saved locations", locations.len()))
        };
        envelope.with_locations(locations)
    }
}
