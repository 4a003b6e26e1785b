//! 龙门机器人
//!
//! 绝对坐标运动、相对运动、点动、命名位置。安全抬升由执行引擎负责，
//! 这里只负责把意图翻译成绝对目标。

use crate::error::ClientError;
use gantry_driver::{Engine, SavedLocation};
use gantry_protocol::{Params, Position};
use gantry_tools::{LocationFile, RobotConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

/// 点动方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    XPlus,
    XMinus,
    YPlus,
    YMinus,
    ZPlus,
    ZMinus,
}

impl Direction {
    pub const ALL: [Direction; 6] = [
        Direction::XPlus,
        Direction::XMinus,
        Direction::YPlus,
        Direction::YMinus,
        Direction::ZPlus,
        Direction::ZMinus,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::XPlus => "x_plus",
            Direction::XMinus => "x_minus",
            Direction::YPlus => "y_plus",
            Direction::YMinus => "y_minus",
            Direction::ZPlus => "z_plus",
            Direction::ZMinus => "z_minus",
        }
    }

    /// 给定步长下的 (dx, dy, dz)
    pub fn delta(self, step: f64) -> (f64, f64, f64) {
        match self {
            Direction::XPlus => (step, 0.0, 0.0),
            Direction::XMinus => (-step, 0.0, 0.0),
            Direction::YPlus => (0.0, step, 0.0),
            Direction::YMinus => (0.0, -step, 0.0),
            Direction::ZPlus => (0.0, 0.0, step),
            Direction::ZMinus => (0.0, 0.0, -step),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Direction::ALL
            .into_iter()
            .find(|d| d.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ClientError::InvalidArgument(format!("unknown direction '{}'", s)))
    }
}

/// 龙门机器人
#[derive(Clone)]
pub struct Robot {
    engine: Arc<Engine>,
    config: RobotConfig,
    location_file: Option<LocationFile>,
}

impl Robot {
    pub fn new(engine: Arc<Engine>, config: RobotConfig) -> Self {
        Self {
            engine,
            config,
            location_file: None,
        }
    }

    /// 绑定位置文件，并把其中的位置载入引擎
    pub fn with_location_file(mut self, file: LocationFile) -> Result<Self, ClientError> {
        let locations = file
            .load()
            .map_err(|e| ClientError::Config(format!("{:#}", e)))?;
        info!("Loaded {} locations from {}", locations.len(), file.path().display());
        self.engine.load_locations(locations);
        self.location_file = Some(file);
        Ok(self)
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn config(&self) -> &RobotConfig {
        &self.config
    }

    fn feedrate(&self, feed: Option<f64>) -> Result<f64, ClientError> {
        match feed {
            None => Ok(self.config.default_feedrate),
            Some(f) if f.is_finite() && f > 0.0 => Ok(f),
            Some(f) => Err(ClientError::InvalidArgument(format!(
                "feedrate must be positive, got {}",
                f
            ))),
        }
    }

    fn run(&self, action: &str, params: &Params) -> Result<(), ClientError> {
        let result = self.engine.execute_default(action, params)?;
        ClientError::check(action, result).map(|_| ())
    }

    /// 回零，然后刷新位置
    pub fn home(&self) -> Result<(), ClientError> {
        info!("Homing all axes");
        self.run("home_all", &Params::new())?;
        if let Err(e) = self.position() {
            warn!("Homed, but position refresh failed: {}", e);
        }
        Ok(())
    }

    /// 移动到绝对坐标（mm）
    pub fn move_to(&self, x: f64, y: f64, z: f64, feed: Option<f64>) -> Result<(), ClientError> {
        if ![x, y, z].iter().all(|v| v.is_finite()) {
            return Err(ClientError::InvalidArgument(format!(
                "target must be finite, got ({}, {}, {})",
                x, y, z
            )));
        }
        let params = Params::new()
            .with("X", x)
            .with("Y", y)
            .with("Z", z)
            .with("F", self.feedrate(feed)?);
        info!("Moving to ({:.3}, {:.3}, {:.3})", x, y, z);
        self.run("move", &params)
    }

    /// 相对移动：先刷新位置，再换算成绝对目标
    pub fn move_relative(
        &self,
        dx: f64,
        dy: f64,
        dz: f64,
        feed: Option<f64>,
    ) -> Result<Position, ClientError> {
        let current = self.position()?;
        let target = Position::new(current.x + dx, current.y + dy, current.z + dz);
        self.move_to(target.x, target.y, target.z, feed)?;
        Ok(target)
    }

    /// 沿一个方向点动 `step` 毫米
    pub fn jog(&self, direction: Direction, step: f64) -> Result<Position, ClientError> {
        if !step.is_finite() || step <= 0.0 {
            return Err(ClientError::InvalidArgument(format!(
                "step must be positive, got {}",
                step
            )));
        }
        let (dx, dy, dz) = direction.delta(step);
        self.move_relative(dx, dy, dz, None)
    }

    /// 向设备查询当前位置
    pub fn position(&self) -> Result<Position, ClientError> {
        let timeout = self.engine.config().default_timeout();
        Ok(self.engine.get_position(timeout)?)
    }

    /// 遥测中最近一次位置（不与设备通信）
    pub fn cached_position(&self) -> Option<Position> {
        self.engine.telemetry().position
    }

    /// 以当前位置保存命名位置
    ///
    /// 位置刷新失败时退回到遥测中的最近位置；配置了位置文件时同时写入文件。
    pub fn save_location(&self, name: &str) -> Result<SavedLocation, ClientError> {
        if let Err(e) = self.position() {
            warn!("Position refresh failed, saving last known position: {}", e);
        }
        let saved = self.engine.save_location(name)?;
        if let Some(file) = &self.location_file {
            file.upsert(&saved.name, saved.position)
                .map_err(|e| ClientError::Persist(format!("{:#}", e)))?;
        }
        Ok(saved)
    }

    /// 移动到命名位置（可附加 Z 偏移）
    pub fn move_to_location(
        &self,
        name: &str,
        z_offset: f64,
        feed: Option<f64>,
    ) -> Result<Position, ClientError> {
        let location = self
            .engine
            .location(name)
            .ok_or_else(|| ClientError::UnknownLocation(name.to_string()))?;
        let target = Position::new(location.x, location.y, location.z + z_offset);
        info!("Moving to location '{}' at {}", name, target);
        self.move_to(target.x, target.y, target.z, feed)?;
        Ok(target)
    }

    pub fn locations(&self) -> Arc<BTreeMap<String, Position>> {
        self.engine.locations()
    }
}
