//! 蠕动泵（由挤出机轴驱动）
//!
//! 体积与流速按 `mm_per_ml` 换算成挤出长度 E 和进给速度 F。

use crate::error::ClientError;
use gantry_driver::{Engine, ExecutionResult};
use gantry_protocol::Params;
use gantry_tools::PumpConfig;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// 一次泵送的换算结果
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PumpMove {
    /// 挤出长度（mm，负值为反抽）
    pub distance_mm: f64,
    /// 进给速度（mm/min，恒为正）
    pub feedrate_mm_min: f64,
}

impl PumpMove {
    /// 按进给速度估算的运行时长
    pub fn expected_duration(&self) -> Duration {
        Duration::try_from_secs_f64(self.distance_mm.abs() / self.feedrate_mm_min * 60.0)
            .unwrap_or(Duration::ZERO)
    }
}

#[derive(Clone)]
pub struct Pump {
    engine: Arc<Engine>,
    config: PumpConfig,
}

impl Pump {
    pub fn new(engine: Arc<Engine>, config: PumpConfig) -> Self {
        Self { engine, config }
    }

    pub fn config(&self) -> &PumpConfig {
        &self.config
    }

    fn rate(&self, rate_ml_min: Option<f64>) -> Result<f64, ClientError> {
        let rate = rate_ml_min.unwrap_or(self.config.default_rate_ml_min);
        if !rate.is_finite() || rate == 0.0 || rate.abs() > self.config.max_rate_ml_min {
            return Err(ClientError::InvalidArgument(format!(
                "flow rate must be non-zero and within ±{} mL/min, got {}",
                self.config.max_rate_ml_min, rate
            )));
        }
        Ok(rate)
    }

    /// 按体积泵送的换算（不发送）
    pub fn plan_volume(
        &self,
        volume_ml: f64,
        rate_ml_min: Option<f64>,
    ) -> Result<PumpMove, ClientError> {
        if !volume_ml.is_finite() || volume_ml == 0.0 || volume_ml.abs() > self.config.max_volume_ml {
            return Err(ClientError::InvalidArgument(format!(
                "volume must be non-zero and within ±{} mL, got {}",
                self.config.max_volume_ml, volume_ml
            )));
        }
        let rate = self.rate(rate_ml_min)?;
        Ok(PumpMove {
            distance_mm: volume_ml * self.config.mm_per_ml,
            feedrate_mm_min: rate.abs() * self.config.mm_per_ml,
        })
    }

    /// 按时长泵送的换算（不发送）；流速为负时反抽
    pub fn plan_duration(
        &self,
        duration: Duration,
        rate_ml_min: Option<f64>,
    ) -> Result<PumpMove, ClientError> {
        if duration.is_zero() {
            return Err(ClientError::InvalidArgument(
                "duration must be positive".to_string(),
            ));
        }
        let rate = self.rate(rate_ml_min)?;
        Ok(PumpMove {
            distance_mm: rate * self.config.mm_per_ml * duration.as_secs_f64() / 60.0,
            feedrate_mm_min: rate.abs() * self.config.mm_per_ml,
        })
    }

    /// 泵送给定体积（mL）
    pub fn dispense(
        &self,
        volume_ml: f64,
        rate_ml_min: Option<f64>,
    ) -> Result<ExecutionResult, ClientError> {
        let plan = self.plan_volume(volume_ml, rate_ml_min)?;
        info!("Dispensing {} mL", volume_ml);
        self.execute(plan)
    }

    /// 按给定流速运行一段时间
    pub fn run_for(
        &self,
        duration: Duration,
        rate_ml_min: Option<f64>,
    ) -> Result<ExecutionResult, ClientError> {
        let plan = self.plan_duration(duration, rate_ml_min)?;
        info!("Pumping for {:?}", duration);
        self.execute(plan)
    }

    fn execute(&self, plan: PumpMove) -> Result<ExecutionResult, ClientError> {
        if plan.feedrate_mm_min > self.config.max_feedrate_mm_min {
            warn!(
                "Pump feedrate {:.2} mm/min exceeds {:.2} mm/min, check the flow rate",
                plan.feedrate_mm_min, self.config.max_feedrate_mm_min
            );
        }
        let timeout = self.engine.config().default_timeout() + plan.expected_duration();

        let result = self
            .engine
            .execute("set_extruder_relative", &Params::new(), timeout)?;
        ClientError::check("set_extruder_relative", result)?;

        let params = Params::new()
            .with("E", plan.distance_mm)
            .with("F", plan.feedrate_mm_min);
        let result = self.engine.execute("pump_move", &params, timeout)?;
        ClientError::check("pump_move", result)
    }
}
