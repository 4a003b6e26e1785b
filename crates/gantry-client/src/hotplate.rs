//! 加热板（热床）

use crate::error::ClientError;
use gantry_driver::Engine;
use gantry_protocol::Params;
use gantry_tools::HotplateConfig;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub struct Hotplate {
    engine: Arc<Engine>,
    config: HotplateConfig,
    /// 最近一次下发的目标温度
    target: Mutex<f64>,
}

impl Hotplate {
    pub fn new(engine: Arc<Engine>, config: HotplateConfig) -> Self {
        Self {
            engine,
            config,
            target: Mutex::new(0.0),
        }
    }

    /// 把目标温度限制在 [0, max_temp_c]
    pub fn clamp(&self, celsius: f64) -> Result<f64, ClientError> {
        if !celsius.is_finite() {
            return Err(ClientError::InvalidArgument(format!(
                "temperature must be finite, got {}",
                celsius
            )));
        }
        if celsius < 0.0 {
            warn!("Target temperature {}°C is negative, using 0°C", celsius);
            Ok(0.0)
        } else if celsius > self.config.max_temp_c {
            warn!(
                "Target temperature {}°C exceeds {}°C, limiting",
                celsius, self.config.max_temp_c
            );
            Ok(self.config.max_temp_c)
        } else {
            Ok(celsius)
        }
    }

    fn send(&self, action: &str, celsius: f64, timeout: Duration) -> Result<f64, ClientError> {
        let params = Params::new().with("S", celsius);
        let result = self.engine.execute(action, &params, timeout)?;
        ClientError::check(action, result)?;
        *self.target.lock() = celsius;
        Ok(celsius)
    }

    /// 设置目标温度（不等待），返回实际下发的值
    pub fn set_temperature(&self, celsius: f64) -> Result<f64, ClientError> {
        let target = self.clamp(celsius)?;
        info!("Setting hotplate to {}°C", target);
        self.send("set_bed_temp", target, self.engine.config().default_timeout())
    }

    /// 设置目标温度并等待设备报告到温
    pub fn heat_and_wait(&self, celsius: f64, timeout: Duration) -> Result<f64, ClientError> {
        let target = self.clamp(celsius)?;
        info!("Heating hotplate to {}°C and waiting (up to {:?})", target, timeout);
        self.send("set_bed_temp_wait", target, timeout)
    }

    pub fn turn_off(&self) -> Result<(), ClientError> {
        info!("Turning hotplate off");
        self.send("set_bed_temp", 0.0, self.engine.config().default_timeout())
            .map(|_| ())
    }

    /// 最近一次下发的目标温度
    pub fn target(&self) -> f64 {
        *self.target.lock()
    }

    pub fn is_heating(&self) -> bool {
        self.target() > 0.0
    }

    /// 向设备查询当前温度
    pub fn temperature(&self) -> Result<f64, ClientError> {
        Ok(self
            .engine
            .get_temperature(self.engine.config().default_timeout())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_driver::{EngineBuilder, EngineConfig};
    use gantry_transport::mock::MockDevice;

    fn hotplate_on(device: &MockDevice) -> Hotplate {
        let engine = EngineBuilder::new()
            .transport(device.transport())
            .config(EngineConfig {
                read_timeout_ms: 20,
                default_timeout_ms: 1000,
                ..EngineConfig::default()
            })
            .build()
            .unwrap();
        Hotplate::new(engine, HotplateConfig::default())
    }

    #[test]
    fn test_clamping() {
        let device = MockDevice::new();
        let hotplate = hotplate_on(&device);
        assert_eq!(hotplate.clamp(-5.0).unwrap(), 0.0);
        assert_eq!(hotplate.clamp(500.0).unwrap(), 120.0);
        assert_eq!(hotplate.clamp(80.0).unwrap(), 80.0);
        assert!(hotplate.clamp(f64::INFINITY).is_err());
    }

    #[test]
    fn test_set_temperature_tracks_target() {
        let device = MockDevice::new();
        let hotplate = hotplate_on(&device);

        assert_eq!(hotplate.set_temperature(200.0).unwrap(), 120.0);
        assert_eq!(hotplate.target(), 120.0);
        assert!(hotplate.is_heating());

        hotplate.turn_off().unwrap();
        assert!(!hotplate.is_heating());
        assert_eq!(device.sent(), vec!["M140 S120", "M140 S0"]);
    }

    #[test]
    fn test_heat_and_wait_reads_temperature() {
        let device = MockDevice::new();
        device.simulate_marlin(0.0, 0.0, 0.0);
        let hotplate = hotplate_on(&device);

        hotplate.heat_and_wait(65.5, Duration::from_secs(2)).unwrap();
        assert_eq!(hotplate.temperature().unwrap(), 65.5);
        assert_eq!(device.sent(), vec!["M190 S65.5", "M105"]);
    }

    #[test]
    fn test_heat_and_wait_timeout_keeps_previous_target() {
        let device = MockDevice::new();
        let hotplate = hotplate_on(&device);
        let err = hotplate
            .heat_and_wait(60.0, Duration::from_millis(100))
            .unwrap_err();
        assert!(matches!(err, ClientError::Command { .. }));
        assert_eq!(hotplate.target(), 0.0);
    }
}
