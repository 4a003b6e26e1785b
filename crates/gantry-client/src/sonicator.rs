//! 超声仪（风扇输出驱动的继电器）
//!
//! 序列：`fan_on` → `dwell` → `fan_off`。无论前两步是否成功都会尝试关闭。

use crate::error::ClientError;
use gantry_driver::Engine;
use gantry_protocol::Params;
use gantry_tools::SonicatorConfig;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Clone)]
pub struct Sonicator {
    engine: Arc<Engine>,
    config: SonicatorConfig,
}

impl Sonicator {
    pub fn new(engine: Arc<Engine>, config: SonicatorConfig) -> Self {
        Self { engine, config }
    }

    /// 按配置的默认时长运行
    pub fn run(&self) -> Result<(), ClientError> {
        let duration = Duration::try_from_secs_f64(self.config.duration_s).map_err(|_| {
            ClientError::InvalidArgument(format!(
                "invalid sonication duration {} s",
                self.config.duration_s
            ))
        })?;
        self.run_for(duration)
    }

    pub fn run_for(&self, duration: Duration) -> Result<(), ClientError> {
        let duration_ms = duration.as_millis() as u64;
        if duration_ms == 0 {
            return Err(ClientError::InvalidArgument(
                "sonication duration must be at least 1 ms".to_string(),
            ));
        }
        info!("Running sonicator for {:?}", duration);

        let base = self.engine.config().default_timeout();
        let run = self
            .step("fan_on", &Params::new(), base)
            .and_then(|()| {
                self.step(
                    "dwell",
                    &Params::new().with("duration_ms", duration_ms),
                    base + duration,
                )
            });

        let off = self.step("fan_off", &Params::new(), base);
        match (run, off) {
            (Err(e), off) => {
                if let Err(off_err) = off {
                    warn!("Failed to turn sonicator off: {}", off_err);
                }
                Err(e)
            },
            (Ok(()), Err(off_err)) => {
                warn!("Sonication finished but fan_off failed: {}", off_err);
                Ok(())
            },
            (Ok(()), Ok(())) => Ok(()),
        }
    }

    fn step(&self, action: &str, params: &Params, timeout: Duration) -> Result<(), ClientError> {
        let result = self.engine.execute(action, params, timeout)?;
        ClientError::check(action, result).map(|_| ())
    }
}
