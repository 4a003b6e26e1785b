//! 设备装配
//!
//! 按 [`AppConfig`] 打开连接、启动引擎，并创建各仪器模块与控制面板。

use crate::config::AppConfig;
use crate::error::ClientError;
use crate::hotplate::Hotplate;
use crate::panel::ControlPanel;
use crate::pump::Pump;
use crate::robot::Robot;
use crate::sonicator::Sonicator;
use gantry_driver::{Engine, EngineBuilder};
use gantry_tools::LocationFile;
use gantry_transport::Transport;
use std::sync::Arc;
use tracing::info;

/// 一台已连接的龙门工作站
pub struct Gantry {
    engine: Arc<Engine>,
    robot: Robot,
    pump: Pump,
    hotplate: Hotplate,
    sonicator: Sonicator,
}

impl Gantry {
    /// 按配置打开连接并启动
    pub fn connect(config: &AppConfig) -> Result<Self, ClientError> {
        Self::assemble(config, None)
    }

    /// 使用已打开的传输启动（测试或自定义传输）
    pub fn with_transport(
        config: &AppConfig,
        transport: impl Transport + 'static,
    ) -> Result<Self, ClientError> {
        Self::assemble(config, Some(Box::new(transport)))
    }

    fn assemble(
        config: &AppConfig,
        transport: Option<Box<dyn Transport>>,
    ) -> Result<Self, ClientError> {
        let boot = config.boot.resolve()?;

        let mut builder = EngineBuilder::new()
            .connection(config.connection.clone())
            .safety(config.safety_policy())
            .boot_sequence(boot);
        if let Some(engine_config) = &config.engine {
            builder = builder.config(engine_config.clone());
        }
        if let Some(transport) = transport {
            builder = builder.transport(transport);
        }
        let engine = builder.build()?;

        let mut robot = Robot::new(engine.clone(), config.device.robot.clone());
        if let Some(path) = &config.locations_file {
            robot = robot.with_location_file(LocationFile::new(path))?;
        }

        info!(
            "Gantry ready ({} mode, safe Z {})",
            config.connection.mode_name(),
            config.device.robot.safe_z
        );
        Ok(Self {
            pump: Pump::new(engine.clone(), config.device.pump.clone()),
            hotplate: Hotplate::new(engine.clone(), config.device.hotplate.clone()),
            sonicator: Sonicator::new(engine.clone(), config.device.sonicator.clone()),
            robot,
            engine,
        })
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn robot(&self) -> &Robot {
        &self.robot
    }

    pub fn pump(&self) -> &Pump {
        &self.pump
    }

    pub fn hotplate(&self) -> &Hotplate {
        &self.hotplate
    }

    pub fn sonicator(&self) -> &Sonicator {
        &self.sonicator
    }

    pub fn panel(&self) -> ControlPanel {
        ControlPanel::new(self.robot.clone())
    }

    /// 关闭连接
    pub fn shutdown(&self) {
        self.engine.shutdown();
    }
}
