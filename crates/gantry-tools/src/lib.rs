//! # Gantry Tools - 配置与文件格式
//!
//! **依赖原则**: 只依赖 `gantry-protocol`，不引入传输或驱动层
//!
//! ## 包含模块
//!
//! - `config` - 设备参数（安全高度、泵标定、加热板上限等）
//! - `boot` - 启动 G-code 脚本解析
//! - `locations` - 命名位置文件（JSON，原子替换写入）

pub mod boot;
pub mod config;
pub mod locations;

// 重新导出常用类型
pub use boot::{load_boot_file, parse_boot_script};
pub use config::{DeviceConfig, HotplateConfig, PumpConfig, RobotConfig, SonicatorConfig};
pub use locations::LocationFile;
