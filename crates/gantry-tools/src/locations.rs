//! # 位置文件
//!
//! 命名位置以 JSON 对象保存：
//!
//! ```json
//! {
//!   "vial_1": { "x": 10.0, "y": 20.0, "z": 5.0 }
//! }
//! ```
//!
//! 写入先落到同目录的临时文件，再原子替换目标文件。

use anyhow::{Context, Result};
use gantry_protocol::Position;
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// 位置文件句柄
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocationFile {
    path: PathBuf,
}

impl LocationFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 读取全部位置；文件不存在时返回空表
    pub fn load(&self) -> Result<BTreeMap<String, Position>> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read locations {}", self.path.display()));
            },
        };
        if text.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&text)
            .with_context(|| format!("Invalid locations file {}", self.path.display()))
    }

    /// 写入全部位置（临时文件 + rename）
    pub fn save(&self, locations: &BTreeMap<String, Position>) -> Result<()> {
        let json = serde_json::to_string_pretty(locations).context("Failed to serialize locations")?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        fs::write(&tmp, json).with_context(|| format!("Failed to write {}", tmp.display()))?;
        if let Err(e) = fs::rename(&tmp, &self.path) {
            let _ = fs::remove_file(&tmp);
            return Err(e).with_context(|| format!("Failed to replace {}", self.path.display()));
        }
        Ok(())
    }

    /// 插入或替换一个位置并写回文件
    pub fn upsert(&self, name: &str, position: Position) -> Result<BTreeMap<String, Position>> {
        let mut locations = self.load()?;
        locations.insert(name.to_string(), position);
        self.save(&locations)?;
        Ok(locations)
    }
}
