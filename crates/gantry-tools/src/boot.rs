//! # 启动脚本
//!
//! 连接建立后逐行发送的 G-code。`;` 之后为注释，空行被忽略。

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

/// 解析启动脚本文本，返回待发送的行
pub fn parse_boot_script(text: &str) -> Vec<String> {
    text.lines()
        .map(|line| match line.find(';') {
            Some(index) => &line[..index],
            None => line,
        })
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// 读取并解析启动脚本文件
pub fn load_boot_file<P: AsRef<Path>>(path: P) -> Result<Vec<String>> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read boot script {}", path.display()))?;
    Ok(parse_boot_script(&text))
}
