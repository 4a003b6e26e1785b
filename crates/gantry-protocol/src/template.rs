//! 命令模板与参数值
//!
//! 渲染是纯字符串替换：不求值、无副作用。参数校验和格式化由
//! [`CommandSpec::render`](crate::CommandSpec::render) 完成，这里只负责拼接。

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// 调用方提供的参数值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Number(f64),
    Text(String),
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        ParamValue::Number(value)
    }
}

impl From<f32> for ParamValue {
    fn from(value: f32) -> Self {
        ParamValue::Number(value as f64)
    }
}

impl From<i32> for ParamValue {
    fn from(value: i32) -> Self {
        ParamValue::Number(value as f64)
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        ParamValue::Number(value as f64)
    }
}

impl From<u32> for ParamValue {
    fn from(value: u32) -> Self {
        ParamValue::Number(value as f64)
    }
}

impl From<u64> for ParamValue {
    fn from(value: u64) -> Self {
        ParamValue::Number(value as f64)
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        ParamValue::Text(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        ParamValue::Text(value)
    }
}

/// 一次请求的参数集合（按名称有序）
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params(BTreeMap<String, ParamValue>);

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// 链式添加参数
    ///
    /// ```
    /// use gantry_protocol::Params;
    ///
    /// let params = Params::new().with("X", 10.0).with("F", 3000);
    /// assert_eq!(params.len(), 2);
    /// ```
    pub fn with(mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(
        &mut self,
        name: impl Into<String>,
        value: impl Into<ParamValue>,
    ) -> Option<ParamValue> {
        self.0.insert(name.into(), value.into())
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.0.get(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<ParamValue> {
        self.0.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    /// 读取数值参数；文本值会尝试按数字解析
    pub fn number(&self, name: &str) -> Option<f64> {
        match self.0.get(name)? {
            ParamValue::Number(n) => Some(*n),
            ParamValue::Text(s) => s.trim().parse().ok(),
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl<K, V> FromIterator<(K, V)> for Params
where
    K: Into<String>,
    V: Into<ParamValue>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// 命令模板
///
/// - `Literal`：固定文本，如 `G28`
/// - `Pattern`：带 `{slot}` 占位符的文本，如 `G4 P{duration_ms}`
/// - `Axes`：基础指令加上每个已提供轴的 ` <轴><值>`，如 `G1 X10 Y20 F3000`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Template {
    Literal(String),
    Pattern(String),
    Axes { base: String, axes: Vec<String> },
}

impl Template {
    /// 模板引用的槽位名
    pub fn slots(&self) -> Result<Vec<&str>, String> {
        match self {
            Template::Literal(_) => Ok(Vec::new()),
            Template::Pattern(pattern) => placeholders(pattern),
            Template::Axes { axes, .. } => Ok(axes.iter().map(String::as_str).collect()),
        }
    }

    /// 用已格式化的值填充模板
    ///
    /// 缺失的 `Axes` 轴被省略；缺失的 `Pattern` 槽位渲染为空。
    pub fn render(&self, values: &BTreeMap<&str, String>) -> String {
        match self {
            Template::Literal(text) => text.clone(),
            Template::Pattern(pattern) => {
                let mut out = String::with_capacity(pattern.len() + 8);
                let mut rest = pattern.as_str();
                while let Some(start) = rest.find('{') {
                    out.push_str(&rest[..start]);
                    let after = &rest[start + 1..];
                    match after.find('}') {
                        Some(end) => {
                            if let Some(value) = values.get(&after[..end]) {
                                out.push_str(value);
                            }
                            rest = &after[end + 1..];
                        },
                        None => {
                            out.push_str(&rest[start..]);
                            rest = "";
                        },
                    }
                }
                out.push_str(rest);
                out
            },
            Template::Axes { base, axes } => {
                let mut out = base.clone();
                for axis in axes {
                    if let Some(value) = values.get(axis.as_str()) {
                        out.push(' ');
                        out.push_str(axis);
                        out.push_str(value);
                    }
                }
                out
            },
        }
    }
}

fn placeholders(pattern: &str) -> Result<Vec<&str>, String> {
    let mut slots = Vec::new();
    let mut rest = pattern;
    while let Some(start) = rest.find('{') {
        let after = &rest[start + 1..];
        let end = after
            .find('}')
            .ok_or_else(|| format!("unterminated placeholder in '{}'", pattern))?;
        let name = &after[..end];
        if name.is_empty() || name.contains('{') {
            return Err(format!("malformed placeholder in '{}'", pattern));
        }
        slots.push(name);
        rest = &after[end + 1..];
    }
    Ok(slots)
}

/// 浮点数格式化：最多 4 位小数，去掉尾随零，`-0` 归一为 `0`
pub(crate) fn format_number(value: f64) -> String {
    let mut text = format!("{:.4}", value);
    if text.contains('.') {
        let trimmed = text.trim_end_matches('0').trim_end_matches('.').len();
        text.truncate(trimmed);
    }
    if text == "-0" {
        text = "0".to_string();
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values<'a>(pairs: &[(&'a str, &str)]) -> BTreeMap<&'a str, String> {
        pairs.iter().map(|(k, v)| (*k, v.to_string())).collect()
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(10.0), "10");
        assert_eq!(format_number(12.345), "12.345");
        assert_eq!(format_number(0.12346), "0.1235");
        assert_eq!(format_number(-0.00001), "0");
        assert_eq!(format_number(-2.5), "-2.5");
        assert_eq!(format_number(3000.0), "3000");
    }

    #[test]
    fn test_literal_render() {
        let t = Template::Literal("G28".to_string());
        assert_eq!(t.render(&BTreeMap::new()), "G28");
        assert!(t.slots().unwrap().is_empty());
    }

    #[test]
    fn test_pattern_render() {
        let t = Template::Pattern("G4 P{duration_ms}".to_string());
        assert_eq!(t.slots().unwrap(), vec!["duration_ms"]);
        assert_eq!(t.render(&values(&[("duration_ms", "1500")])), "G4 P1500");
    }

    #[test]
    fn test_pattern_malformed() {
        assert!(Template::Pattern("G4 P{duration_ms".to_string()).slots().is_err());
        assert!(Template::Pattern("G4 P{}".to_string()).slots().is_err());
    }

    #[test]
    fn test_axes_render_keeps_declared_order() {
        let t = Template::Axes {
            base: "G1".to_string(),
            axes: vec!["X".into(), "Y".into(), "Z".into(), "F".into()],
        };
        // 只渲染提供的轴，顺序按声明
        let rendered = t.render(&values(&[("F", "3000"), ("Z", "5"), ("X", "10")]));
        assert_eq!(rendered, "G1 X10 Z5 F3000");
        assert_eq!(t.render(&BTreeMap::new()), "G1");
    }

    #[test]
    fn test_params_builder() {
        let p = Params::new().with("X", 1.5).with("name", "home");
        assert_eq!(p.number("X"), Some(1.5));
        assert_eq!(p.get("name"), Some(&ParamValue::Text("home".into())));
        assert_eq!(p.number("missing"), None);

        let collected: Params = [("Z", 2.0)].into_iter().collect();
        assert!(collected.contains("Z"));
    }
}
