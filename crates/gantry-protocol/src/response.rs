//! 响应行解析
//!
//! 把设备回送的每一行文本分类为类型化事件。解析按行无状态；
//! 跨行的重组由执行引擎的等待循环负责。

use crate::{Position, ProtocolError};
use regex::Regex;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// 单行解析出的事件
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseEvent {
    /// 成功应答
    Acknowledgement,
    /// 设备仍在执行先前的动作
    Busy,
    /// 设备报告故障（原文保留）
    Error { raw: String },
    /// 位置报告
    PositionReport(Position),
    /// 温度报告（摄氏度）
    TemperatureReport { value: f64 },
    /// 其他回显，只用于日志
    Echo(String),
}

/// 一行最多产生两个事件（遥测 + 应答，如 `ok T:21.0 /0.0 B:60.2 /60.0`）
pub type ParsedLine = SmallVec<[ResponseEvent; 2]>;

/// 应答识别规则
///
/// 不同固件与桥接器对"完成"的措辞不同，因此识别规则由配置提供。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum AckMatcher {
    /// 整行相等（忽略大小写）
    Exact(String),
    /// 第一个空白分隔的词相等（忽略大小写）
    Token(String),
    /// 行尾匹配（忽略大小写），用于会拼接输出的桥接器
    Suffix(String),
    /// 正则表达式
    Pattern(String),
}

/// 解析器配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParserConfig {
    pub ack: Vec<AckMatcher>,
    pub busy_prefixes: Vec<String>,
    pub error_prefixes: Vec<String>,
    /// 桥接器的心跳/会话噪声，归类为回显
    pub ignore_prefixes: Vec<String>,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            ack: vec![AckMatcher::Token("ok".to_string())],
            busy_prefixes: vec!["echo:busy".to_string()],
            error_prefixes: vec!["Error:".to_string(), "!!".to_string()],
            ignore_prefixes: vec!["PING:".to_string(), "ACTIVE_ID:".to_string()],
        }
    }
}

#[derive(Debug, Clone)]
enum CompiledMatcher {
    Exact(String),
    Token(String),
    Suffix(String),
    Pattern(Regex),
}

impl CompiledMatcher {
    fn matches(&self, line: &str, lower: &str) -> bool {
        match self {
            CompiledMatcher::Exact(text) => lower == text.as_str(),
            CompiledMatcher::Token(token) => lower.split_whitespace().next() == Some(token.as_str()),
            CompiledMatcher::Suffix(suffix) => lower.ends_with(suffix.as_str()),
            CompiledMatcher::Pattern(re) => re.is_match(line),
        }
    }
}

const NUMBER: &str = r"[-+]?(?:\d+\.?\d*|\.\d+)";

/// 响应解析器
#[derive(Debug, Clone)]
pub struct ResponseParser {
    acks: Vec<CompiledMatcher>,
    busy: Vec<String>,
    errors: Vec<String>,
    ignore: Vec<String>,
    position: Regex,
    bed_temp: Regex,
    tool_temp: Regex,
}

impl ResponseParser {
    pub fn new(config: &ParserConfig) -> Result<Self, ProtocolError> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|e| ProtocolError::InvalidPattern {
                pattern: pattern.to_string(),
                reason: e.to_string(),
            })
        };

        let acks = config
            .ack
            .iter()
            .map(|m| {
                Ok(match m {
                    AckMatcher::Exact(t) => CompiledMatcher::Exact(t.trim().to_ascii_lowercase()),
                    AckMatcher::Token(t) => CompiledMatcher::Token(t.trim().to_ascii_lowercase()),
                    AckMatcher::Suffix(t) => CompiledMatcher::Suffix(t.trim().to_ascii_lowercase()),
                    AckMatcher::Pattern(p) => CompiledMatcher::Pattern(compile(p)?),
                })
            })
            .collect::<Result<Vec<_>, ProtocolError>>()?;
        if acks.is_empty() {
            return Err(ProtocolError::InvalidPattern {
                pattern: String::new(),
                reason: "at least one acknowledgement matcher is required".to_string(),
            });
        }

        let lower = |list: &[String]| -> Vec<String> { list.iter().map(|s| s.to_ascii_lowercase()).collect() };

        Ok(Self {
            acks,
            busy: lower(&config.busy_prefixes),
            errors: lower(&config.error_prefixes),
            ignore: lower(&config.ignore_prefixes),
            position: compile(&format!(
                r"X:\s*({n})\s+Y:\s*({n})\s+Z:\s*({n})",
                n = NUMBER
            ))?,
            bed_temp: compile(&format!(r"\bB:\s*({})", NUMBER))?,
            tool_temp: compile(&format!(r"\bT\d?:\s*({})", NUMBER))?,
        })
    }

    /// 分类一行文本
    ///
    /// 同一行里遥测事件排在应答之前。空行不产生事件。
    pub fn parse(&self, line: &str) -> ParsedLine {
        let mut events = ParsedLine::new();
        let line = line.trim();
        if line.is_empty() {
            return events;
        }
        let lower = line.to_ascii_lowercase();
        let starts = |prefixes: &[String]| prefixes.iter().any(|p| lower.starts_with(p.as_str()));

        if starts(&self.ignore) {
            events.push(ResponseEvent::Echo(line.to_string()));
            return events;
        }
        if starts(&self.errors) {
            events.push(ResponseEvent::Error {
                raw: line.to_string(),
            });
            return events;
        }
        if starts(&self.busy) {
            events.push(ResponseEvent::Busy);
            return events;
        }

        if let Some(position) = self.parse_position(line) {
            events.push(ResponseEvent::PositionReport(position));
        } else if let Some(value) = self.parse_temperature(line) {
            events.push(ResponseEvent::TemperatureReport { value });
        }

        if self.is_ack(line) {
            events.push(ResponseEvent::Acknowledgement);
        }

        if events.is_empty() {
            events.push(ResponseEvent::Echo(line.to_string()));
        }
        events
    }

    /// 该行是否被识别为应答
    pub fn is_ack(&self, line: &str) -> bool {
        let line = line.trim();
        let lower = line.to_ascii_lowercase();
        self.acks.iter().any(|m| m.matches(line, &lower))
    }

    fn parse_position(&self, line: &str) -> Option<Position> {
        let caps = self.position.captures(line)?;
        let axis = |i: usize| caps.get(i)?.as_str().parse::<f64>().ok().filter(|v| v.is_finite());
        Some(Position::new(axis(1)?, axis(2)?, axis(3)?))
    }

    fn parse_temperature(&self, line: &str) -> Option<f64> {
        let caps = self
            .bed_temp
            .captures(line)
            .or_else(|| self.tool_temp.captures(line))?;
        caps.get(1)?.as_str().parse::<f64>().ok().filter(|v| v.is_finite())
    }
}

impl Default for ResponseParser {
    fn default() -> Self {
        // 内置配置的正则均为常量，编译不会失败
        match Self::new(&ParserConfig::default()) {
            Ok(parser) => parser,
            Err(e) => unreachable!("built-in parser config is invalid: {e}"),
        }
    }
}
