//! 命令目录
//!
//! 逻辑动作名到 [`CommandSpec`] 的只读映射。目录在启动时加载一次，
//! 之后在进程生命周期内不再变化（见 [`install`] / [`global`]）。

use crate::ProtocolError;
use crate::template::{ParamValue, Params, Template, format_number};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::OnceLock;

/// 命令完成策略
///
/// 只有三种合法组合：不等待、直接等待、先发送排空命令再等待。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionPolicy {
    /// 发送成功即返回
    #[default]
    NoWait,
    /// 发送后等待完成应答
    WaitDirect,
    /// 发送后先发送排空命令（如 `M400`），再等待完成应答
    WaitAfterDrain,
}

impl CompletionPolicy {
    /// 从两个布尔标志构造
    ///
    /// `{wait_after: false, drain_before_wait: true}` 不是合法组合。
    pub fn from_flags(wait_after: bool, drain_before_wait: bool) -> Result<Self, ProtocolError> {
        match (wait_after, drain_before_wait) {
            (false, false) => Ok(Self::NoWait),
            (true, false) => Ok(Self::WaitDirect),
            (true, true) => Ok(Self::WaitAfterDrain),
            (false, true) => Err(ProtocolError::InvalidCatalog(
                "drain_before_wait requires wait_after".to_string(),
            )),
        }
    }

    pub fn wait_after(self) -> bool {
        !matches!(self, Self::NoWait)
    }

    pub fn drain_before_wait(self) -> bool {
        matches!(self, Self::WaitAfterDrain)
    }
}

/// 参数槽位期望的类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    #[default]
    Float,
    Integer,
    Text,
}

/// 参数槽位定义
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    #[serde(default)]
    pub kind: ParamKind,
    #[serde(default)]
    pub required: bool,
    /// 目录级默认值
    #[serde(default)]
    pub default: Option<ParamValue>,
}

impl ParamSpec {
    pub fn required(name: impl Into<String>, kind: ParamKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: true,
            default: None,
        }
    }

    pub fn optional(name: impl Into<String>, kind: ParamKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
            default: None,
        }
    }

    pub fn with_default(mut self, value: impl Into<ParamValue>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// 把值格式化为协议文本
    fn format(&self, command: &str, value: &ParamValue) -> Result<String, ProtocolError> {
        let invalid = |reason: String| ProtocolError::InvalidParameter {
            command: command.to_string(),
            param: self.name.clone(),
            reason,
        };

        match self.kind {
            ParamKind::Float => {
                let n = numeric(value).ok_or_else(|| invalid(format!("expected a number, got {:?}", value)))?;
                if !n.is_finite() {
                    return Err(invalid(format!("{} is not finite", n)));
                }
                Ok(format_number(n))
            },
            ParamKind::Integer => {
                let n = numeric(value).ok_or_else(|| invalid(format!("expected an integer, got {:?}", value)))?;
                if !n.is_finite() || n.fract() != 0.0 || n.abs() > i64::MAX as f64 {
                    return Err(invalid(format!("{} is not an integer", n)));
                }
                Ok(format!("{}", n as i64))
            },
            ParamKind::Text => {
                let text = match value {
                    ParamValue::Text(s) => s.clone(),
                    ParamValue::Number(n) if n.is_finite() => format_number(*n),
                    ParamValue::Number(n) => return Err(invalid(format!("{} is not finite", n))),
                };
                if text.is_empty() {
                    return Err(invalid("empty text".to_string()));
                }
                if text.chars().any(|c| c.is_whitespace() || c == ';' || c.is_control()) {
                    return Err(invalid(format!("'{}' contains whitespace, ';' or control characters", text.escape_debug())));
                }
                Ok(text)
            },
        }
    }
}

fn numeric(value: &ParamValue) -> Option<f64> {
    match value {
        ParamValue::Number(n) => Some(*n),
        ParamValue::Text(s) => s.trim().parse().ok(),
    }
}

fn default_completion() -> CompletionPolicy {
    CompletionPolicy::NoWait
}

/// 单条命令定义（加载后不可变）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub template: Template,
    #[serde(default)]
    pub params: Vec<ParamSpec>,
    #[serde(default = "default_completion")]
    pub completion: CompletionPolicy,
    /// 是否为平移运动命令（会经过安全策略）
    #[serde(default)]
    pub motion: bool,
}

impl CommandSpec {
    pub fn new(name: impl Into<String>, template: Template) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            template,
            params: Vec::new(),
            completion: CompletionPolicy::NoWait,
            motion: false,
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn param(mut self, param: ParamSpec) -> Self {
        self.params.push(param);
        self
    }

    pub fn completion(mut self, completion: CompletionPolicy) -> Self {
        self.completion = completion;
        self
    }

    pub fn as_motion(mut self) -> Self {
        self.motion = true;
        self
    }

    pub fn param_spec(&self, name: &str) -> Option<&ParamSpec> {
        self.params.iter().find(|p| p.name == name)
    }

    pub fn required_params(&self) -> impl Iterator<Item = &str> {
        self.params.iter().filter(|p| p.required).map(|p| p.name.as_str())
    }

    pub fn optional_params(&self) -> impl Iterator<Item = &str> {
        self.params.iter().filter(|p| !p.required).map(|p| p.name.as_str())
    }

    /// 校验定义的一致性
    ///
    /// - 参数名唯一
    /// - 模板中每个槽位都有对应的参数定义
    /// - `Pattern` 的槽位必须是必填或带默认值
    /// - 默认值本身可被格式化
    pub fn validate(&self) -> Result<(), ProtocolError> {
        let invalid = |msg: String| ProtocolError::InvalidCatalog(format!("{}: {}", self.name, msg));

        if self.name.trim().is_empty() {
            return Err(ProtocolError::InvalidCatalog("command with empty name".to_string()));
        }

        for (i, p) in self.params.iter().enumerate() {
            if self.params[..i].iter().any(|q| q.name == p.name) {
                return Err(invalid(format!("duplicate parameter '{}'", p.name)));
            }
            if let Some(default) = &p.default {
                p.format(&self.name, default)
                    .map_err(|e| invalid(format!("bad default: {}", e)))?;
            }
        }

        let slots = self.template.slots().map_err(invalid)?;
        for slot in slots {
            let Some(p) = self.param_spec(slot) else {
                return Err(invalid(format!("template slot '{}' has no parameter", slot)));
            };
            if matches!(self.template, Template::Pattern(_)) && !p.required && p.default.is_none() {
                return Err(invalid(format!("pattern slot '{}' must be required or defaulted", slot)));
            }
        }
        Ok(())
    }

    /// 校验参数并渲染为一行协议文本
    pub fn render(&self, params: &Params) -> Result<String, ProtocolError> {
        if let Some((name, _)) = params.iter().find(|(name, _)| self.param_spec(name).is_none()) {
            return Err(ProtocolError::InvalidParameter {
                command: self.name.clone(),
                param: name.to_string(),
                reason: "not accepted by this command".to_string(),
            });
        }

        let mut values = BTreeMap::new();
        for p in &self.params {
            let value = match params.get(&p.name).or(p.default.as_ref()) {
                Some(value) => value,
                None if p.required => {
                    return Err(ProtocolError::MissingParameter {
                        command: self.name.clone(),
                        param: p.name.clone(),
                    });
                },
                None => continue,
            };
            values.insert(p.name.as_str(), p.format(&self.name, value)?);
        }

        Ok(self.template.render(&values))
    }
}

#[derive(Deserialize)]
struct CatalogFile {
    #[serde(default)]
    command: Vec<CommandSpec>,
}

/// 命令目录
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    commands: HashMap<String, CommandSpec>,
}

impl Catalog {
    /// 从命令定义列表构造，逐条校验并拒绝重名
    pub fn from_specs(specs: impl IntoIterator<Item = CommandSpec>) -> Result<Self, ProtocolError> {
        let mut commands = HashMap::new();
        for spec in specs {
            spec.validate()?;
            if commands.contains_key(&spec.name) {
                return Err(ProtocolError::InvalidCatalog(format!(
                    "duplicate command '{}'",
                    spec.name
                )));
            }
            commands.insert(spec.name.clone(), spec);
        }
        Ok(Self { commands })
    }

    /// 从 TOML 文本加载（`[[command]]` 数组）
    ///
    /// ```
    /// use gantry_protocol::Catalog;
    ///
    /// let catalog = Catalog::from_toml_str(r#"
    ///     [[command]]
    ///     name = "home_all"
    ///     template = { literal = "G28" }
    ///     completion = "wait_direct"
    /// "#).unwrap();
    /// assert!(catalog.contains("home_all"));
    /// ```
    pub fn from_toml_str(text: &str) -> Result<Self, ProtocolError> {
        let file: CatalogFile =
            toml::from_str(text).map_err(|e| ProtocolError::InvalidCatalog(e.to_string()))?;
        Self::from_specs(file.command)
    }

    /// 内置目录（Marlin 兼容固件）
    pub fn builtin() -> Self {
        let commands = builtin_specs().into_iter().map(|s| (s.name.clone(), s)).collect();
        Self { commands }
    }

    pub fn lookup(&self, name: &str) -> Result<&CommandSpec, ProtocolError> {
        self.commands
            .get(name)
            .ok_or_else(|| ProtocolError::UnknownCommand(name.to_string()))
    }

    /// 查找并渲染
    pub fn render(&self, name: &str, params: &Params) -> Result<String, ProtocolError> {
        self.lookup(name)?.render(params)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.commands.contains_key(name)
    }

    /// 所有动作名（排序后）
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.commands.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

fn builtin_specs() -> Vec<CommandSpec> {
    use CompletionPolicy::*;
    use ParamKind::*;

    let literal = |text: &str| Template::Literal(text.to_string());
    let axes = |base: &str, axes: &[&str]| Template::Axes {
        base: base.to_string(),
        axes: axes.iter().map(|a| a.to_string()).collect(),
    };

    vec![
        CommandSpec::new("home_all", literal("G28"))
            .describe("Home all axes")
            .completion(WaitDirect),
        CommandSpec::new("get_position", literal("M114")).describe("Report current position"),
        CommandSpec::new("move", axes("G1", &["X", "Y", "Z", "F"]))
            .describe("Move axes")
            .param(ParamSpec::optional("X", Float))
            .param(ParamSpec::optional("Y", Float))
            .param(ParamSpec::optional("Z", Float))
            .param(ParamSpec::optional("F", Float))
            .completion(WaitAfterDrain)
            .as_motion(),
        CommandSpec::new("set_absolute", literal("G90")).describe("Set absolute positioning"),
        CommandSpec::new("set_relative", literal("G91")).describe("Set relative positioning"),
        CommandSpec::new("wait_finish", literal("M400")).describe("Wait for planned moves to finish"),
        CommandSpec::new("set_extruder_relative", literal("M83")).describe("Set extruder relative"),
        CommandSpec::new("set_extruder_absolute", literal("M82")).describe("Set extruder absolute"),
        CommandSpec::new("pump_move", axes("G1", &["E", "F"]))
            .describe("Move extruder (pump)")
            .param(ParamSpec::optional("E", Float))
            .param(ParamSpec::optional("F", Float))
            .completion(WaitAfterDrain),
        CommandSpec::new("fan_on", literal("M106 S255")).describe("Turn fan on"),
        CommandSpec::new("fan_off", literal("M107")).describe("Turn fan off"),
        CommandSpec::new("dwell", Template::Pattern("G4 P{duration_ms}".to_string()))
            .describe("Pause")
            .param(ParamSpec::required("duration_ms", Integer))
            .completion(WaitDirect),
        CommandSpec::new("set_bed_temp", Template::Pattern("M140 S{S}".to_string()))
            .describe("Set bed temperature")
            .param(ParamSpec::required("S", Float)),
        CommandSpec::new("set_bed_temp_wait", Template::Pattern("M190 S{S}".to_string()))
            .describe("Set bed temperature and wait")
            .param(ParamSpec::required("S", Float))
            .completion(WaitDirect),
        CommandSpec::new("get_temp", literal("M105")).describe("Report temperatures"),
        CommandSpec::new("emergency_stop", literal("M112")).describe("Emergency stop"),
    ]
}

static GLOBAL: OnceLock<Catalog> = OnceLock::new();

/// 安装进程级目录（只能成功一次）
///
/// 若 [`global`] 已被调用过，内置目录已经生效，安装会失败。
pub fn install(catalog: Catalog) -> Result<(), ProtocolError> {
    GLOBAL
        .set(catalog)
        .map_err(|_| ProtocolError::InvalidCatalog("global catalog already installed".to_string()))
}

/// 进程级目录；未安装时为内置目录
pub fn global() -> &'static Catalog {
    GLOBAL.get_or_init(Catalog::builtin)
}
