//! 安全策略
//!
//! 平移（X/Y 有位移）之前必须先抬升到安全高度，防止工具撞上夹具。
//! 策略是当前遥测与目标位置的纯函数，只作用于运动命令。

use gantry_protocol::{Params, Position};
use serde::{Deserialize, Serialize};

/// 位置比较容差（毫米）
pub const CLEARANCE_TOLERANCE: f64 = 1e-3;

/// 运动请求中的目标坐标（未给出的轴为 `None`）
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MoveTarget {
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub z: Option<f64>,
}

impl MoveTarget {
    pub fn from_params(params: &Params) -> Self {
        Self {
            x: params.number("X"),
            y: params.number("Y"),
            z: params.number("Z"),
        }
    }

    /// 是否包含水平位移
    ///
    /// 当前位置未知时，只要给出了 X 或 Y 就视为水平位移。
    pub fn is_horizontal_from(&self, current: Option<Position>) -> bool {
        let moved = |target: Option<f64>, now: Option<f64>| match (target, now) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(t), Some(n)) => (t - n).abs() > CLEARANCE_TOLERANCE,
        };
        moved(self.x, current.map(|p| p.x)) || moved(self.y, current.map(|p| p.y))
    }

    /// 作为相对位移解读时是否包含水平分量
    pub fn has_horizontal_offset(&self) -> bool {
        let offset = |d: Option<f64>| d.is_some_and(|d| d.abs() > CLEARANCE_TOLERANCE);
        offset(self.x) || offset(self.y)
    }

    /// 把相对位移换算成以 `origin` 为起点的绝对目标
    pub fn offset_from(&self, origin: Position) -> MoveTarget {
        MoveTarget {
            x: self.x.map(|d| origin.x + d),
            y: self.y.map(|d| origin.y + d),
            z: self.z.map(|d| origin.z + d),
        }
    }

    /// 用本目标的坐标覆盖参数中的 X/Y/Z，其余参数保持不变
    pub fn write_into(&self, params: &Params) -> Params {
        let mut params = params.clone();
        for (axis, value) in [("X", self.x), ("Y", self.y), ("Z", self.z)] {
            if let Some(value) = value {
                params.insert(axis, value);
            }
        }
        params
    }
}

/// 设备的定位模式（`G90` / `G91`）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Positioning {
    #[default]
    Absolute,
    Relative,
}

impl Positioning {
    /// 识别切换定位模式的协议行
    pub fn from_line(line: &str) -> Option<Self> {
        let word = line.split_whitespace().next()?;
        if word.eq_ignore_ascii_case("G90") {
            Some(Positioning::Absolute)
        } else if word.eq_ignore_ascii_case("G91") {
            Some(Positioning::Relative)
        } else {
            None
        }
    }
}

/// 判断是否需要先抬升到安全高度
///
/// 水平位移且当前高度低于 `safe_z` 时需要；当前位置未知视为不安全。
/// 纯竖直运动永远不被拦截。
pub fn requires_clearance(current: Option<Position>, target: &MoveTarget, safe_z: f64) -> bool {
    if !target.is_horizontal_from(current) {
        return false;
    }
    match current {
        Some(p) => p.z < safe_z - CLEARANCE_TOLERANCE,
        None => true,
    }
}

/// 抬升计划
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ClearancePlan {
    /// 先抬升到安全高度
    pub lift: bool,
    /// 水平运动（不带 Z）之后再下降到该高度
    pub lower_to: Option<f64>,
}

impl ClearancePlan {
    pub fn is_passthrough(&self) -> bool {
        !self.lift && self.lower_to.is_none()
    }
}

/// 安全策略配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyPolicy {
    pub enabled: bool,
    /// 安全高度（毫米）
    pub safe_z: f64,
    /// 抬升时使用的进给速度；未设置时沿用请求的 F
    pub lift_feedrate: Option<f64>,
    /// 请求未给出 Z 时，水平运动后是否回到抬升前的高度
    pub restore_height: bool,
}

impl Default for SafetyPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            safe_z: 150.0,
            lift_feedrate: None,
            restore_height: false,
        }
    }
}

impl SafetyPolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn requires_clearance(&self, current: Option<Position>, target: &MoveTarget) -> bool {
        self.enabled && requires_clearance(current, target, self.safe_z)
    }

    /// 为一次运动请求生成抬升计划
    ///
    /// 目标 Z 低于安全高度的水平运动总是拆成"先水平、后下降"，
    /// 只有到达目标上方后工具才会下降。
    pub fn plan(&self, current: Option<Position>, target: &MoveTarget) -> ClearancePlan {
        if !self.enabled || !target.is_horizontal_from(current) {
            return ClearancePlan::default();
        }

        let lift = requires_clearance(current, target, self.safe_z);
        let below_safe = |z: f64| z < self.safe_z - CLEARANCE_TOLERANCE;

        let lower_to = match target.z {
            Some(z) if below_safe(z) => Some(z),
            Some(_) => None,
            None if lift && self.restore_height => current.map(|p| p.z).filter(|z| below_safe(*z)),
            None => None,
        };

        ClearancePlan { lift, lower_to }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn target(x: Option<f64>, y: Option<f64>, z: Option<f64>) -> MoveTarget {
        MoveTarget { x, y, z }
    }

    #[test]
    fn test_horizontal_move_below_safe_z_requires_lift() {
        let current = Some(Position::new(0.0, 0.0, 50.0));
        assert!(requires_clearance(current, &target(Some(10.0), None, None), 150.0));
        assert!(requires_clearance(current, &target(None, Some(-5.0), None), 150.0));
    }

    #[test]
    fn test_zero_delta_is_not_intercepted() {
        let current = Some(Position::new(10.0, 20.0, 50.0));
        assert!(!requires_clearance(current, &target(Some(10.0), Some(20.0), None), 150.0));
        // 纯竖直运动
        assert!(!requires_clearance(current, &target(None, None, Some(0.0)), 150.0));
        assert!(!requires_clearance(current, &target(Some(10.0), None, Some(5.0)), 150.0));
    }

    #[test]
    fn test_at_or_above_safe_z_needs_no_lift() {
        let current = Some(Position::new(0.0, 0.0, 150.0));
        assert!(!requires_clearance(current, &target(Some(10.0), None, None), 150.0));
        let current = Some(Position::new(0.0, 0.0, 149.9995));
        assert!(!requires_clearance(current, &target(Some(10.0), None, None), 150.0));
    }

    #[test]
    fn test_unknown_position_is_unsafe() {
        assert!(requires_clearance(None, &target(Some(0.0), None, None), 150.0));
        assert!(!requires_clearance(None, &target(None, None, Some(10.0)), 150.0));
    }

    #[test]
    fn test_plan_lift_then_lower() {
        let policy = SafetyPolicy::default();
        let current = Some(Position::new(0.0, 0.0, 50.0));

        let plan = policy.plan(current, &target(Some(100.0), Some(100.0), Some(20.0)));
        assert_eq!(
            plan,
            ClearancePlan {
                lift: true,
                lower_to: Some(20.0)
            }
        );

        // 目标高于安全高度：抬升后直接带 Z 移动
        let plan = policy.plan(current, &target(Some(100.0), None, Some(160.0)));
        assert_eq!(
            plan,
            ClearancePlan {
                lift: true,
                lower_to: None
            }
        );
    }

    #[test]
    fn test_plan_descends_only_over_target() {
        let policy = SafetyPolicy::default();
        let current = Some(Position::new(0.0, 0.0, 150.0));
        let plan = policy.plan(current, &target(Some(50.0), None, Some(10.0)));
        assert_eq!(
            plan,
            ClearancePlan {
                lift: false,
                lower_to: Some(10.0)
            }
        );
    }

    #[test]
    fn test_plan_restore_height() {
        let policy = SafetyPolicy {
            restore_height: true,
            ..SafetyPolicy::default()
        };
        let current = Some(Position::new(0.0, 0.0, 40.0));
        let plan = policy.plan(current, &target(Some(5.0), None, None));
        assert_eq!(
            plan,
            ClearancePlan {
                lift: true,
                lower_to: Some(40.0)
            }
        );

        // 默认不回到原高度
        let plan = SafetyPolicy::default().plan(current, &target(Some(5.0), None, None));
        assert_eq!(plan.lower_to, None);
    }

    #[test]
    fn test_disabled_policy_passes_through() {
        let plan = SafetyPolicy::disabled().plan(None, &target(Some(5.0), None, Some(1.0)));
        assert!(plan.is_passthrough());
    }

    #[test]
    fn test_positioning_from_line() {
        assert_eq!(Positioning::from_line("G91"), Some(Positioning::Relative));
        assert_eq!(Positioning::from_line(" g90 "), Some(Positioning::Absolute));
        assert_eq!(Positioning::from_line("G1 X10"), None);
        assert_eq!(Positioning::from_line("G910"), None);
        assert_eq!(Positioning::from_line(""), None);
    }

    #[test]
    fn test_relative_offsets() {
        let offset = target(Some(10.0), None, Some(-5.0));
        assert!(offset.has_horizontal_offset());
        assert!(!target(Some(0.0), None, Some(20.0)).has_horizontal_offset());

        let absolute = offset.offset_from(Position::new(10.0, 3.0, 50.0));
        assert_eq!(absolute, target(Some(20.0), None, Some(45.0)));

        let params = Params::new().with("X", 10.0).with("F", 1200);
        let rewritten = absolute.write_into(&params);
        assert_eq!(rewritten.number("X"), Some(20.0));
        assert_eq!(rewritten.number("Z"), Some(45.0));
        assert_eq!(rewritten.number("F"), Some(1200.0));
        assert!(!rewritten.contains("Y"));
    }

    #[test]
    fn test_policy_toml() {
        let policy: SafetyPolicy = toml::from_str("safe_z = 120.0\nlift_feedrate = 1500.0").unwrap();
        assert_eq!(policy.safe_z, 120.0);
        assert_eq!(policy.lift_feedrate, Some(1500.0));
        assert!(policy.enabled);
    }

    proptest! {
        /// 低于安全高度的任何水平位移都需要抬升
        #[test]
        fn horizontal_below_safe_always_lifts(
            z in -10.0..149.0f64,
            x in -300.0..300.0f64,
            dx in 0.01..100.0f64,
        ) {
            let current = Some(Position::new(x, 0.0, z));
            prop_assert!(requires_clearance(current, &target(Some(x + dx), None, None), 150.0));
            prop_assert!(requires_clearance(current, &target(Some(x - dx), None, None), 150.0));
        }

        /// 纯竖直运动从不被拦截
        #[test]
        fn vertical_never_lifts(z in -10.0..300.0f64, tz in -10.0..300.0f64) {
            let current = Some(Position::new(1.0, 2.0, z));
            prop_assert!(!requires_clearance(current, &target(None, None, Some(tz)), 150.0));
            prop_assert!(SafetyPolicy::default().plan(current, &target(Some(1.0), Some(2.0), Some(tz))).is_passthrough());
        }
    }
}
