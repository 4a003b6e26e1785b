//! 遥测状态
//!
//! 每个设备连接只有一份权威状态：最近一次位置、温度、命令结果，
//! 以及已保存的位置表和连接状态。
//!
//! 写入只发生在执行引擎的单一执行路径上（持有单飞锁时）；
//! 读取方通过 `ArcSwap` 无锁获取快照，永远不会看到写了一半的值。

use arc_swap::ArcSwap;
use gantry_protocol::Position;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// 最近一次命令的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    Error,
    Timeout,
    /// 等待中设备报告忙（会被最终结果覆盖）
    Busy,
}

/// 遥测快照
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TelemetrySnapshot {
    /// 最近一次成功解析的位置报告；从不推测或外推
    pub position: Option<Position>,
    /// 最近一次温度报告（摄氏度）
    pub temperature: Option<f64>,
    pub last_outcome: Option<Outcome>,
    /// 已解析的位置报告总数
    pub position_reports: u64,
}

/// 连接状态
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Booting,
    Ready,
    Failed(String),
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Booting => write!(f, "booting"),
            ConnectionState::Ready => write!(f, "ready"),
            ConnectionState::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// 已保存的位置
#[derive(Debug, Clone, PartialEq)]
pub struct SavedLocation {
    pub name: String,
    pub position: Position,
}

/// 引擎共享上下文
pub struct EngineContext {
    telemetry: ArcSwap<TelemetrySnapshot>,
    locations: ArcSwap<BTreeMap<String, Position>>,
    connection: ArcSwap<ConnectionState>,
}

impl Default for EngineContext {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineContext {
    pub fn new() -> Self {
        Self {
            telemetry: ArcSwap::from_pointee(TelemetrySnapshot::default()),
            locations: ArcSwap::from_pointee(BTreeMap::new()),
            connection: ArcSwap::from_pointee(ConnectionState::Disconnected),
        }
    }

    /// 获取遥测快照（无锁）
    pub fn telemetry(&self) -> TelemetrySnapshot {
        self.telemetry.load().as_ref().clone()
    }

    pub fn position(&self) -> Option<Position> {
        self.telemetry.load().position
    }

    pub fn temperature(&self) -> Option<f64> {
        self.telemetry.load().temperature
    }

    pub fn last_outcome(&self) -> Option<Outcome> {
        self.telemetry.load().last_outcome
    }

    pub fn position_reports(&self) -> u64 {
        self.telemetry.load().position_reports
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.load().as_ref().clone()
    }

    pub fn is_ready(&self) -> bool {
        matches!(**self.connection.load(), ConnectionState::Ready)
    }

    /// 已保存位置表的快照
    pub fn locations(&self) -> Arc<BTreeMap<String, Position>> {
        self.locations.load_full()
    }

    pub fn location(&self, name: &str) -> Option<Position> {
        self.locations.load().get(name).copied()
    }

    pub(crate) fn record_position(&self, position: Position) {
        self.telemetry.rcu(|current| {
            let mut next = TelemetrySnapshot::clone(current);
            next.position = Some(position);
            next.position_reports += 1;
            next
        });
    }

    pub(crate) fn record_temperature(&self, value: f64) {
        self.telemetry.rcu(|current| {
            let mut next = TelemetrySnapshot::clone(current);
            next.temperature = Some(value);
            next
        });
    }

    pub(crate) fn record_outcome(&self, outcome: Outcome) {
        self.telemetry.rcu(|current| {
            let mut next = TelemetrySnapshot::clone(current);
            next.last_outcome = Some(outcome);
            next
        });
    }

    pub(crate) fn set_connection(&self, state: ConnectionState) {
        self.connection.store(Arc::new(state));
    }

    /// 插入或替换，返回是否替换了已有条目
    pub(crate) fn insert_location(&self, name: &str, position: Position) -> bool {
        let mut replaced = false;
        self.locations.rcu(|current| {
            let mut next = BTreeMap::clone(current);
            replaced = next.insert(name.to_string(), position).is_some();
            next
        });
        replaced
    }

    pub(crate) fn extend_locations(&self, entries: impl IntoIterator<Item = (String, Position)>) {
        let entries: Vec<_> = entries.into_iter().collect();
        self.locations.rcu(|current| {
            let mut next = BTreeMap::clone(current);
            next.extend(entries.iter().cloned());
            next
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state_is_unknown() {
        let ctx = EngineContext::new();
        assert_eq!(ctx.position(), None);
        assert_eq!(ctx.temperature(), None);
        assert_eq!(ctx.last_outcome(), None);
        assert_eq!(ctx.connection_state(), ConnectionState::Disconnected);
        assert!(!ctx.is_ready());
    }

    #[test]
    fn test_record_position_counts_reports() {
        let ctx = EngineContext::new();
        ctx.record_position(Position::new(1.0, 2.0, 3.0));
        ctx.record_position(Position::new(4.0, 5.0, 6.0));
        let snapshot = ctx.telemetry();
        assert_eq!(snapshot.position, Some(Position::new(4.0, 5.0, 6.0)));
        assert_eq!(snapshot.position_reports, 2);
    }

    #[test]
    fn test_snapshot_is_isolated_from_later_writes() {
        let ctx = EngineContext::new();
        ctx.record_temperature(25.0);
        let before = ctx.telemetry();
        ctx.record_temperature(60.0);
        assert_eq!(before.temperature, Some(25.0));
        assert_eq!(ctx.temperature(), Some(60.0));
    }

    #[test]
    fn test_location_replace_keeps_key_count() {
        let ctx = EngineContext::new();
        assert!(!ctx.insert_location("vial", Position::new(1.0, 1.0, 1.0)));
        assert!(ctx.insert_location("vial", Position::new(2.0, 2.0, 2.0)));
        assert_eq!(ctx.locations().len(), 1);
        assert_eq!(ctx.location("vial"), Some(Position::new(2.0, 2.0, 2.0)));

        ctx.extend_locations([("plate".to_string(), Position::new(0.0, 0.0, 0.0))]);
        assert_eq!(ctx.locations().len(), 2);
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::Ready.to_string(), "ready");
        assert_eq!(
            ConnectionState::Failed("timeout".into()).to_string(),
            "failed: timeout"
        );
    }
}
