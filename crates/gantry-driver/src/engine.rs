//! 命令执行引擎
//!
//! 把一个语义动作翻译成协议行、写入传输、按完成策略等待，并在等待期间
//! 维护遥测状态。每个连接同一时刻只有一个动作在执行（单飞锁），
//! 锁在任何返回路径上都会随守卫释放。
//!
//! 运动命令在发送前经过 [`SafetyPolicy`]：低于安全高度的水平运动会被
//! 拆成"抬升 → 水平 → 下降"多个物理步骤，每一步各自完成等待。

use crate::config::{AckAccounting, EngineConfig};
use crate::error::DriverError;
use crate::safety::{MoveTarget, Positioning, SafetyPolicy};
use crate::state::{ConnectionState, EngineContext, Outcome, SavedLocation, TelemetrySnapshot};
use gantry_protocol::{
    Catalog, CommandSpec, CompletionPolicy, Params, Position, ResponseEvent, ResponseParser,
};
use gantry_transport::{Transport, TransportError};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// 单次清理最多丢弃的陈旧行数
const MAX_STALE_LINES: usize = 4096;

/// 执行结果状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Ok,
    Error,
    Timeout,
}

impl ExecutionStatus {
    pub fn is_ok(self) -> bool {
        self == ExecutionStatus::Ok
    }

    fn outcome(self) -> Outcome {
        match self {
            ExecutionStatus::Ok => Outcome::Ok,
            ExecutionStatus::Error => Outcome::Error,
            ExecutionStatus::Timeout => Outcome::Timeout,
        }
    }
}

/// 一次 `execute` 的结果
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    /// 人类可读的描述；设备报错时包含原文
    pub message: String,
    /// 完成时的遥测快照
    pub telemetry: TelemetrySnapshot,
    /// 实际写入传输的所有行（含抬升与排空命令）
    pub sent: Vec<String>,
}

impl ExecutionResult {
    pub fn is_ok(&self) -> bool {
        self.status.is_ok()
    }
}

/// 单个物理步骤的失败原因
#[derive(Debug)]
enum StepFailure {
    Transport(TransportError),
    Device(String),
    Timeout,
}

impl StepFailure {
    fn status(&self) -> ExecutionStatus {
        match self {
            StepFailure::Timeout | StepFailure::Transport(TransportError::Timeout) => {
                ExecutionStatus::Timeout
            },
            StepFailure::Transport(_) | StepFailure::Device(_) => ExecutionStatus::Error,
        }
    }

    fn message(&self) -> String {
        match self {
            StepFailure::Transport(e) => format!("transport failure: {}", e),
            StepFailure::Device(raw) => format!("device reported: {}", raw),
            StepFailure::Timeout => {
                "no completion before deadline; device state unknown, query position before continuing"
                    .to_string()
            },
        }
    }

    fn into_error(self, timeout: Duration) -> DriverError {
        match self {
            StepFailure::Transport(e) => DriverError::Transport(e),
            StepFailure::Device(raw) => DriverError::Device(raw),
            StepFailure::Timeout => DriverError::ExecutionTimeout(timeout),
        }
    }
}

/// 一个待发送的物理步骤
struct Step<'a> {
    spec: &'a CommandSpec,
    line: String,
}

/// 安全抬升展开时借用的命令
struct MotionSpecs<'a> {
    lift: &'a CommandSpec,
    absolute: &'a CommandSpec,
    relative: &'a CommandSpec,
    /// 相对模式下刷新位置用的查询行
    query: String,
}

/// 单飞锁保护的会话
struct Session {
    transport: Box<dyn Transport>,
    parser: ResponseParser,
    /// 已发送、尚未收到应答的行数（仅 `PerLine` 计数）
    acks_owed: usize,
    /// 最近一次发出的定位模式
    positioning: Positioning,
}

/// 命令执行引擎
///
/// 线程安全：可放入 `Arc` 在多个调用方之间共享。读取遥测不需要获取
/// 执行锁。
pub struct Engine {
    catalog: Arc<Catalog>,
    session: Mutex<Session>,
    ctx: Arc<EngineContext>,
    config: EngineConfig,
    policy: SafetyPolicy,
}

impl Engine {
    /// 在已打开的传输上创建引擎（状态为 `Disconnected`，需要 [`boot`](Self::boot)）
    pub fn new(
        transport: Box<dyn Transport>,
        catalog: Arc<Catalog>,
        config: EngineConfig,
        policy: SafetyPolicy,
    ) -> Result<Self, DriverError> {
        let parser = ResponseParser::new(&config.parser)?;
        debug!(
            "Engine created on {} ({} commands in catalog)",
            transport.describe(),
            catalog.len()
        );
        Ok(Self {
            catalog,
            session: Mutex::new(Session {
                transport,
                parser,
                acks_owed: 0,
                positioning: Positioning::default(),
            }),
            ctx: Arc::new(EngineContext::new()),
            config,
            policy,
        })
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn safety_policy(&self) -> &SafetyPolicy {
        &self.policy
    }

    /// 遥测快照（无锁）
    pub fn telemetry(&self) -> TelemetrySnapshot {
        self.ctx.telemetry()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.ctx.connection_state()
    }

    /// 设备当前的定位模式（等待正在执行的动作结束）
    pub fn positioning(&self) -> Positioning {
        self.session.lock().positioning
    }

    /// 运行启动序列
    ///
    /// 逐行发送（跳过空行），默认每行都必须在 `boot_line_timeout` 内得到应答。
    /// 任一行失败则连接进入 `Failed`，之后的执行请求都会被拒绝。
    pub fn boot<I, S>(&self, lines: I) -> Result<(), DriverError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let lines: Vec<String> = lines
            .into_iter()
            .map(|l| l.as_ref().trim().to_string())
            .filter(|l| !l.is_empty())
            .collect();

        let mut session = self.session.lock();
        self.ctx.set_connection(ConnectionState::Booting);
        info!(
            "Running boot sequence ({} lines) on {}",
            lines.len(),
            session.transport.describe()
        );

        // 固件复位后处于绝对定位
        session.acks_owed = 0;
        session.positioning = Positioning::default();
        self.drain_stale(&mut session);
        let gap = self.config.boot_line_gap();
        for (index, line) in lines.iter().enumerate() {
            let deadline = Instant::now() + self.config.boot_line_timeout();
            let mut sent = Vec::new();
            let mut result = self.transmit(&mut session, line, &mut sent);
            if result.is_ok() && self.config.boot_requires_ack {
                result = self.read_until(&mut session, deadline, |event, owed| {
                    matches!(event, ResponseEvent::Acknowledgement) && owed == 0
                });
            }

            if let Err(failure) = result {
                let reason = format!("boot line {} '{}': {}", index + 1, line, failure.message());
                error!("Boot sequence failed: {}", reason);
                session.acks_owed = 0;
                self.ctx.set_connection(ConnectionState::Failed(reason.clone()));
                return Err(DriverError::ConnectionFailed(reason));
            }

            if !gap.is_zero() && index + 1 < lines.len() {
                thread::sleep(gap);
            }
        }

        self.ctx.set_connection(ConnectionState::Ready);
        info!("Boot sequence complete, engine ready");
        Ok(())
    }

    /// 关闭传输，状态回到 `Disconnected`
    pub fn shutdown(&self) {
        let mut session = self.session.lock();
        session.transport.close();
        self.ctx.set_connection(ConnectionState::Disconnected);
        info!("Engine shut down ({})", session.transport.describe());
    }

    /// 执行一个语义动作
    ///
    /// 调用方输入错误（未知动作、缺少或非法参数）以及引擎未就绪以 `Err`
    /// 返回，且不会写出任何字节。设备报错、传输失败与超时都以
    /// `Ok(ExecutionResult)` 返回，由 `status` 区分。
    ///
    /// `timeout` 是整个动作（含安全抬升与排空）的总时限。
    pub fn execute(
        &self,
        action: &str,
        params: &Params,
        timeout: Duration,
    ) -> Result<ExecutionResult, DriverError> {
        let spec = self.catalog.lookup(action)?;
        let line = spec.render(params)?;
        let motion = if spec.motion && self.policy.enabled {
            Some(MotionSpecs {
                lift: self.catalog.lookup(&self.config.move_action)?,
                absolute: self.catalog.lookup(&self.config.absolute_action)?,
                relative: self.catalog.lookup(&self.config.relative_action)?,
                query: self.catalog.render(&self.config.position_action, &Params::new())?,
            })
        } else {
            None
        };
        let needs_drain = spec.completion.drain_before_wait()
            || motion
                .as_ref()
                .is_some_and(|m| m.lift.completion.drain_before_wait());
        let drain = if needs_drain {
            Some(self.catalog.render(&self.config.drain_action, &Params::new())?)
        } else {
            None
        };

        let mut session = self.session.lock();
        self.ensure_ready()?;
        let started = Instant::now();
        let deadline = started + timeout;

        let mut sent = Vec::new();
        let mut result = Ok(());
        let mut steps = Vec::new();
        match &motion {
            Some(motion) => {
                let relative = session.positioning == Positioning::Relative;
                let current = if relative && MoveTarget::from_params(params).has_horizontal_offset() {
                    // 相对目标只能按实时位置换算
                    self.refresh_position(&mut session, &motion.query, deadline, &mut sent)
                        .map(Some)
                } else {
                    Ok(self.ctx.position())
                };
                match current {
                    Ok(current) => {
                        steps = self.plan_motion(motion, relative, current, spec, params, line)?
                    },
                    Err(failure) => result = Err(failure),
                }
            },
            None => steps.push(Step { spec, line }),
        }

        if result.is_ok() {
            for step in &steps {
                self.drain_stale(&mut session);
                result = self.run_step(&mut session, step, drain.as_deref(), deadline, &mut sent);
                if result.is_err() {
                    break;
                }
            }
        }

        let (status, message) = match result {
            Ok(()) => {
                debug!("{} completed in {:?}", action, started.elapsed());
                let moves = steps.iter().filter(|s| s.spec.motion).count();
                let message = if moves > 1 {
                    format!("{} completed ({} moves with clearance)", action, moves)
                } else {
                    format!("{} completed", action)
                };
                (ExecutionStatus::Ok, message)
            },
            Err(failure) => {
                let status = failure.status();
                warn!(
                    "{} ended with {:?} after {:?}: {}",
                    action,
                    status,
                    started.elapsed(),
                    failure.message()
                );
                // 设备状态未知，不再追究遗留的应答
                session.acks_owed = 0;
                (status, format!("{}: {}", action, failure.message()))
            },
        };

        self.ctx.record_outcome(status.outcome());
        let telemetry = self.ctx.telemetry();
        drop(session);

        Ok(ExecutionResult {
            status,
            message,
            telemetry,
            sent,
        })
    }

    /// 使用配置的默认总时限执行
    pub fn execute_default(
        &self,
        action: &str,
        params: &Params,
    ) -> Result<ExecutionResult, DriverError> {
        self.execute(action, params, self.config.default_timeout())
    }

    /// 查询当前位置
    ///
    /// 只返回本次查询之后解析到的位置报告，从不返回查询前的陈旧值。
    pub fn get_position(&self, timeout: Duration) -> Result<Position, DriverError> {
        self.query(&self.config.position_action, timeout, |event| match event {
            ResponseEvent::PositionReport(position) => Some(*position),
            _ => None,
        })
    }

    /// 查询温度（优先热床温度）
    pub fn get_temperature(&self, timeout: Duration) -> Result<f64, DriverError> {
        self.query(&self.config.temperature_action, timeout, |event| match event {
            ResponseEvent::TemperatureReport { value } => Some(*value),
            _ => None,
        })
    }

    /// 以当前遥测位置保存一个命名位置（同名覆盖）
    ///
    /// 不与设备通信；遥测中没有位置时返回 [`DriverError::PositionUnknown`]。
    pub fn save_location(&self, name: &str) -> Result<SavedLocation, DriverError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(DriverError::InvalidInput("location name must not be empty".to_string()));
        }

        // 持锁读取，保证位置不是某次执行中途的值
        let _session = self.session.lock();
        let position = self.ctx.position().ok_or(DriverError::PositionUnknown)?;
        if self.ctx.insert_location(name, position) {
            info!("Location '{}' replaced with {}", name, position);
        } else {
            info!("Location '{}' saved at {}", name, position);
        }
        Ok(SavedLocation {
            name: name.to_string(),
            position,
        })
    }

    /// 批量载入位置（同名覆盖）
    pub fn load_locations(&self, entries: impl IntoIterator<Item = (String, Position)>) {
        self.ctx.extend_locations(entries);
    }

    pub fn locations(&self) -> Arc<BTreeMap<String, Position>> {
        self.ctx.locations()
    }

    pub fn location(&self, name: &str) -> Option<Position> {
        self.ctx.location(name)
    }

    fn ensure_ready(&self) -> Result<(), DriverError> {
        match self.ctx.connection_state() {
            ConnectionState::Ready => Ok(()),
            state => Err(DriverError::NotReady(state)),
        }
    }

    fn counts_acks(&self) -> bool {
        matches!(self.config.ack_accounting, AckAccounting::PerLine)
    }

    /// 依据安全策略把一次运动请求展开为物理步骤
    ///
    /// 相对模式下的水平位移先换算成绝对目标；需要抬升时整段改用绝对
    /// 坐标发送，结束后切回相对模式。
    fn plan_motion<'a>(
        &self,
        motion: &MotionSpecs<'a>,
        relative: bool,
        current: Option<Position>,
        spec: &'a CommandSpec,
        params: &Params,
        line: String,
    ) -> Result<Vec<Step<'a>>, DriverError> {
        let requested = MoveTarget::from_params(params);
        let absolute = match (relative, current) {
            (false, _) => None,
            (true, _) if !requested.has_horizontal_offset() => {
                return Ok(vec![Step { spec, line }]);
            },
            (true, Some(origin)) => Some(requested.offset_from(origin)),
            (true, None) => return Err(DriverError::PositionUnknown),
        };

        let plan = self.policy.plan(current, &absolute.unwrap_or(requested));
        if plan.is_passthrough() {
            return Ok(vec![Step { spec, line }]);
        }

        let rewritten = absolute.map(|target| target.write_into(params));
        let params = rewritten.as_ref().unwrap_or(params);
        let line = match &rewritten {
            Some(params) => spec.render(params)?,
            None => line,
        };

        let feedrate = params.number("F");
        let mut steps = Vec::with_capacity(5);
        if relative {
            info!("Relative move needs clearance, switching to absolute positioning");
            steps.push(Step {
                spec: motion.absolute,
                line: motion.absolute.render(&Params::new())?,
            });
        }
        if plan.lift {
            let mut lift = Params::new().with("Z", self.policy.safe_z);
            if let Some(f) = self.policy.lift_feedrate.or(feedrate) {
                lift.insert("F", f);
            }
            match current {
                Some(p) => info!("Lifting from Z={:.3} to safe Z={}", p.z, self.policy.safe_z),
                None => info!("Position unknown, lifting to safe Z={}", self.policy.safe_z),
            }
            steps.push(Step {
                spec: motion.lift,
                line: motion.lift.render(&lift)?,
            });
        }

        match plan.lower_to {
            Some(z) => {
                let mut horizontal = params.clone();
                horizontal.remove("Z");
                steps.push(Step {
                    spec,
                    line: spec.render(&horizontal)?,
                });

                let mut lower = Params::new().with("Z", z);
                if let Some(f) = feedrate {
                    lower.insert("F", f);
                }
                steps.push(Step {
                    spec,
                    line: spec.render(&lower)?,
                });
            },
            None => steps.push(Step { spec, line }),
        }

        if relative {
            steps.push(Step {
                spec: motion.relative,
                line: motion.relative.render(&Params::new())?,
            });
        }
        Ok(steps)
    }

    /// 发送一个步骤并按其完成策略等待
    fn run_step(
        &self,
        session: &mut Session,
        step: &Step<'_>,
        drain: Option<&str>,
        deadline: Instant,
        sent: &mut Vec<String>,
    ) -> Result<(), StepFailure> {
        self.transmit(session, &step.line, sent)?;
        match (step.spec.completion, drain) {
            (CompletionPolicy::NoWait, _) => Ok(()),
            (CompletionPolicy::WaitAfterDrain, Some(drain)) => {
                self.transmit(session, drain, sent)?;
                self.await_acks(session, true, deadline)
            },
            (CompletionPolicy::WaitDirect, _) | (CompletionPolicy::WaitAfterDrain, None) => {
                self.await_acks(session, false, deadline)
            },
        }
    }

    /// 等待完成应答
    ///
    /// `PerLine` 等到所有已发送的行（包括之前不等待的命令和查询遗留的
    /// 应答）都被应答；`Settled` 只作用于排空步骤，忽略排空命令发出后
    /// 窗口内的应答。
    fn await_acks(
        &self,
        session: &mut Session,
        drained: bool,
        deadline: Instant,
    ) -> Result<(), StepFailure> {
        let settle = match self.config.ack_accounting {
            AckAccounting::Settled { window_ms } if drained => Some(Duration::from_millis(window_ms)),
            _ => None,
        };
        let sent_at = Instant::now();

        self.read_until(session, deadline, |event, owed| {
            if !matches!(event, ResponseEvent::Acknowledgement) {
                return false;
            }
            match settle {
                Some(window) if sent_at.elapsed() < window => {
                    trace!("Ignoring acknowledgement inside settle window");
                    false
                },
                Some(_) => true,
                None => owed == 0,
            }
        })
    }

    /// 在执行路径内查询位置
    fn refresh_position(
        &self,
        session: &mut Session,
        query: &str,
        deadline: Instant,
        sent: &mut Vec<String>,
    ) -> Result<Position, StepFailure> {
        self.drain_stale(session);
        self.transmit(session, query, sent)?;
        let mut found = None;
        self.read_until(session, deadline, |event, _| {
            if let ResponseEvent::PositionReport(position) = event {
                found = Some(*position);
            }
            found.is_some()
        })?;
        found.ok_or(StepFailure::Timeout)
    }

    /// 查询类动作：发送后读取直到出现所需报告
    ///
    /// 报告之后的应答留给下一次执行消化。
    fn query<T>(
        &self,
        action: &str,
        timeout: Duration,
        extract: impl Fn(&ResponseEvent) -> Option<T>,
    ) -> Result<T, DriverError> {
        let line = self.catalog.render(action, &Params::new())?;

        let mut session = self.session.lock();
        self.ensure_ready()?;
        let deadline = Instant::now() + timeout;
        self.drain_stale(&mut session);

        let mut found = None;
        let mut sent = Vec::new();
        let result = match self.transmit(&mut session, &line, &mut sent) {
            Ok(()) => self.read_until(&mut session, deadline, |event, _| {
                if found.is_none() {
                    found = extract(event);
                }
                found.is_some()
            }),
            Err(failure) => Err(failure),
        };

        match (result, found) {
            (Ok(()), Some(value)) => {
                self.ctx.record_outcome(Outcome::Ok);
                Ok(value)
            },
            (Err(failure), _) => {
                warn!("{} failed: {}", action, failure.message());
                session.acks_owed = 0;
                self.ctx.record_outcome(failure.status().outcome());
                Err(failure.into_error(timeout))
            },
            (Ok(()), None) => {
                session.acks_owed = 0;
                self.ctx.record_outcome(Outcome::Timeout);
                Err(DriverError::ExecutionTimeout(timeout))
            },
        }
    }

    fn transmit(
        &self,
        session: &mut Session,
        line: &str,
        sent: &mut Vec<String>,
    ) -> Result<(), StepFailure> {
        debug!("TX {}", line);
        session.transport.send(line).map_err(|e| {
            warn!("Failed to send '{}': {}", line, e);
            StepFailure::Transport(e)
        })?;
        if self.counts_acks() {
            session.acks_owed += 1;
        }
        if let Some(mode) = Positioning::from_line(line) {
            session.positioning = mode;
        }
        sent.push(line.to_string());
        Ok(())
    }

    /// 读取并处理响应行，直到 `done` 返回 `true`
    ///
    /// `done` 的第二个参数是处理完该事件后仍欠的应答数。一行中的事件
    /// 总是全部处理完才返回。每次读取的时限是 `read_timeout` 与剩余时间
    /// 中的较小者；读超时只是继续等待，到达 `deadline` 才算失败。
    fn read_until<F>(
        &self,
        session: &mut Session,
        deadline: Instant,
        mut done: F,
    ) -> Result<(), StepFailure>
    where
        F: FnMut(&ResponseEvent, usize) -> bool,
    {
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(StepFailure::Timeout);
            }
            let slice = self.config.read_timeout().min(deadline - now);

            let line = match session.transport.read_line(slice) {
                Ok(line) => line,
                Err(TransportError::Timeout) => continue,
                Err(e) => return Err(StepFailure::Transport(e)),
            };
            trace!("RX {}", line);

            let mut finished = false;
            for event in session.parser.parse(&line) {
                self.apply(&event)?;
                if matches!(event, ResponseEvent::Acknowledgement) {
                    session.acks_owed = session.acks_owed.saturating_sub(1);
                }
                finished |= done(&event, session.acks_owed);
            }
            if finished {
                return Ok(());
            }
        }
    }

    /// 把事件写入遥测；设备错误立即终止等待
    fn apply(&self, event: &ResponseEvent) -> Result<(), StepFailure> {
        match event {
            ResponseEvent::PositionReport(position) => self.ctx.record_position(*position),
            ResponseEvent::TemperatureReport { value } => self.ctx.record_temperature(*value),
            ResponseEvent::Busy => {
                debug!("Device busy");
                self.ctx.record_outcome(Outcome::Busy);
            },
            ResponseEvent::Error { raw } => {
                warn!("Device reported error: {}", raw);
                return Err(StepFailure::Device(raw.clone()));
            },
            ResponseEvent::Echo(text) => debug!("Device: {}", text),
            ResponseEvent::Acknowledgement => {},
        }
        Ok(())
    }

    /// 丢弃上一次动作遗留的行，其中的遥测与欠下的应答仍然被记账
    fn drain_stale(&self, session: &mut Session) {
        for _ in 0..MAX_STALE_LINES {
            match session.transport.try_read_line() {
                Ok(Some(line)) => {
                    trace!("RX (stale) {}", line);
                    for event in session.parser.parse(&line) {
                        match event {
                            ResponseEvent::PositionReport(p) => self.ctx.record_position(p),
                            ResponseEvent::TemperatureReport { value } => {
                                self.ctx.record_temperature(value)
                            },
                            ResponseEvent::Acknowledgement => {
                                session.acks_owed = session.acks_owed.saturating_sub(1)
                            },
                            ResponseEvent::Error { raw } => warn!("Stale device error: {}", raw),
                            _ => {},
                        }
                    }
                },
                Ok(None) => return,
                Err(e) => {
                    debug!("Stopped draining stale lines: {}", e);
                    return;
                },
            }
        }
        warn!("Stale line limit reached, device output may be flooding");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_protocol::ProtocolError;
    use gantry_transport::mock::MockDevice;

    fn test_config() -> EngineConfig {
        EngineConfig {
            read_timeout_ms: 20,
            boot_line_timeout_ms: 200,
            boot_line_gap_ms: 0,
            ..EngineConfig::default()
        }
    }

    fn engine_with(device: &MockDevice, config: EngineConfig, policy: SafetyPolicy) -> Engine {
        let engine = Engine::new(
            Box::new(device.transport()),
            Arc::new(Catalog::builtin()),
            config,
            policy,
        )
        .unwrap();
        engine.boot(Vec::<String>::new()).unwrap();
        engine
    }

    fn ready_engine(device: &MockDevice) -> Engine {
        engine_with(device, test_config(), SafetyPolicy::default())
    }

    const SECOND: Duration = Duration::from_secs(1);

    #[test]
    fn test_unknown_action_sends_nothing() {
        let device = MockDevice::new();
        let engine = ready_engine(&device);

        let err = engine.execute("teleport", &Params::new(), SECOND).unwrap_err();
        assert!(matches!(
            err,
            DriverError::Protocol(ProtocolError::UnknownCommand(ref name)) if name == "teleport"
        ));
        assert!(err.is_caller_error());

        let err = engine.execute("dwell", &Params::new(), SECOND).unwrap_err();
        assert!(matches!(
            err,
            DriverError::Protocol(ProtocolError::MissingParameter { .. })
        ));
        assert!(device.sent().is_empty());
    }

    #[test]
    fn test_not_ready_before_boot() {
        let device = MockDevice::new();
        let engine = Engine::new(
            Box::new(device.transport()),
            Arc::new(Catalog::builtin()),
            test_config(),
            SafetyPolicy::default(),
        )
        .unwrap();
        assert!(matches!(
            engine.execute("home_all", &Params::new(), SECOND),
            Err(DriverError::NotReady(ConnectionState::Disconnected))
        ));
        assert!(device.sent().is_empty());
    }

    #[test]
    fn test_fire_and_forget_returns_without_ack() {
        let device = MockDevice::new();
        let engine = ready_engine(&device);

        let start = Instant::now();
        let result = engine.execute("set_absolute", &Params::new(), SECOND).unwrap();
        assert!(result.is_ok());
        assert!(start.elapsed() < Duration::from_millis(500));
        assert_eq!(result.sent, vec!["G90"]);
        assert_eq!(result.telemetry.last_outcome, Some(Outcome::Ok));
    }

    #[test]
    fn test_drain_is_sent_before_waiting() {
        let device = MockDevice::new();
        device.ack_everything();
        let engine = engine_with(&device, test_config(), SafetyPolicy::disabled());

        let params = Params::new().with("X", 10.0).with("F", 3000);
        let result = engine.execute("move", &params, SECOND).unwrap();
        assert!(result.is_ok(), "{}", result.message);
        assert_eq!(device.sent(), vec!["G1 X10 F3000", "M400"]);
    }

    #[test]
    fn test_wait_direct_needs_one_ack() {
        let device = MockDevice::new();
        device.ack_everything();
        let engine = ready_engine(&device);

        let result = engine
            .execute("dwell", &Params::new().with("duration_ms", 250), SECOND)
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(result.sent, vec!["G4 P250"]);
    }

    #[test]
    fn test_timeout_is_bounded_and_releases_lock() {
        let device = MockDevice::new();
        let engine = ready_engine(&device);

        let start = Instant::now();
        let result = engine
            .execute(
                "dwell",
                &Params::new().with("duration_ms", 1000),
                Duration::from_millis(200),
            )
            .unwrap();
        let elapsed = start.elapsed();
        assert_eq!(result.status, ExecutionStatus::Timeout);
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_millis(700), "took {:?}", elapsed);
        assert_eq!(engine.telemetry().last_outcome, Some(Outcome::Timeout));

        // 超时之后锁已释放
        let result = engine.execute("set_relative", &Params::new(), SECOND).unwrap();
        assert!(result.is_ok());
    }

    #[test]
    fn test_device_error_is_reported_verbatim() {
        let device = MockDevice::new();
        device.respond_with(|line| {
            if line == "G28" {
                vec!["Error:Printer halted. kill() called!".to_string()]
            } else {
                vec!["ok".to_string()]
            }
        });
        let engine = ready_engine(&device);

        let result = engine.execute("home_all", &Params::new(), SECOND).unwrap();
        assert_eq!(result.status, ExecutionStatus::Error);
        assert!(result.message.contains("Error:Printer halted. kill() called!"));

        // 引擎仍然可用
        let result = engine.execute("fan_off", &Params::new(), SECOND).unwrap();
        assert!(result.is_ok());
    }

    #[test]
    fn test_send_failure_is_an_error_result() {
        let device = MockDevice::new();
        let engine = ready_engine(&device);
        device.fail_sends(true);

        let result = engine.execute("home_all", &Params::new(), SECOND).unwrap();
        assert_eq!(result.status, ExecutionStatus::Error);
        assert!(result.message.contains("unreachable"));
        assert!(result.sent.is_empty());
    }

    #[test]
    fn test_busy_lines_do_not_complete() {
        let device = MockDevice::new();
        device.respond_with(|_| {
            vec![
                "echo:busy: processing".to_string(),
                "echo:busy: processing".to_string(),
                "ok".to_string(),
            ]
        });
        let engine = ready_engine(&device);

        let result = engine
            .execute("set_bed_temp_wait", &Params::new().with("S", 60), SECOND)
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(result.telemetry.last_outcome, Some(Outcome::Ok));
    }

    #[test]
    fn test_telemetry_updates_during_wait() {
        let device = MockDevice::new();
        device.respond_with(|line| match line {
            "G28" => vec!["X:0.00 Y:0.00 Z:0.00 E:0.00 Count X:0 Y:0 Z:0".to_string(), "ok".to_string()],
            _ => vec!["ok".to_string()],
        });
        let engine = ready_engine(&device);

        let result = engine.execute("home_all", &Params::new(), SECOND).unwrap();
        assert!(result.is_ok());
        assert_eq!(result.telemetry.position, Some(Position::new(0.0, 0.0, 0.0)));
    }

    #[test]
    fn test_get_position_returns_fresh_report() {
        let device = MockDevice::new();
        device.respond_with(|line| match line {
            "M114" => vec!["X:12.34 Y:56.78 Z:9.00 E:0.00 Count X:0 Y:0 Z:0".to_string(), "ok".to_string()],
            _ => vec!["ok".to_string()],
        });
        let engine = ready_engine(&device);

        // 陈旧的报告不会被当作本次查询的结果
        device.inject("X:1.00 Y:1.00 Z:1.00");
        let position = engine.get_position(SECOND).unwrap();
        assert_eq!(position, Position::new(12.34, 56.78, 9.0));
        assert_eq!(engine.telemetry().position, Some(position));
        assert_eq!(engine.telemetry().position_reports, 2);
    }

    #[test]
    fn test_get_position_without_report_times_out() {
        let device = MockDevice::new();
        device.ack_everything();
        let engine = ready_engine(&device);

        let err = engine.get_position(Duration::from_millis(100)).unwrap_err();
        assert!(matches!(err, DriverError::ExecutionTimeout(_)));
        assert_eq!(engine.telemetry().position, None);
    }

    #[test]
    fn test_get_temperature_prefers_bed() {
        let device = MockDevice::new();
        device.simulate_marlin(0.0, 0.0, 0.0);
        let engine = ready_engine(&device);

        engine
            .execute("set_bed_temp_wait", &Params::new().with("S", 55), SECOND)
            .unwrap();
        assert_eq!(engine.get_temperature(SECOND).unwrap(), 55.0);
        assert_eq!(engine.telemetry().temperature, Some(55.0));
    }

    #[test]
    fn test_safety_lift_precedes_horizontal_move() {
        let device = MockDevice::new();
        device.simulate_marlin(0.0, 0.0, 50.0);
        let engine = ready_engine(&device);
        engine.get_position(SECOND).unwrap();
        device.take_sent();

        let result = engine
            .execute("move", &Params::new().with("X", 10.0), SECOND)
            .unwrap();
        assert!(result.is_ok(), "{}", result.message);
        assert_eq!(device.sent(), vec!["G1 Z150", "M400", "G1 X10", "M400"]);

        let position = engine.get_position(SECOND).unwrap();
        assert_eq!(position, Position::new(10.0, 0.0, 150.0));
    }

    #[test]
    fn test_zero_delta_move_is_not_lifted() {
        let device = MockDevice::new();
        device.simulate_marlin(10.0, 20.0, 50.0);
        let engine = ready_engine(&device);
        engine.get_position(SECOND).unwrap();
        device.take_sent();

        let params = Params::new().with("X", 10.0).with("Y", 20.0);
        let result = engine.execute("move", &params, SECOND).unwrap();
        assert!(result.is_ok());
        assert_eq!(device.sent(), vec!["G1 X10 Y20", "M400"]);

        // 纯竖直运动同样直接放行
        device.take_sent();
        engine
            .execute("move", &Params::new().with("Z", 5.0), SECOND)
            .unwrap();
        assert_eq!(device.sent(), vec!["G1 Z5", "M400"]);
    }

    #[test]
    fn test_unknown_position_lifts_first() {
        let device = MockDevice::new();
        device.simulate_marlin(0.0, 0.0, 0.0);
        let engine = ready_engine(&device);

        let params = Params::new().with("X", 5.0).with("F", 1200);
        let result = engine.execute("move", &params, SECOND).unwrap();
        assert!(result.is_ok());
        assert_eq!(
            result.sent,
            vec!["G1 Z150 F1200", "M400", "G1 X5 F1200", "M400"]
        );
    }

    #[test]
    fn test_low_target_descends_after_horizontal_move() {
        let device = MockDevice::new();
        device.simulate_marlin(0.0, 0.0, 50.0);
        let engine = ready_engine(&device);
        engine.get_position(SECOND).unwrap();

        let params = Params::new().with("X", 100.0).with("Z", 20.0);
        let result = engine.execute("move", &params, SECOND).unwrap();
        assert!(result.is_ok());
        assert_eq!(
            result.sent,
            vec!["G1 Z150", "M400", "G1 X100", "M400", "G1 Z20", "M400"]
        );
        assert!(result.message.contains("3 moves"));
        assert_eq!(
            engine.get_position(SECOND).unwrap(),
            Position::new(100.0, 0.0, 20.0)
        );
    }

    #[test]
    fn test_settled_accounting_ignores_early_acks() {
        let device = MockDevice::new();
        device.ack_everything();
        let config = EngineConfig {
            ack_accounting: AckAccounting::Settled { window_ms: 150 },
            ..test_config()
        };
        let engine = Arc::new(engine_with(&device, config, SafetyPolicy::disabled()));

        let injector = device.clone();
        let late = thread::spawn(move || {
            thread::sleep(Duration::from_millis(300));
            injector.inject("ok");
        });

        let start = Instant::now();
        let result = engine
            .execute("move", &Params::new().with("X", 1.0), SECOND)
            .unwrap();
        assert!(result.is_ok());
        assert!(start.elapsed() >= Duration::from_millis(150));
        late.join().unwrap();

        // 非排空步骤不受窗口影响
        let start = Instant::now();
        engine
            .execute("dwell", &Params::new().with("duration_ms", 1), SECOND)
            .unwrap();
        assert!(start.elapsed() < Duration::from_millis(150));
    }

    #[test]
    fn test_single_flight_serializes_callers() {
        let device = MockDevice::new();
        let engine = Arc::new(ready_engine(&device));

        let first = {
            let engine = engine.clone();
            thread::spawn(move || {
                engine
                    .execute(
                        "dwell",
                        &Params::new().with("duration_ms", 1000),
                        Duration::from_millis(300),
                    )
                    .unwrap()
            })
        };
        thread::sleep(Duration::from_millis(50));

        let start = Instant::now();
        let result = engine.execute("set_absolute", &Params::new(), SECOND).unwrap();
        assert!(result.is_ok());
        assert!(start.elapsed() >= Duration::from_millis(150));
        assert_eq!(first.join().unwrap().status, ExecutionStatus::Timeout);

        assert_eq!(device.sent(), vec!["G4 P1000", "G90"]);
    }

    #[test]
    fn test_boot_sends_lines_in_order() {
        let device = MockDevice::new();
        device.ack_everything();
        let engine = Engine::new(
            Box::new(device.transport()),
            Arc::new(Catalog::builtin()),
            test_config(),
            SafetyPolicy::default(),
        )
        .unwrap();

        engine.boot(["G90", "", "  M83  ", "G28"]).unwrap();
        assert_eq!(device.sent(), vec!["G90", "M83", "G28"]);
        assert_eq!(engine.connection_state(), ConnectionState::Ready);
    }

    #[test]
    fn test_boot_failure_marks_connection_failed() {
        let device = MockDevice::new();
        let engine = Engine::new(
            Box::new(device.transport()),
            Arc::new(Catalog::builtin()),
            test_config(),
            SafetyPolicy::default(),
        )
        .unwrap();

        let err = engine.boot(["G90", "G28"]).unwrap_err();
        assert!(matches!(err, DriverError::ConnectionFailed(ref reason) if reason.contains("G90")));
        assert!(matches!(engine.connection_state(), ConnectionState::Failed(_)));
        assert_eq!(device.sent(), vec!["G90"]);

        assert!(matches!(
            engine.execute("set_absolute", &Params::new(), SECOND),
            Err(DriverError::NotReady(ConnectionState::Failed(_)))
        ));
    }

    #[test]
    fn test_save_location() {
        let device = MockDevice::new();
        device.simulate_marlin(1.0, 2.0, 3.0);
        let engine = ready_engine(&device);

        assert!(matches!(engine.save_location("vial"), Err(DriverError::PositionUnknown)));
        assert!(matches!(engine.save_location("  "), Err(DriverError::InvalidInput(_))));

        engine.get_position(SECOND).unwrap();
        let saved = engine.save_location(" vial ").unwrap();
        assert_eq!(saved.name, "vial");
        assert_eq!(saved.position, Position::new(1.0, 2.0, 3.0));

        engine.execute("move", &Params::new().with("Z", 10.0), SECOND).unwrap();
        engine.get_position(SECOND).unwrap();
        engine.save_location("vial").unwrap();
        assert_eq!(engine.locations().len(), 1);
        assert_eq!(engine.location("vial"), Some(Position::new(1.0, 2.0, 10.0)));
    }

    #[test]
    fn test_shutdown_closes_transport() {
        let device = MockDevice::new();
        let engine = ready_engine(&device);
        engine.shutdown();
        assert!(device.is_closed());
        assert!(matches!(
            engine.execute("set_absolute", &Params::new(), SECOND),
            Err(DriverError::NotReady(ConnectionState::Disconnected))
        ));
    }

    /// 应答按发送顺序延后到达：`slow` 行延迟 `millis`，其余 5 ms
    fn delay_slow_lines(device: &MockDevice, slow: &'static str, millis: u64) {
        device.delay_replies(move |line| {
            if line.starts_with(slow) {
                Duration::from_millis(millis)
            } else {
                Duration::from_millis(5)
            }
        });
    }

    #[test]
    fn test_late_ack_of_fire_and_forget_does_not_complete_next_wait() {
        let device = MockDevice::new();
        device.ack_everything();
        delay_slow_lines(&device, "G4", 400);
        let engine = ready_engine(&device);

        assert!(engine.execute("fan_on", &Params::new(), SECOND).unwrap().is_ok());
        let start = Instant::now();
        let result = engine
            .execute("dwell", &Params::new().with("duration_ms", 400), SECOND)
            .unwrap();
        assert!(result.is_ok(), "{}", result.message);
        assert!(start.elapsed() >= Duration::from_millis(350), "took {:?}", start.elapsed());
    }

    #[test]
    fn test_drained_step_waits_for_its_own_drain_ack() {
        let device = MockDevice::new();
        device.ack_everything();
        delay_slow_lines(&device, "M400", 300);
        let engine = ready_engine(&device);

        assert!(
            engine
                .execute("set_extruder_relative", &Params::new(), SECOND)
                .unwrap()
                .is_ok()
        );
        let start = Instant::now();
        let params = Params::new().with("E", 2.0).with("F", 60);
        let result = engine.execute("pump_move", &params, SECOND).unwrap();
        assert!(result.is_ok(), "{}", result.message);
        assert_eq!(result.sent, vec!["G1 E2 F60", "M400"]);
        assert!(start.elapsed() >= Duration::from_millis(250), "took {:?}", start.elapsed());
    }

    #[test]
    fn test_trailing_query_ack_does_not_complete_next_move() {
        let device = MockDevice::new();
        device.respond_with(|line| match line {
            "M114" => vec!["X:0.00 Y:0.00 Z:150.00 E:0.00 Count X:0 Y:0 Z:0".to_string()],
            _ => vec!["ok".to_string()],
        });
        delay_slow_lines(&device, "M400", 300);
        let engine = engine_with(&device, test_config(), SafetyPolicy::disabled());

        engine.get_position(SECOND).unwrap();
        // 查询的应答在报告之后才到
        let injector = device.clone();
        let late = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            injector.inject("ok");
        });

        let start = Instant::now();
        let result = engine
            .execute("move", &Params::new().with("X", 10.0), SECOND)
            .unwrap();
        assert!(result.is_ok(), "{}", result.message);
        assert!(start.elapsed() >= Duration::from_millis(250), "took {:?}", start.elapsed());
        late.join().unwrap();
    }

    #[test]
    fn test_relative_move_is_lifted_in_absolute_coordinates() {
        let device = MockDevice::new();
        device.simulate_marlin(10.0, 0.0, 50.0);
        let engine = ready_engine(&device);
        engine.get_position(SECOND).unwrap();

        assert!(engine.execute("set_relative", &Params::new(), SECOND).unwrap().is_ok());
        assert_eq!(engine.positioning(), Positioning::Relative);

        let result = engine
            .execute("move", &Params::new().with("X", 10.0), SECOND)
            .unwrap();
        assert!(result.is_ok(), "{}", result.message);
        assert_eq!(
            result.sent,
            vec!["M114", "G90", "G1 Z150", "M400", "G1 X20", "M400", "G91"]
        );
        assert_eq!(engine.positioning(), Positioning::Relative);
        assert_eq!(
            engine.get_position(SECOND).unwrap(),
            Position::new(20.0, 0.0, 150.0)
        );
    }

    #[test]
    fn test_relative_move_descends_to_offset_height() {
        let device = MockDevice::new();
        device.simulate_marlin(10.0, 0.0, 50.0);
        let engine = ready_engine(&device);
        engine.execute("set_relative", &Params::new(), SECOND).unwrap();

        // 位置未知时先刷新
        let params = Params::new().with("X", 10.0).with("Z", -20.0);
        let result = engine.execute("move", &params, SECOND).unwrap();
        assert!(result.is_ok(), "{}", result.message);
        assert_eq!(
            result.sent,
            vec!["M114", "G90", "G1 Z150", "M400", "G1 X20", "M400", "G1 Z30", "M400", "G91"]
        );
        assert_eq!(
            engine.get_position(SECOND).unwrap(),
            Position::new(20.0, 0.0, 30.0)
        );

        // 纯竖直的相对运动直接放行
        let result = engine
            .execute("move", &Params::new().with("Z", -5.0), SECOND)
            .unwrap();
        assert_eq!(result.sent, vec!["G1 Z-5", "M400"]);
        assert_eq!(
            engine.get_position(SECOND).unwrap(),
            Position::new(20.0, 0.0, 25.0)
        );
    }

    #[test]
    fn test_boot_lines_set_positioning() {
        let device = MockDevice::new();
        device.ack_everything();
        let engine = Engine::new(
            Box::new(device.transport()),
            Arc::new(Catalog::builtin()),
            test_config(),
            SafetyPolicy::default(),
        )
        .unwrap();

        engine.boot(["G91"]).unwrap();
        assert_eq!(engine.positioning(), Positioning::Relative);
        engine.boot(Vec::<String>::new()).unwrap();
        assert_eq!(engine.positioning(), Positioning::Absolute);
    }
}
