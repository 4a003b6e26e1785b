//! Mock 传输（无硬件依赖，用于测试）
//!
//! [`MockDevice`] 是可克隆的设备侧句柄：记录发送的行、注入响应行、
//! 安装自动应答闭包、强制发送失败。[`MockTransport`] 是引擎侧端点。
//!
//! 应答默认在 `send` 返回前就已入队；[`MockDevice::delay_replies`] 让应答
//! 延后到达（按发送顺序），用来模拟真实固件执行命令的耗时。

use crate::line::recv_line;
use crate::{Transport, TransportError};
use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

type Responder = Box<dyn FnMut(&str) -> Vec<String> + Send>;
type ReplyDelay = Box<dyn Fn(&str) -> Duration + Send>;

/// 一批延后注入的应答
struct Delayed {
    due: Instant,
    lines: Vec<String>,
}

/// 延后应答的投递线程（按到期时间依次注入，不会乱序）
struct Scheduler {
    queue: Sender<Delayed>,
    last_due: Instant,
}

impl Scheduler {
    fn spawn(out: Sender<String>) -> Self {
        let (queue, jobs) = unbounded::<Delayed>();
        thread::spawn(move || {
            for job in jobs {
                let now = Instant::now();
                if job.due > now {
                    thread::sleep(job.due - now);
                }
                for line in job.lines {
                    if out.send(line).is_err() {
                        return;
                    }
                }
            }
        });
        Self {
            queue,
            last_due: Instant::now(),
        }
    }
}

/// 一条已发送的行及其时间戳
#[derive(Debug, Clone, PartialEq)]
pub struct SentLine {
    pub line: String,
    pub at: Instant,
}

struct MockInner {
    sent: Mutex<Vec<SentLine>>,
    tx: Sender<String>,
    rx: Receiver<String>,
    responder: Mutex<Option<Responder>>,
    delay: Mutex<Option<ReplyDelay>>,
    scheduler: Mutex<Option<Scheduler>>,
    fail_sends: AtomicBool,
    closed: AtomicBool,
}

/// 设备侧句柄
#[derive(Clone)]
pub struct MockDevice {
    inner: Arc<MockInner>,
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDevice {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self {
            inner: Arc::new(MockInner {
                sent: Mutex::new(Vec::new()),
                tx,
                rx,
                responder: Mutex::new(None),
                delay: Mutex::new(None),
                scheduler: Mutex::new(None),
                fail_sends: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// 创建连接到本设备的传输端点
    pub fn transport(&self) -> MockTransport {
        MockTransport {
            device: self.clone(),
        }
    }

    /// 注入一行设备输出
    pub fn inject(&self, line: impl Into<String>) {
        let _ = self.inner.tx.send(line.into());
    }

    /// 安装自动应答：每发送一行调用一次，返回的行被依次注入
    pub fn respond_with<F>(&self, responder: F)
    where
        F: FnMut(&str) -> Vec<String> + Send + 'static,
    {
        *self.inner.responder.lock() = Some(Box::new(responder));
    }

    /// 对每一行都回复 `ok`
    pub fn ack_everything(&self) {
        self.respond_with(|_| vec!["ok".to_string()]);
    }

    pub fn clear_responder(&self) {
        *self.inner.responder.lock() = None;
    }

    /// 让自动应答延后到达：`delay` 按发送的行给出延迟
    ///
    /// 应答之间保持发送顺序，一条慢命令会推迟其后所有命令的应答。
    pub fn delay_replies<F>(&self, delay: F)
    where
        F: Fn(&str) -> Duration + Send + 'static,
    {
        *self.inner.delay.lock() = Some(Box::new(delay));
    }

    fn deliver(&self, lines: Vec<String>, delay: Duration) {
        let mut scheduler = self.inner.scheduler.lock();
        if delay.is_zero() && scheduler.is_none() {
            for line in lines {
                let _ = self.inner.tx.send(line);
            }
            return;
        }

        let scheduler = scheduler.get_or_insert_with(|| Scheduler::spawn(self.inner.tx.clone()));
        let due = (Instant::now() + delay).max(scheduler.last_due);
        scheduler.last_due = due;
        let _ = scheduler.queue.send(Delayed { due, lines });
    }

    /// 安装一个简化的 Marlin 固件模拟器（起始位置为给定坐标）
    ///
    /// 支持 `G28`、`G90`/`G91`、`G0`/`G1`、`M114`、`M105`、`M140`/`M190`，
    /// 其余命令一律回复 `ok`。
    pub fn simulate_marlin(&self, x: f64, y: f64, z: f64) {
        let mut sim = MarlinSim {
            pos: [x, y, z, 0.0],
            relative: false,
            bed_target: 0.0,
            bed_current: 21.0,
        };
        self.respond_with(move |line| sim.handle(line));
    }

    /// 让后续的 `send` 失败
    pub fn fail_sends(&self, fail: bool) {
        self.inner.fail_sends.store(fail, Ordering::Release);
    }

    /// 已发送的行（按顺序）
    pub fn sent(&self) -> Vec<String> {
        self.inner.sent.lock().iter().map(|s| s.line.clone()).collect()
    }

    pub fn sent_lines(&self) -> Vec<SentLine> {
        self.inner.sent.lock().clone()
    }

    /// 取出并清空已发送记录
    pub fn take_sent(&self) -> Vec<String> {
        std::mem::take(&mut *self.inner.sent.lock())
            .into_iter()
            .map(|s| s.line)
            .collect()
    }

    /// 尚未被读取的注入行数
    pub fn pending(&self) -> usize {
        self.inner.rx.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

/// 最小 Marlin 行为模型
struct MarlinSim {
    /// X, Y, Z, E
    pos: [f64; 4],
    relative: bool,
    bed_target: f64,
    bed_current: f64,
}

impl MarlinSim {
    fn handle(&mut self, line: &str) -> Vec<String> {
        let mut words = line.split_whitespace();
        let command = words.next().unwrap_or("").to_ascii_uppercase();
        let args: Vec<(char, f64)> = words
            .filter_map(|w| {
                let mut chars = w.chars();
                let letter = chars.next()?.to_ascii_uppercase();
                Some((letter, chars.as_str().parse().ok()?))
            })
            .collect();
        let arg = |letter: char| args.iter().find(|(l, _)| *l == letter).map(|(_, v)| *v);

        match command.as_str() {
            "G28" => self.pos[..3].fill(0.0),
            "G90" => self.relative = false,
            "G91" => self.relative = true,
            "G0" | "G1" => {
                for (i, axis) in ['X', 'Y', 'Z', 'E'].into_iter().enumerate() {
                    if let Some(v) = arg(axis) {
                        self.pos[i] = if self.relative { self.pos[i] + v } else { v };
                    }
                }
            },
            "M114" => {
                return vec![
                    format!(
                        "X:{:.2} Y:{:.2} Z:{:.2} E:{:.2} Count X:0 Y:0 Z:0",
                        self.pos[0], self.pos[1], self.pos[2], self.pos[3]
                    ),
                    "ok".to_string(),
                ];
            },
            "M105" => {
                return vec![format!(
                    "ok T:21.0 /0.0 B:{:.1} /{:.1} @:0 B@:0",
                    self.bed_current, self.bed_target
                )];
            },
            "M140" => self.bed_target = arg('S').unwrap_or(0.0),
            "M190" => {
                self.bed_target = arg('S').unwrap_or(0.0);
                self.bed_current = self.bed_target;
            },
            _ => {},
        }
        vec!["ok".to_string()]
    }
}

/// 引擎侧端点
pub struct MockTransport {
    device: MockDevice,
}

impl Transport for MockTransport {
    fn send(&mut self, line: &str) -> Result<(), TransportError> {
        let inner = &self.device.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        if inner.fail_sends.load(Ordering::Acquire) {
            return Err(TransportError::Unavailable("mock device unreachable".to_string()));
        }

        inner.sent.lock().push(SentLine {
            line: line.to_string(),
            at: Instant::now(),
        });

        let replies = match inner.responder.lock().as_mut() {
            Some(responder) => responder(line),
            None => return Ok(()),
        };
        let delay = inner
            .delay
            .lock()
            .as_ref()
            .map_or(Duration::ZERO, |delay| delay(line));
        self.device.deliver(replies, delay);
        Ok(())
    }

    fn read_line(&mut self, timeout: Duration) -> Result<String, TransportError> {
        recv_line(&self.device.inner.rx, timeout)
    }

    fn close(&mut self) {
        self.device.inner.closed.store(true, Ordering::Release);
    }

    fn describe(&self) -> String {
        "mock".to_string()
    }
}
