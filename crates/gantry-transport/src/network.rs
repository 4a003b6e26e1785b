//! 网络桥接传输
//!
//! 命令通过 HTTP 提交（桥接器只确认"已收到"，不代表执行完成）；
//! 设备输出通过持久 WebSocket 异步推送，进入有界队列。
//!
//! WebSocket 不可用时退化为轮询：`read_line` 在等待期间按间隔
//! 请求状态端点，因此轮询始终发生在调用方线程上，不会与引擎并发。

use crate::line::{LineSink, line_queue, recv_line, split_lines};
use crate::{Transport, TransportError};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use serde::{Deserialize, Serialize};
use std::net::TcpStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};
use tungstenite::client::IntoClientRequest;
use tungstenite::http::HeaderValue;
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Message, WebSocket};

/// WebSocket 读超时，决定接收线程检查停止标志的频率
const SOCKET_READ_SLICE: Duration = Duration::from_millis(200);

/// 命令提交方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HttpMethod {
    /// `GET {command_path}?{command_param}=<line>`（ESP3D 风格）
    #[default]
    Get,
    /// `POST {command_path}`，请求体为命令文本
    Post,
}

/// 遥测获取方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TelemetryMode {
    /// 持久 WebSocket；不可用时若给出间隔则退化为轮询
    WebSocket { fallback_poll_interval_ms: Option<u64> },
    /// 始终轮询状态端点
    Polling { interval_ms: u64 },
}

impl Default for TelemetryMode {
    fn default() -> Self {
        TelemetryMode::WebSocket {
            fallback_poll_interval_ms: Some(500),
        }
    }
}

/// 网络桥接配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub host: String,
    /// 命令端口（HTTP）
    pub http_port: u16,
    /// 遥测端口（WebSocket）
    pub ws_port: u16,
    pub ws_path: String,
    pub ws_subprotocol: Option<String>,
    pub command_path: String,
    pub command_param: String,
    pub method: HttpMethod,
    pub http_timeout_ms: u64,
    pub telemetry: TelemetryMode,
    /// 轮询模式下的状态端点
    pub status_path: String,
    pub queue_capacity: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "192.168.0.1".to_string(),
            http_port: 80,
            ws_port: 81,
            ws_path: "/".to_string(),
            ws_subprotocol: Some("arduino".to_string()),
            command_path: "/command".to_string(),
            command_param: "commandText".to_string(),
            method: HttpMethod::Get,
            http_timeout_ms: 15_000,
            telemetry: TelemetryMode::default(),
            status_path: "/status".to_string(),
            queue_capacity: 1024,
        }
    }
}

impl NetworkConfig {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.http_port)
    }

    pub fn command_url(&self) -> String {
        format!("{}{}", self.base_url(), self.command_path)
    }

    pub fn status_url(&self) -> String {
        format!("{}{}", self.base_url(), self.status_path)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}:{}{}", self.host, self.ws_port, self.ws_path)
    }
}

enum Telemetry {
    Socket {
        running: Arc<AtomicBool>,
        alive: Arc<AtomicBool>,
        handle: Option<JoinHandle<()>>,
        fallback: Option<Duration>,
    },
    Polling {
        interval: Duration,
        last_poll: Option<Instant>,
    },
    /// 套接字已断开且没有轮询回退
    Lost,
}

/// 网络桥接传输
pub struct NetworkTransport {
    client: reqwest::blocking::Client,
    config: NetworkConfig,
    command_url: String,
    status_url: String,
    sink: LineSink,
    rx: Receiver<String>,
    telemetry: Telemetry,
}

impl NetworkTransport {
    /// 建立 HTTP 客户端与遥测通道
    pub fn connect(config: &NetworkConfig) -> Result<Self, TransportError> {
        let timeout = Duration::from_millis(config.http_timeout_ms.max(1));
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(map_http_error)?;

        let (sink, rx) = line_queue(config.queue_capacity, "network");

        let telemetry = match config.telemetry {
            TelemetryMode::Polling { interval_ms } => {
                info!("Using status polling every {}ms at {}", interval_ms, config.status_url());
                Telemetry::Polling {
                    interval: Duration::from_millis(interval_ms.max(1)),
                    last_poll: None,
                }
            },
            TelemetryMode::WebSocket {
                fallback_poll_interval_ms,
            } => {
                let fallback = fallback_poll_interval_ms.map(|ms| Duration::from_millis(ms.max(1)));
                match open_socket(config) {
                    Ok(socket) => spawn_socket_reader(socket, sink.clone(), fallback)?,
                    Err(e) => match fallback {
                        Some(interval) => {
                            warn!(
                                "WebSocket {} unavailable ({}), falling back to polling every {:?}",
                                config.ws_url(),
                                e,
                                interval
                            );
                            Telemetry::Polling {
                                interval,
                                last_poll: None,
                            }
                        },
                        None => return Err(e),
                    },
                }
            },
        };

        Ok(Self {
            client,
            command_url: config.command_url(),
            status_url: config.status_url(),
            config: config.clone(),
            sink,
            rx,
            telemetry,
        })
    }

    /// 当前是否处于轮询模式
    pub fn is_polling(&self) -> bool {
        matches!(self.telemetry, Telemetry::Polling { .. })
    }

    /// 套接字线程退出后切换到轮询或标记为断开
    fn refresh_telemetry(&mut self) {
        let Telemetry::Socket {
            alive, fallback, ..
        } = &self.telemetry
        else {
            return;
        };
        if alive.load(Ordering::Acquire) {
            return;
        }
        let next = match *fallback {
            Some(interval) => {
                warn!("WebSocket telemetry lost, falling back to polling every {:?}", interval);
                Telemetry::Polling {
                    interval,
                    last_poll: None,
                }
            },
            None => {
                warn!("WebSocket telemetry lost");
                Telemetry::Lost
            },
        };
        self.stop_socket();
        self.telemetry = next;
    }

    fn stop_socket(&mut self) {
        if let Telemetry::Socket {
            running, handle, ..
        } = &mut self.telemetry
        {
            running.store(false, Ordering::Release);
            if let Some(handle) = handle.take()
                && handle.join().is_err()
            {
                warn!("WebSocket reader thread panicked");
            }
        }
    }

    fn enqueue_body(&self, body: &str) {
        for line in split_lines(body) {
            trace!("RX {}", line);
            self.sink.push(line.to_string());
        }
    }

    fn poll_status(&self) -> Result<(), TransportError> {
        let response = self.client.get(&self.status_url).send().map_err(map_http_error)?;
        let status = response.status();
        let body = response.text().map_err(map_http_error)?;
        if !status.is_success() {
            return Err(TransportError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        self.enqueue_body(&body);
        Ok(())
    }

    fn read_polling(&mut self, timeout: Duration) -> Result<String, TransportError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Ok(line) = self.rx.try_recv() {
                return Ok(line);
            }
            let Telemetry::Polling {
                interval,
                last_poll,
            } = self.telemetry
            else {
                return Err(TransportError::Closed);
            };

            let now = Instant::now();
            let next_poll = last_poll.map_or(now, |t| t + interval);
            if next_poll <= now {
                self.telemetry = Telemetry::Polling {
                    interval,
                    last_poll: Some(now),
                };
                match self.poll_status() {
                    Ok(()) => {},
                    Err(TransportError::Timeout) => debug!("Status poll timed out"),
                    Err(TransportError::Rejected { status, body }) => {
                        warn!("Status poll returned HTTP {}: {}", status, body.trim())
                    },
                    Err(e) => return Err(e),
                }
                continue;
            }

            if now >= deadline {
                return Err(TransportError::Timeout);
            }
            match self.rx.recv_timeout(deadline.min(next_poll) - now) {
                Ok(line) => return Ok(line),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Err(TransportError::Closed),
            }
        }
    }
}

fn map_http_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Unavailable(e.to_string())
    }
}

fn open_socket(config: &NetworkConfig) -> Result<WebSocket<MaybeTlsStream<TcpStream>>, TransportError> {
    let url = config.ws_url();
    info!("Connecting to WebSocket at {}", url);

    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| TransportError::Unavailable(format!("{}: {}", url, e)))?;
    if let Some(protocol) = &config.ws_subprotocol {
        let value = HeaderValue::from_str(protocol)
            .map_err(|e| TransportError::Unavailable(format!("bad subprotocol '{}': {}", protocol, e)))?;
        request.headers_mut().insert("Sec-WebSocket-Protocol", value);
    }

    let (mut socket, _response) =
        tungstenite::connect(request).map_err(|e| TransportError::Unavailable(format!("{}: {}", url, e)))?;
    if let MaybeTlsStream::Plain(stream) = socket.get_mut() {
        stream.set_read_timeout(Some(SOCKET_READ_SLICE))?;
    }
    info!("WebSocket connected");
    Ok(socket)
}

fn spawn_socket_reader(
    socket: WebSocket<MaybeTlsStream<TcpStream>>,
    sink: LineSink,
    fallback: Option<Duration>,
) -> Result<Telemetry, TransportError> {
    let running = Arc::new(AtomicBool::new(true));
    let alive = Arc::new(AtomicBool::new(true));
    let (running_clone, alive_clone) = (running.clone(), alive.clone());

    let handle = thread::Builder::new()
        .name("gantry-ws-rx".into())
        .spawn(move || socket_loop(socket, sink, running_clone, alive_clone))?;

    Ok(Telemetry::Socket {
        running,
        alive,
        handle: Some(handle),
        fallback,
    })
}

fn socket_loop(
    mut socket: WebSocket<MaybeTlsStream<TcpStream>>,
    sink: LineSink,
    running: Arc<AtomicBool>,
    alive: Arc<AtomicBool>,
) {
    let push = |text: &str| {
        for line in split_lines(text) {
            trace!("RX {}", line);
            sink.push(line.to_string());
        }
    };

    while running.load(Ordering::Acquire) {
        match socket.read() {
            Ok(Message::Text(text)) => push(&text),
            Ok(Message::Binary(data)) => push(&String::from_utf8_lossy(&data)),
            Ok(Message::Close(frame)) => {
                info!("WebSocket closed by peer: {:?}", frame);
                break;
            },
            Ok(_) => {},
            Err(tungstenite::Error::Io(e))
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                continue;
            },
            Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => break,
            Err(e) => {
                if running.load(Ordering::Acquire) {
                    warn!("WebSocket receive error: {}", e);
                }
                break;
            },
        }
    }

    let _ = socket.close(None);
    alive.store(false, Ordering::Release);
    debug!("WebSocket reader thread exiting");
}

impl Transport for NetworkTransport {
    fn send(&mut self, line: &str) -> Result<(), TransportError> {
        let line = line.trim();
        let request = match self.config.method {
            HttpMethod::Get => self
                .client
                .get(&self.command_url)
                .query(&[(self.config.command_param.as_str(), line)]),
            HttpMethod::Post => self
                .client
                .post(&self.command_url)
                .header(reqwest::header::CONTENT_TYPE, "text/plain")
                .body(line.to_string()),
        };

        let response = request.send().map_err(map_http_error)?;
        let status = response.status();
        let body = match response.text() {
            Ok(body) => body,
            Err(e) => {
                debug!("Failed to read command response body: {}", e);
                String::new()
            },
        };
        if !status.is_success() {
            return Err(TransportError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        debug!("TX {}", line);

        // 套接字模式下设备输出由 WebSocket 推送，响应体只是提交回执
        self.refresh_telemetry();
        if self.is_polling() {
            self.enqueue_body(&body);
        }
        Ok(())
    }

    fn read_line(&mut self, timeout: Duration) -> Result<String, TransportError> {
        self.refresh_telemetry();
        match self.telemetry {
            Telemetry::Socket { .. } => recv_line(&self.rx, timeout),
            Telemetry::Polling { .. } => self.read_polling(timeout),
            Telemetry::Lost => match self.rx.try_recv() {
                Ok(line) => Ok(line),
                Err(_) => Err(TransportError::Closed),
            },
        }
    }

    fn try_read_line(&mut self) -> Result<Option<String>, TransportError> {
        // 只取已到达的行，不触发轮询请求
        Ok(self.rx.try_recv().ok())
    }

    fn close(&mut self) {
        self.stop_socket();
        if matches!(self.telemetry, Telemetry::Socket { .. }) {
            self.telemetry = Telemetry::Lost;
            info!("Closed network transport {}", self.config.base_url());
        }
    }

    fn describe(&self) -> String {
        format!("network {}", self.config.base_url())
    }
}

impl Drop for NetworkTransport {
    fn drop(&mut self) {
        self.stop_socket();
    }
}
