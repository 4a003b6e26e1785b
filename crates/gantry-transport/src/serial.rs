//! 串口传输
//!
//! 打开端口后等待控制器复位（多数 Arduino 类主板在打开串口时会重启），
//! 清空输入缓冲，再由后台线程持续读取并分帧。

use crate::line::{LineFramer, LineSink, line_queue, recv_line};
use crate::{Transport, TransportError};
use crossbeam_channel::Receiver;
use serde::{Deserialize, Serialize};
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// 串口配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// 端口标识（如 `/dev/ttyUSB0`、`COM3`）
    pub port: String,
    pub baud_rate: u32,
    /// 固件期望的行结束符
    pub line_ending: String,
    /// 打开后等待控制器复位的时间（毫秒）
    pub settle_delay_ms: u64,
    /// 接收线程单次读取的超时（毫秒），决定关闭时的响应速度
    pub read_poll_ms: u64,
    /// 行队列容量
    pub queue_capacity: usize,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 115_200,
            line_ending: "\n".to_string(),
            settle_delay_ms: 2000,
            read_poll_ms: 100,
            queue_capacity: 1024,
        }
    }
}

/// 串口传输
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
    rx: Receiver<String>,
    running: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
    line_ending: String,
    name: String,
}

impl SerialTransport {
    /// 打开串口并启动接收线程
    pub fn open(config: &SerialConfig) -> Result<Self, TransportError> {
        info!("Opening serial port {} at {} baud", config.port, config.baud_rate);

        let port = serialport::new(&config.port, config.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(Duration::from_millis(config.read_poll_ms.max(1)))
            .open()
            .map_err(|e| TransportError::Unavailable(format!("{}: {}", config.port, e)))?;

        if config.settle_delay_ms > 0 {
            debug!("Waiting {}ms for controller reset", config.settle_delay_ms);
            thread::sleep(Duration::from_millis(config.settle_delay_ms));
        }
        if let Err(e) = port.clear(ClearBuffer::Input) {
            warn!("Failed to clear serial input buffer: {}", e);
        }

        let reader_port = port
            .try_clone()
            .map_err(|e| TransportError::Unavailable(format!("{}: {}", config.port, e)))?;

        Self::with_port(port, reader_port, config)
    }

    /// 用已打开的端口构造（读写各一个句柄）
    pub fn with_port(
        port: Box<dyn SerialPort>,
        reader_port: Box<dyn SerialPort>,
        config: &SerialConfig,
    ) -> Result<Self, TransportError> {
        let (sink, rx) = line_queue(config.queue_capacity, "serial");
        let running = Arc::new(AtomicBool::new(true));
        let running_clone = running.clone();

        let reader = thread::Builder::new()
            .name("gantry-serial-rx".into())
            .spawn(move || reader_loop(reader_port, sink, running_clone))?;

        Ok(Self {
            port,
            rx,
            running,
            reader: Some(reader),
            line_ending: config.line_ending.clone(),
            name: format!("serial {}@{}", config.port, config.baud_rate),
        })
    }
}

fn reader_loop(mut port: Box<dyn SerialPort>, sink: LineSink, running: Arc<AtomicBool>) {
    let mut framer = LineFramer::new();
    let mut buf = [0u8; 256];

    while running.load(Ordering::Acquire) {
        match port.read(&mut buf) {
            Ok(0) => continue,
            Ok(n) => {
                for line in framer.push(&buf[..n]) {
                    trace!("RX {}", line);
                    if !sink.push(line) {
                        debug!("Serial line queue receiver dropped, stopping reader");
                        return;
                    }
                }
            },
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                continue;
            },
            Err(e) => {
                error!("Serial read failed: {}", e);
                break;
            },
        }
    }
    debug!("Serial reader thread exiting");
}

impl Transport for SerialTransport {
    fn send(&mut self, line: &str) -> Result<(), TransportError> {
        let mut data = String::with_capacity(line.len() + self.line_ending.len());
        data.push_str(line.trim_end());
        data.push_str(&self.line_ending);

        self.port
            .write_all(data.as_bytes())
            .map_err(TransportError::from_io)?;
        self.port.flush().map_err(TransportError::from_io)?;
        debug!("TX {}", line.trim_end());
        Ok(())
    }

    fn read_line(&mut self, timeout: Duration) -> Result<String, TransportError> {
        recv_line(&self.rx, timeout)
    }

    fn close(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.reader.take() {
            if handle.join().is_err() {
                warn!("Serial reader thread panicked");
            }
            info!("Closed {}", self.name);
        }
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.close();
    }
}
