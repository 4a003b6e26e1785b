//! 行分帧与行队列
//!
//! 后台接收线程把字节流切分成行，放入有界队列；`read_line` 按到达顺序取出。

use crate::TransportError;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};
use std::time::Duration;
use tracing::warn;

/// 单行最大长度，超过后强制切分
const MAX_LINE_LEN: usize = 4096;

/// 字节流行分帧器
///
/// 以 `\n` 切分，去掉 `\r` 和首尾空白，丢弃空行，按 UTF-8 有损解码。
#[derive(Debug, Default)]
pub struct LineFramer {
    buf: Vec<u8>,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加字节，返回已完整的行
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(bytes);
        let mut lines = Vec::new();

        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            if let Some(line) = decode(&raw) {
                lines.push(line);
            }
        }

        if self.buf.len() > MAX_LINE_LEN {
            warn!("Line exceeds {} bytes without terminator, flushing", MAX_LINE_LEN);
            let raw = std::mem::take(&mut self.buf);
            if let Some(line) = decode(&raw) {
                lines.push(line);
            }
        }
        lines
    }

    /// 尚未成行的字节数
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

fn decode(raw: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(raw);
    let line = text.trim();
    (!line.is_empty()).then(|| line.to_string())
}

/// 把一段文本（可能含多行，`\r\n` 或 `\n`）拆成非空行
pub fn split_lines(text: &str) -> impl Iterator<Item = &str> {
    text.lines().map(str::trim).filter(|l| !l.is_empty())
}

/// 行队列的发送端
#[derive(Debug, Clone)]
pub(crate) struct LineSink {
    tx: Sender<String>,
    source: &'static str,
}

impl LineSink {
    /// 入队；队列满时丢弃该行并告警。接收端已关闭时返回 `false`
    pub(crate) fn push(&self, line: String) -> bool {
        match self.tx.try_send(line) {
            Ok(()) => true,
            Err(TrySendError::Full(line)) => {
                warn!("{} line queue full, dropping: {}", self.source, line);
                true
            },
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

pub(crate) fn line_queue(capacity: usize, source: &'static str) -> (LineSink, Receiver<String>) {
    let (tx, rx) = bounded(capacity.max(1));
    (LineSink { tx, source }, rx)
}

pub(crate) fn recv_line(rx: &Receiver<String>, timeout: Duration) -> Result<String, TransportError> {
    match rx.recv_timeout(timeout) {
        Ok(line) => Ok(line),
        Err(RecvTimeoutError::Timeout) => Err(TransportError::Timeout),
        Err(RecvTimeoutError::Disconnected) => Err(TransportError::Closed),
    }
}
