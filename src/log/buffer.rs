//! 로그 링 버퍼 (dmesg)
//!
//! 64KB 바이트 예산의 순환 버퍼. 예산을 넘으면 오래된 엔트리부터 버린다.
//! 엔트리 비용: 헤더 14바이트 + 타겟 + 메시지

use std::collections::VecDeque;
use std::fmt::{self, Write as _};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::Context;

use super::LogLevel;

const RING_BUFFER_SIZE: usize = 64 * 1024; // 64KB
// 항목 비용 = 고정 헤더 + target 길이 + message 길이
const ENTRY_HEADER_SIZE: usize = 14;

/// 저장된 로그 한 줄
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub level: LogLevel,
    /// 링 생성 이후 경과 시간
    pub elapsed: Duration,
    pub target: String,
    pub message: String,
}

impl LogEntry {
    fn cost(&self) -> usize {
        ENTRY_HEADER_SIZE + self.target.len() + self.message.len()
    }
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:>6}.{:06}] {} {}: {}",
            self.elapsed.as_secs(),
            self.elapsed.subsec_micros(),
            self.level,
            self.target,
            self.message
        )
    }
}

struct Ring {
    entries: VecDeque<LogEntry>,
    bytes: usize,
    capacity: usize,
}

impl Ring {
    fn push(&mut self, entry: LogEntry) {
        let cost = entry.cost();

        // 버퍼 절반보다 큰 메시지는 무시
        if cost > self.capacity / 2 {
            return;
        }

        while self.bytes + cost > self.capacity {
            match self.entries.pop_front() {
                Some(old) => self.bytes -= old.cost(),
                None => break,
            }
        }
        self.bytes += cost;
        self.entries.push_back(entry);
    }
}

/// 공유 로그 링
#[derive(Clone)]
pub struct LogRing {
    inner: Arc<Mutex<Ring>>,
    started: Instant,
}

impl Default for LogRing {
    fn default() -> Self {
        Self::new()
    }
}

impl LogRing {
    pub fn new() -> Self {
        Self::with_capacity(RING_BUFFER_SIZE)
    }

    /// 바이트 예산 지정
    pub fn with_capacity(bytes: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Ring {
                entries: VecDeque::new(),
                bytes: 0,
                capacity: bytes,
            })),
            started: Instant::now(),
        }
    }

    pub fn append(&self, level: LogLevel, target: &str, message: &str) {
        self.inner.lock().push(LogEntry {
            level,
            elapsed: self.started.elapsed(),
            target: target.to_string(),
            message: message.to_string(),
        });
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.inner.lock().entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// 현재 사용 중인 바이트 수
    pub fn bytes(&self) -> usize {
        self.inner.lock().bytes
    }

    pub fn clear(&self) {
        let mut ring = self.inner.lock();
        ring.entries.clear();
        ring.bytes = 0;
    }

    /// dmesg 출력 형식
    pub fn dump(&self) -> String {
        let ring = self.inner.lock();
        if ring.entries.is_empty() {
            return "(empty log buffer)\n".to_string();
        }

        let mut out = String::new();
        for entry in &ring.entries {
            let _ = writeln!(out, "{entry}");
        }
        out
    }
}

impl fmt::Debug for LogRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ring = self.inner.lock();
        f.debug_struct("LogRing")
            .field("entries", &ring.entries.len())
            .field("bytes", &ring.bytes)
            .field("capacity", &ring.capacity)
            .finish()
    }
}

/// 이벤트를 링에 복사하는 tracing 레이어
pub struct RingLayer {
    ring: LogRing,
}

impl RingLayer {
    pub fn new(ring: LogRing) -> Self {
        Self { ring }
    }
}

impl<S> Layer<S> for RingLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();

        let mut message = String::new();
        event.record(&mut MessageVisitor(&mut message));

        self.ring
            .append(LogLevel::from(*metadata.level()), metadata.target(), &message);
    }
}

/// `message` 필드 추출
struct MessageVisitor<'a>(&'a mut String);

impl Visit for MessageVisitor<'_> {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            *self.0 = format!("{value:?}");
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            *self.0 = value.to_string();
        }
    }
}

#[cfg(test)]
mod tests {
    use tracing_subscriber::layer::SubscriberExt;

    use super::*;

    #[test]
    fn oldest_entries_are_evicted_by_bytes() {
        // 엔트리당 14 + 1 + 10 = 25바이트
        let ring = LogRing::with_capacity(60);
        ring.append(LogLevel::Info, "t", "message-01");
        ring.append(LogLevel::Info, "t", "message-02");
        assert_eq!(ring.bytes(), 50);

        ring.append(LogLevel::Warn, "t", "message-03");
        let messages: Vec<_> = ring.entries().into_iter().map(|e| e.message).collect();
        assert_eq!(messages, ["message-02", "message-03"]);
        assert_eq!(ring.bytes(), 50);
    }

    #[test]
    fn entry_cost_counts_target_and_message() {
        let ring = LogRing::with_capacity(1024);
        ring.append(LogLevel::Info, "module", "hi");
        assert_eq!(ring.bytes(), ENTRY_HEADER_SIZE + "module".len() + "hi".len());

        ring.append(LogLevel::Debug, "tcc", "");
        assert_eq!(ring.bytes(), 2 * ENTRY_HEADER_SIZE + 8 + 3);
    }

    #[test]
    fn oversized_entry_is_dropped() {
        let ring = LogRing::with_capacity(64);
        ring.append(LogLevel::Error, "t", &"x".repeat(40));
        assert!(ring.is_empty());
    }

    #[test]
    fn dump_uses_dmesg_layout() {
        let ring = LogRing::new();
        assert_eq!(ring.dump(), "(empty log buffer)\n");

        ring.append(LogLevel::Info, "tccmod::module", "Module 'hello' loaded");
        let dump = ring.dump();
        assert!(dump.starts_with('['));
        assert!(dump.ends_with("]  INFO tccmod::module: Module 'hello' loaded\n"));

        ring.clear();
        assert_eq!((ring.len(), ring.bytes()), (0, 0));
    }

    #[test]
    fn layer_captures_events() {
        let ring = LogRing::new();
        let subscriber = tracing_subscriber::registry().with(RingLayer::new(ring.clone()));

        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(target: "tcc", "hello.c:3: warning: {}", "implicit declaration");
        });

        let entries = ring.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].level, LogLevel::Warn);
        assert_eq!(entries[0].target, "tcc");
        assert_eq!(entries[0].message, "hello.c:3: warning: implicit declaration");
    }
}
