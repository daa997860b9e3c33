//! 로깅 시스템
//!
//! - 로그 레벨: ERROR, WARN, INFO, DEBUG, TRACE
//! - tracing-subscriber: EnvFilter (`TCCMOD_LOG`) + stderr fmt 레이어
//! - 64KB 링 버퍼 (dmesg)

mod buffer;

pub use buffer::{LogEntry, LogRing, RingLayer};

use std::fmt;
use std::str::FromStr;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// 레벨 설정을 덮어쓰는 환경 변수 (EnvFilter 문법)
pub const LOG_ENV: &str = "TCCMOD_LOG";

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => " WARN",
            LogLevel::Info => " INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }

    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Error,
            1 => LogLevel::Warn,
            2 => LogLevel::Info,
            3 => LogLevel::Debug,
            4 => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    }

    pub fn filter(&self) -> LevelFilter {
        match self {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<tracing::Level> for LogLevel {
    fn from(level: tracing::Level) -> Self {
        match level {
            tracing::Level::ERROR => LogLevel::Error,
            tracing::Level::WARN => LogLevel::Warn,
            tracing::Level::INFO => LogLevel::Info,
            tracing::Level::DEBUG => LogLevel::Debug,
            tracing::Level::TRACE => LogLevel::Trace,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown log level '{0}' (expected error, warn, info, debug, trace or 0-4)")]
pub struct ParseLevelError(String);

impl FromStr for LogLevel {
    type Err = ParseLevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        // 숫자로 먼저 시도
        if let [c @ b'0'..=b'4'] = s.as_bytes() {
            return Ok(Self::from_u8(c - b'0'));
        }
        // 이름으로 시도 (대소문자 무시)
        match s.to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err(ParseLevelError(s.to_string())),
        }
    }
}

/// 로깅 시스템 초기화
///
/// `TCCMOD_LOG`가 있으면 그 필터가 `level`보다 우선한다.
/// 전역 subscriber가 이미 설치되어 있으면 링만 만들어 돌려준다.
pub fn init(level: LogLevel) -> LogRing {
    let ring = LogRing::new();

    let filter = EnvFilter::builder()
        .with_default_directive(level.filter().into())
        .with_env_var(LOG_ENV)
        .from_env_lossy();

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(RingLayer::new(ring.clone()))
        .try_init();

    if installed.is_err() {
        tracing::debug!("Global subscriber already installed");
    }
    ring
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_parse_from_names_and_digits() {
        assert_eq!("INFO".parse::<LogLevel>(), Ok(LogLevel::Info));
        assert_eq!("Trace".parse::<LogLevel>(), Ok(LogLevel::Trace));
        assert_eq!("warning".parse::<LogLevel>(), Ok(LogLevel::Warn));
        assert_eq!("0".parse::<LogLevel>(), Ok(LogLevel::Error));
        assert_eq!("3".parse::<LogLevel>(), Ok(LogLevel::Debug));
        assert!("5".parse::<LogLevel>().is_err());
        assert!("loud".parse::<LogLevel>().is_err());
    }

    #[test]
    fn level_ordering_matches_verbosity() {
        assert!(LogLevel::Error < LogLevel::Trace);
        assert_eq!(LogLevel::from_u8(9), LogLevel::Info);
        assert_eq!(LogLevel::Debug.filter(), LevelFilter::DEBUG);
        assert_eq!(LogLevel::from(tracing::Level::WARN), LogLevel::Warn);
    }
}
