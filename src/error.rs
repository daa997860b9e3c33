//! 로더 에러 분류
//!
//! 로드 파이프라인의 각 단계 실패는 단계 이름 + 진단 메시지 한 줄로 보고된다.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::module::{HookKind, SessionId, SessionStage};

/// 로드 파이프라인 단계
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStage {
    Configure,
    Compile,
    Size,
    Allocate,
    Relocate,
    Resolve,
    Initialize,
    Hook,
}

impl LoadStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadStage::Configure => "configure",
            LoadStage::Compile => "compile",
            LoadStage::Size => "size",
            LoadStage::Allocate => "allocate",
            LoadStage::Relocate => "relocate",
            LoadStage::Resolve => "resolve",
            LoadStage::Initialize => "initialize",
            LoadStage::Hook => "hook",
        }
    }
}

impl fmt::Display for LoadStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 세션/모듈 상태 위반
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("`{operation}` is not allowed while the session is {stage:?}")]
    OutOfOrder {
        operation: &'static str,
        stage: SessionStage,
    },
    #[error("buffer was sized for session {found}, not session {expected}")]
    BufferMismatch { expected: SessionId, found: SessionId },
    #[error("buffer holds {provided} bytes but the image needs {required}")]
    BufferTooSmall { required: usize, provided: usize },
    #[error("module is already active")]
    AlreadyActive,
    #[error("module has been destroyed")]
    Destroyed,
}

/// 훅 실패 원인
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookFailure {
    /// 모듈이 훅을 등록하지 않음
    Missing,
    /// 훅이 실패를 반환
    Reported,
}

impl fmt::Display for HookFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookFailure::Missing => f.write_str("is not registered"),
            HookFailure::Reported => f.write_str("reported failure"),
        }
    }
}

/// 모듈 로드/수명 주기 에러
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("configure: toolchain unavailable: {0}")]
    Toolchain(String),

    #[error("configure: {} does not have the `.{extension}` extension", .path.display())]
    UnsupportedFile { path: PathBuf, extension: String },

    #[error("configure: {} is already loaded", .path.display())]
    AlreadyLoaded { path: PathBuf },

    #[error("module {} is not loaded", .path.display())]
    NotFound { path: PathBuf },

    #[error("compile: {}: {diagnostics}", .path.display())]
    Compile { path: PathBuf, diagnostics: String },

    #[error("size: {}: {diagnostics}", .path.display())]
    Sizing { path: PathBuf, diagnostics: String },

    #[error("allocate: could not reserve {bytes} bytes for the image")]
    OutOfMemory { bytes: usize },

    #[error("relocate: {}: {diagnostics}", .path.display())]
    Relocation { path: PathBuf, diagnostics: String },

    #[error("resolve: {} does not define `{symbol}`", .path.display())]
    MissingEntryPoint { path: PathBuf, symbol: &'static str },

    #[error("initialize: `{symbol}` in {} reported failure", .path.display())]
    InitializationFailed { path: PathBuf, symbol: &'static str },

    #[error("hook: {hook} hook of {} {failure}", .path.display())]
    Hook {
        path: PathBuf,
        hook: HookKind,
        failure: HookFailure,
    },

    #[error("{0}")]
    State(#[from] StateError),
}

impl LoadError {
    /// 파이프라인 단계 (상태 위반/조회 실패는 None)
    pub fn stage(&self) -> Option<LoadStage> {
        match self {
            LoadError::Toolchain(_)
            | LoadError::UnsupportedFile { .. }
            | LoadError::AlreadyLoaded { .. } => Some(LoadStage::Configure),
            LoadError::Compile { .. } => Some(LoadStage::Compile),
            LoadError::Sizing { .. } => Some(LoadStage::Size),
            LoadError::OutOfMemory { .. } => Some(LoadStage::Allocate),
            LoadError::Relocation { .. } => Some(LoadStage::Relocate),
            LoadError::MissingEntryPoint { .. } => Some(LoadStage::Resolve),
            LoadError::InitializationFailed { .. } => Some(LoadStage::Initialize),
            LoadError::Hook { .. } => Some(LoadStage::Hook),
            LoadError::NotFound { .. } | LoadError::State(_) => None,
        }
    }
}

/// 설정 파일 에러
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_leads_with_stage_name() {
        let err = LoadError::Compile {
            path: PathBuf::from("plugins/broken.c"),
            diagnostics: "broken.c:3: error: ';' expected".into(),
        };
        assert_eq!(
            err.to_string(),
            "compile: plugins/broken.c: broken.c:3: error: ';' expected"
        );
        assert_eq!(err.stage(), Some(LoadStage::Compile));
    }

    #[test]
    fn missing_entry_point_is_not_a_compile_error() {
        let err = LoadError::MissingEntryPoint {
            path: PathBuf::from("a.c"),
            symbol: "module_init",
        };
        assert_eq!(err.stage(), Some(LoadStage::Resolve));
        assert!(err.to_string().starts_with("resolve: "));
    }

    #[test]
    fn hook_failure_wording() {
        let err = LoadError::Hook {
            path: PathBuf::from("a.c"),
            hook: HookKind::Load,
            failure: HookFailure::Missing,
        };
        assert_eq!(err.to_string(), "hook: load hook of a.c is not registered");
    }
}
