//! tccmod
//!
//! C 소스 파일을 프로세스 안에서 컴파일해 메모리에 올리고, 엔트리 심볼
//! `module_init`을 호출해 모듈로 등록한다. 디스크 산출물이나 OS 로더를 거치지 않는다.
//!
//! - compiler: 임베디드 컴파일러 추상화 (libtcc, 내장 툴체인)
//! - module: 컴파일 세션, 재배치 버퍼, 심볼 해석, 수명 주기/레지스트리
//! - config: 검색 경로 및 설정 파일
//! - log: tracing 초기화 및 링 버퍼

pub mod compiler;
pub mod config;
pub mod error;
pub mod log;
pub mod module;

pub use config::{LoaderConfig, SearchConfiguration};
pub use error::{ConfigError, LoadError, LoadStage, StateError};
pub use module::{HookOutcome, ModuleId, ModuleInfo, ModuleManager, ModuleState};
