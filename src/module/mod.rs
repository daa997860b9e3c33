//! C 모듈 시스템
//!
//! 소스 파일을 임베디드 컴파일러로 메모리에 직접 컴파일/재배치하고
//! 수명 주기를 관리한다.
//! - 컴파일 세션 (단계 순서 검사)
//! - 재배치 버퍼
//! - 엔트리 심볼 해석 / 호스트 심볼 테이블
//! - 모듈 라이프사이클 및 레지스트리

mod abi;
mod buffer;
pub mod loader;
mod registry;
mod session;
pub mod symbol;

pub use abi::{ABI_VERSION, DestroyFn, HookFn, HookKind, ModuleRecord};
pub use buffer::{BufferStats, IMAGE_ALIGN, RelocationBuffer};
pub use loader::{HookOutcome, HookSet, LoadedModule, ModuleInfo, ModuleManager, ModuleState};
pub use registry::{ModuleId, ModuleRegistry, Reservation};
pub use session::{CompilationSession, ImageSize, SessionId, SessionStage};
pub use symbol::{ENTRY_SYMBOL, EntryPoint, HostSymbols, resolve_entry};
