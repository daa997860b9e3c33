//! 임베디드 컴파일러 추상화
//!
//! "소스 → 재배치 가능한 기계어" 변환은 외부에서 주어지는 primitive로 취급.
//! - Toolchain: 로드 시도마다 새 컴파일러 인스턴스 생성
//! - CompilerInstance: libtcc 스타일의 단계별 API
//! - diag: 진단 메시지 수집/로깅
//!
//! 구현체
//! - tcc: libtcc 공유 라이브러리 (feature `tcc`)
//! - builtin: 호스트에 링크된 네이티브 함수를 컴파일 유닛처럼 제공

pub mod builtin;
mod diag;
#[cfg(feature = "tcc")]
pub mod tcc;

pub use diag::{COMPONENT, Diagnostic, DiagnosticSink, Severity};

use std::ffi::{CStr, c_void};
use std::path::Path;
use std::ptr::NonNull;

/// 컴파일러 primitive 호출 실패
///
/// 상세 원인은 대부분 진단 싱크로 전달되고, 여기에는 요약만 담긴다.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct CompilerFault {
    pub message: String,
}

impl CompilerFault {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// 컴파일러 인스턴스 공급자
pub trait Toolchain: Send + Sync {
    type Instance: CompilerInstance;

    /// 로그/에러에 쓰는 이름
    fn name(&self) -> &str;

    /// 새 인스턴스 생성 (로드 시도 하나당 하나)
    fn instantiate(&self) -> Result<Self::Instance, CompilerFault>;
}

/// 컴파일러 인스턴스 하나
///
/// 해제는 `Drop`으로 한다. 호출 순서 검사는 `CompilationSession`이 담당.
pub trait CompilerInstance: Send {
    /// 에러/경고를 받을 싱크 설치
    fn set_diagnostic_sink(&mut self, sink: DiagnosticSink);

    fn add_include_path(&mut self, dir: &Path) -> Result<(), CompilerFault>;

    fn add_sysinclude_path(&mut self, dir: &Path) -> Result<(), CompilerFault>;

    fn add_library_path(&mut self, dir: &Path) -> Result<(), CompilerFault>;

    fn add_library(&mut self, name: &str) -> Result<(), CompilerFault>;

    /// 전처리기 매크로 정의
    fn define(&mut self, name: &str, value: Option<&str>) -> Result<(), CompilerFault>;

    /// 호스트 심볼을 모듈 링크 대상으로 노출
    ///
    /// # Safety
    /// `address`는 모듈 쪽 C 선언과 맞는 살아 있는 함수나 객체여야 하고,
    /// 이 인스턴스로 만든 이미지가 쓰이는 동안 유효해야 한다.
    unsafe fn add_symbol(&mut self, name: &str, address: *const c_void) -> Result<(), CompilerFault>;

    /// 소스 파일 파싱 및 컴파일
    fn add_file(&mut self, path: &Path) -> Result<(), CompilerFault>;

    /// 재배치된 이미지가 차지할 바이트 수
    fn image_size(&mut self) -> Result<usize, CompilerFault>;

    /// 이미지를 `dest`에 배치하고 주소를 패치
    ///
    /// # Safety
    /// `dest`는 `len` 바이트 이상 쓰기 가능해야 하고 `len`은 `image_size()`
    /// 결과 이상이어야 한다. 배치된 코드가 쓰이는 동안 메모리가 살아 있어야 한다.
    unsafe fn relocate(&mut self, dest: *mut u8, len: usize) -> Result<(), CompilerFault>;

    /// 재배치 후 심볼 주소 조회
    fn symbol(&self, name: &CStr) -> Option<NonNull<c_void>>;
}
