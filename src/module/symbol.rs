//! 심볼 해석
//!
//! - 엔트리 심볼 (`module_init`) 해석: 재배치된 세션에서만 `EntryPoint` 생성
//! - 호스트 심볼 테이블: 모듈이 extern으로 참조할 수 있는 호스트 함수

use std::ffi::{CStr, c_char, c_int, c_void};
use std::fmt;
use std::marker::PhantomData;

use crate::compiler::CompilerInstance;
use crate::error::{LoadError, StateError};

use super::abi::{ABI_VERSION, ModuleRecord};
use super::buffer::RelocationBuffer;
use super::session::CompilationSession;

/// 모든 모듈이 정의해야 하는 엔트리 심볼
pub const ENTRY_SYMBOL: &str = "module_init";

/// 엔트리 함수 시그니처: `int module_init(tccmod_record *)`
type EntryFn = unsafe extern "C" fn(record: *mut ModuleRecord) -> c_int;

/// 검증된 엔트리 포인트
///
/// 재배치가 끝난 세션과 그 버퍼에서 `resolve_entry`로만 만들 수 있고,
/// 둘 중 어느 것보다도 오래 살 수 없다.
pub struct EntryPoint<'image> {
    func: EntryFn,
    _image: PhantomData<&'image ()>,
}

impl EntryPoint<'_> {
    pub fn address(&self) -> usize {
        self.func as usize
    }

    /// 엔트리 함수 호출, 성공 여부 반환
    pub(crate) fn invoke(&self, record: &mut ModuleRecord) -> bool {
        // SAFETY: func는 재배치된 이미지에서 해석된 심볼이고 버퍼와 세션은 'image 동안 살아 있다.
        // 시그니처는 모듈 ABI 계약으로 정해진다.
        unsafe { (self.func)(record) != 0 }
    }
}

impl fmt::Debug for EntryPoint<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntryPoint({:#x})", self.address())
    }
}

/// 재배치된 세션에서 엔트리 심볼 해석
///
/// 코드가 놓인 버퍼도 함께 빌려 엔트리 포인트가 살아 있는 동안 해제되지 않게 한다.
pub fn resolve_entry<'image, I: CompilerInstance>(
    session: &'image CompilationSession<I>,
    buffer: &'image RelocationBuffer,
) -> Result<EntryPoint<'image>, LoadError> {
    if buffer.session() != session.id() {
        return Err(StateError::BufferMismatch {
            expected: session.id(),
            found: buffer.session(),
        }
        .into());
    }

    let address = session
        .resolve_symbol(ENTRY_SYMBOL)?
        .ok_or_else(|| LoadError::MissingEntryPoint {
            path: session.source().map(|p| p.to_path_buf()).unwrap_or_default(),
            symbol: ENTRY_SYMBOL,
        })?;

    // SAFETY: null이 아닌 코드 주소를 같은 크기의 함수 포인터로 변환
    let func = unsafe { std::mem::transmute::<*mut c_void, EntryFn>(address.as_ptr()) };
    tracing::debug!("Found {} at {:#x}", ENTRY_SYMBOL, func as usize);

    Ok(EntryPoint {
        func,
        _image: PhantomData,
    })
}

/// 호스트 심볼 테이블
///
/// 세션 구성 시 컴파일러에 그대로 노출된다. 모듈은 등록된 주소를
/// 코드나 데이터로 직접 사용하므로 등록은 `unsafe`다.
#[derive(Debug, Clone, Default)]
pub struct HostSymbols {
    entries: Vec<(String, usize)>,
}

impl HostSymbols {
    /// 빈 테이블
    pub fn new() -> Self {
        Self::default()
    }

    /// 기본 호스트 API (`tccmod_log`, `tccmod_abi_version`)
    pub fn with_defaults() -> Self {
        // SAFETY: 두 함수 모두 tccmod.h 선언과 같은 시그니처의 정적 함수
        unsafe {
            Self::new()
                .with("tccmod_log", tccmod_log as usize)
                .with("tccmod_abi_version", tccmod_abi_version as usize)
        }
    }

    /// # Safety
    /// `register`와 같다.
    pub unsafe fn with(mut self, name: &str, address: usize) -> Self {
        unsafe { self.register(name, address) };
        self
    }

    /// 심볼 등록 (기존 항목은 교체)
    ///
    /// # Safety
    /// `address`는 모듈이 선언한 C 프로토타입과 맞는 함수나 객체여야 하고
    /// 이 테이블로 구성된 세션의 이미지가 쓰이는 동안 살아 있어야 한다.
    pub unsafe fn register(&mut self, name: &str, address: usize) {
        if let Some(pos) = self.entries.iter().position(|(n, _)| n == name) {
            self.entries[pos].1 = address;
        } else {
            self.entries.push((name.to_string(), address));
        }
    }

    pub fn unregister(&mut self, name: &str) -> bool {
        if let Some(pos) = self.entries.iter().position(|(n, _)| n == name) {
            self.entries.remove(pos);
            return true;
        }
        false
    }

    pub fn lookup(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, address)| *address)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, usize)> {
        self.entries.iter().map(|(n, a)| (n.as_str(), *a))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// 모듈용 로그 함수
///
/// level: 0=error, 1=warn, 2=info, 3=debug, 그 외=trace
///
/// # Safety
/// `msg`는 null이거나 호출 동안 유효한 NUL 종료 문자열이어야 한다.
pub unsafe extern "C" fn tccmod_log(level: c_int, msg: *const c_char) {
    if msg.is_null() {
        return;
    }
    // SAFETY: 호출자 계약
    let text = unsafe { CStr::from_ptr(msg) }.to_string_lossy();
    let text = text.trim_end();
    match level {
        0 => tracing::error!(target: "module", "{}", text),
        1 => tracing::warn!(target: "module", "{}", text),
        2 => tracing::info!(target: "module", "{}", text),
        3 => tracing::debug!(target: "module", "{}", text),
        _ => tracing::trace!(target: "module", "{}", text),
    }
}

/// 호스트가 구현하는 레코드 ABI 버전
pub extern "C" fn tccmod_abi_version() -> c_int {
    ABI_VERSION as c_int
}
