//! 모듈 ↔ 호스트 C ABI
//!
//! `modules/include/tccmod.h`의 `tccmod_record`와 레이아웃이 같아야 한다.

use std::ffi::{CStr, c_char, c_int, c_void};
use std::fmt;
use std::ptr;

/// 레코드 레이아웃 버전
pub const ABI_VERSION: u32 = 1;

/// load/unload 훅: 0이 아니면 성공
pub type HookFn = unsafe extern "C" fn(record: *mut ModuleRecord) -> c_int;

/// destroy 훅
pub type DestroyFn = unsafe extern "C" fn(record: *mut ModuleRecord);

/// 호스트 등록 레코드
///
/// 엔트리 함수에 넘겨지는 핸들. 모듈이 이름과 훅을 채운다.
/// 모듈이 포인터를 보관할 수 있으므로 로드된 동안 주소가 고정된다.
#[repr(C)]
pub struct ModuleRecord {
    pub abi_version: u32,
    pub name: *const c_char,
    pub version: *const c_char,
    pub summary: *const c_char,
    pub load: Option<HookFn>,
    pub unload: Option<HookFn>,
    pub destroy: Option<DestroyFn>,
    pub user_data: *mut c_void,
}

impl ModuleRecord {
    pub fn new() -> Self {
        Self {
            abi_version: ABI_VERSION,
            name: ptr::null(),
            version: ptr::null(),
            summary: ptr::null(),
            load: None,
            unload: None,
            destroy: None,
            user_data: ptr::null_mut(),
        }
    }

    /// 모듈이 채운 문자열 필드 복사
    ///
    /// # Safety
    /// null이 아닌 문자열 포인터는 NUL로 끝나는 유효한 메모리를 가리켜야 한다.
    pub(crate) unsafe fn text(field: *const c_char) -> Option<String> {
        if field.is_null() {
            return None;
        }
        let text = unsafe { CStr::from_ptr(field) }.to_string_lossy().into_owned();
        (!text.is_empty()).then_some(text)
    }
}

impl Default for ModuleRecord {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ModuleRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleRecord")
            .field("abi_version", &self.abi_version)
            .field("load", &self.load.is_some())
            .field("unload", &self.unload.is_some())
            .field("destroy", &self.destroy.is_some())
            .finish_non_exhaustive()
    }
}

/// 라이프사이클 훅 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    Load,
    Unload,
    Destroy,
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HookKind::Load => "load",
            HookKind::Unload => "unload",
            HookKind::Destroy => "destroy",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_record_has_no_hooks() {
        let record = ModuleRecord::new();
        assert_eq!(record.abi_version, ABI_VERSION);
        assert!(record.load.is_none() && record.unload.is_none() && record.destroy.is_none());
        assert!(unsafe { ModuleRecord::text(record.name) }.is_none());
    }

    #[test]
    fn text_fields_are_copied() {
        let name = c"hello";
        let empty = c"";
        assert_eq!(unsafe { ModuleRecord::text(name.as_ptr()) }.as_deref(), Some("hello"));
        assert_eq!(unsafe { ModuleRecord::text(empty.as_ptr()) }, None);
    }

    #[test]
    fn layout_matches_c_header() {
        let pointer = std::mem::size_of::<*const c_void>();
        // u32 + 패딩 후 포인터 7개
        assert_eq!(std::mem::size_of::<ModuleRecord>(), pointer * 8);
        assert_eq!(std::mem::offset_of!(ModuleRecord, name), pointer);
        assert_eq!(std::mem::offset_of!(ModuleRecord, user_data), pointer * 7);
    }
}
