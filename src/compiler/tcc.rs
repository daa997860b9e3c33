//! libtcc 백엔드
//!
//! libtcc 공유 라이브러리를 런타임에 열어 (libloading) 0.9.27 API를 사용.
//! - `tcc_relocate(s, NULL)`: 이미지 크기 질의
//! - `tcc_relocate(s, ptr)`: 호출자 버퍼에 배치 (텍스트 페이지 실행 권한은 libtcc가 설정)
//!
//! libtcc는 컴파일 중 프로세스 전역 상태를 쓰므로, libtcc 호출은 모두
//! 하나의 프로세스 전역 락으로 직렬화한다 (툴체인을 여러 번 열어도 동일).

use std::ffi::{CStr, CString, c_char, c_int, c_void};
use std::path::{Path, PathBuf};
use std::ptr::{self, NonNull};
use std::sync::Arc;

use libloading::Library;
use parking_lot::Mutex;

use super::{CompilerFault, CompilerInstance, DiagnosticSink, Toolchain};

/// libtcc 경로를 덮어쓰는 환경 변수
pub const LIBTCC_ENV: &str = "TCCMOD_LIBTCC";

#[cfg(target_os = "linux")]
const LIBRARY_CANDIDATES: &[&str] = &["libtcc.so", "libtcc.so.1", "libtcc.so.0"];

#[cfg(target_os = "macos")]
const LIBRARY_CANDIDATES: &[&str] = &["libtcc.dylib"];

#[cfg(windows)]
const LIBRARY_CANDIDATES: &[&str] = &["libtcc.dll"];

#[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
const LIBRARY_CANDIDATES: &[&str] = &["libtcc.so"];

const TCC_OUTPUT_MEMORY: c_int = 1;

/// libtcc 전역 컴파일러 상태 보호
static LIBTCC_LOCK: Mutex<()> = Mutex::new(());

#[repr(C)]
struct TccState {
    _private: [u8; 0],
}

type ErrorFunc = unsafe extern "C" fn(opaque: *mut c_void, msg: *const c_char);

/// libtcc 함수 테이블
///
/// 함수 포인터는 `_lib`가 살아 있는 동안만 유효하다 (필드 선언 순서상 마지막에 해제).
struct Api {
    new: unsafe extern "C" fn() -> *mut TccState,
    delete: unsafe extern "C" fn(*mut TccState),
    set_lib_path: unsafe extern "C" fn(*mut TccState, *const c_char),
    set_error_func: unsafe extern "C" fn(*mut TccState, *mut c_void, Option<ErrorFunc>),
    set_options: unsafe extern "C" fn(*mut TccState, *const c_char),
    set_output_type: unsafe extern "C" fn(*mut TccState, c_int) -> c_int,
    add_include_path: unsafe extern "C" fn(*mut TccState, *const c_char) -> c_int,
    add_sysinclude_path: unsafe extern "C" fn(*mut TccState, *const c_char) -> c_int,
    add_library_path: unsafe extern "C" fn(*mut TccState, *const c_char) -> c_int,
    add_library: unsafe extern "C" fn(*mut TccState, *const c_char) -> c_int,
    define_symbol: unsafe extern "C" fn(*mut TccState, *const c_char, *const c_char),
    add_symbol: unsafe extern "C" fn(*mut TccState, *const c_char, *const c_void) -> c_int,
    add_file: unsafe extern "C" fn(*mut TccState, *const c_char) -> c_int,
    relocate: unsafe extern "C" fn(*mut TccState, *mut c_void) -> c_int,
    get_symbol: unsafe extern "C" fn(*mut TccState, *const c_char) -> *mut c_void,
    path: String,
    _lib: Library,
}

/// 심볼 하나를 함수 포인터로 읽기
///
/// # Safety
/// `T`가 심볼의 실제 C 시그니처와 일치해야 한다.
unsafe fn load<T: Copy>(lib: &Library, name: &[u8]) -> Result<T, CompilerFault> {
    let symbol = unsafe { lib.get::<T>(name) }.map_err(|e| {
        let name = String::from_utf8_lossy(name.strip_suffix(b"\0").unwrap_or(name));
        CompilerFault::new(format!("libtcc does not export `{name}`: {e}"))
    })?;
    Ok(*symbol)
}

impl Api {
    fn open(path: &str) -> Result<Self, CompilerFault> {
        let lib = unsafe { Library::new(path) }
            .map_err(|e| CompilerFault::new(format!("failed to open {path}: {e}")))?;

        // 0.9.28 이후는 tcc_relocate가 단일 인자로 바뀌어 크기 질의가 불가능
        if unsafe { lib.get::<unsafe extern "C" fn()>(b"tcc_list_symbols\0") }.is_ok() {
            return Err(CompilerFault::new(format!(
                "{path} uses the single-phase tcc_relocate API; libtcc 0.9.27 is required"
            )));
        }

        unsafe {
            Ok(Self {
                new: load(&lib, b"tcc_new\0")?,
                delete: load(&lib, b"tcc_delete\0")?,
                set_lib_path: load(&lib, b"tcc_set_lib_path\0")?,
                set_error_func: load(&lib, b"tcc_set_error_func\0")?,
                set_options: load(&lib, b"tcc_set_options\0")?,
                set_output_type: load(&lib, b"tcc_set_output_type\0")?,
                add_include_path: load(&lib, b"tcc_add_include_path\0")?,
                add_sysinclude_path: load(&lib, b"tcc_add_sysinclude_path\0")?,
                add_library_path: load(&lib, b"tcc_add_library_path\0")?,
                add_library: load(&lib, b"tcc_add_library\0")?,
                define_symbol: load(&lib, b"tcc_define_symbol\0")?,
                add_symbol: load(&lib, b"tcc_add_symbol\0")?,
                add_file: load(&lib, b"tcc_add_file\0")?,
                relocate: load(&lib, b"tcc_relocate\0")?,
                get_symbol: load(&lib, b"tcc_get_symbol\0")?,
                path: path.to_string(),
                _lib: lib,
            })
        }
    }
}

/// libtcc 툴체인 옵션
#[derive(Debug, Clone, Default)]
pub struct TccOptions {
    /// libtcc 공유 라이브러리 경로 (없으면 환경 변수, 기본 이름 순으로 탐색)
    pub library: Option<PathBuf>,
    /// libtcc1.a 와 런타임 헤더가 있는 디렉토리 (`tcc_set_lib_path`)
    pub tcc_dir: Option<PathBuf>,
    /// `tcc_set_options`에 넘길 옵션 (예: `-nostdlib`)
    pub options: Vec<String>,
}

/// libtcc 기반 툴체인
pub struct TccToolchain {
    api: Arc<Api>,
    tcc_dir: Option<CString>,
    options: Option<CString>,
}

impl std::fmt::Debug for TccToolchain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TccToolchain")
            .field("library", &self.api.path)
            .field("tcc_dir", &self.tcc_dir)
            .field("options", &self.options)
            .finish()
    }
}

impl TccToolchain {
    /// libtcc를 찾아 연다
    pub fn open(options: TccOptions) -> Result<Self, CompilerFault> {
        let candidates: Vec<String> = match &options.library {
            Some(path) => vec![path_str(path)?.to_string()],
            None => match std::env::var(LIBTCC_ENV) {
                Ok(path) if !path.is_empty() => vec![path],
                _ => LIBRARY_CANDIDATES.iter().map(|s| s.to_string()).collect(),
            },
        };

        let mut failures = Vec::new();
        let mut api = None;
        for candidate in &candidates {
            match Api::open(candidate) {
                Ok(opened) => {
                    api = Some(opened);
                    break;
                }
                Err(fault) => failures.push(fault.message),
            }
        }
        let Some(api) = api else {
            return Err(CompilerFault::new(failures.join("; ")));
        };

        tracing::debug!("Opened libtcc from {}", api.path);

        let tcc_dir = options
            .tcc_dir
            .as_deref()
            .map(path_cstring)
            .transpose()?;
        let options = if options.options.is_empty() {
            None
        } else {
            Some(c_string(&options.options.join(" "))?)
        };

        Ok(Self {
            api: Arc::new(api),
            tcc_dir,
            options,
        })
    }

    /// 실제로 열린 라이브러리 경로
    pub fn library_path(&self) -> &str {
        &self.api.path
    }
}

impl Toolchain for TccToolchain {
    type Instance = TccInstance;

    fn name(&self) -> &str {
        "tcc"
    }

    fn instantiate(&self) -> Result<TccInstance, CompilerFault> {
        let api = Arc::clone(&self.api);
        let _guard = LIBTCC_LOCK.lock();

        let state = NonNull::new(unsafe { (api.new)() })
            .ok_or_else(|| CompilerFault::new("tcc_new returned NULL"))?;

        unsafe {
            if let Some(dir) = &self.tcc_dir {
                (api.set_lib_path)(state.as_ptr(), dir.as_ptr());
            }
            // 옵션은 출력 타입보다 먼저 (-nostdlib 등이 런타임 추가에 영향)
            if let Some(options) = &self.options {
                (api.set_options)(state.as_ptr(), options.as_ptr());
            }
            if (api.set_output_type)(state.as_ptr(), TCC_OUTPUT_MEMORY) < 0 {
                (api.delete)(state.as_ptr());
                return Err(CompilerFault::new("tcc_set_output_type failed"));
            }
        }

        drop(_guard);
        Ok(TccInstance {
            api,
            state,
            sink: None,
        })
    }
}

/// libtcc 인스턴스 (`TCCState` 하나)
pub struct TccInstance {
    api: Arc<Api>,
    state: NonNull<TccState>,
    /// 에러 콜백의 opaque 포인터가 가리키는 싱크 (주소 고정)
    sink: Option<Box<DiagnosticSink>>,
}

// SAFETY: TCCState는 특정 스레드에 묶이지 않고, 모든 호출은 LIBTCC_LOCK으로 직렬화된다.
unsafe impl Send for TccInstance {}

impl TccInstance {
    fn call<R>(&self, f: impl FnOnce(&Api, *mut TccState) -> R) -> R {
        let _guard = LIBTCC_LOCK.lock();
        f(&*self.api, self.state.as_ptr())
    }

    fn check(&self, status: c_int, what: impl FnOnce() -> String) -> Result<(), CompilerFault> {
        if status < 0 {
            Err(CompilerFault::new(what()))
        } else {
            Ok(())
        }
    }
}

impl Drop for TccInstance {
    fn drop(&mut self) {
        self.call(|api, state| unsafe { (api.delete)(state) });
    }
}

/// libtcc 에러 콜백 → 진단 싱크
unsafe extern "C" fn forward_diagnostic(opaque: *mut c_void, msg: *const c_char) {
    if opaque.is_null() || msg.is_null() {
        return;
    }
    // SAFETY: opaque는 TccInstance가 소유한 Box<DiagnosticSink>를 가리킨다
    let sink = unsafe { &*(opaque as *const DiagnosticSink) };
    let text = unsafe { CStr::from_ptr(msg) }.to_string_lossy();
    sink.emit(&text);
}

impl CompilerInstance for TccInstance {
    fn set_diagnostic_sink(&mut self, sink: DiagnosticSink) {
        let sink = Box::new(sink);
        let opaque = &*sink as *const DiagnosticSink as *mut c_void;
        self.call(|api, state| unsafe {
            (api.set_error_func)(state, opaque, Some(forward_diagnostic));
        });
        // 이전 싱크는 콜백이 교체된 뒤에 해제
        self.sink = Some(sink);
    }

    fn add_include_path(&mut self, dir: &Path) -> Result<(), CompilerFault> {
        let dir = path_cstring(dir)?;
        let status = self.call(|api, state| unsafe { (api.add_include_path)(state, dir.as_ptr()) });
        self.check(status, || format!("cannot add include path {dir:?}"))
    }

    fn add_sysinclude_path(&mut self, dir: &Path) -> Result<(), CompilerFault> {
        let dir = path_cstring(dir)?;
        let status =
            self.call(|api, state| unsafe { (api.add_sysinclude_path)(state, dir.as_ptr()) });
        self.check(status, || format!("cannot add system include path {dir:?}"))
    }

    fn add_library_path(&mut self, dir: &Path) -> Result<(), CompilerFault> {
        let dir = path_cstring(dir)?;
        let status = self.call(|api, state| unsafe { (api.add_library_path)(state, dir.as_ptr()) });
        self.check(status, || format!("cannot add library path {dir:?}"))
    }

    fn add_library(&mut self, name: &str) -> Result<(), CompilerFault> {
        let lib = c_string(name)?;
        let status = self.call(|api, state| unsafe { (api.add_library)(state, lib.as_ptr()) });
        self.check(status, || format!("library '{name}' not found"))
    }

    fn define(&mut self, name: &str, value: Option<&str>) -> Result<(), CompilerFault> {
        let name = c_string(name)?;
        let value = value.map(c_string).transpose()?;
        self.call(|api, state| unsafe {
            (api.define_symbol)(
                state,
                name.as_ptr(),
                value.as_ref().map_or(ptr::null(), |v| v.as_ptr()),
            );
        });
        Ok(())
    }

    unsafe fn add_symbol(&mut self, name: &str, address: *const c_void) -> Result<(), CompilerFault> {
        let symbol = c_string(name)?;
        let status =
            self.call(|api, state| unsafe { (api.add_symbol)(state, symbol.as_ptr(), address) });
        self.check(status, || format!("cannot export host symbol '{name}'"))
    }

    fn add_file(&mut self, path: &Path) -> Result<(), CompilerFault> {
        let file = path_cstring(path)?;
        let status = self.call(|api, state| unsafe { (api.add_file)(state, file.as_ptr()) });
        self.check(status, || format!("couldn't load file {}", path.display()))
    }

    fn image_size(&mut self) -> Result<usize, CompilerFault> {
        let size = self.call(|api, state| unsafe { (api.relocate)(state, ptr::null_mut()) });
        usize::try_from(size)
            .map_err(|_| CompilerFault::new("couldn't work out how much memory is needed"))
    }

    unsafe fn relocate(&mut self, dest: *mut u8, _len: usize) -> Result<(), CompilerFault> {
        let status = self.call(|api, state| unsafe { (api.relocate)(state, dest.cast()) });
        self.check(status, || "could not relocate module into memory".to_string())
    }

    fn symbol(&self, name: &CStr) -> Option<NonNull<c_void>> {
        let address = self.call(|api, state| unsafe { (api.get_symbol)(state, name.as_ptr()) });
        NonNull::new(address)
    }
}

fn path_str(path: &Path) -> Result<&str, CompilerFault> {
    path.to_str()
        .ok_or_else(|| CompilerFault::new(format!("path {} is not valid UTF-8", path.display())))
}

fn path_cstring(path: &Path) -> Result<CString, CompilerFault> {
    c_string(path_str(path)?)
}

fn c_string(s: &str) -> Result<CString, CompilerFault> {
    CString::new(s).map_err(|_| CompilerFault::new(format!("{s:?} contains a NUL byte")))
}
