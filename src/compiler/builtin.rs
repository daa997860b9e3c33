//! 내장 툴체인
//!
//! 파싱 없이 호스트에 정적으로 링크된 네이티브 함수를 컴파일 유닛처럼
//! 제공한다. 세션/버퍼/수명 주기 경로는 libtcc와 동일하게 거친다.
//! - 경로별로 유닛 등록
//! - 단계별 실패 주입 (파싱, 크기 계산, 재배치)
//! - 살아 있는 인스턴스 수 추적

use std::collections::HashMap;
use std::ffi::{CStr, c_void};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;

use super::{CompilerFault, CompilerInstance, DiagnosticSink, Toolchain};

/// 실패를 주입할 단계
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailAt {
    Parse,
    Size,
    Relocate,
}

/// 내장 컴파일 유닛
#[derive(Debug, Clone)]
pub struct BuiltinUnit {
    symbols: Vec<(String, usize)>,
    image: Vec<u8>,
    failure: Option<(FailAt, String)>,
}

impl Default for BuiltinUnit {
    fn default() -> Self {
        Self {
            symbols: Vec::new(),
            image: b"builtin-image".to_vec(),
            failure: None,
        }
    }
}

impl BuiltinUnit {
    pub fn new() -> Self {
        Self::default()
    }

    /// 심볼 추가 (같은 이름은 교체)
    pub fn symbol(mut self, name: &str, address: usize) -> Self {
        if let Some(pos) = self.symbols.iter().position(|(n, _)| n == name) {
            self.symbols[pos].1 = address;
        } else {
            self.symbols.push((name.to_string(), address));
        }
        self
    }

    /// 재배치 시 버퍼에 복사될 이미지 바이트
    pub fn image(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.image = bytes.into();
        self
    }

    pub fn fail_at(mut self, stage: FailAt, diagnostic: impl Into<String>) -> Self {
        self.failure = Some((stage, diagnostic.into()));
        self
    }

    fn failure_at(&self, stage: FailAt) -> Option<&str> {
        match &self.failure {
            Some((at, message)) if *at == stage => Some(message),
            _ => None,
        }
    }
}

type UnitTable = Arc<RwLock<HashMap<PathBuf, Arc<BuiltinUnit>>>>;

/// 내장 유닛 툴체인
#[derive(Debug, Default)]
pub struct BuiltinToolchain {
    units: UnitTable,
    live: Arc<AtomicUsize>,
    created: AtomicUsize,
}

impl BuiltinToolchain {
    pub fn new() -> Self {
        Self::default()
    }

    /// 경로에 유닛 등록 (기존 등록은 교체)
    pub fn register(&self, path: impl Into<PathBuf>, unit: BuiltinUnit) {
        self.units.write().insert(path.into(), Arc::new(unit));
    }

    pub fn unregister(&self, path: &Path) -> bool {
        self.units.write().remove(path).is_some()
    }

    /// 아직 해제되지 않은 인스턴스 수
    pub fn live_instances(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// 지금까지 생성된 인스턴스 수
    pub fn instances_created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl Toolchain for BuiltinToolchain {
    type Instance = BuiltinInstance;

    fn name(&self) -> &str {
        "builtin"
    }

    fn instantiate(&self) -> Result<BuiltinInstance, CompilerFault> {
        self.created.fetch_add(1, Ordering::SeqCst);
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(BuiltinInstance {
            units: Arc::clone(&self.units),
            live: Arc::clone(&self.live),
            sink: DiagnosticSink::new(),
            unit: None,
            host_symbols: Vec::new(),
            include_paths: Vec::new(),
            sysinclude_paths: Vec::new(),
            library_paths: Vec::new(),
            libraries: Vec::new(),
            defines: Vec::new(),
            relocated: false,
        })
    }
}

/// 내장 툴체인 인스턴스
#[derive(Debug)]
pub struct BuiltinInstance {
    units: UnitTable,
    live: Arc<AtomicUsize>,
    sink: DiagnosticSink,
    unit: Option<Arc<BuiltinUnit>>,
    host_symbols: Vec<(String, usize)>,
    include_paths: Vec<PathBuf>,
    sysinclude_paths: Vec<PathBuf>,
    library_paths: Vec<PathBuf>,
    libraries: Vec<String>,
    defines: Vec<(String, Option<String>)>,
    relocated: bool,
}

impl BuiltinInstance {
    pub fn include_paths(&self) -> &[PathBuf] {
        &self.include_paths
    }

    pub fn sysinclude_paths(&self) -> &[PathBuf] {
        &self.sysinclude_paths
    }

    pub fn library_paths(&self) -> &[PathBuf] {
        &self.library_paths
    }

    pub fn libraries(&self) -> &[String] {
        &self.libraries
    }

    pub fn defines(&self) -> &[(String, Option<String>)] {
        &self.defines
    }

    pub fn host_symbols(&self) -> &[(String, usize)] {
        &self.host_symbols
    }

    fn current_unit(&self) -> Result<&Arc<BuiltinUnit>, CompilerFault> {
        self.unit
            .as_ref()
            .ok_or_else(|| CompilerFault::new("no translation unit has been added"))
    }

    fn fail(&self, message: String) -> CompilerFault {
        self.sink.emit(&message);
        CompilerFault::new(message)
    }
}

impl Drop for BuiltinInstance {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

impl CompilerInstance for BuiltinInstance {
    fn set_diagnostic_sink(&mut self, sink: DiagnosticSink) {
        self.sink = sink;
    }

    fn add_include_path(&mut self, dir: &Path) -> Result<(), CompilerFault> {
        self.include_paths.push(dir.to_path_buf());
        Ok(())
    }

    fn add_sysinclude_path(&mut self, dir: &Path) -> Result<(), CompilerFault> {
        self.sysinclude_paths.push(dir.to_path_buf());
        Ok(())
    }

    fn add_library_path(&mut self, dir: &Path) -> Result<(), CompilerFault> {
        self.library_paths.push(dir.to_path_buf());
        Ok(())
    }

    fn add_library(&mut self, name: &str) -> Result<(), CompilerFault> {
        self.libraries.push(name.to_string());
        Ok(())
    }

    fn define(&mut self, name: &str, value: Option<&str>) -> Result<(), CompilerFault> {
        self.defines
            .push((name.to_string(), value.map(str::to_string)));
        Ok(())
    }

    unsafe fn add_symbol(&mut self, name: &str, address: *const c_void) -> Result<(), CompilerFault> {
        let address = address as usize;
        if let Some(pos) = self.host_symbols.iter().position(|(n, _)| n == name) {
            self.host_symbols[pos].1 = address;
        } else {
            self.host_symbols.push((name.to_string(), address));
        }
        Ok(())
    }

    fn add_file(&mut self, path: &Path) -> Result<(), CompilerFault> {
        let unit = self.units.read().get(path).cloned();
        let Some(unit) = unit else {
            return Err(self.fail(format!("builtin: error: file '{}' not found", path.display())));
        };

        if let Some(message) = unit.failure_at(FailAt::Parse) {
            return Err(self.fail(format!("{}:1: error: {}", path.display(), message)));
        }

        self.unit = Some(unit);
        Ok(())
    }

    fn image_size(&mut self) -> Result<usize, CompilerFault> {
        let unit = Arc::clone(self.current_unit()?);
        if let Some(message) = unit.failure_at(FailAt::Size) {
            return Err(self.fail(format!("builtin: error: {message}")));
        }
        Ok(unit.image.len())
    }

    unsafe fn relocate(&mut self, dest: *mut u8, len: usize) -> Result<(), CompilerFault> {
        let unit = Arc::clone(self.current_unit()?);
        if let Some(message) = unit.failure_at(FailAt::Relocate) {
            return Err(self.fail(format!("builtin: error: {message}")));
        }
        if len < unit.image.len() {
            return Err(self.fail(format!(
                "builtin: error: image needs {} bytes, got {len}",
                unit.image.len()
            )));
        }

        // SAFETY: 호출자가 dest에 len 바이트 쓰기 가능함을 보장
        unsafe {
            std::ptr::copy_nonoverlapping(unit.image.as_ptr(), dest, unit.image.len());
        }
        self.relocated = true;
        Ok(())
    }

    fn symbol(&self, name: &CStr) -> Option<NonNull<c_void>> {
        if !self.relocated {
            return None;
        }
        let name = name.to_str().ok()?;
        let unit = self.unit.as_ref()?;

        // 유닛 심볼이 호스트 심볼보다 우선
        unit.symbols
            .iter()
            .chain(self.host_symbols.iter())
            .find(|(n, _)| n == name)
            .and_then(|(_, address)| NonNull::new(*address as *mut c_void))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn answer() -> i32 {
        42
    }

    #[test]
    fn symbols_resolve_only_after_relocation() {
        let toolchain = BuiltinToolchain::new();
        toolchain.register("answer.c", BuiltinUnit::new().symbol("answer", answer as usize));

        let mut instance = toolchain.instantiate().unwrap();
        instance.add_file(Path::new("answer.c")).unwrap();
        assert!(instance.symbol(c"answer").is_none());

        let size = instance.image_size().unwrap();
        let mut image = vec![0u8; size];
        unsafe { instance.relocate(image.as_mut_ptr(), image.len()).unwrap() };

        assert_eq!(image, b"builtin-image");
        let address = instance.symbol(c"answer").unwrap();
        assert_eq!(address.as_ptr() as usize, answer as usize);
        assert!(instance.symbol(c"question").is_none());
    }

    #[test]
    fn injected_parse_failure_reaches_the_sink() {
        let toolchain = BuiltinToolchain::new();
        toolchain.register(
            "broken.c",
            BuiltinUnit::new().fail_at(FailAt::Parse, "';' expected"),
        );

        let sink = DiagnosticSink::new();
        let mut instance = toolchain.instantiate().unwrap();
        instance.set_diagnostic_sink(sink.clone());

        assert!(instance.add_file(Path::new("broken.c")).is_err());
        assert_eq!(sink.render(), "broken.c:1: error: ';' expected");
    }

    #[test]
    fn live_instances_follow_drop() {
        let toolchain = BuiltinToolchain::new();
        let first = toolchain.instantiate().unwrap();
        let second = toolchain.instantiate().unwrap();
        assert_eq!(toolchain.live_instances(), 2);

        drop(first);
        drop(second);
        assert_eq!(toolchain.live_instances(), 0);
        assert_eq!(toolchain.instances_created(), 2);
    }
}
