//! 컴파일 세션
//!
//! 로드 시도 하나당 컴파일러 인스턴스 하나를 감싼다.
//! 단계 순서: configure → add_source → compute_image_size → relocate_into → resolve_symbol
//! 순서를 벗어난 호출은 `StateError`로 거부한다.

use std::ffi::{CString, c_void};
use std::fmt;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::compiler::{CompilerFault, CompilerInstance, Diagnostic, DiagnosticSink, Toolchain};
use crate::config::SearchConfiguration;
use crate::error::{LoadError, StateError};

use super::buffer::RelocationBuffer;
use super::symbol::HostSymbols;

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

/// 세션 식별자 (버퍼-세션 짝 검증용)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    fn next() -> Self {
        Self(NEXT_SESSION.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// 특정 세션의 이미지 크기
///
/// 버퍼는 이 값으로만 할당할 수 있다.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageSize {
    session: SessionId,
    bytes: usize,
}

impl ImageSize {
    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

/// 세션 단계
///
/// 크기를 구한 뒤의 단계는 이미지 크기를 함께 들고 다닌다.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStage {
    Configured,
    SourceAdded,
    Sized { bytes: usize },
    Relocated { bytes: usize },
    Failed,
    Disposed,
}

/// 컴파일 세션
pub struct CompilationSession<I: CompilerInstance> {
    id: SessionId,
    /// `Disposed` 단계에서만 None
    instance: Option<I>,
    stage: SessionStage,
    sink: DiagnosticSink,
    source: Option<PathBuf>,
}

impl<I: CompilerInstance> CompilationSession<I> {
    /// 새 인스턴스를 만들고 검색 설정과 호스트 심볼 적용
    pub fn configure<T>(
        toolchain: &T,
        search: &SearchConfiguration,
        host_symbols: &HostSymbols,
    ) -> Result<Self, LoadError>
    where
        T: Toolchain<Instance = I> + ?Sized,
    {
        let mut instance = toolchain
            .instantiate()
            .map_err(|fault| LoadError::Toolchain(format!("{}: {fault}", toolchain.name())))?;

        let sink = DiagnosticSink::new();
        instance.set_diagnostic_sink(sink.clone());

        apply(&mut instance, search, host_symbols)
            .map_err(|fault| LoadError::Toolchain(format!("{}: {fault}", toolchain.name())))?;

        Ok(Self {
            id: SessionId::next(),
            instance: Some(instance),
            stage: SessionStage::Configured,
            sink,
            source: None,
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn stage(&self) -> SessionStage {
        self.stage
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// 크기 계산 이후에만 값이 있다
    pub fn image_size(&self) -> Option<usize> {
        match self.stage {
            SessionStage::Sized { bytes } | SessionStage::Relocated { bytes } => Some(bytes),
            _ => None,
        }
    }

    /// 지금까지 수집된 진단 메시지
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.sink.diagnostics()
    }

    pub fn instance(&self) -> Option<&I> {
        self.instance.as_ref()
    }

    /// 소스 파일 파싱 및 컴파일
    pub fn add_source(&mut self, path: &Path) -> Result<(), LoadError> {
        if self.stage != SessionStage::Configured {
            return Err(self.out_of_order("add_source").into());
        }
        self.source = Some(path.to_path_buf());

        let result = self.instance_mut()?.add_file(path);
        match result {
            Ok(()) => {
                self.stage = SessionStage::SourceAdded;
                Ok(())
            }
            Err(fault) => {
                self.stage = SessionStage::Failed;
                Err(LoadError::Compile {
                    path: path.to_path_buf(),
                    diagnostics: self.report(&fault),
                })
            }
        }
    }

    /// 재배치된 이미지 크기 질의
    ///
    /// 처음 한 번만 컴파일러에 묻고 이후에는 같은 값을 돌려준다.
    pub fn compute_image_size(&mut self) -> Result<ImageSize, LoadError> {
        match self.stage {
            SessionStage::Sized { bytes } => {
                return Ok(ImageSize {
                    session: self.id,
                    bytes,
                });
            }
            SessionStage::SourceAdded => {}
            _ => return Err(self.out_of_order("compute_image_size").into()),
        }

        let result = self.instance_mut()?.image_size();
        match result {
            Ok(bytes) => {
                self.stage = SessionStage::Sized { bytes };
                Ok(ImageSize {
                    session: self.id,
                    bytes,
                })
            }
            Err(fault) => {
                self.stage = SessionStage::Failed;
                Err(LoadError::Sizing {
                    path: self.source_path(),
                    diagnostics: self.report(&fault),
                })
            }
        }
    }

    /// 같은 세션 크기로 할당된 버퍼에 이미지 배치
    pub fn relocate_into(&mut self, buffer: &mut RelocationBuffer) -> Result<(), LoadError> {
        let SessionStage::Sized { bytes: required } = self.stage else {
            return Err(self.out_of_order("relocate_into").into());
        };

        if buffer.session() != self.id {
            return Err(StateError::BufferMismatch {
                expected: self.id,
                found: buffer.session(),
            }
            .into());
        }
        if buffer.len() < required {
            return Err(StateError::BufferTooSmall {
                required,
                provided: buffer.len(),
            }
            .into());
        }

        let (dest, len) = (buffer.as_mut_ptr(), buffer.len());
        // SAFETY: 버퍼는 len 바이트를 소유하고 이미지 크기 이상임을 위에서 확인
        let result = unsafe { self.instance_mut()?.relocate(dest, len) };
        match result {
            Ok(()) => {
                self.stage = SessionStage::Relocated { bytes: required };
                Ok(())
            }
            Err(fault) => {
                self.stage = SessionStage::Failed;
                Err(LoadError::Relocation {
                    path: self.source_path(),
                    diagnostics: self.report(&fault),
                })
            }
        }
    }

    /// 재배치된 이미지에서 심볼 주소 조회
    pub fn resolve_symbol(&self, name: &str) -> Result<Option<NonNull<c_void>>, LoadError> {
        let SessionStage::Relocated { .. } = self.stage else {
            return Err(self.out_of_order("resolve_symbol").into());
        };

        let Ok(name) = CString::new(name) else {
            return Ok(None);
        };
        Ok(self.instance.as_ref().and_then(|instance| instance.symbol(&name)))
    }

    /// 컴파일러 인스턴스 해제 (여러 번 호출해도 안전)
    pub fn dispose(&mut self) {
        if self.instance.take().is_some() {
            tracing::trace!("Disposed compilation session {}", self.id);
        }
        self.stage = SessionStage::Disposed;
    }

    fn out_of_order(&self, operation: &'static str) -> StateError {
        StateError::OutOfOrder {
            operation,
            stage: self.stage,
        }
    }

    fn instance_mut(&mut self) -> Result<&mut I, StateError> {
        let stage = self.stage;
        self.instance.as_mut().ok_or(StateError::OutOfOrder {
            operation: "instance",
            stage,
        })
    }

    fn source_path(&self) -> PathBuf {
        self.source.clone().unwrap_or_default()
    }

    /// 싱크에 아무것도 없으면 컴파일러 요약 메시지 사용
    fn report(&self, fault: &CompilerFault) -> String {
        if self.sink.is_empty() {
            fault.message.clone()
        } else {
            self.sink.render()
        }
    }
}

impl<I: CompilerInstance> fmt::Debug for CompilationSession<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompilationSession")
            .field("id", &self.id)
            .field("stage", &self.stage)
            .field("source", &self.source)
            .finish()
    }
}

fn apply<I: CompilerInstance>(
    instance: &mut I,
    search: &SearchConfiguration,
    host_symbols: &HostSymbols,
) -> Result<(), CompilerFault> {
    for dir in search.include_paths() {
        instance.add_include_path(dir)?;
    }
    for dir in search.sysinclude_paths() {
        instance.add_sysinclude_path(dir)?;
    }
    for dir in search.library_paths() {
        instance.add_library_path(dir)?;
    }
    for (name, value) in search.defines() {
        instance.define(name, value.as_deref())?;
    }
    for (name, address) in host_symbols.iter() {
        // SAFETY: HostSymbols 항목은 unsafe `register` 계약으로만 들어온다
        // (선언과 맞는 함수/객체 주소, 프로세스 수명 동안 유효)
        unsafe { instance.add_symbol(name, address as *const c_void)? };
    }
    // 라이브러리가 없으면 링크 단계(크기 계산)에서 미해결 심볼로 드러난다
    for library in search.libraries() {
        if let Err(fault) = instance.add_library(library) {
            tracing::warn!("Cannot link '{}': {}", library, fault);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::compiler::builtin::{BuiltinInstance, BuiltinToolchain, BuiltinUnit, FailAt};
    use crate::module::buffer::BufferStats;

    extern "C" fn probe() -> i32 {
        7
    }

    fn open(toolchain: &BuiltinToolchain) -> CompilationSession<BuiltinInstance> {
        CompilationSession::configure(toolchain, &SearchConfiguration::new(), &HostSymbols::new())
            .unwrap()
    }

    #[test]
    fn configure_applies_search_paths_and_host_symbols() {
        let toolchain = BuiltinToolchain::new();
        let search = SearchConfiguration::from_roots(&["/host"])
            .include("/extra")
            .define("TCCMOD", None);
        // SAFETY: probe는 정적 함수
        let symbols = unsafe { HostSymbols::new().with("probe", probe as usize) };

        let session = CompilationSession::configure(&toolchain, &search, &symbols).unwrap();
        let instance = session.instance().unwrap();

        assert_eq!(instance.include_paths(), search.include_paths());
        assert_eq!(instance.sysinclude_paths(), search.sysinclude_paths());
        assert_eq!(instance.library_paths(), search.library_paths());
        assert_eq!(instance.libraries(), search.libraries());
        assert_eq!(instance.defines(), &[("TCCMOD".to_string(), None)]);
        assert_eq!(instance.host_symbols(), &[("probe".to_string(), probe as usize)]);
        assert_eq!(session.stage(), SessionStage::Configured);
    }

    #[test]
    fn stages_cannot_be_skipped() {
        let toolchain = BuiltinToolchain::new();
        toolchain.register("a.c", BuiltinUnit::new());
        let stats = Arc::new(BufferStats::default());
        let mut session = open(&toolchain);

        assert!(matches!(
            session.compute_image_size(),
            Err(LoadError::State(StateError::OutOfOrder { operation: "compute_image_size", .. }))
        ));
        assert!(matches!(
            session.resolve_symbol("module_init"),
            Err(LoadError::State(StateError::OutOfOrder { .. }))
        ));

        session.add_source(Path::new("a.c")).unwrap();
        assert!(matches!(
            session.add_source(Path::new("a.c")),
            Err(LoadError::State(StateError::OutOfOrder { stage: SessionStage::SourceAdded, .. }))
        ));

        let size = session.compute_image_size().unwrap();
        assert!(matches!(
            session.resolve_symbol("module_init"),
            Err(LoadError::State(StateError::OutOfOrder { stage: SessionStage::Sized { .. }, .. }))
        ));

        let mut buffer = RelocationBuffer::allocate(size, &stats).unwrap();
        session.relocate_into(&mut buffer).unwrap();
        assert_eq!(session.resolve_symbol("module_init").unwrap(), None);
    }

    #[test]
    fn image_size_is_stable() {
        let toolchain = BuiltinToolchain::new();
        toolchain.register("a.c", BuiltinUnit::new().image(vec![0x90; 300]));
        let mut session = open(&toolchain);
        session.add_source(Path::new("a.c")).unwrap();

        let first = session.compute_image_size().unwrap();
        let second = session.compute_image_size().unwrap();
        assert_eq!(first, second);
        assert_eq!(first.bytes(), 300);
        assert_eq!(first.session(), session.id());
    }

    #[test]
    fn stage_carries_the_image_size() {
        let toolchain = BuiltinToolchain::new();
        toolchain.register("a.c", BuiltinUnit::new().image(vec![0x90; 120]));
        let stats = Arc::new(BufferStats::default());
        let mut session = open(&toolchain);
        assert_eq!(session.image_size(), None);

        session.add_source(Path::new("a.c")).unwrap();
        let size = session.compute_image_size().unwrap();
        assert_eq!(session.stage(), SessionStage::Sized { bytes: 120 });

        let mut buffer = RelocationBuffer::allocate(size, &stats).unwrap();
        session.relocate_into(&mut buffer).unwrap();
        assert_eq!(session.stage(), SessionStage::Relocated { bytes: 120 });
        assert_eq!(session.image_size(), Some(120));

        session.dispose();
        assert_eq!(session.image_size(), None);
    }

    #[test]
    fn buffer_from_another_session_is_rejected() {
        let toolchain = BuiltinToolchain::new();
        toolchain.register("a.c", BuiltinUnit::new());
        let stats = Arc::new(BufferStats::default());

        let mut first = open(&toolchain);
        let mut second = open(&toolchain);
        first.add_source(Path::new("a.c")).unwrap();
        second.add_source(Path::new("a.c")).unwrap();
        let first_size = first.compute_image_size().unwrap();
        second.compute_image_size().unwrap();

        let mut buffer = RelocationBuffer::allocate(first_size, &stats).unwrap();
        let err = second.relocate_into(&mut buffer).unwrap_err();
        assert!(matches!(err, LoadError::State(StateError::BufferMismatch { .. })));
        assert!(matches!(second.stage(), SessionStage::Sized { .. }));
    }

    #[test]
    fn compile_failure_carries_diagnostics() {
        let toolchain = BuiltinToolchain::new();
        toolchain.register(
            "broken.c",
            BuiltinUnit::new().fail_at(FailAt::Parse, "';' expected"),
        );
        let mut session = open(&toolchain);

        let err = session.add_source(Path::new("broken.c")).unwrap_err();
        match err {
            LoadError::Compile { path, diagnostics } => {
                assert_eq!(path, PathBuf::from("broken.c"));
                assert!(diagnostics.contains("';' expected"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(session.stage(), SessionStage::Failed);
        assert!(session.compute_image_size().is_err());
    }

    #[test]
    fn dispose_is_idempotent() {
        let toolchain = BuiltinToolchain::new();
        let mut session = open(&toolchain);
        assert_eq!(toolchain.live_instances(), 1);

        session.dispose();
        session.dispose();
        assert_eq!(toolchain.live_instances(), 0);
        assert_eq!(session.stage(), SessionStage::Disposed);
        assert!(session.add_source(Path::new("a.c")).is_err());

        drop(session);
        assert_eq!(toolchain.live_instances(), 0);
    }
}
