//! 모듈 로더
//!
//! C 소스 파일을 메모리에 컴파일/재배치하고 수명 주기를 관리
//! - probe: 컴파일 → 크기 계산 → 버퍼 할당 → 재배치 → 엔트리 해석 → 초기화
//! - activate / deactivate: 모듈이 등록한 load / unload 훅
//! - destroy: destroy 훅 → 버퍼 해제 → 컴파일러 인스턴스 해제 → 레지스트리 제거
//!
//! 실패한 단계까지 만들어진 세션/버퍼는 drop으로 되돌려진다.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::compiler::{CompilerInstance, Toolchain};
use crate::config::{DEFAULT_EXTENSION, SearchConfiguration};
use crate::error::{HookFailure, LoadError, StateError};

use super::abi::{HookKind, ModuleRecord};
use super::buffer::{BufferStats, RelocationBuffer};
use super::registry::{ModuleId, ModuleRegistry};
use super::session::CompilationSession;
use super::symbol::{ENTRY_SYMBOL, HostSymbols, resolve_entry};

// ============================================================================
// 모듈 상태 및 정보
// ============================================================================

/// 모듈 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    /// 초기화 완료, 아직 활성화 전
    Running,
    /// load 훅 성공
    Active,
    /// 해제됨
    Destroyed,
}

impl ModuleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleState::Running => "running",
            ModuleState::Active => "active",
            ModuleState::Destroyed => "destroyed",
        }
    }
}

/// 훅 호출 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookOutcome {
    /// 모듈이 훅을 등록하지 않음
    Absent,
    /// 호출할 상황이 아님 (예: 활성화되지 않은 모듈의 unload)
    Skipped,
    Succeeded,
    Failed,
}

/// 모듈이 등록한 훅
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HookSet {
    pub load: bool,
    pub unload: bool,
    pub destroy: bool,
}

/// 모듈 상세 정보 (조회용)
#[derive(Debug, Clone)]
pub struct ModuleInfo {
    pub id: ModuleId,
    /// 모듈이 알린 이름 (없으면 파일 이름)
    pub name: String,
    pub version: Option<String>,
    pub summary: Option<String>,
    pub state: ModuleState,
    /// 재배치된 이미지 크기
    pub image_size: usize,
    pub hooks: HookSet,
}

// ============================================================================
// 로드된 모듈
// ============================================================================

/// 재배치까지 끝난 이미지 (버퍼 + 컴파일러 인스턴스)
///
/// 필드 순서대로 해제된다: 버퍼 → 세션.
struct RelocatedImage<I: CompilerInstance> {
    buffer: RelocationBuffer,
    session: CompilationSession<I>,
}

impl<I: CompilerInstance> RelocatedImage<I> {
    fn release(self) {
        let Self { buffer, mut session } = self;
        drop(buffer);
        session.dispose();
    }
}

/// 로드된 모듈
///
/// 훅이 호출될 수 있는 동안 이미지는 살아 있다.
pub struct LoadedModule<I: CompilerInstance> {
    id: ModuleId,
    source: PathBuf,
    name: String,
    version: Option<String>,
    summary: Option<String>,
    state: ModuleState,
    image_size: usize,
    /// 모듈이 포인터를 보관할 수 있으므로 박스로 고정
    record: Box<ModuleRecord>,
    image: Option<RelocatedImage<I>>,
}

// SAFETY: 레코드의 raw 포인터는 모듈 이미지 안을 가리키고 이미지와 함께 이동한다.
// 접근은 레지스트리 슬롯의 Mutex로 직렬화된다.
unsafe impl<I: CompilerInstance> Send for LoadedModule<I> {}

impl<I: CompilerInstance> LoadedModule<I> {
    fn new(id: ModuleId, source: &Path, record: Box<ModuleRecord>, image: RelocatedImage<I>) -> Self {
        // SAFETY: 문자열 필드는 모듈 이미지 안의 NUL 종료 상수를 가리킨다
        let (name, version, summary) = unsafe {
            (
                ModuleRecord::text(record.name),
                ModuleRecord::text(record.version),
                ModuleRecord::text(record.summary),
            )
        };
        let name = name.unwrap_or_else(|| file_stem(source));

        Self {
            id,
            source: source.to_path_buf(),
            name,
            version,
            summary,
            state: ModuleState::Running,
            image_size: image.buffer.len(),
            record,
            image: Some(image),
        }
    }

    pub fn id(&self) -> &ModuleId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn state(&self) -> ModuleState {
        self.state
    }

    pub fn hooks(&self) -> HookSet {
        HookSet {
            load: self.record.load.is_some(),
            unload: self.record.unload.is_some(),
            destroy: self.record.destroy.is_some(),
        }
    }

    pub fn info(&self) -> ModuleInfo {
        ModuleInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            version: self.version.clone(),
            summary: self.summary.clone(),
            state: self.state,
            image_size: self.image_size,
            hooks: self.hooks(),
        }
    }

    /// load 훅 호출
    pub fn activate(&mut self) -> Result<(), LoadError> {
        match self.state {
            ModuleState::Destroyed => return Err(StateError::Destroyed.into()),
            ModuleState::Active => return Err(StateError::AlreadyActive.into()),
            ModuleState::Running => {}
        }

        let Some(load) = self.record.load else {
            return Err(self.hook_error(HookKind::Load, HookFailure::Missing));
        };
        // SAFETY: 훅은 살아 있는 이미지 안의 함수이고 레코드 주소는 고정되어 있다
        if unsafe { load(&mut *self.record) } == 0 {
            return Err(self.hook_error(HookKind::Load, HookFailure::Reported));
        }

        self.state = ModuleState::Active;
        tracing::info!("Module '{}' activated", self.name);
        Ok(())
    }

    /// unload 훅 호출
    ///
    /// 훅 실패는 기록만 하고 모듈은 비활성 상태가 된다.
    pub fn deactivate(&mut self) -> Result<HookOutcome, LoadError> {
        match self.state {
            ModuleState::Destroyed => return Err(StateError::Destroyed.into()),
            ModuleState::Running => return Ok(HookOutcome::Skipped),
            ModuleState::Active => {}
        }
        self.state = ModuleState::Running;

        let Some(unload) = self.record.unload else {
            return Ok(HookOutcome::Absent);
        };
        // SAFETY: activate와 동일
        if unsafe { unload(&mut *self.record) } == 0 {
            tracing::warn!("{}", self.hook_error(HookKind::Unload, HookFailure::Reported));
            return Ok(HookOutcome::Failed);
        }

        tracing::info!("Module '{}' deactivated", self.name);
        Ok(HookOutcome::Succeeded)
    }

    /// 모듈 해제: (활성이면 unload) → destroy 훅 → 버퍼 → 컴파일러 인스턴스
    ///
    /// 두 번째 호출부터는 아무 일도 하지 않는다.
    pub fn teardown(&mut self) {
        if self.state == ModuleState::Destroyed {
            return;
        }
        if self.state == ModuleState::Active {
            // 실패해도 해제는 계속된다
            let _ = self.deactivate();
        }

        if let Some(destroy) = self.record.destroy {
            // SAFETY: 이미지는 아직 해제 전이다
            unsafe { destroy(&mut *self.record) };
        }
        self.state = ModuleState::Destroyed;

        if let Some(image) = self.image.take() {
            image.release();
        }
        tracing::info!("Module '{}' destroyed", self.name);
    }

    fn hook_error(&self, hook: HookKind, failure: HookFailure) -> LoadError {
        LoadError::Hook {
            path: self.source.clone(),
            hook,
            failure,
        }
    }
}

impl<I: CompilerInstance> Drop for LoadedModule<I> {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

// ============================================================================
// 모듈 매니저
// ============================================================================

/// 모듈 매니저
///
/// 툴체인, 검색 설정, 호스트 심볼, 레지스트리를 묶는 명시적 컨텍스트.
/// drop 시 남은 모듈을 모두 해제한다.
pub struct ModuleManager<T: Toolchain> {
    toolchain: T,
    search: RwLock<Arc<SearchConfiguration>>,
    host_symbols: HostSymbols,
    extension: String,
    registry: ModuleRegistry<LoadedModule<T::Instance>>,
    stats: Arc<BufferStats>,
}

impl<T: Toolchain> ModuleManager<T> {
    pub fn new(toolchain: T, search: SearchConfiguration) -> Self {
        Self {
            toolchain,
            search: RwLock::new(Arc::new(search)),
            host_symbols: HostSymbols::with_defaults(),
            extension: DEFAULT_EXTENSION.to_string(),
            registry: ModuleRegistry::new(),
            stats: Arc::new(BufferStats::default()),
        }
    }

    /// 호스트 심볼 테이블 교체
    pub fn with_host_symbols(mut self, host_symbols: HostSymbols) -> Self {
        self.host_symbols = host_symbols;
        self
    }

    /// 처리할 소스 확장자 지정 (점 없이)
    pub fn with_extension(mut self, extension: &str) -> Self {
        self.extension = extension.trim_start_matches('.').to_string();
        self
    }

    pub fn toolchain(&self) -> &T {
        &self.toolchain
    }

    pub fn host_symbols(&self) -> &HostSymbols {
        &self.host_symbols
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    pub fn registry(&self) -> &ModuleRegistry<LoadedModule<T::Instance>> {
        &self.registry
    }

    pub fn buffer_stats(&self) -> &Arc<BufferStats> {
        &self.stats
    }

    /// 현재 검색 설정 스냅샷
    pub fn search_configuration(&self) -> Arc<SearchConfiguration> {
        Arc::clone(&self.search.read())
    }

    /// 검색 설정 교체
    ///
    /// 이미 로드된 모듈에는 영향이 없고 이후 로드부터 적용된다.
    pub fn set_search_configuration(&self, search: SearchConfiguration) {
        *self.search.write() = Arc::new(search);
        tracing::debug!("Search configuration replaced");
    }

    /// 이 로더가 처리하는 파일인지 (확장자 검사)
    pub fn accepts(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case(&self.extension))
    }

    /// 소스 파일을 컴파일/재배치하고 엔트리 함수 호출
    ///
    /// 성공하면 레지스트리에 등록된다. 실패하면 레지스트리는 바뀌지 않고
    /// 할당된 버퍼와 컴파일러 인스턴스는 모두 해제된다.
    pub fn probe(&self, path: &Path) -> Result<ModuleInfo, LoadError> {
        if !self.accepts(path) {
            return Err(LoadError::UnsupportedFile {
                path: path.to_path_buf(),
                extension: self.extension.clone(),
            });
        }

        tracing::info!("Loading module from path: {}", path.display());
        let reservation = self.registry.reserve(ModuleId::from_path(path))?;
        let id = reservation.id().clone();

        match self.build(id, path) {
            Ok(module) => {
                let info = module.info();
                reservation.commit(module);
                tracing::info!(
                    "Module '{}' loaded successfully ({} bytes)",
                    info.name,
                    info.image_size
                );
                Ok(info)
            }
            Err(err) => {
                tracing::error!("Failed to load {}: {}", path.display(), err);
                Err(err)
            }
        }
    }

    fn build(&self, id: ModuleId, path: &Path) -> Result<LoadedModule<T::Instance>, LoadError> {
        let search = self.search_configuration();

        let mut session = CompilationSession::configure(&self.toolchain, &search, &self.host_symbols)?;
        session.add_source(path)?;

        let size = session.compute_image_size()?;
        tracing::debug!("Image size: {} bytes", size.bytes());

        let mut buffer = RelocationBuffer::allocate(size, &self.stats)?;
        session.relocate_into(&mut buffer)?;
        let image = RelocatedImage { buffer, session };

        let mut record = Box::new(ModuleRecord::new());
        {
            let entry = resolve_entry(&image.session, &image.buffer)?;
            if !entry.invoke(&mut record) {
                return Err(LoadError::InitializationFailed {
                    path: path.to_path_buf(),
                    symbol: ENTRY_SYMBOL,
                });
            }
        }

        Ok(LoadedModule::new(id, path, record, image))
    }

    /// 모듈 활성화 (load 훅)
    pub fn activate(&self, id: &ModuleId) -> Result<(), LoadError> {
        self.slot(id)?.lock().activate()
    }

    /// 모듈 비활성화 (unload 훅)
    pub fn deactivate(&self, id: &ModuleId) -> Result<HookOutcome, LoadError> {
        self.slot(id)?.lock().deactivate()
    }

    /// 모듈 해제 후 레지스트리에서 제거
    pub fn destroy(&self, id: &ModuleId) -> Result<(), LoadError> {
        let slot = self.slot(id)?;
        {
            let mut module = slot.lock();
            if module.state() == ModuleState::Destroyed {
                return Err(StateError::Destroyed.into());
            }
            module.teardown();
        }
        self.registry.remove(id);
        Ok(())
    }

    /// 남은 모듈 전부 해제 (마지막으로 로드된 것부터)
    pub fn destroy_all(&self) -> usize {
        let drained = self.registry.drain_reverse();
        let count = drained.len();
        for (_, slot) in drained {
            slot.lock().teardown();
        }
        if count > 0 {
            tracing::info!("Destroyed {} module(s)", count);
        }
        count
    }

    pub fn info(&self, id: &ModuleId) -> Option<ModuleInfo> {
        self.registry.get(id).map(|slot| slot.lock().info())
    }

    /// 로드 순서대로의 모듈 정보
    pub fn list(&self) -> Vec<ModuleInfo> {
        self.registry
            .entries()
            .into_iter()
            .map(|(_, slot)| slot.lock().info())
            .collect()
    }

    /// 경로, 모듈 이름, 파일 이름 순으로 검색
    pub fn find(&self, name: &str) -> Option<ModuleId> {
        let wanted = ModuleId::from_path(Path::new(name));
        let entries = self.registry.entries();

        if let Some((id, _)) = entries.iter().find(|(id, _)| *id == wanted) {
            return Some(id.clone());
        }
        if let Some((id, _)) = entries.iter().find(|(_, slot)| slot.lock().name() == name) {
            return Some(id.clone());
        }
        entries
            .into_iter()
            .find(|(id, _)| file_stem(id.as_path()) == name)
            .map(|(id, _)| id)
    }

    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    fn slot(&self, id: &ModuleId) -> Result<Arc<Mutex<LoadedModule<T::Instance>>>, LoadError> {
        self.registry.get(id).ok_or_else(|| LoadError::NotFound {
            path: id.as_path().to_path_buf(),
        })
    }
}

impl<T: Toolchain> Drop for ModuleManager<T> {
    fn drop(&mut self) {
        self.destroy_all();
    }
}
