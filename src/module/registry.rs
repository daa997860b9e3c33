//! 모듈 레지스트리
//!
//! 로드된 모듈 목록 (로드 순서 유지). 전역 싱글톤이 아니라 매니저가 소유한다.
//! - 로드 중인 항목은 `Loading` 슬롯으로 예약해 같은 경로의 중복 로드를 막는다
//! - 예약이 커밋되지 않고 drop되면 슬롯이 제거된다 (실패 시 레지스트리 불변)

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::error::LoadError;

/// 모듈 식별자 (소스 경로)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId(PathBuf);

impl ModuleId {
    /// 가능하면 정규화된 경로를 사용
    pub fn from_path(path: &Path) -> Self {
        Self(std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf()))
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

enum Slot<M> {
    Loading,
    Live(Arc<Mutex<M>>),
}

impl<M> Slot<M> {
    fn live(&self) -> Option<&Arc<Mutex<M>>> {
        match self {
            Slot::Live(module) => Some(module),
            Slot::Loading => None,
        }
    }
}

/// 로드된 모듈 레지스트리
pub struct ModuleRegistry<M> {
    entries: RwLock<Vec<(ModuleId, Slot<M>)>>,
}

impl<M> Default for ModuleRegistry<M> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }
}

impl<M> ModuleRegistry<M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// 로드를 위해 식별자 예약
    ///
    /// 이미 로드됐거나 로드 중이면 `AlreadyLoaded`.
    pub fn reserve(&self, id: ModuleId) -> Result<Reservation<'_, M>, LoadError> {
        let mut entries = self.entries.write();
        if entries.iter().any(|(existing, _)| *existing == id) {
            return Err(LoadError::AlreadyLoaded {
                path: id.as_path().to_path_buf(),
            });
        }
        entries.push((id.clone(), Slot::Loading));

        Ok(Reservation {
            registry: self,
            id,
            committed: false,
        })
    }

    pub fn get(&self, id: &ModuleId) -> Option<Arc<Mutex<M>>> {
        self.entries
            .read()
            .iter()
            .find(|(existing, _)| existing == id)
            .and_then(|(_, slot)| slot.live().cloned())
    }

    /// 로드 완료된 항목 제거
    pub fn remove(&self, id: &ModuleId) -> Option<Arc<Mutex<M>>> {
        let mut entries = self.entries.write();
        let idx = entries
            .iter()
            .position(|(existing, slot)| existing == id && slot.live().is_some())?;
        match entries.remove(idx).1 {
            Slot::Live(module) => Some(module),
            Slot::Loading => None,
        }
    }

    /// 로드 순서대로의 식별자
    pub fn ids(&self) -> Vec<ModuleId> {
        self.entries
            .read()
            .iter()
            .filter(|(_, slot)| slot.live().is_some())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// 로드 순서대로의 스냅샷
    pub fn entries(&self) -> Vec<(ModuleId, Arc<Mutex<M>>)> {
        self.entries
            .read()
            .iter()
            .filter_map(|(id, slot)| slot.live().map(|m| (id.clone(), Arc::clone(m))))
            .collect()
    }

    /// 모든 로드 완료 항목을 역순(마지막 로드 먼저)으로 꺼낸다
    ///
    /// 로드 중인 예약은 그대로 둔다.
    pub fn drain_reverse(&self) -> Vec<(ModuleId, Arc<Mutex<M>>)> {
        let mut entries = self.entries.write();
        let mut drained = Vec::new();
        let mut kept = Vec::new();

        for (id, slot) in entries.drain(..) {
            match slot {
                Slot::Live(module) => drained.push((id, module)),
                Slot::Loading => kept.push((id, Slot::Loading)),
            }
        }
        *entries = kept;

        drained.reverse();
        drained
    }

    pub fn contains(&self, id: &ModuleId) -> bool {
        self.get(id).is_some()
    }

    /// 로드 완료된 모듈 수
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .iter()
            .filter(|(_, slot)| slot.live().is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn release(&self, id: &ModuleId) {
        self.entries
            .write()
            .retain(|(existing, slot)| !(existing == id && matches!(slot, Slot::Loading)));
    }
}

impl<M> fmt::Debug for ModuleRegistry<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.entries.read();
        f.debug_list()
            .entries(entries.iter().map(|(id, slot)| {
                (id, if slot.live().is_some() { "live" } else { "loading" })
            }))
            .finish()
    }
}

/// 로드 중 예약 (RAII)
///
/// `commit` 없이 drop되면 예약이 해제된다.
pub struct Reservation<'r, M> {
    registry: &'r ModuleRegistry<M>,
    id: ModuleId,
    committed: bool,
}

impl<M> Reservation<'_, M> {
    pub fn id(&self) -> &ModuleId {
        &self.id
    }

    /// 예약 슬롯을 로드된 모듈로 교체
    pub fn commit(mut self, module: M) -> Arc<Mutex<M>> {
        let module = Arc::new(Mutex::new(module));
        let mut entries = self.registry.entries.write();
        if let Some((_, slot)) = entries.iter_mut().find(|(id, _)| *id == self.id) {
            *slot = Slot::Live(Arc::clone(&module));
        } else {
            entries.push((self.id.clone(), Slot::Live(Arc::clone(&module))));
        }
        self.committed = true;
        module
    }
}

impl<M> Drop for Reservation<'_, M> {
    fn drop(&mut self) {
        if !self.committed {
            self.registry.release(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(path: &str) -> ModuleId {
        ModuleId::from_path(Path::new(path))
    }

    #[test]
    fn uncommitted_reservation_leaves_no_trace() {
        let registry: ModuleRegistry<u32> = ModuleRegistry::new();
        {
            let reservation = registry.reserve(id("a.c")).unwrap();
            assert_eq!(reservation.id(), &id("a.c"));
            assert!(registry.is_empty());
            assert!(registry.reserve(id("a.c")).is_err());
        }
        assert!(registry.reserve(id("a.c")).is_ok());
        assert!(registry.is_empty());
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let registry = ModuleRegistry::new();
        registry.reserve(id("a.c")).unwrap().commit(1u32);

        match registry.reserve(id("a.c")) {
            Err(LoadError::AlreadyLoaded { path }) => assert_eq!(path, PathBuf::from("a.c")),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("duplicate reservation accepted"),
        }
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn load_order_is_kept_and_drained_in_reverse() {
        let registry = ModuleRegistry::new();
        for (n, path) in ["a.c", "b.c", "c.c"].into_iter().enumerate() {
            registry.reserve(id(path)).unwrap().commit(n);
        }
        let pending = registry.reserve(id("d.c")).unwrap();

        assert_eq!(registry.ids(), vec![id("a.c"), id("b.c"), id("c.c")]);
        assert_eq!(*registry.get(&id("b.c")).unwrap().lock(), 1);

        let drained: Vec<_> = registry
            .drain_reverse()
            .into_iter()
            .map(|(id, module)| {
                let value = *module.lock();
                (id, value)
            })
            .collect();
        assert_eq!(drained, vec![(id("c.c"), 2), (id("b.c"), 1), (id("a.c"), 0)]);
        assert!(registry.is_empty());

        pending.commit(3);
        assert_eq!(registry.ids(), vec![id("d.c")]);
    }

    #[test]
    fn remove_ignores_pending_reservations() {
        let registry: ModuleRegistry<u32> = ModuleRegistry::new();
        let _pending = registry.reserve(id("a.c")).unwrap();
        assert!(registry.remove(&id("a.c")).is_none());
        assert!(!registry.contains(&id("a.c")));
    }
}
