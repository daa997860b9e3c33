//! 재배치 버퍼
//!
//! 컴파일된 이미지 하나를 담는 0으로 초기화된 연속 메모리.
//! - 크기는 짝이 되는 세션의 `compute_image_size()` 결과로만 정해진다
//! - 페이지 정렬 (컴파일러가 텍스트 페이지 권한을 바꿀 때 이웃 할당을 건드리지 않도록)
//! - Drop에서 정확히 한 번 해제

use std::alloc::{self, Layout};
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::LoadError;

use super::session::{ImageSize, SessionId};

/// 버퍼 정렬 단위
pub const IMAGE_ALIGN: usize = 4096;

/// 버퍼 할당/해제 집계
#[derive(Debug, Default)]
pub struct BufferStats {
    allocations: AtomicUsize,
    releases: AtomicUsize,
    live_bytes: AtomicUsize,
}

impl BufferStats {
    pub fn allocations(&self) -> usize {
        self.allocations.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    /// 해제되지 않은 버퍼 수
    ///
    /// 해제는 항상 할당 뒤에 세므로 releases를 먼저 읽는다.
    pub fn live(&self) -> usize {
        let releases = self.releases();
        self.allocations().saturating_sub(releases)
    }

    pub fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::SeqCst)
    }
}

/// 이미지 하나를 위한 소유 메모리 블록
pub struct RelocationBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
    len: usize,
    session: SessionId,
    stats: Arc<BufferStats>,
}

// SAFETY: 버퍼는 단일 소유자만 접근하고 내부 포인터를 공유하지 않는다.
unsafe impl Send for RelocationBuffer {}

impl RelocationBuffer {
    /// 세션이 계산한 크기로 0 초기화된 메모리 할당
    pub fn allocate(size: ImageSize, stats: &Arc<BufferStats>) -> Result<Self, LoadError> {
        let len = size.bytes();
        let layout = Layout::from_size_align(len.max(1), IMAGE_ALIGN)
            .map_err(|_| LoadError::OutOfMemory { bytes: len })?;

        // SAFETY: layout 크기는 0이 아니다
        let ptr = NonNull::new(unsafe { alloc::alloc_zeroed(layout) })
            .ok_or(LoadError::OutOfMemory { bytes: len })?;

        stats.allocations.fetch_add(1, Ordering::SeqCst);
        stats.live_bytes.fetch_add(len, Ordering::SeqCst);
        tracing::debug!("Allocated {} byte image buffer for session {}", len, size.session());

        Ok(Self {
            ptr,
            layout,
            len,
            session: size.session(),
            stats: Arc::clone(stats),
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// 버퍼 크기를 계산한 세션
    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr은 len 바이트 이상 초기화(0)된 할당을 가리킨다
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// 주소가 이미지 범위 안인지
    pub fn contains(&self, address: usize) -> bool {
        let start = self.ptr.as_ptr() as usize;
        address >= start && address < start + self.len
    }
}

impl Drop for RelocationBuffer {
    fn drop(&mut self) {
        // SAFETY: allocate에서 같은 layout으로 할당했고 여기서만 해제한다
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
        self.stats.releases.fetch_add(1, Ordering::SeqCst);
        self.stats.live_bytes.fetch_sub(self.len, Ordering::SeqCst);
        tracing::debug!("Released image buffer of session {}", self.session);
    }
}

impl fmt::Debug for RelocationBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelocationBuffer")
            .field("address", &format_args!("{:#x}", self.ptr.as_ptr() as usize))
            .field("len", &self.len)
            .field("session", &self.session)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::compiler::builtin::{BuiltinToolchain, BuiltinUnit};
    use crate::config::SearchConfiguration;
    use crate::module::session::CompilationSession;
    use crate::module::symbol::HostSymbols;

    fn sized(toolchain: &BuiltinToolchain, bytes: usize) -> ImageSize {
        toolchain.register("img.c", BuiltinUnit::new().image(vec![0xAB; bytes]));
        let mut session = CompilationSession::configure(
            toolchain,
            &SearchConfiguration::new(),
            &HostSymbols::new(),
        )
        .unwrap();
        session.add_source(Path::new("img.c")).unwrap();
        session.compute_image_size().unwrap()
    }

    #[test]
    fn allocation_is_zeroed_and_aligned() {
        let toolchain = BuiltinToolchain::new();
        let stats = Arc::new(BufferStats::default());
        let buffer = RelocationBuffer::allocate(sized(&toolchain, 5000), &stats).unwrap();

        assert_eq!(buffer.len(), 5000);
        assert_eq!(buffer.as_ptr() as usize % IMAGE_ALIGN, 0);
        assert!(buffer.as_slice().iter().all(|&b| b == 0));
        assert!(buffer.contains(buffer.as_ptr() as usize + 4999));
        assert!(!buffer.contains(buffer.as_ptr() as usize + 5000));
    }

    #[test]
    fn drop_releases_exactly_once() {
        let toolchain = BuiltinToolchain::new();
        let stats = Arc::new(BufferStats::default());

        let buffer = RelocationBuffer::allocate(sized(&toolchain, 64), &stats).unwrap();
        assert_eq!((stats.allocations(), stats.releases(), stats.live_bytes()), (1, 0, 64));

        drop(buffer);
        assert_eq!((stats.allocations(), stats.releases(), stats.live_bytes()), (1, 1, 0));
        assert_eq!(stats.live(), 0);
    }

    #[test]
    fn live_count_holds_under_concurrent_churn() {
        let toolchain = BuiltinToolchain::new();
        let size = sized(&toolchain, 16);
        let stats = Arc::new(BufferStats::default());

        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..500 {
                        drop(RelocationBuffer::allocate(size, &stats).unwrap());
                    }
                });
            }
            for _ in 0..2000 {
                let live = stats.live();
                assert!(live <= stats.allocations());
            }
        });

        assert_eq!(stats.allocations(), 2000);
        assert_eq!(stats.live(), 0);
    }

    #[test]
    fn empty_image_still_gets_a_block() {
        let toolchain = BuiltinToolchain::new();
        let stats = Arc::new(BufferStats::default());
        let buffer = RelocationBuffer::allocate(sized(&toolchain, 0), &stats).unwrap();
        assert!(buffer.is_empty());
        assert!(buffer.as_slice().is_empty());
    }
}
