//! 검색 경로 및 로더 설정
//!
//! - SearchConfiguration: 컴파일 세션에 적용되는 include/라이브러리 경로 (읽기 전용)
//! - LoaderConfig: TOML 설정 파일

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// 로더가 처리하는 소스 파일 확장자
pub const DEFAULT_EXTENSION: &str = "c";

/// 항상 링크되는 호스트 API 라이브러리
pub const HOST_LIBRARY: &str = "tccmod_host";

const INCLUDE_SUBDIR: &str = "include/tccmod";
const RUNTIME_INCLUDE_SUBDIR: &str = "lib/tcc/include";
const UTIL_INCLUDE_SUBDIR: &str = "include/tccmod/util";
const LIBRARY_SUBDIR: &str = "lib";
const WIN32_INCLUDE_SUBDIR: &str = "include/win32";
const WIN32_LIBRARY_SUBDIR: &str = "lib/win32";

/// 검색 경로 레이아웃을 결정하는 대상 플랫폼
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Unix,
    Windows,
}

impl Platform {
    pub const fn current() -> Self {
        if cfg!(windows) {
            Platform::Windows
        } else {
            Platform::Unix
        }
    }
}

/// 컴파일 세션에 적용되는 검색 설정
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchConfiguration {
    include_paths: Vec<PathBuf>,
    sysinclude_paths: Vec<PathBuf>,
    library_paths: Vec<PathBuf>,
    libraries: Vec<String>,
    defines: Vec<(String, Option<String>)>,
}

impl SearchConfiguration {
    pub fn new() -> Self {
        Self::default()
    }

    /// 호스트 루트 디렉토리들로부터 현재 플랫폼 레이아웃 구성
    pub fn from_roots<P: AsRef<Path>>(roots: &[P]) -> Self {
        Self::from_roots_for(roots, Platform::current())
    }

    pub fn from_roots_for<P: AsRef<Path>>(roots: &[P], platform: Platform) -> Self {
        let mut config = Self::new();

        for root in roots {
            let root = root.as_ref();
            config = config
                .include(root.join(INCLUDE_SUBDIR))
                .sysinclude(root.join(RUNTIME_INCLUDE_SUBDIR))
                .sysinclude(root.join(UTIL_INCLUDE_SUBDIR))
                .library_path(root.join(LIBRARY_SUBDIR));

            if platform == Platform::Windows {
                config = config
                    .include(root.join(WIN32_INCLUDE_SUBDIR))
                    .library_path(root.join(WIN32_LIBRARY_SUBDIR));
            }
        }

        config.link(HOST_LIBRARY)
    }

    pub fn include(mut self, dir: impl Into<PathBuf>) -> Self {
        push_unique(&mut self.include_paths, dir.into());
        self
    }

    pub fn sysinclude(mut self, dir: impl Into<PathBuf>) -> Self {
        push_unique(&mut self.sysinclude_paths, dir.into());
        self
    }

    pub fn library_path(mut self, dir: impl Into<PathBuf>) -> Self {
        push_unique(&mut self.library_paths, dir.into());
        self
    }

    /// 링크할 라이브러리 추가 (중복은 무시)
    pub fn link(mut self, name: impl Into<String>) -> Self {
        push_unique(&mut self.libraries, name.into());
        self
    }

    /// 매크로 정의 (같은 이름은 교체)
    pub fn define(mut self, name: impl Into<String>, value: Option<String>) -> Self {
        let name = name.into();
        if let Some(pos) = self.defines.iter().position(|(n, _)| *n == name) {
            self.defines[pos].1 = value;
        } else {
            self.defines.push((name, value));
        }
        self
    }

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
}

fn push_unique<T: PartialEq>(list: &mut Vec<T>, item: T) {
    if !list.contains(&item) {
        list.push(item);
    }
}

/// 로더 설정 파일
///
/// ```toml
/// roots = ["/usr/local"]
/// include_paths = ["./modules/include"]
/// compiler_options = ["-nostdlib"]
///
/// [defines]
/// TCCMOD_DEBUG = "1"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoaderConfig {
    /// 호스트 검색 루트 (플랫폼 레이아웃 적용)
    pub roots: Vec<PathBuf>,
    pub include_paths: Vec<PathBuf>,
    pub sysinclude_paths: Vec<PathBuf>,
    pub library_paths: Vec<PathBuf>,
    pub libraries: Vec<String>,
    /// 빈 문자열 값은 값 없는 정의 (`-DNAME`)
    pub defines: BTreeMap<String, String>,
    /// 처리할 소스 확장자 (점 없이)
    pub extension: String,
    /// libtcc 공유 라이브러리 경로
    pub libtcc: Option<PathBuf>,
    /// libtcc 런타임 디렉토리
    pub tcc_dir: Option<PathBuf>,
    pub compiler_options: Vec<String>,
    pub log_level: Option<String>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            roots: Vec::new(),
            include_paths: Vec::new(),
            sysinclude_paths: Vec::new(),
            library_paths: Vec::new(),
            libraries: Vec::new(),
            defines: BTreeMap::new(),
            extension: DEFAULT_EXTENSION.to_string(),
            libtcc: None,
            tcc_dir: None,
            compiler_options: Vec::new(),
            log_level: None,
        }
    }
}

impl LoaderConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// 루트 레이아웃 + 명시 항목을 합친 검색 설정
    pub fn search_configuration(&self) -> SearchConfiguration {
        let mut config = SearchConfiguration::from_roots(&self.roots);

        for dir in &self.include_paths {
            config = config.include(dir);
        }
        for dir in &self.sysinclude_paths {
            config = config.sysinclude(dir);
        }
        for dir in &self.library_paths {
            config = config.library_path(dir);
        }
        for name in &self.libraries {
            config = config.link(name);
        }
        for (name, value) in &self.defines {
            let value = (!value.is_empty()).then(|| value.clone());
            config = config.define(name, value);
        }

        config
    }
}
