//! 실제 libtcc로 modules/ 의 예제 모듈 로드
//!
//! libtcc 0.9.27이 필요하므로 기본으로는 무시된다.
//! `TCCMOD_LIBTCC=/path/to/libtcc.so cargo test --test tcc -- --ignored`
//! 라이브러리를 열 수 없으면 실패한다.

#![cfg(feature = "tcc")]

use std::io::Write;
use std::path::{Path, PathBuf};

use tccmod::compiler::tcc::{TccOptions, TccToolchain};
use tccmod::module::{HookOutcome, ModuleManager, ModuleState};
use tccmod::{LoadError, LoadStage, SearchConfiguration};

fn modules_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("modules")
}

fn manager() -> ModuleManager<TccToolchain> {
    let toolchain = TccToolchain::open(TccOptions {
        options: vec!["-nostdlib".to_string()],
        ..TccOptions::default()
    })
    .unwrap_or_else(|fault| panic!("cannot open libtcc: {fault}"));
    let search = SearchConfiguration::new().include(modules_dir().join("include"));
    ModuleManager::new(toolchain, search)
}

#[test]
#[ignore = "needs libtcc 0.9.27 (TCCMOD_LIBTCC)"]
fn hello_module_runs_its_hooks() {
    let manager = manager();
    let path = modules_dir().join("hello/hello.c");

    let info = manager.probe(&path).unwrap();
    assert_eq!(info.name, "hello");
    assert_eq!(info.version.as_deref(), Some("0.1.0"));
    assert!(info.hooks.load && info.hooks.unload && info.hooks.destroy);
    assert!(info.image_size > 0);

    manager.activate(&info.id).unwrap();
    assert_eq!(manager.info(&info.id).unwrap().state, ModuleState::Active);
    assert_eq!(manager.deactivate(&info.id).unwrap(), HookOutcome::Succeeded);

    assert_eq!(manager.find("hello"), Some(info.id.clone()));
    manager.destroy(&info.id).unwrap();

    let stats = manager.buffer_stats();
    assert_eq!((stats.allocations(), stats.releases()), (1, 1));
}

#[test]
#[ignore = "needs libtcc 0.9.27 (TCCMOD_LIBTCC)"]
fn syntax_error_is_a_compile_error() {
    let manager = manager();
    let path = modules_dir().join("test_syntax/syntax_error.c");

    match manager.probe(&path) {
        Err(LoadError::Compile { diagnostics, .. }) => assert!(diagnostics.contains("error")),
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(manager.buffer_stats().allocations(), 0);
    assert!(manager.is_empty());
}

#[test]
#[ignore = "needs libtcc 0.9.27 (TCCMOD_LIBTCC)"]
fn module_without_entry_point_is_rejected() {
    let manager = manager();
    let path = modules_dir().join("test_no_entry/no_entry.c");

    let err = manager.probe(&path).unwrap_err();
    assert_eq!(err.stage(), Some(LoadStage::Resolve));
    assert_eq!(manager.buffer_stats().live(), 0);
}

#[test]
#[ignore = "needs libtcc 0.9.27 (TCCMOD_LIBTCC)"]
fn refused_initialization_leaves_no_module() {
    let manager = manager();
    let path = modules_dir().join("test_init_fail/init_fail.c");

    let err = manager.probe(&path).unwrap_err();
    assert!(matches!(err, LoadError::InitializationFailed { .. }));
    assert!(manager.is_empty());
    assert_eq!(manager.buffer_stats().live(), 0);
}

#[test]
#[ignore = "needs libtcc 0.9.27 (TCCMOD_LIBTCC)"]
fn unresolved_extern_fails_at_link_time() {
    let manager = manager();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("unresolved.c");
    let mut file = std::fs::File::create(&path).unwrap();
    writeln!(
        file,
        "extern int not_provided_by_host(void);\n\
         int module_init(void *record) {{ return not_provided_by_host(); }}"
    )
    .unwrap();
    drop(file);

    let err = manager.probe(&path).unwrap_err();
    assert!(
        matches!(err, LoadError::Sizing { .. } | LoadError::Relocation { .. }),
        "unexpected error: {err}"
    );
    assert!(err.to_string().contains("not_provided_by_host"));
    assert_eq!(manager.buffer_stats().live(), 0);
}
