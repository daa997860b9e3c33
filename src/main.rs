//! tccmod 명령행 도구
//!
//! - check: 모듈을 로드했다가 바로 해제 (컴파일/엔트리 검사)
//! - run: 로드 → 활성화 → 비활성화 → 해제
//! - shell: insmod / rmmod / lsmod 대화형 셸

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use tccmod::compiler::tcc::{TccOptions, TccToolchain};
use tccmod::config::LoaderConfig;
use tccmod::log::{self as logging, LogLevel, LogRing};
use tccmod::module::{HookOutcome, ModuleInfo, ModuleManager};

type Manager = ModuleManager<TccToolchain>;

#[derive(Debug, Parser)]
#[command(name = "tccmod", version, about = "Compile C modules in memory and drive their lifecycle")]
struct Cli {
    /// TOML 설정 파일
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// 호스트 검색 루트 (반복 가능)
    #[arg(long = "root", global = true)]
    roots: Vec<PathBuf>,

    /// 추가 include 디렉토리
    #[arg(short = 'I', long = "include", global = true)]
    includes: Vec<PathBuf>,

    /// libtcc 공유 라이브러리 경로
    #[arg(long, global = true)]
    libtcc: Option<PathBuf>,

    /// libtcc 런타임 디렉토리
    #[arg(long, global = true)]
    tcc_dir: Option<PathBuf>,

    /// 로그 레벨 (error, warn, info, debug, trace 또는 0-4)
    #[arg(long, global = true)]
    log_level: Option<LogLevel>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Load each module and destroy it again
    Check {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Load, activate, deactivate and destroy each module
    Run {
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Stop after loading
        #[arg(long)]
        no_activate: bool,
    },
    /// Interactive module shell
    Shell,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("tccmod: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let mut config = match &cli.config {
        Some(path) => LoaderConfig::load(path)?,
        None => LoaderConfig::default(),
    };
    config.roots.extend(cli.roots);
    config.include_paths.extend(cli.includes);
    if cli.libtcc.is_some() {
        config.libtcc = cli.libtcc;
    }
    if cli.tcc_dir.is_some() {
        config.tcc_dir = cli.tcc_dir;
    }

    let level = match cli.log_level {
        Some(level) => level,
        None => config
            .log_level
            .as_deref()
            .map(str::parse::<LogLevel>)
            .transpose()?
            .unwrap_or(LogLevel::Info),
    };
    let ring = logging::init(level);

    let toolchain = TccToolchain::open(TccOptions {
        library: config.libtcc.clone(),
        tcc_dir: config.tcc_dir.clone(),
        options: config.compiler_options.clone(),
    })
    .context("cannot open libtcc")?;
    tracing::info!("Using libtcc from {}", toolchain.library_path());

    let manager = ModuleManager::new(toolchain, config.search_configuration())
        .with_extension(&config.extension);

    let code = match cli.command {
        Command::Check { files } => check(&manager, &files),
        Command::Run { files, no_activate } => run_files(&manager, &files, !no_activate),
        Command::Shell => {
            shell(&manager, &ring)?;
            ExitCode::SUCCESS
        }
    };

    manager.destroy_all();
    Ok(code)
}

fn check(manager: &Manager, files: &[PathBuf]) -> ExitCode {
    let mut failures = 0;
    for path in files {
        match manager.probe(path) {
            Ok(info) => {
                println!("ok   {}: {} ({} bytes)", path.display(), info.name, info.image_size);
                if let Err(err) = manager.destroy(&info.id) {
                    println!("FAIL {}: {err}", path.display());
                    failures += 1;
                }
            }
            Err(err) => {
                println!("FAIL {err}");
                failures += 1;
            }
        }
    }
    exit_code(failures)
}

fn run_files(manager: &Manager, files: &[PathBuf], activate: bool) -> ExitCode {
    let mut failures = 0;
    for path in files {
        let info = match manager.probe(path) {
            Ok(info) => info,
            Err(err) => {
                println!("FAIL {err}");
                failures += 1;
                continue;
            }
        };

        if activate {
            match manager.activate(&info.id) {
                Ok(()) => {
                    if let Ok(HookOutcome::Failed) = manager.deactivate(&info.id) {
                        println!("warn {}: unload hook reported failure", path.display());
                    }
                }
                Err(err) => {
                    println!("FAIL {err}");
                    failures += 1;
                }
            }
        }

        if let Err(err) = manager.destroy(&info.id) {
            println!("FAIL {err}");
            failures += 1;
        } else {
            println!("ok   {}", path.display());
        }
    }
    exit_code(failures)
}

fn exit_code(failures: usize) -> ExitCode {
    if failures == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn shell(manager: &Manager, ring: &LogRing) -> Result<()> {
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut line = String::new();

    loop {
        write!(stdout, "tccmod> ")?;
        stdout.flush()?;

        line.clear();
        if stdin.lock().read_line(&mut line)? == 0 {
            println!();
            return Ok(());
        }

        let cmd = line.trim();
        if cmd.is_empty() {
            continue;
        }

        let parts: Vec<&str> = cmd.split_whitespace().collect();
        match parts.first().copied() {
            Some("help") => {
                println!("Available commands:");
                println!("  insmod <path>       - Compile and load a module");
                println!("  rmmod <name>        - Destroy a module");
                println!("  lsmod               - List loaded modules");
                println!("  modinfo <name>      - Show module details");
                println!("  activate <name>     - Call the module's load hook");
                println!("  deactivate <name>   - Call the module's unload hook");
                println!("  dmesg               - Display the log ring buffer");
                println!("  exit                - Destroy all modules and quit");
            }
            Some("insmod") => match parts.get(1) {
                Some(path) => match manager.probe(Path::new(path)) {
                    Ok(info) => println!("Module '{}' loaded ({} bytes)", info.name, info.image_size),
                    Err(err) => println!("Failed to load module: {err}"),
                },
                None => println!("Usage: insmod <path>"),
            },
            Some("rmmod") => with_module(manager, parts.get(1), "rmmod", |id| {
                manager.destroy(id).map(|()| format!("Module '{}' unloaded", id))
            }),
            Some("activate") => with_module(manager, parts.get(1), "activate", |id| {
                manager.activate(id).map(|()| format!("Module '{}' activated", id))
            }),
            Some("deactivate") => with_module(manager, parts.get(1), "deactivate", |id| {
                manager.deactivate(id).map(|outcome| match outcome {
                    HookOutcome::Succeeded => format!("Module '{}' deactivated", id),
                    HookOutcome::Absent => format!("Module '{}' has no unload hook", id),
                    HookOutcome::Skipped => format!("Module '{}' is not active", id),
                    HookOutcome::Failed => format!("Unload hook of '{}' reported failure", id),
                })
            }),
            Some("lsmod") => {
                let modules = manager.list();
                if modules.is_empty() {
                    println!("No modules loaded");
                } else {
                    println!("Loaded modules:");
                    for info in modules {
                        println!("  - {:<16} {:<10} {}", info.name, info.state.as_str(), info.id);
                    }
                }
            }
            Some("modinfo") => match parts.get(1).and_then(|name| manager.find(name)) {
                Some(id) => match manager.info(&id) {
                    Some(info) => print_info(&info),
                    None => println!("Module '{}' not found", id),
                },
                None => println!("Usage: modinfo <name> (see lsmod)"),
            },
            Some("dmesg") => print!("{}", ring.dump()),
            Some("exit") | Some("quit") => return Ok(()),
            Some(unknown) => println!("Unknown command: {unknown} (try 'help')"),
            None => {}
        }
    }
}

fn with_module<F>(manager: &Manager, name: Option<&&str>, usage: &str, action: F)
where
    F: FnOnce(&tccmod::ModuleId) -> Result<String, tccmod::LoadError>,
{
    let Some(name) = name else {
        println!("Usage: {usage} <name>");
        return;
    };
    let Some(id) = manager.find(name) else {
        println!("Module '{name}' not found");
        return;
    };
    match action(&id) {
        Ok(message) => println!("{message}"),
        Err(err) => println!("Failed: {err}"),
    }
}

fn print_info(info: &ModuleInfo) {
    println!("name:       {}", info.name);
    println!("path:       {}", info.id);
    if let Some(version) = &info.version {
        println!("version:    {version}");
    }
    if let Some(summary) = &info.summary {
        println!("summary:    {summary}");
    }
    println!("state:      {}", info.state.as_str());
    println!("image size: {} bytes", info.image_size);
    println!(
        "hooks:      load={} unload={} destroy={}",
        info.hooks.load, info.hooks.unload, info.hooks.destroy
    );
}
