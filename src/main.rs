use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tracing::{error, info};
use walkdir::WalkDir;

use watchtower::cli::{Cli, Command};
use watchtower::config::loader::{ConfigError, ConfigLoader, ConfigLoaderFile};
use watchtower::config::params::{expand_env, parse_args, parse_env_entries};
use watchtower::config::{Config, DEFAULT_CONFIG_FILE, EXAMPLE_CONFIG};
use watchtower::context::Context;
use watchtower::logging::{Logging, LoggingError};
use watchtower::ports::{probe_is_free, PortError, PortPool};
use watchtower::proxy::engine::Engine;
use watchtower::proxy::{self, Proxy, ProxyConfig, ProxyError, SupervisorBackend};
use watchtower::render::ErrorRenderer;
use watchtower::supervisor::{
    parse_bin_timestamp, trim_exe_suffix, unix_now, Supervisor, SupervisorOptions, BIN_PREFIX,
};
use watchtower::watcher::{
    FileWatcher, WatchError, WatchFlags, WatchMode, WatcherOptions, DEBOUNCE_INTERVAL,
};

#[derive(Error, Debug)]
enum BootError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Logging(#[from] LoggingError),

    #[error("invalid app.port: {0}")]
    Ports(#[from] PortError),

    #[error(transparent)]
    Watch(#[from] WatchError),

    #[error("port ({0}) already in use")]
    ProxyPortInUse(String),

    #[error("one of app.main (compile mode) or app.exec (watch-only mode) must be set")]
    NoAppConfigured,

    #[error("app.exec must name a `{BIN_PREFIX}<timestamp>` binary, got `{0}`")]
    BadExecName(String),

    #[error("no binary matches app.exec glob `{0}`")]
    ExecNotFound(String),

    #[error(transparent)]
    Proxy(#[from] ProxyError),

    #[error("signal handler error: {0}")]
    Signal(#[from] ctrlc::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

fn main() {
    let cli = Cli::init_cli();

    if let Some(Command::Init) = cli.command {
        if let Err(err) = std::fs::write(DEFAULT_CONFIG_FILE, EXAMPLE_CONFIG) {
            eprintln!("cannot write {DEFAULT_CONFIG_FILE}: {err}");
            std::process::exit(2);
        }
        println!("generated config file {DEFAULT_CONFIG_FILE}");
        return;
    }

    if let Err(err) = run(cli) {
        error!("{err}");
        eprintln!("{err}");
        let code = match err {
            BootError::ProxyPortInUse(_) | BootError::Proxy(ProxyError::Bind(_, _)) => 1,
            _ => 2,
        };
        std::process::exit(code);
    }
}

fn run(cli: Cli) -> Result<(), BootError> {
    let mut config = load_config(&cli)?;
    cli.apply_overrides(&mut config);

    Logging::try_init(config.effective_log_level())?;

    if !config.app.pkg_mirrors.is_empty() {
        info!("app.pkgMirrors is accepted for compatibility but ignored");
    }

    // compile mode when a source entry point is given, otherwise watch-only
    let compile = !config.app.main.is_empty();
    if !compile && config.app.exec.is_empty() {
        return Err(BootError::NoAppConfigured);
    }

    let build_dir = PathBuf::from(&config.app.build_dir);
    let initial_bin = if compile {
        format!("{BIN_PREFIX}{}", unix_now())
    } else {
        resolve_exec_binary(&config.app.exec, &build_dir)?
    };

    // the public port must be ours before anything else starts
    if !probe_is_free(&config.proxy.port) {
        return Err(BootError::ProxyPortInUse(config.proxy.port.clone()));
    }

    let ports = PortPool::parse(&config.app.port)?;

    let root = if compile {
        Path::new(&config.app.main)
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    } else {
        PathBuf::from(".")
    };

    let name = std::env::current_dir()
        .ok()
        .and_then(|wd| wd.file_name().map(|n| n.to_string_lossy().to_string()))
        .unwrap_or_else(|| "app".to_string());

    let build_params = split_params(&config.app.build_params);
    let run_params = split_params(&config.app.run_params);

    let ctx = Context::new();
    let supervisor = Supervisor::new(
        SupervisorOptions {
            name,
            main_file: config.app.main.clone(),
            root: root.clone(),
            build_dir: build_dir.clone(),
            build_params,
            run_params,
            env: parse_env_entries(&config.app.env),
            port_param_name: config.app.port_param_name.clone(),
            generate: config.app.generate,
            offline: config.offline,
            compile,
            initial_bin,
            ports,
        },
        ctx.clone(),
    );

    if config.auto_clear && compile {
        supervisor.auto_clear();
    }

    // watcher wiring
    let flags = WatchFlags::new();
    let mode = if compile {
        WatchMode::Compile
    } else {
        let sup = supervisor.clone();
        WatchMode::Binary {
            adopt: Arc::new(move |artifact: &str| sup.adopt_binary(artifact)),
        }
    };
    let mut watch_dirs: Vec<PathBuf> = Vec::new();
    if compile {
        watch_dirs.push(root);
    } else if build_dir.as_os_str().is_empty() {
        watch_dirs.push(PathBuf::from("."));
    } else {
        watch_dirs.push(build_dir.clone());
    }
    for dir in config.watch.other_dir.split('|').filter(|d| !d.is_empty()) {
        watch_dirs.push(PathBuf::from(dir));
    }

    let watcher = FileWatcher::new(
        WatcherOptions {
            dirs: watch_dirs,
            file_extension: config.watch.file_extension.clone(),
            ignored_path: config.watch.ignored_path.clone(),
            mode,
            debounce: DEBOUNCE_INTERVAL,
        },
        flags.clone(),
    )?;

    let on_changed = {
        let sup = supervisor.clone();
        let flags = flags.clone();
        move |file: PathBuf| on_change(&sup, &flags, &file)
    };
    let watcher_handle = watcher.spawn(ctx.clone(), Box::new(on_changed))?;

    // SIGINT/SIGTERM shut the whole system down cleanly
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let shutdown_tx = Mutex::new(Some(shutdown_tx));
    ctrlc::set_handler({
        let ctx = ctx.clone();
        let sup = supervisor.clone();
        move || {
            info!("shutting down");
            ctx.cancel();
            sup.shutdown();
            if let Ok(mut guard) = shutdown_tx.lock() {
                if let Some(tx) = guard.take() {
                    let _ = tx.send(());
                }
            }
        }
    })?;

    // first start; failures surface on the next request as an error page
    if let Err(err) = supervisor.start(true, None) {
        error!(error = %err, "initial start failed");
    }

    let request_timeout = match config.proxy.request_timeout {
        0 => None,
        secs => Some(Duration::from_secs(secs)),
    };
    let renderer = ErrorRenderer::new(
        std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
    );
    let proxy = Proxy::new(
        ProxyConfig {
            listen_ip: config.proxy.ip.clone(),
            listen_port: config.proxy.port.clone(),
            engine: Engine::parse(&config.proxy.engine),
            request_timeout,
            log_request: config.log_request,
            admin_password: config.admin.password.clone(),
            admin_ips: config.admin_ips(),
        },
        Arc::new(SupervisorBackend(supervisor.clone())),
        flags,
        renderer,
    );

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(proxy::serve(proxy, shutdown_rx))?;

    ctx.cancel();
    let _ = watcher_handle.join();
    info!("bye");
    Ok(())
}

fn load_config(cli: &Cli) -> Result<Config, BootError> {
    match ConfigLoaderFile::new(Path::new(&cli.config)).load() {
        Ok(config) => Ok(config),
        // the default config file is optional; flags and defaults suffice
        Err(ConfigError::Io(_, _)) if cli.config == DEFAULT_CONFIG_FILE => {
            Ok(Config::default())
        }
        Err(err) => Err(err.into()),
    }
}

fn split_params(raw: &str) -> Vec<String> {
    parse_args(raw).into_iter().map(|a| expand_env(&a)).collect()
}

/// The watcher fires at most once per debounced burst; swap to a different
/// port, cleaning up to three times if the pool is congested.
fn on_change(sup: &Arc<Supervisor>, flags: &Arc<WatchFlags>, file: &Path) {
    flags.reset_changed();
    sup.reset_restart_count();

    if !sup.supports_multi_port() {
        error!("no switchable ports configured (app.port / app.portParamName), cannot swap");
        return;
    }

    let mut port = sup.pick_port();
    for _ in 0..3 {
        if port != sup.current_port() {
            break;
        }
        sup.clean(None);
        std::thread::sleep(Duration::from_secs(1));
        port = sup.pick_port();
    }
    if port == sup.current_port() {
        error!(port = %port, "picked port equals the current one, cannot swap");
        return;
    }

    info!(file = %file.display(), port = %port, "rebuilding");
    if let Err(err) = sup.start(true, Some(port)) {
        error!(error = %err, "rebuild failed");
    }
}

/// Watch-only mode: resolve `app.exec` (optionally a `*` glob) to a
/// `tower-app-<timestamp>` artifact and return its bare marker name.
fn resolve_exec_binary(exec: &str, build_dir: &Path) -> Result<String, BootError> {
    let mut resolved = exec.to_string();

    if exec.contains('*') {
        resolved = match find_bin_file(Path::new(exec)) {
            Some(found) => found,
            None if !build_dir.as_os_str().is_empty() => {
                find_bin_file(&build_dir.join(exec))
                    .ok_or_else(|| BootError::ExecNotFound(exec.to_string()))?
            }
            None => return Err(BootError::ExecNotFound(exec.to_string())),
        };
    }

    let base = Path::new(&resolved)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| resolved.clone());
    let bare = trim_exe_suffix(&base).to_string();
    if parse_bin_timestamp(&bare).is_none() {
        return Err(BootError::BadExecName(base));
    }
    Ok(bare)
}

/// Finds the first file under the pattern's directory whose name matches
/// `<prefix>*<suffix>`.
fn find_bin_file(pattern: &Path) -> Option<String> {
    let file = pattern.file_name()?.to_string_lossy().to_string();
    let (prefix, suffix) = file.split_once('*')?;
    let dir = match pattern.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };

    for entry in WalkDir::new(&dir).into_iter().filter_map(Result::ok) {
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with(prefix) && name.ends_with(suffix) {
            return Some(entry.path().to_string_lossy().to_string());
        }
    }
    None
}
