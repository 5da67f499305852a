pub mod error;

pub use self::error::SupervisorError;

use std::collections::{HashMap, HashSet};
use std::net::TcpStream;
use std::path::PathBuf;
use std::process::Command;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tracing::{debug, error, info, warn};

use crate::command::capture;
use crate::command::processrunner::{ProcessRunner, Started};
#[cfg(target_family = "unix")]
use crate::command::ProcessTerminator;
use crate::context::Context;
use crate::event::channel::pub_sub;
use crate::event::OutputEvent;
use crate::ports::{probe_is_free, PortPool};
use crate::sync::ResettableLatch;

/// Artifact names are `tower-app-<unix-seconds>`; the timestamp doubles as
/// the version marker compared in watch-only mode.
pub const BIN_PREFIX: &str = "tower-app-";

#[cfg(target_family = "windows")]
pub const EXE_SUFFIX: &str = ".exe";
#[cfg(not(target_family = "windows"))]
pub const EXE_SUFFIX: &str = "";

/// Consecutive automatic restarts before the proxy gives up and renders
/// the terminal error page.
pub const AUTO_RESTART_MAX_TIMES: u32 = 3;

const BUILD_TOOLCHAIN: &str = "go";
const DIAL_TIMEOUT: Duration = Duration::from_secs(60);
const ARTIFACT_REMOVE_ATTEMPTS: u32 = 10;
const ARTIFACT_REMOVE_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Stopped,
    Building,
    Starting,
    Running,
    Switching,
    Crashed,
}

pub struct SupervisorOptions {
    /// Project name, shown in logs.
    pub name: String,
    /// Source entry point (compile mode).
    pub main_file: String,
    /// Directory the toolchain runs in.
    pub root: PathBuf,
    /// Where artifacts land; empty means the working directory.
    pub build_dir: PathBuf,
    pub build_params: Vec<String>,
    pub run_params: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Flag name the child reads its listen port from, e.g. `-p`.
    pub port_param_name: String,
    /// Run the toolchain's code generation before each build.
    pub generate: bool,
    /// In-dev mode: reap draining children right after a successful swap.
    pub offline: bool,
    /// False selects watch-only mode: an external tool builds, we only swap.
    pub compile: bool,
    /// Adopted binary marker at boot. Compile mode stamps a fresh one per
    /// build; watch-only mode starts from the resolved `app.exec` name.
    pub initial_bin: String,
    pub ports: PortPool,
}

struct State {
    pool: PortPool,
    /// port → child. Authoritative for liveness: a present-but-exited entry
    /// for the current port is how a crash is observed.
    cmds: HashMap<String, ProcessRunner<Started>>,
    bin_files: HashMap<String, PathBuf>,
    current_port: String,
    /// Bare artifact name (no platform suffix) of the adopted binary.
    current_bin: String,
    phase: Phase,
    build_error: Option<String>,
    runtime_error: Option<String>,
    switch_pending: bool,
    restart_count: u32,
    stdin_listener_installed: bool,
}

/// Owns the child process lifecycle: at most one active child plus any
/// draining children superseded by a swap, the port pool, the binary
/// artifacts, and the last captured build/runtime errors.
pub struct Supervisor {
    name: String,
    main_file: String,
    root: PathBuf,
    build_dir: PathBuf,
    build_params: Vec<String>,
    run_params: Vec<String>,
    env: Vec<(String, String)>,
    port_param_name: String,
    generate: bool,
    offline: bool,
    compile: bool,

    state: Mutex<State>,
    start_latch: ResettableLatch<Result<(), SupervisorError>>,
    restart_latch: ResettableLatch<Result<(), SupervisorError>>,
    recover_latch: ResettableLatch<Result<(), SupervisorError>>,
    ctx: Context,
}

pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// `tower-app-1700000000[.exe]` → `1700000000`.
pub fn parse_bin_timestamp(name: &str) -> Option<i64> {
    let name = name.strip_prefix(BIN_PREFIX)?;
    let name = name.strip_suffix(".exe").unwrap_or(name);
    name.parse().ok()
}

/// Strips the platform suffix so markers compare by bare name.
pub fn trim_exe_suffix(name: &str) -> &str {
    name.strip_suffix(".exe").unwrap_or(name)
}

impl Supervisor {
    pub fn new(opts: SupervisorOptions, ctx: Context) -> Arc<Self> {
        let current_port = opts.ports.pick(|_| false, probe_is_free);
        Arc::new(Self {
            name: opts.name,
            main_file: opts.main_file,
            root: opts.root,
            build_dir: opts.build_dir,
            build_params: opts.build_params,
            run_params: opts.run_params,
            env: opts.env,
            port_param_name: opts.port_param_name,
            generate: opts.generate,
            offline: opts.offline,
            compile: opts.compile,
            state: Mutex::new(State {
                pool: opts.ports,
                cmds: HashMap::new(),
                bin_files: HashMap::new(),
                current_port,
                current_bin: opts.initial_bin,
                phase: Phase::Stopped,
                build_error: None,
                runtime_error: None,
                switch_pending: false,
                restart_count: 0,
                stdin_listener_installed: false,
            }),
            start_latch: ResettableLatch::new(),
            restart_latch: ResettableLatch::new(),
            recover_latch: ResettableLatch::new(),
            ctx,
        })
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn supports_multi_port(&self) -> bool {
        !self.port_param_name.is_empty() && self.state().pool.len() > 1
    }

    /// Path of the artifact `bin_name` on disk, platform suffix included.
    fn bin_path(&self, bin_name: &str) -> PathBuf {
        let file = format!("{bin_name}{EXE_SUFFIX}");
        if self.build_dir.as_os_str().is_empty() {
            PathBuf::from(file)
        } else {
            self.build_dir.join(file)
        }
    }

    /// Port rotation for the next swap; see [`PortPool::pick`].
    pub fn pick_port(&self) -> String {
        let mut st = self.state();
        let running: HashSet<String> = st
            .cmds
            .iter_mut()
            .filter_map(|(port, child)| child.is_running().then(|| port.clone()))
            .collect();
        st.pool.pick(|port| running.contains(port), probe_is_free)
    }

    /// Compiles the app into a freshly-stamped artifact. Any toolchain
    /// output is a build failure; it is stored for the error page and
    /// cleared again by the next successful build.
    pub fn build(&self) -> Result<(), SupervisorError> {
        if !self.compile {
            return Ok(());
        }
        self.state().phase = Phase::Building;
        info!(app = %self.name, "building");

        if self.generate {
            let output = Command::new(BUILD_TOOLCHAIN)
                .arg("generate")
                .arg("./...")
                .current_dir(&self.root)
                .output()
                .map_err(|e| SupervisorError::BuildFailed(e.to_string()))?;
            if !output.status.success() {
                let msg = String::from_utf8_lossy(&output.stderr).to_string();
                return self.fail_build(msg);
            }
        }

        let bin_name = format!("{BIN_PREFIX}{}", unix_now());
        self.state().current_bin = bin_name.clone();
        let bin_path = self.bin_path(&bin_name);

        let output = Command::new(BUILD_TOOLCHAIN)
            .arg("build")
            .arg("-o")
            .arg(&bin_path)
            .args(&self.build_params)
            .arg(&self.main_file)
            .current_dir(&self.root)
            .output()
            .map_err(|e| SupervisorError::BuildFailed(e.to_string()))?;

        let mut msg = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        msg = msg.replacen("# command-line-arguments\n", "", 1);

        if !output.status.success() || !msg.trim().is_empty() {
            error!(app = %self.name, "build failed:\n{msg}");
            return self.fail_build(msg);
        }

        self.state().build_error = None;
        info!(app = %self.name, "build completed");
        Ok(())
    }

    fn fail_build(&self, msg: String) -> Result<(), SupervisorError> {
        let mut st = self.state();
        st.build_error = Some(msg.clone());
        st.phase = Phase::Crashed;
        Err(SupervisorError::BuildFailed(msg))
    }

    /// Builds (optionally) and runs the app. Concurrent callers coalesce
    /// into one build+run and all observe the same result.
    pub fn start(
        self: &Arc<Self>,
        build: bool,
        port: Option<String>,
    ) -> Result<(), SupervisorError> {
        let me = Arc::clone(self);
        self.start_latch.coalesce(move || {
            if build {
                me.build()?;
            }
            let port = port.unwrap_or_else(|| me.current_port());
            me.run(&port)?;
            me.install_stdin_listener();
            Ok(())
        })
    }

    /// Launches the adopted artifact on `port` and dials it until reachable
    /// (up to 60s), bailing early if the child dies first. On success the
    /// port becomes current; a changed port arms `switch_pending` and, in
    /// offline mode, schedules cleanup of the superseded children.
    pub fn run(self: &Arc<Self>, port: &str) -> Result<(), SupervisorError> {
        let bin_name = self.state().current_bin.clone();
        let bin = self.bin_path(&bin_name);
        if !bin.exists() {
            return Err(SupervisorError::MissingArtifact(
                bin.to_string_lossy().to_string(),
            ));
        }

        info!(app = %self.name, port, "running");

        let mut args: Vec<String> = Vec::new();
        if self.supports_multi_port() {
            args.push(self.port_param_name.clone());
            args.push(port.to_string());
        }
        args.extend(self.run_params.iter().cloned());

        let mut child = ProcessRunner::new(&bin, &args)
            .with_envs(&self.env)
            .start()
            .map_err(|e| SupervisorError::RunFailed(e.to_string()))?;

        // stdout lines go to our log; stderr runs through the panic capturer
        let (tx, rx) = pub_sub();
        if let Ok(_reader) = child.stream_stdout(tx) {
            let app = self.name.clone();
            thread::spawn(move || {
                for event in rx.iter() {
                    if let OutputEvent::Stdout(line) = event {
                        info!(app = %app, "{line}");
                    }
                }
            });
        }
        if let Ok(stderr) = child.take_stderr() {
            let me = Arc::clone(self);
            capture::spawn_capturer(stderr, move |text| {
                me.state().runtime_error = Some(text);
            });
        }

        let able_switch;
        {
            let mut st = self.state();
            able_switch = st.current_port != port;
            st.phase = Phase::Starting;
            st.bin_files.insert(port.to_string(), bin.clone());
            st.pool.mark_used(port, unix_now());
            st.cmds.insert(port.to_string(), child);
        }

        self.dial(port)?;

        {
            let mut st = self.state();
            st.current_port = port.to_string();
            st.phase = if able_switch {
                st.switch_pending = true;
                Phase::Switching
            } else {
                Phase::Running
            };
            st.restart_count = 0;
        }

        if able_switch && self.offline {
            let me = Arc::clone(self);
            let keep = port.to_string();
            thread::spawn(move || me.clean(Some(&keep)));
        }
        Ok(())
    }

    fn dial(self: &Arc<Self>, port: &str) -> Result<(), SupervisorError> {
        let addr = format!("127.0.0.1:{port}");
        let deadline = Instant::now() + DIAL_TIMEOUT;

        loop {
            if self.ctx.is_cancelled() {
                return Err(SupervisorError::ShuttingDown);
            }
            if let Ok(sock) = addr.parse() {
                if TcpStream::connect_timeout(&sock, Duration::from_secs(1)).is_ok() {
                    return Ok(());
                }
            }
            {
                let mut st = self.state();
                match st.cmds.get_mut(port) {
                    Some(child) => {
                        if let Ok(Some(status)) = child.try_wait() {
                            if !status.success() {
                                st.phase = Phase::Crashed;
                                return Err(SupervisorError::EarlyExit(status.to_string()));
                            }
                        }
                    }
                    None => {
                        return Err(SupervisorError::RunFailed(
                            "child vanished during startup".to_string(),
                        ))
                    }
                }
            }
            if Instant::now() >= deadline {
                self.state().phase = Phase::Crashed;
                return Err(SupervisorError::DialTimeout(port.to_string()));
            }
            debug!(addr = %addr, "not reachable yet, retrying");
            self.ctx.wait_timeout(Duration::from_secs(1));
        }
    }

    /// Kills the child on `port` and removes its artifact, retrying the
    /// removal in the background to tolerate transient file locks. The
    /// pool timestamp is released once the artifact is gone.
    pub fn stop(self: &Arc<Self>, port: &str) {
        let (mut child, bin, skip_artifact) = {
            let mut st = self.state();
            let alive = st
                .cmds
                .get_mut(port)
                .map(|child| child.is_running())
                .unwrap_or(false);
            if !alive {
                return;
            }
            let Some(child) = st.cmds.remove(port) else {
                return;
            };
            let bin = st.bin_files.get(port).cloned();
            // in watch-only mode the adopted binary is not ours to delete
            let skip_artifact = !self.compile && port == st.current_port;
            (child, bin, skip_artifact)
        };

        info!(app = %self.name, port, "stopping");

        #[cfg(target_family = "unix")]
        if let Some(pid) = child.pid() {
            let _ = ProcessTerminator::new(pid).shutdown(|| !child.is_running());
        }
        #[cfg(not(target_family = "unix"))]
        {
            let _ = child.kill();
        }
        let _ = child.wait();

        if skip_artifact {
            return;
        }
        if let Some(bin) = bin {
            self.remove_artifact(port.to_string(), bin);
        }
    }

    fn remove_artifact(self: &Arc<Self>, port: String, bin: PathBuf) {
        match std::fs::remove_file(&bin) {
            Ok(()) => {
                let mut st = self.state();
                st.pool.release(&port);
                st.bin_files.remove(&port);
            }
            Err(first_err) => {
                warn!(bin = %bin.display(), error = %first_err, "artifact removal failed, retrying");
                let me = Arc::clone(self);
                thread::spawn(move || {
                    for _ in 0..ARTIFACT_REMOVE_ATTEMPTS {
                        if me.ctx.wait_timeout(ARTIFACT_REMOVE_DELAY) {
                            return;
                        }
                        match std::fs::remove_file(&bin) {
                            Ok(()) => {
                                info!(bin = %bin.display(), "artifact removed");
                                let mut st = me.state();
                                st.pool.release(&port);
                                st.bin_files.remove(&port);
                                return;
                            }
                            Err(err) => {
                                warn!(bin = %bin.display(), error = %err, "artifact removal failed")
                            }
                        }
                    }
                });
            }
        }
    }

    /// Stops every live child except the excluded port (default: current).
    pub fn clean(self: &Arc<Self>, exclude: Option<&str>) {
        let keep = exclude
            .map(str::to_string)
            .unwrap_or_else(|| self.current_port());
        let targets: Vec<String> = {
            let mut st = self.state();
            st.cmds
                .iter_mut()
                .filter_map(|(port, child)| {
                    (*port != keep && child.is_running()).then(|| port.clone())
                })
                .collect()
        };
        for port in targets {
            info!(port = %port, "stopping superseded app");
            self.stop(&port);
        }
    }

    /// Full serialized restart: clean, stop the current child, rebuild and
    /// run again. A burst of restart requests executes once.
    pub fn restart(self: &Arc<Self>) -> Result<(), SupervisorError> {
        let me = Arc::clone(self);
        self.restart_latch.coalesce(move || {
            me.clean(None);
            let current = me.current_port();
            me.stop(&current);
            me.start(true, None)
        })
    }

    /// Crash recovery driven by the proxy: up to three consecutive
    /// stop→clean→pick→start(build) rounds; exhausted retries stay
    /// exhausted until a file change resets the counter.
    pub fn recover(self: &Arc<Self>) -> Result<(), SupervisorError> {
        let me = Arc::clone(self);
        self.recover_latch.coalesce(move || {
            loop {
                {
                    let mut st = me.state();
                    if st.restart_count >= AUTO_RESTART_MAX_TIMES {
                        return Err(SupervisorError::RestartExhausted);
                    }
                    st.restart_count += 1;
                    st.phase = Phase::Crashed;
                }
                let current = me.current_port();
                me.stop(&current);
                me.clean(None);
                let port = me.pick_port();
                match me.start(true, Some(port)) {
                    Ok(()) => return Ok(()),
                    Err(err) => {
                        warn!(error = %err, "automatic restart failed");
                    }
                }
                if me.ctx.is_cancelled() {
                    return Err(SupervisorError::ShuttingDown);
                }
            }
        })
    }

    /// Watch-only mode: adopt `name` when its embedded timestamp is
    /// strictly newer than the current binary's.
    pub fn adopt_binary(&self, name: &str) -> bool {
        let Some(new_ts) = parse_bin_timestamp(name) else {
            return false;
        };
        let mut st = self.state();
        let current_ts = parse_bin_timestamp(&st.current_bin).unwrap_or(0);
        if new_ts <= current_ts {
            debug!(artifact = name, "artifact not newer than adopted binary");
            return false;
        }
        st.current_bin = trim_exe_suffix(name).to_string();
        info!(artifact = name, "adopted new binary");
        true
    }

    /// Deletes stale artifacts left over from previous runs.
    pub fn auto_clear(&self) {
        let dir = if self.build_dir.as_os_str().is_empty() {
            PathBuf::from(".")
        } else {
            self.build_dir.clone()
        };
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return;
        };
        for entry in entries.filter_map(Result::ok) {
            let name = entry.file_name().to_string_lossy().to_string();
            if parse_bin_timestamp(&name).is_some() {
                match std::fs::remove_file(entry.path()) {
                    Ok(()) => info!(artifact = %name, "removed stale artifact"),
                    Err(err) => warn!(artifact = %name, error = %err, "cannot remove stale artifact"),
                }
            }
        }
    }

    /// Graceful shutdown: stop the current child (removing its artifact)
    /// and reap any draining children.
    pub fn shutdown(self: &Arc<Self>) {
        self.state().phase = Phase::Stopped;
        let current = self.current_port();
        self.stop(&current);
        self.clean(Some(&current));
    }

    /// Pressing return on a blank line restarts the app; installed once
    /// per supervisor lifetime after the first successful start.
    fn install_stdin_listener(self: &Arc<Self>) {
        {
            let mut st = self.state();
            if st.stdin_listener_installed {
                return;
            }
            st.stdin_listener_installed = true;
        }
        let me = Arc::clone(self);
        thread::spawn(move || {
            let stdin = std::io::stdin();
            let mut input = String::new();
            loop {
                input.clear();
                match std::io::BufRead::read_line(&mut stdin.lock(), &mut input) {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {
                        if input == "\n" {
                            if let Err(err) = me.restart() {
                                error!(error = %err, "restart failed");
                            }
                        }
                    }
                }
            }
        });
    }

    // view accessors, used by the proxy

    pub fn current_port(&self) -> String {
        self.state().current_port.clone()
    }

    pub fn phase(&self) -> Phase {
        self.state().phase
    }

    /// Is the current child alive?
    pub fn is_alive(&self) -> bool {
        let mut st = self.state();
        let port = st.current_port.clone();
        st.cmds
            .get_mut(&port)
            .map(|child| child.is_running())
            .unwrap_or(false)
    }

    /// Has the current child exited underneath us? Distinct from "never
    /// started" and from a deliberate stop, both of which clear the entry.
    pub fn is_quit(&self) -> bool {
        let mut st = self.state();
        let port = st.current_port.clone();
        st.cmds
            .get_mut(&port)
            .map(|child| !child.is_running())
            .unwrap_or(false)
    }

    /// Single read-and-clear of the swap flag: exactly one caller observes
    /// the pending switch and completes it.
    pub fn take_switch_pending(&self) -> bool {
        let mut st = self.state();
        if st.switch_pending {
            st.switch_pending = false;
            st.phase = Phase::Running;
            true
        } else {
            false
        }
    }

    pub fn build_error(&self) -> Option<String> {
        self.state().build_error.clone()
    }

    pub fn runtime_error(&self) -> Option<String> {
        self.state().runtime_error.clone()
    }

    pub fn clear_runtime_error(&self) {
        self.state().runtime_error = None;
    }

    /// A file change gives crashed apps a fresh automatic-restart budget.
    pub fn reset_restart_count(&self) {
        self.state().restart_count = 0;
    }
}
