pub mod debounce;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::RecvTimeoutError;
use notify::{EventKind, RecursiveMode, Watcher as _};
use regex::Regex;
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::context::Context;
use crate::supervisor::BIN_PREFIX;

use self::debounce::Debouncer;

/// Quiet window after the last accepted event before a rebuild fires.
pub const DEBOUNCE_INTERVAL: Duration = Duration::from_secs(2);

pub const DEFAULT_WATCHED_EXTENSIONS: &str = "go";
pub const DEFAULT_IGNORED_PATHS: &str = r"(/\.\w+)|(^\.)|(\.\w+$)";

#[derive(Error, Debug)]
pub enum WatchError {
    #[error("watch backend error: {0}")]
    Backend(#[from] notify::Error),

    #[error("bad watch pattern `{0}`: {1}")]
    BadPattern(String, #[source] regex::Error),
}

/// Flags shared between the watcher loop and the proxy's admin endpoints.
#[derive(Debug, Default)]
pub struct WatchFlags {
    paused: AtomicBool,
    changed: AtomicBool,
}

impl WatchFlags {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn mark_changed(&self) {
        self.changed.store(true, Ordering::SeqCst);
    }

    pub fn reset_changed(&self) {
        self.changed.store(false, Ordering::SeqCst);
    }

    pub fn has_changed(&self) -> bool {
        self.changed.load(Ordering::SeqCst)
    }
}

/// What drives rebuilds.
pub enum WatchMode {
    /// We compile the app ourselves; our own artifacts must not feed back
    /// into the watch stream.
    Compile,
    /// An external tool builds; only `tower-app-<ts>` artifacts matter, and
    /// only when strictly newer than the adopted one. The callback performs
    /// the compare-and-adopt against the supervisor's binary marker.
    Binary {
        adopt: Arc<dyn Fn(&str) -> bool + Send + Sync>,
    },
}

pub struct WatcherOptions {
    pub dirs: Vec<PathBuf>,
    /// Pipe-separated extension list, e.g. `go|html`.
    pub file_extension: String,
    /// Regular expression of paths to skip; empty uses the default.
    pub ignored_path: String,
    pub mode: WatchMode,
    pub debounce: Duration,
}

#[derive(Debug, PartialEq)]
enum Action {
    Ignore,
    AddDir(PathBuf),
    Changed(PathBuf),
}

pub struct FileWatcher {
    dirs: Vec<PathBuf>,
    file_re: Regex,
    bin_re: Regex,
    ignore_re: Regex,
    mode: WatchMode,
    debounce: Duration,
    flags: Arc<WatchFlags>,
}

impl FileWatcher {
    pub fn new(opts: WatcherOptions, flags: Arc<WatchFlags>) -> Result<Self, WatchError> {
        let extensions = if opts.file_extension.is_empty() {
            DEFAULT_WATCHED_EXTENSIONS.to_string()
        } else {
            opts.file_extension.clone()
        };
        let file_pattern = format!(r"\.({extensions})$");
        let file_re = Regex::new(&file_pattern)
            .map_err(|e| WatchError::BadPattern(file_pattern.clone(), e))?;

        let bin_pattern = format!(r"^{}\d+(\.exe)?$", regex::escape(BIN_PREFIX));
        let bin_re = Regex::new(&bin_pattern)
            .map_err(|e| WatchError::BadPattern(bin_pattern.clone(), e))?;

        let ignored = if opts.ignored_path.is_empty() {
            DEFAULT_IGNORED_PATHS.to_string()
        } else {
            opts.ignored_path.clone()
        };
        let ignore_re =
            Regex::new(&ignored).map_err(|e| WatchError::BadPattern(ignored.clone(), e))?;

        Ok(Self {
            dirs: opts.dirs,
            file_re,
            bin_re,
            ignore_re,
            mode: opts.mode,
            debounce: opts.debounce,
            flags,
        })
    }

    /// The per-event filtering pipeline, in order: pause gate, editor swap
    /// files, filename pattern, mode rules, then directory creations (which
    /// extend the watch set without triggering a rebuild).
    fn classify(&self, path: &Path, is_dir_create: bool) -> Action {
        if self.flags.is_paused() {
            return Action::Ignore;
        }

        let path_str = path.to_string_lossy().replace('\\', "/");
        if path_str.to_lowercase().ends_with(".tmp") {
            return Action::Ignore;
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        match &self.mode {
            WatchMode::Compile => {
                if !self.file_re.is_match(&path_str) {
                    return Action::Ignore;
                }
                if name.starts_with(BIN_PREFIX) {
                    return Action::Ignore;
                }
            }
            WatchMode::Binary { adopt } => {
                if !self.bin_re.is_match(&name) {
                    debug!(file = %path_str, "ignoring non-artifact change");
                    return Action::Ignore;
                }
                if !is_dir_create && !adopt(&name) {
                    return Action::Ignore;
                }
            }
        }

        if is_dir_create {
            if self.is_ignored(&path_str) {
                return Action::Ignore;
            }
            return Action::AddDir(path.to_path_buf());
        }

        Action::Changed(path.to_path_buf())
    }

    fn is_ignored(&self, path: &str) -> bool {
        self.ignore_re.is_match(path) || self.ignore_re.is_match(&format!("{path}/"))
    }

    /// Recursive walk of every root, skipping ignored directories; the walk
    /// result is the initial watch set.
    fn dirs_to_watch(&self) -> Vec<PathBuf> {
        let mut seen: HashSet<PathBuf> = HashSet::new();
        let mut dirs = Vec::new();

        for root in &self.dirs {
            let root = match root.canonicalize() {
                Ok(root) => root,
                Err(err) => {
                    warn!(dir = %root.display(), error = %err, "skipping unreadable watch root");
                    continue;
                }
            };
            if !root.is_dir() {
                continue;
            }

            let walker = WalkDir::new(&root).follow_links(false).into_iter();
            for entry in walker.filter_entry(|e| {
                e.file_type().is_dir()
                    && !self.is_ignored(&e.path().to_string_lossy().replace('\\', "/"))
            }) {
                match entry {
                    Ok(entry) => {
                        let path = entry.into_path();
                        if seen.insert(path.clone()) {
                            dirs.push(path);
                        }
                    }
                    Err(err) => warn!(error = %err, "walk error"),
                }
            }
        }

        dirs
    }

    /// Starts the OS watcher and the event loop on a dedicated thread.
    /// `on_changed` is invoked from that thread, once per debounced burst.
    pub fn spawn(
        self,
        ctx: Context,
        on_changed: Box<dyn Fn(PathBuf) + Send>,
    ) -> Result<JoinHandle<()>, WatchError> {
        let (tx, rx) = crossbeam::channel::unbounded();
        let mut os_watcher =
            notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| {
                let _ = tx.send(res);
            })?;

        let dirs = self.dirs_to_watch();
        if dirs.is_empty() {
            warn!("nothing to watch: no readable directories configured");
        }
        for dir in &dirs {
            match os_watcher.watch(dir, RecursiveMode::NonRecursive) {
                Ok(()) => debug!(dir = %dir.display(), "watching"),
                Err(err) => warn!(dir = %dir.display(), error = %err, "cannot watch directory"),
            }
        }

        const POLL: Duration = Duration::from_millis(250);

        Ok(thread::spawn(move || {
            let mut debouncer = Debouncer::new(self.debounce);

            while !ctx.is_cancelled() {
                let timeout = debouncer
                    .next_timeout(Instant::now())
                    .map(|t| t.min(POLL))
                    .unwrap_or(POLL);

                match rx.recv_timeout(timeout) {
                    Ok(Ok(event)) => {
                        let is_create = matches!(event.kind, EventKind::Create(_));
                        for path in &event.paths {
                            let is_dir_create = is_create && path.is_dir();
                            match self.classify(path, is_dir_create) {
                                Action::Ignore => {}
                                Action::AddDir(dir) => {
                                    match os_watcher.watch(&dir, RecursiveMode::NonRecursive) {
                                        Ok(()) => debug!(dir = %dir.display(), "watching new directory"),
                                        Err(err) => {
                                            warn!(dir = %dir.display(), error = %err, "cannot watch new directory")
                                        }
                                    }
                                }
                                Action::Changed(path) => {
                                    debug!(file = %path.display(), "accepted change event");
                                    debouncer.record(path, Instant::now());
                                }
                            }
                        }
                    }
                    Ok(Err(err)) => warn!(error = %err, "watch backend error"),
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }

                if let Some(path) = debouncer.due(Instant::now()) {
                    self.flags.mark_changed();
                    info!(file = %path.display(), "change detected");
                    on_changed(path);
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn compile_watcher(flags: Arc<WatchFlags>) -> FileWatcher {
        FileWatcher::new(
            WatcherOptions {
                dirs: Vec::new(),
                file_extension: "go|html".to_string(),
                ignored_path: r"/\.git".to_string(),
                mode: WatchMode::Compile,
                debounce: DEBOUNCE_INTERVAL,
            },
            flags,
        )
        .unwrap()
    }

    fn binary_watcher(
        flags: Arc<WatchFlags>,
        adopt: Arc<dyn Fn(&str) -> bool + Send + Sync>,
    ) -> FileWatcher {
        FileWatcher::new(
            WatcherOptions {
                dirs: Vec::new(),
                file_extension: String::new(),
                ignored_path: String::new(),
                mode: WatchMode::Binary { adopt },
                debounce: DEBOUNCE_INTERVAL,
            },
            flags,
        )
        .unwrap()
    }

    #[test]
    fn tmp_files_always_dropped() {
        let w = compile_watcher(WatchFlags::new());
        assert_eq!(
            Action::Ignore,
            w.classify(Path::new("/src/handler.go.TMP"), false)
        );
        assert_eq!(Action::Ignore, w.classify(Path::new("/src/x.tmp"), false));
    }

    #[test]
    fn extension_filter_applies() {
        let w = compile_watcher(WatchFlags::new());
        assert_eq!(
            Action::Changed(PathBuf::from("/src/handler.go")),
            w.classify(Path::new("/src/handler.go"), false)
        );
        assert_eq!(
            Action::Changed(PathBuf::from("/src/index.html")),
            w.classify(Path::new("/src/index.html"), false)
        );
        assert_eq!(Action::Ignore, w.classify(Path::new("/src/notes.md"), false));
    }

    #[test]
    fn own_artifacts_dropped_in_compile_mode() {
        let w = compile_watcher(WatchFlags::new());
        // artifact name that happens to match the extension list
        assert_eq!(
            Action::Ignore,
            w.classify(Path::new("/build/tower-app-1700000000.go"), false)
        );
    }

    #[test]
    fn paused_drops_everything() {
        let flags = WatchFlags::new();
        let w = compile_watcher(flags.clone());
        flags.pause();
        assert_eq!(Action::Ignore, w.classify(Path::new("/src/handler.go"), false));
        flags.resume();
        assert_eq!(
            Action::Changed(PathBuf::from("/src/handler.go")),
            w.classify(Path::new("/src/handler.go"), false)
        );
    }

    #[test]
    fn binary_mode_requires_artifact_prefix() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counting = calls.clone();
        let w = binary_watcher(
            WatchFlags::new(),
            Arc::new(move |_name: &str| {
                counting.fetch_add(1, Ordering::SeqCst);
                true
            }),
        );

        assert_eq!(Action::Ignore, w.classify(Path::new("/bin/server.go"), false));
        assert_eq!(0, calls.load(Ordering::SeqCst));

        assert_eq!(
            Action::Changed(PathBuf::from("/bin/tower-app-1700000001")),
            w.classify(Path::new("/bin/tower-app-1700000001"), false)
        );
        assert_eq!(1, calls.load(Ordering::SeqCst));
    }

    #[test]
    fn binary_mode_drops_stale_artifacts() {
        let w = binary_watcher(WatchFlags::new(), Arc::new(|_name: &str| false));
        assert_eq!(
            Action::Ignore,
            w.classify(Path::new("/bin/tower-app-100"), false)
        );
    }

    #[test]
    fn matching_dir_create_extends_watch_set_without_rebuild() {
        let w = compile_watcher(WatchFlags::new());
        assert_eq!(
            Action::AddDir(PathBuf::from("/src/pkg.go")),
            w.classify(Path::new("/src/pkg.go"), true)
        );
        assert_eq!(
            Action::Ignore,
            w.classify(Path::new("/src/.git/objects.go"), true)
        );
    }

    #[test]
    fn walk_skips_ignored_directories() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("src/sub")).unwrap();
        std::fs::create_dir_all(tmp.path().join(".git/objects")).unwrap();
        std::fs::write(tmp.path().join("src/main.go"), "package main").unwrap();

        let w = FileWatcher::new(
            WatcherOptions {
                dirs: vec![tmp.path().to_path_buf()],
                file_extension: "go".to_string(),
                ignored_path: r"/\.git".to_string(),
                mode: WatchMode::Compile,
                debounce: DEBOUNCE_INTERVAL,
            },
            WatchFlags::new(),
        )
        .unwrap();

        let dirs = w.dirs_to_watch();
        assert!(dirs.iter().any(|d| d.ends_with("src/sub")));
        assert!(!dirs.iter().any(|d| d.to_string_lossy().contains(".git")));
    }
}
