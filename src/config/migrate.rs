use std::collections::HashMap;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{info, warn};

use super::Config;

#[derive(Error, Debug)]
pub enum MigrateError {
    #[error("error parsing legacy config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("error backing up legacy config to `{0}`: {1}")]
    Backup(PathBuf, #[source] std::io::Error),

    #[error("error writing migrated config: {0}")]
    Write(#[source] std::io::Error),
}

/// Keys of the legacy flat format. A file qualifies for migration only when
/// it parses as a flat string map and carries at least one of these, so a
/// current-format file (which parses as nested sections) is never touched
/// twice.
const LEGACY_KEYS: &[&str] = &[
    "app_port",
    "pxy_port",
    "pxy_engine",
    "auto_clear",
    "log_level",
    "log_request",
    "app_buildDir",
    "app_portParamName",
    "app_runParams",
    "watch",
    "watch_otherDir",
    "watch_ignoredPath",
    "offline_mode",
    "admin_pwd",
    "admin_ip",
    "main",
    "exec",
];

pub fn looks_legacy(contents: &str) -> bool {
    let Ok(flat) = serde_yaml::from_str::<HashMap<String, serde_yaml::Value>>(contents) else {
        return false;
    };
    flat.values().all(|v| !v.is_mapping())
        && flat.keys().any(|k| LEGACY_KEYS.contains(&k.as_str()))
}

/// Converts a legacy flat map into the nested [`Config`], starting from
/// defaults so absent keys keep their current meaning.
pub fn convert(flat: &HashMap<String, String>) -> Config {
    let mut config = Config::default();

    let get = |key: &str| flat.get(key).cloned();

    if let Some(v) = get("app_port") {
        config.app.port = v;
    }
    if let Some(v) = get("pxy_port") {
        config.proxy.port = v;
    }
    if let Some(v) = get("pxy_engine") {
        config.proxy.engine = v;
    }
    if let Some(v) = get("auto_clear") {
        config.auto_clear = atob(&v);
    }
    if let Some(v) = get("log_level") {
        config.log_level = v;
    }
    if let Some(v) = get("log_request") {
        config.log_request = atob(&v);
    }
    if let Some(v) = get("app_buildDir") {
        config.app.build_dir = v;
    }
    if let Some(v) = get("app_portParamName") {
        config.app.port_param_name = v;
    }
    if let Some(v) = get("app_runParams") {
        config.app.run_params = v;
    }
    if let Some(v) = get("watch") {
        config.watch.file_extension = v;
    }
    if let Some(v) = get("watch_otherDir") {
        config.watch.other_dir = v;
    }
    if let Some(v) = get("watch_ignoredPath") {
        config.watch.ignored_path = v;
    }
    if let Some(v) = get("offline_mode") {
        config.offline = atob(&v);
    }
    if let Some(v) = get("admin_pwd") {
        config.admin.password = v;
    }
    if let Some(v) = get("admin_ip") {
        config.admin.ips = v;
    }
    if let Some(v) = get("main") {
        config.app.main = v;
    }
    if let Some(v) = get("exec") {
        config.app.exec = v;
    }

    config
}

/// Rewrites `path` in the nested format, keeping the legacy file as a
/// timestamped sibling backup.
pub fn migrate_file(path: &Path, contents: &str) -> Result<Config, MigrateError> {
    let raw: HashMap<String, serde_yaml::Value> = serde_yaml::from_str(contents)?;
    let flat: HashMap<String, String> = raw
        .into_iter()
        .filter_map(|(k, v)| scalar_to_string(&v).map(|s| (k, s)))
        .collect();
    let config = convert(&flat);

    let backup = backup_path(path);
    std::fs::rename(path, &backup).map_err(|e| MigrateError::Backup(backup.clone(), e))?;
    info!(backup = %backup.display(), "legacy config backed up");

    let rendered = serde_yaml::to_string(&config)?;
    if let Err(err) = std::fs::write(path, rendered) {
        warn!(error = %err, "failed to write migrated config, restoring backup");
        let _ = std::fs::rename(&backup, path);
        return Err(MigrateError::Write(err));
    }

    Ok(config)
}

fn backup_path(path: &Path) -> PathBuf {
    let stamp = chrono::Local::now().format("%Y%m%d%H%M%S");
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "config".to_string());
    path.with_file_name(format!("{name}.{stamp}.bak"))
}

/// Legacy truthiness: the original accepted `1`, `true`, `on` and `yes`.
fn atob(v: &str) -> bool {
    matches!(v, "1" | "true" | "on" | "yes")
}

fn scalar_to_string(v: &serde_yaml::Value) -> Option<String> {
    match v {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
