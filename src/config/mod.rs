pub mod loader;
pub mod migrate;
pub mod params;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_FILE: &str = ".tower.yml";

/// Root configuration. Unknown top-level keys are rejected so that legacy
/// flat-key files (`app_port: ...`) fail with a recognisable error and get
/// routed into [`migrate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub app: AppSection,
    pub proxy: ProxySection,
    pub admin: AdminSection,
    pub watch: WatchSection,
    pub verbose: bool,
    #[serde(rename = "logLevel")]
    pub log_level: String,
    #[serde(rename = "logRequest")]
    pub log_request: bool,
    #[serde(rename = "autoClear")]
    pub auto_clear: bool,
    pub offline: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSection {
    /// Pre-built binary in watch-only mode; `*` globs one name segment.
    pub exec: String,
    /// Source entry point in compile mode.
    pub main: String,
    /// Candidate ports: `"a,b,c-d"`.
    pub port: String,
    #[serde(rename = "portParamName")]
    pub port_param_name: String,
    /// Run the toolchain's code generation step before each build.
    pub generate: bool,
    #[serde(rename = "buildDir")]
    pub build_dir: String,
    #[serde(rename = "buildParams")]
    pub build_params: String,
    #[serde(rename = "params")]
    pub run_params: String,
    /// Accepted for compatibility with the original tool; dependency
    /// auto-fetching is not performed, so mirrors are ignored.
    #[serde(rename = "pkgMirrors")]
    pub pkg_mirrors: HashMap<String, String>,
    /// Extra `NAME=value` environment entries for the child.
    pub env: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySection {
    pub ip: String,
    pub port: String,
    /// `standard` or `fast`.
    pub engine: String,
    /// Per-request forwarding budget in seconds; 0 leaves it unbounded.
    #[serde(rename = "requestTimeout")]
    pub request_timeout: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminSection {
    pub password: String,
    /// Comma-separated client IPs allowed on the admin endpoints.
    pub ips: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchSection {
    /// Pipe-separated file extensions that trigger a rebuild.
    #[serde(rename = "fileExtension")]
    pub file_extension: String,
    /// Pipe-separated additional directories to watch.
    #[serde(rename = "otherDir")]
    pub other_dir: String,
    /// Regular expression of paths to skip.
    #[serde(rename = "ignoredPath")]
    pub ignored_path: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            app: AppSection::default(),
            proxy: ProxySection::default(),
            admin: AdminSection::default(),
            watch: WatchSection::default(),
            verbose: false,
            log_level: "Info".to_string(),
            log_request: true,
            auto_clear: true,
            offline: true,
        }
    }
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            exec: "tower-app-*.exe".to_string(),
            main: String::new(),
            port: "5001-5050".to_string(),
            port_param_name: String::new(),
            generate: false,
            build_dir: String::new(),
            build_params: String::new(),
            run_params: String::new(),
            pkg_mirrors: HashMap::new(),
            env: Vec::new(),
        }
    }
}

impl Default for ProxySection {
    fn default() -> Self {
        Self {
            ip: String::new(),
            port: "8080".to_string(),
            engine: "standard".to_string(),
            request_timeout: 0,
        }
    }
}

impl Default for AdminSection {
    fn default() -> Self {
        Self {
            password: String::new(),
            ips: "127.0.0.1,::1".to_string(),
        }
    }
}

impl Default for WatchSection {
    fn default() -> Self {
        Self {
            file_extension: "go".to_string(),
            other_dir: String::new(),
            ignored_path: r"/\.git".to_string(),
        }
    }
}

impl Config {
    /// The log level the subscriber should start with; `verbose` forces
    /// debug output regardless of `logLevel`.
    pub fn effective_log_level(&self) -> &str {
        if self.verbose {
            "Debug"
        } else {
            &self.log_level
        }
    }

    pub fn admin_ips(&self) -> Vec<String> {
        self.admin
            .ips
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// Example configuration written by `watchtower init`.
pub const EXAMPLE_CONFIG: &str = r#"app:
  # Pre-built executable used in watch-only mode. "*" may replace part of
  # the file name, e.g. "tower-app-*.exe".
  exec: "tower-app-*.exe"

  # Source entry point built in compile mode, usually "main.go".
  main: ""

  # Candidate local ports. Singles and inclusive ranges may be combined,
  # e.g. "5001,5003,5050-5060".
  port: "5001-5050"

  # Flag name through which the app receives its listen port, e.g. the
  # "-p" in "app -p 8080". Leave empty if the app has no such flag.
  portParamName: "-p"

  # Where build artifacts are placed.
  buildDir: ""

  # Extra toolchain arguments for the build step.
  buildParams: ""

  # Extra runtime arguments for the app. Separated by single spaces, or
  # prefix with ":<delim>:" to pick a different delimiter.
  params: ""

proxy:
  # The public port your app is reached on.
  port: "8080"

  # Forwarding engine: "standard" or "fast".
  engine: "standard"

admin:
  password: ""
  ips: "127.0.0.1,::1"

watch:
  # File extensions that trigger a rebuild, pipe-separated: "go|html".
  fileExtension: "go"

  # Additional directories to watch, pipe-separated.
  otherDir: ""

  # Paths to skip (regular expression).
  ignoredPath: ""

# Show more detail; forces logLevel to Debug.
verbose: false

# One of Debug/Info/Warn/Error.
logLevel: "Info"

# Log one line per proxied request.
logRequest: true

# Delete stale build artifacts on boot.
autoClear: true

# In-dev mode: clean up superseded children right after a swap.
offline: true
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_original_tool() {
        let cfg = Config::default();
        assert_eq!("5001-5050", cfg.app.port);
        assert_eq!("8080", cfg.proxy.port);
        assert_eq!("standard", cfg.proxy.engine);
        assert_eq!("go", cfg.watch.file_extension);
        assert_eq!(vec!["127.0.0.1".to_string(), "::1".to_string()], cfg.admin_ips());
        assert!(cfg.auto_clear);
        assert!(cfg.offline);
    }

    #[test]
    fn verbose_forces_debug_level() {
        let mut cfg = Config::default();
        assert_eq!("Info", cfg.effective_log_level());
        cfg.verbose = true;
        assert_eq!("Debug", cfg.effective_log_level());
    }
}
