use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use tempfile::TempDir;

use watchtower::config::loader::{ConfigLoader, ConfigLoaderFile};
use watchtower::config::params::parse_args;
use watchtower::context::Context;
use watchtower::ports::PortPool;
use watchtower::supervisor::{Supervisor, SupervisorOptions, BIN_PREFIX};

fn write_file(dir: &TempDir, name: &str, contents: &str) -> PathBuf {
    let path = dir.path().join(name);
    let mut f = std::fs::File::create(&path).unwrap();
    write!(f, "{contents}").unwrap();
    path
}

/// Wires a config file through the loader into a live supervisor, the way
/// boot does, and checks the first-start invariants end to end.
#[test]
fn config_drives_the_supervisor_wiring() {
    let dir = TempDir::new().unwrap();
    let config_path = write_file(
        &dir,
        ".tower.yml",
        r#"
app:
  main: "main.go"
  port: "5001-5002"
  portParamName: "-p"
  params: "-e 90"
proxy:
  port: "8080"
"#,
    );

    let config = ConfigLoaderFile::new(&config_path).load().unwrap();
    let ports = PortPool::parse(&config.app.port).unwrap();
    assert_eq!(2, ports.len());

    let supervisor = Supervisor::new(
        SupervisorOptions {
            name: "demo".to_string(),
            main_file: config.app.main.clone(),
            root: PathBuf::from("."),
            build_dir: dir.path().to_path_buf(),
            build_params: parse_args(&config.app.build_params),
            run_params: parse_args(&config.app.run_params),
            env: Vec::new(),
            port_param_name: config.app.port_param_name.clone(),
            generate: false,
            offline: config.offline,
            compile: true,
            initial_bin: format!("{BIN_PREFIX}1"),
            ports,
        },
        Context::new(),
    );

    // the first pool entry becomes the current port before anything runs
    assert_eq!("5001", supervisor.current_port());
    assert!(supervisor.supports_multi_port());
    assert!(!supervisor.is_alive());
    assert_eq!(None, supervisor.build_error());
}

#[test]
fn legacy_config_migrates_once_and_loads_cleanly() {
    let dir = TempDir::new().unwrap();
    let config_path = write_file(
        &dir,
        ".tower.yml",
        r#"
app_port: "6001-6002"
pxy_port: "9090"
admin_ip: "127.0.0.1"
"#,
    );

    let migrated = ConfigLoaderFile::new(&config_path).load().unwrap();
    assert_eq!("6001-6002", migrated.app.port);
    assert_eq!("9090", migrated.proxy.port);

    let reloaded = ConfigLoaderFile::new(&config_path).load().unwrap();
    assert_eq!(migrated, reloaded);
}

#[cfg(target_family = "unix")]
#[test]
fn restart_requests_coalesce_under_load() {
    // with no artifact on disk every restart fails fast, which is exactly
    // what a burst needs: all callers must observe the same error
    let dir = TempDir::new().unwrap();
    let supervisor = Supervisor::new(
        SupervisorOptions {
            name: "demo".to_string(),
            main_file: "main.go".to_string(),
            root: PathBuf::from("."),
            build_dir: dir.path().to_path_buf(),
            build_params: Vec::new(),
            run_params: Vec::new(),
            env: Vec::new(),
            port_param_name: "-p".to_string(),
            generate: false,
            offline: false,
            compile: false,
            initial_bin: format!("{BIN_PREFIX}1"),
            ports: PortPool::parse("6001-6002").unwrap(),
        },
        Context::new(),
    );

    let mut handles = Vec::new();
    for _ in 0..8 {
        let sup: Arc<Supervisor> = supervisor.clone();
        handles.push(std::thread::spawn(move || sup.restart()));
    }
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert!(results.iter().all(|r| r.is_err()));
}
