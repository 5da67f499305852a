use clap::{Parser, Subcommand};

use crate::config::{Config, DEFAULT_CONFIG_FILE};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)] // Read from `Cargo.toml`
pub struct Cli {
    /// Configuration file location.
    #[arg(short, long, default_value_t = String::from(DEFAULT_CONFIG_FILE))]
    pub config: String,

    /// Override the proxy listen address.
    #[arg(long = "proxy.listenAddr")]
    pub proxy_listen_addr: Option<String>,

    /// Override the proxy listen port.
    #[arg(long = "proxy.listenPort")]
    pub proxy_listen_port: Option<String>,

    /// Replace the configured build parameters.
    #[arg(long = "build.params", allow_hyphen_values = true)]
    pub build_params: Option<String>,

    /// Replace the configured run parameters.
    #[arg(long = "run.params", allow_hyphen_values = true)]
    pub run_params: Option<String>,

    /// Append to the configured build parameters.
    #[arg(long = "build.appendParams", allow_hyphen_values = true)]
    pub build_append_params: Option<String>,

    /// Append to the configured run parameters.
    #[arg(long = "run.appendParams", allow_hyphen_values = true)]
    pub run_append_params: Option<String>,

    /// Production-mode gating: disables the in-dev cleanup behaviour.
    #[arg(long)]
    pub prod: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Command {
    /// Write an example configuration file and exit.
    Init,
}

impl Cli {
    pub fn init_cli() -> Self {
        Self::parse()
    }

    /// Main-mode flags win over file configuration.
    pub fn apply_overrides(&self, config: &mut Config) {
        if let Some(addr) = &self.proxy_listen_addr {
            config.proxy.ip = addr.clone();
        }
        if let Some(port) = &self.proxy_listen_port {
            config.proxy.port = port.clone();
        }
        if let Some(params) = &self.build_params {
            config.app.build_params = params.clone();
        }
        if let Some(params) = &self.run_params {
            config.app.run_params = params.clone();
        }
        if let Some(extra) = &self.build_append_params {
            if config.app.build_params.is_empty() {
                config.app.build_params = extra.clone();
            } else {
                config.app.build_params = format!("{} {}", config.app.build_params, extra);
            }
        }
        if let Some(extra) = &self.run_append_params {
            if config.app.run_params.is_empty() {
                config.app.run_params = extra.clone();
            } else {
                config.app.run_params = format!("{} {}", config.app.run_params, extra);
            }
        }
        if self.prod {
            config.offline = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_point_at_the_standard_config() {
        let cli = Cli::try_parse_from(["watchtower"]).unwrap();
        assert_eq!(DEFAULT_CONFIG_FILE, cli.config);
        assert_eq!(None, cli.command);
        assert!(!cli.prod);
    }

    #[test]
    fn parses_init_subcommand() {
        let cli = Cli::try_parse_from(["watchtower", "init"]).unwrap();
        assert_eq!(Some(Command::Init), cli.command);
    }

    #[test]
    fn overrides_replace_and_append() {
        let cli = Cli::try_parse_from([
            "watchtower",
            "-c",
            "custom.yml",
            "--proxy.listenAddr",
            "127.0.0.1",
            "--proxy.listenPort",
            "9090",
            "--build.params",
            "-race",
            "--run.appendParams",
            "-debug",
            "--prod",
        ])
        .unwrap();
        assert_eq!("custom.yml", cli.config);

        let mut config = Config::default();
        config.app.run_params = "-e 90".to_string();
        cli.apply_overrides(&mut config);

        assert_eq!("127.0.0.1", config.proxy.ip);
        assert_eq!("9090", config.proxy.port);
        assert_eq!("-race", config.app.build_params);
        assert_eq!("-e 90 -debug", config.app.run_params);
        assert!(!config.offline);
    }
}
