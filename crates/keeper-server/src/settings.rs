//! Server settings from the INI configuration file plus CLI flags.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::Parser;
use config::{Config, FileFormat};

use keeper_common::utils::advertise_addr;
use keeper_storage::EventMode;

/// Command line arguments for the server
#[derive(Debug, Parser)]
#[command()]
struct Cli {
    /// keeper config file path
    #[arg(short = 'f', long = "config", default_value = "/etc/keeper/keeper.conf")]
    config_file: String,
    /// keeper id
    #[arg(short = 'i', long = "id", default_value_t = -1)]
    keeper_id: i64,
}

#[derive(Clone, Debug)]
pub struct Settings {
    pub keeper_id: i64,

    pub gorpc_listen: String,
    pub grpc_listen: String,
    pub admin_listen: String,
    pub prom_listen: String,

    pub base_path: PathBuf,
    pub log_path: PathBuf,
    pub tmp_path: PathBuf,

    pub storage_url: Vec<String>,
    pub storage_username: String,
    pub storage_password: String,
    pub event_mode: EventMode,

    pub registry_url: Vec<String>,
    pub registry_username: String,
    pub registry_password: String,

    pub event_interval: Duration,
    pub reconcile_interval: Duration,
    pub test_mode: bool,

    /// Advertised address of the node RPC port.
    pub keeper_rpc_addr: String,
    /// Advertised address of the admin port.
    pub keeper_admin_addr: String,
}

const DEFAULT_EVENT_INTERVAL_SECS: u64 = 5;
const DEFAULT_RECONCILE_INTERVAL: &str = "24h";

impl Settings {
    pub fn load() -> anyhow::Result<Settings> {
        let cli = Cli::parse();
        Settings::from_file(&cli.config_file, cli.keeper_id)
    }

    pub fn from_file(path: &str, keeper_id: i64) -> anyhow::Result<Settings> {
        let config = Config::builder()
            .add_source(config::File::new(path, FileFormat::Ini))
            .build()
            .with_context(|| format!("load config file {path}"))?;

        let required = |key: &str| -> anyhow::Result<String> {
            let value = config.get_string(key).unwrap_or_default();
            if value.is_empty() {
                bail!("{key} is empty");
            }
            Ok(value)
        };
        let optional = |key: &str| config.get_string(key).unwrap_or_default();
        let csv = |value: String| -> Vec<String> {
            value
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        };

        let gorpc_listen = required("gorpc_listen")?;
        let grpc_listen = required("grpc_listen")?;
        let admin_listen = required("admin_listen")?;
        let prom_listen = required("prom_listen")?;
        let base_path = PathBuf::from(required("base_path")?);

        let storage_url = csv(required("storage_url")?);
        let registry_url = csv(required("registry_url")?);

        let event_mode = optional("event_mode")
            .parse::<EventMode>()
            .unwrap_or_default();

        let log_path = match optional("log_path") {
            path if path.is_empty() => base_path.join("log"),
            path => PathBuf::from(path),
        };
        let tmp_path = match optional("tmp_path") {
            path if path.is_empty() => base_path.join("tmp"),
            path => PathBuf::from(path),
        };

        let event_interval = Duration::from_secs(
            config
                .get_int("event_interval")
                .ok()
                .filter(|v| *v > 0)
                .map(|v| v as u64)
                .unwrap_or(DEFAULT_EVENT_INTERVAL_SECS),
        );
        let reconcile_interval = humantime::parse_duration(
            &match optional("reconcile_interval") {
                value if value.is_empty() => DEFAULT_RECONCILE_INTERVAL.to_string(),
                value => value,
            },
        )
        .context("reconcile_interval is invalid")?;

        let keeper_rpc_addr =
            advertise_addr(&gorpc_listen).map_err(|e| anyhow::anyhow!("gorpc_listen: {e}"))?;
        let keeper_admin_addr =
            advertise_addr(&admin_listen).map_err(|e| anyhow::anyhow!("admin_listen: {e}"))?;

        let settings = Settings {
            keeper_id,
            gorpc_listen,
            grpc_listen,
            admin_listen,
            prom_listen,
            base_path,
            log_path,
            tmp_path,
            storage_url,
            storage_username: optional("storage_username"),
            storage_password: optional("storage_password"),
            event_mode,
            registry_url,
            registry_username: optional("registry_username"),
            registry_password: optional("registry_password"),
            event_interval,
            reconcile_interval,
            test_mode: config.get_bool("test_mode").unwrap_or(false),
            keeper_rpc_addr,
            keeper_admin_addr,
        };
        settings.make_dirs()?;
        Ok(settings)
    }

    fn make_dirs(&self) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.log_path)
            .with_context(|| format!("log_path {}", self.log_path.display()))?;
        std::fs::create_dir_all(&self.tmp_path)
            .with_context(|| format!("tmp_path {}", self.tmp_path.display()))?;
        Ok(())
    }

    /// A listen string (`:7000` or `host:7000`) as a bindable address.
    pub fn bind_addr(listen: &str) -> anyhow::Result<SocketAddr> {
        let listen = if listen.starts_with(':') {
            format!("0.0.0.0{listen}")
        } else {
            listen.to_string()
        };
        listen
            .parse()
            .with_context(|| format!("listen addr {listen}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_conf(dir: &std::path::Path, extra: &str) -> String {
        let path = dir.join("keeper.conf");
        let mut file = std::fs::File::create(&path).unwrap();
        write!(
            file,
            "gorpc_listen = 127.0.0.1:7000\n\
             grpc_listen = 127.0.0.1:7001\n\
             admin_listen = 127.0.0.1:7002\n\
             prom_listen = 127.0.0.1:7003\n\
             base_path = {}\n\
             storage_url = 127.0.0.1:2379,127.0.0.2:2379\n\
             registry_url = 127.0.0.1:2379\n\
             {extra}",
            dir.display()
        )
        .unwrap();
        path.to_string_lossy().to_string()
    }

    #[test]
    fn test_load_minimal() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_conf(dir.path(), "");
        let settings = Settings::from_file(&path, 1).unwrap();
        assert_eq!(settings.keeper_id, 1);
        assert_eq!(settings.storage_url.len(), 2);
        assert_eq!(settings.event_mode, EventMode::Version);
        assert_eq!(settings.event_interval, Duration::from_secs(5));
        assert_eq!(settings.reconcile_interval, Duration::from_secs(24 * 3600));
        assert!(!settings.test_mode);
        assert_eq!(settings.keeper_rpc_addr, "127.0.0.1:7000");
        assert!(settings.log_path.ends_with("log"));
        assert!(settings.log_path.exists());
    }

    #[test]
    fn test_load_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_conf(
            dir.path(),
            "event_mode = conf\nevent_interval = 10\ntest_mode = true\nreconcile_interval = 1h\n",
        );
        let settings = Settings::from_file(&path, 2).unwrap();
        assert_eq!(settings.event_mode, EventMode::Conf);
        assert_eq!(settings.event_interval, Duration::from_secs(10));
        assert_eq!(settings.reconcile_interval, Duration::from_secs(3600));
        assert!(settings.test_mode);
    }

    #[test]
    fn test_missing_required_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keeper.conf");
        std::fs::write(&path, "gorpc_listen = :7000\n").unwrap();
        assert!(Settings::from_file(&path.to_string_lossy(), 1).is_err());
    }

    #[test]
    fn test_bind_addr() {
        assert_eq!(
            Settings::bind_addr(":7000").unwrap().to_string(),
            "0.0.0.0:7000"
        );
        assert!(Settings::bind_addr("not an addr").is_err());
    }
}
