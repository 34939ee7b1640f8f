//! Helper Configuration
//!
//! Provides the helper's runtime configuration: which entry server the
//! bypass route pins, where the tunnel device and local proxy live, and
//! the well-known paths the session leaves on disk (lock file, resolver
//! backup, route record).
//!
//! Defaults match the reference deployment; an optional TOML file can
//! override any field.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Complete helper configuration.
///
/// All fields have deployment defaults, so `HelperConfig::default()` is a
/// working configuration on the reference host. Paths are configurable so
/// tests can run against a scratch directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HelperConfig {
    /// Anonymity-network entry server. The bypass route pins this host
    /// to the original gateway so the client's own traffic stays out of
    /// the tunnel.
    pub entry_server: IpAddr,
    /// Name of the virtual tunnel interface created by the bridge.
    pub tun_device: String,
    /// Local SOCKS endpoint served by the anonymity client.
    pub socks_proxy: String,
    /// Local DNS port served by the anonymity client.
    pub dns_port: u16,
    /// Bridge line handed to the anonymity client.
    pub bridge_line: String,
    /// Line in the client's output that marks bootstrap completion.
    pub bootstrap_marker: String,
    /// How long to wait for the bootstrap marker.
    pub bootstrap_timeout_secs: u64,
    /// How long to wait for the tunnel interface to appear.
    pub settle_delay_ms: u64,
    /// Poll interval while waiting for a signalled helper to exit.
    pub lock_poll_interval_ms: u64,

    /// Directory holding the subprocess binaries and generated config.
    pub app_dir: PathBuf,
    /// Anonymity client binary.
    pub client_bin: PathBuf,
    /// Tunnel bridge binary.
    pub bridge_bin: PathBuf,
    /// Pluggable-transport binary referenced from the generated config.
    pub transport_plugin_bin: PathBuf,
    /// Where the generated client configuration is written.
    pub client_config_path: PathBuf,

    /// Lock file holding the active helper's PID.
    pub lock_path: PathBuf,
    /// The resolver file the session rewrites.
    pub resolv_conf: PathBuf,
    /// Verbatim backup of the resolver file at snapshot time.
    pub resolv_backup: PathBuf,
    /// Persisted record of the original default route.
    pub route_backup: PathBuf,
}

impl Default for HelperConfig {
    fn default() -> Self {
        let app_dir = PathBuf::from("/var/lib/shroud");
        Self {
            entry_server: IpAddr::V4(Ipv4Addr::new(92, 205, 186, 124)),
            tun_device: "mytun".to_string(),
            socks_proxy: "socks5://127.0.0.1:9050".to_string(),
            dns_port: 53,
            bridge_line: concat!(
                "webtunnel [2001:db8:75db:c6f2:1dae:121:7a04:9e9d]:443 ",
                "4B673DF159CFC12AC91FC2E6AC3047FF2183FCEA ",
                "url=http://freifunk.ckgc.de/xBKEzZunnc3A5pcf6jaeVyPL"
            )
            .to_string(),
            bootstrap_marker: "Bootstrapped 100%".to_string(),
            bootstrap_timeout_secs: 120,
            settle_delay_ms: 2000,
            lock_poll_interval_ms: 1000,
            client_bin: app_dir.join("tor"),
            bridge_bin: app_dir.join("tun2socks"),
            transport_plugin_bin: app_dir.join("webtunnel-client"),
            client_config_path: app_dir.join("torrc-webtunnel"),
            app_dir,
            lock_path: PathBuf::from("/tmp/shroud-helper.pid"),
            resolv_conf: PathBuf::from("/etc/resolv.conf"),
            resolv_backup: PathBuf::from("/tmp/shroud-resolv-backup.conf"),
            route_backup: PathBuf::from("/tmp/shroud-route-backup.json"),
        }
    }
}

impl HelperConfig {
    /// Load configuration from a TOML file, falling back to defaults when
    /// the file does not exist. Missing fields take their default value.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tun_device.is_empty() {
            return Err(ConfigError::Invalid("tunnel device name is empty"));
        }
        if self.socks_proxy.is_empty() {
            return Err(ConfigError::Invalid("SOCKS proxy endpoint is empty"));
        }
        if self.entry_server.is_unspecified() {
            return Err(ConfigError::Invalid("entry server address is unspecified"));
        }
        if self.bootstrap_timeout_secs == 0 {
            return Err(ConfigError::Invalid("bootstrap timeout is zero"));
        }
        Ok(())
    }

    /// How long to wait for the bootstrap marker.
    pub fn bootstrap_timeout(&self) -> Duration {
        Duration::from_secs(self.bootstrap_timeout_secs)
    }

    /// How long to wait for the tunnel interface to appear.
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// Poll interval while waiting for a signalled helper to exit.
    pub fn lock_poll_interval(&self) -> Duration {
        Duration::from_millis(self.lock_poll_interval_ms)
    }

    /// Render the anonymity client's configuration file.
    pub fn render_client_config(&self) -> String {
        format!(
            "UseBridges 1\n\
             DNSPort 127.0.0.1:{}\n\
             AutomapHostsOnResolve 1\n\
             ClientTransportPlugin webtunnel exec {}\n\
             Bridge {}\n",
            self.dns_port,
            self.transport_plugin_bin.display(),
            self.bridge_line,
        )
    }

    /// Write the client configuration file, fresh on every connect.
    pub fn write_client_config(&self) -> Result<(), ConfigError> {
        if let Some(parent) = self.client_config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.client_config_path, self.render_client_config())?;
        Ok(())
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(&'static str),

    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
}
