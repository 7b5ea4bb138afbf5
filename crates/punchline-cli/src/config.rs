//! Configuration system for the punchline CLI.

use punchline_traversal::StrategyKind;
use punchline_traversal::nat::{StunConfig, StunServer};
use punchline_traversal::punch::PunchConfig;
use punchline_traversal::signaling::SignalingConfig;
use punchline_traversal::strategy::OrchestratorConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// punchline configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Node configuration
    #[serde(default)]
    pub node: NodeConfig,
    /// STUN configuration
    #[serde(default)]
    pub stun: StunSection,
    /// Punch and strategy configuration
    #[serde(default)]
    pub punch: PunchSection,
    /// Signaling configuration
    #[serde(default)]
    pub signaling: SignalingSection,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Private key file path
    #[serde(default = "default_private_key_path")]
    pub private_key_file: PathBuf,
    /// Local IP to bind (unspecified picks the outbound interface)
    #[serde(default = "default_bind_ip")]
    pub bind_ip: String,
    /// Listen port for inbound pipes
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// SNTP server used to calibrate the punch clock
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ntp_server: Option<String>,
}

/// A change-request capable STUN server pair
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NatServerEntry {
    /// Primary address
    pub primary: String,
    /// Address on the alternate IP and port
    pub secondary: String,
}

/// STUN configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StunSection {
    /// Servers polled for the WAN IP
    #[serde(default = "default_stun_servers")]
    pub servers: Vec<String>,
    /// Servers used when the first list has no quorum
    #[serde(default)]
    pub fallback_servers: Vec<String>,
    /// Servers used for NAT type tests
    #[serde(default)]
    pub nat_servers: Vec<NatServerEntry>,
    /// Matching replies required
    #[serde(default = "default_min_agree")]
    pub min_agree: usize,
    /// Overall probe timeout in seconds
    #[serde(default = "default_stun_timeout")]
    pub timeout_secs: u64,
}

/// Punch and strategy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PunchSection {
    /// Concurrent punches (0 = one per CPU)
    #[serde(default)]
    pub max_punchers: usize,
    /// Lead time before a burst, in milliseconds
    #[serde(default = "default_meet_step_ms")]
    pub meet_step_ms: u64,
    /// Overall punch timeout in seconds
    #[serde(default = "default_punch_timeout")]
    pub timeout_secs: u64,
    /// Strategy order
    #[serde(default = "default_strategies")]
    pub strategies: Vec<String>,
}

/// Signaling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingSection {
    /// Relay channels that must accept each message
    #[serde(default = "default_relay_no")]
    pub relay_no: usize,
    /// Seal envelopes to the receiver's key
    #[serde(default = "default_true")]
    pub encrypt: bool,
    /// Seconds a seen pipe id is remembered
    #[serde(default = "default_seen_window")]
    pub seen_window_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log file path
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

// Default values

fn default_private_key_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".punchline/private_key")
}

fn default_bind_ip() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    40100
}

fn default_stun_servers() -> Vec<String> {
    vec![
        "stun.l.google.com:19302".to_string(),
        "stun1.l.google.com:19302".to_string(),
        "stun.cloudflare.com:3478".to_string(),
    ]
}

fn default_min_agree() -> usize {
    2
}

fn default_stun_timeout() -> u64 {
    4
}

fn default_meet_step_ms() -> u64 {
    3000
}

fn default_punch_timeout() -> u64 {
    20
}

fn default_strategies() -> Vec<String> {
    StrategyKind::DEFAULT_ORDER
        .iter()
        .map(ToString::to_string)
        .collect()
}

fn default_relay_no() -> usize {
    2
}

fn default_true() -> bool {
    true
}

fn default_seen_window() -> u64 {
    300
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            private_key_file: default_private_key_path(),
            bind_ip: default_bind_ip(),
            listen_port: default_listen_port(),
            ntp_server: None,
        }
    }
}

impl Default for StunSection {
    fn default() -> Self {
        Self {
            servers: default_stun_servers(),
            fallback_servers: Vec::new(),
            nat_servers: Vec::new(),
            min_agree: default_min_agree(),
            timeout_secs: default_stun_timeout(),
        }
    }
}

impl Default for PunchSection {
    fn default() -> Self {
        Self {
            max_punchers: 0,
            meet_step_ms: default_meet_step_ms(),
            timeout_secs: default_punch_timeout(),
            strategies: default_strategies(),
        }
    }
}

impl Default for SignalingSection {
    fn default() -> Self {
        Self {
            relay_no: default_relay_no(),
            encrypt: true,
            seen_window_secs: default_seen_window(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

/// Resolve `host:port` to its first address.
fn resolve(addr: &str) -> anyhow::Result<SocketAddr> {
    addr.to_socket_addrs()?
        .next()
        .ok_or_else(|| anyhow::anyhow!("'{addr}' did not resolve"))
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, contents)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("punchline/config.toml")
    }

    /// Load config from default path, or create default if it doesn't exist
    ///
    /// # Errors
    ///
    /// Returns an error if reading or creating the config fails.
    pub fn load_or_default() -> anyhow::Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load(&path)
        } else {
            let config = Self::default();
            config.save(&path)?;
            Ok(config)
        }
    }

    /// Parse the bind IP
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be parsed.
    pub fn bind_ip(&self) -> anyhow::Result<IpAddr> {
        Ok(self.node.bind_ip.parse()?)
    }

    /// Resolved SNTP server, if one is configured
    ///
    /// # Errors
    ///
    /// Returns an error if the server does not resolve.
    pub fn ntp_server(&self) -> anyhow::Result<Option<SocketAddr>> {
        self.node.ntp_server.as_deref().map(resolve).transpose()
    }

    /// Strategy order as parsed kinds
    ///
    /// # Errors
    ///
    /// Returns an error for unknown strategy names.
    pub fn strategies(&self) -> anyhow::Result<Vec<StrategyKind>> {
        self.punch
            .strategies
            .iter()
            .map(|s| s.parse::<StrategyKind>().map_err(anyhow::Error::msg))
            .collect()
    }

    /// STUN settings with server names resolved
    ///
    /// # Errors
    ///
    /// Returns an error if a server does not resolve.
    pub fn stun_config(&self) -> anyhow::Result<StunConfig> {
        let mut stun = StunConfig::new();
        for server in &self.stun.servers {
            stun.add_server(resolve(server)?);
        }
        for server in &self.stun.fallback_servers {
            stun.add_fallback_server(resolve(server)?);
        }
        for pair in &self.stun.nat_servers {
            stun.add_nat_server(StunServer::new(resolve(&pair.primary)?, resolve(&pair.secondary)?));
        }
        stun.min_agree = self.stun.min_agree;
        stun.timeout = Duration::from_secs(self.stun.timeout_secs);
        Ok(stun)
    }

    /// Punch settings
    #[must_use]
    pub fn punch_config(&self) -> PunchConfig {
        let mut punch = PunchConfig {
            meet_step: Duration::from_millis(self.punch.meet_step_ms),
            punch_timeout: Duration::from_secs(self.punch.timeout_secs),
            ..PunchConfig::default()
        };
        if self.punch.max_punchers > 0 {
            punch.max_punchers = self.punch.max_punchers;
        }
        punch
    }

    /// Signaling settings
    #[must_use]
    pub fn signaling_config(&self) -> SignalingConfig {
        SignalingConfig {
            relay_no: self.signaling.relay_no,
            encrypt: self.signaling.encrypt,
            seen_window: Duration::from_secs(self.signaling.seen_window_secs),
            ..SignalingConfig::default()
        }
    }

    /// Orchestrator settings in the configured strategy order
    ///
    /// # Errors
    ///
    /// Returns an error for unknown strategy names.
    pub fn orchestrator_config(&self) -> anyhow::Result<OrchestratorConfig> {
        let strategies = self.strategies()?.into_iter().map(StrategyKind::spec).collect();
        Ok(OrchestratorConfig {
            strategies,
            ..OrchestratorConfig::default()
        })
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.bind_ip()?;

        if self.node.listen_port == 0 {
            anyhow::bail!("Listen port must not be 0");
        }

        if let Some(server) = &self.node.ntp_server {
            self.validate_host_port(server, "NTP server")?;
        }

        for server in &self.stun.servers {
            self.validate_host_port(server, "STUN server")?;
        }
        for server in &self.stun.fallback_servers {
            self.validate_host_port(server, "Fallback STUN server")?;
        }
        for pair in &self.stun.nat_servers {
            self.validate_host_port(&pair.primary, "NAT test server")?;
            self.validate_host_port(&pair.secondary, "NAT test server")?;
        }

        if self.stun.min_agree == 0 {
            anyhow::bail!("min_agree must be at least 1");
        }
        if self.stun.timeout_secs == 0 || self.punch.timeout_secs == 0 {
            anyhow::bail!("Timeouts must be at least one second");
        }
        if self.punch.max_punchers > 1024 {
            anyhow::bail!("max_punchers must be at most 1024");
        }

        let strategies = self.strategies()?;
        if strategies.is_empty() {
            anyhow::bail!("At least one strategy must be configured");
        }
        for (i, kind) in strategies.iter().enumerate() {
            if strategies[..i].contains(kind) {
                anyhow::bail!("Strategy '{}' listed twice", kind);
            }
        }

        if self.signaling.relay_no == 0 {
            anyhow::bail!("relay_no must be at least 1");
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        Ok(())
    }

    /// Validate host:port format
    fn validate_host_port(&self, addr: &str, name: &str) -> anyhow::Result<()> {
        let Some((host, port_str)) = addr.rsplit_once(':') else {
            anyhow::bail!("{} '{}' missing port (expected format: host:port)", name, addr);
        };

        let port: u16 = port_str
            .parse()
            .map_err(|_| anyhow::anyhow!("{} '{}' has invalid port: {}", name, addr, port_str))?;
        if port == 0 {
            anyhow::bail!("{} '{}' has invalid port: 0", name, addr);
        }

        if host.is_empty() {
            anyhow::bail!("{} '{}' has empty hostname", name, addr);
        }
        if host.contains("..") || host.contains('/') || host.contains('\\') {
            anyhow::bail!("{} '{}' contains invalid characters", name, addr);
        }

        Ok(())
    }
}
