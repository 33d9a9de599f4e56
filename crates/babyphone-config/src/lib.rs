//! Babyphone Configuration
//!
//! TOML configuration loading for the bot, device and keyboard labels

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub core: CoreConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub labels: LabelsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CoreConfig {
    pub data_dir: Option<String>,
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: String,
    /// File holding the bot token on its first line; used when `bot_token` is empty.
    pub token_file: Option<String>,
    pub poll_timeout_secs: Option<u64>,
    pub client_recreate_interval_secs: Option<u64>,
}

impl TelegramConfig {
    pub fn resolve_token(&self) -> anyhow::Result<String> {
        let inline = self.bot_token.trim();
        if !inline.is_empty() {
            return Ok(inline.to_string());
        }

        let Some(token_file) = self.token_file.as_deref() else {
            anyhow::bail!("telegram.bot_token is empty and no telegram.token_file is set");
        };

        let path = expand_user_path(token_file);
        let content = std::fs::read_to_string(&path).map_err(|e| {
            anyhow::anyhow!("Failed to read token file {}: {}", path.display(), e)
        })?;
        let token = content.lines().next().unwrap_or_default().trim().to_string();
        if token.is_empty() {
            anyhow::bail!("Token file {} is empty", path.display());
        }
        Ok(token)
    }

    /// Numeric bot id, the part of the token before the colon.
    pub fn account_tag(token: &str) -> String {
        let token = token.trim();
        token.split(':').next().unwrap_or(token).trim().to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuthConfig {
    /// PIN expected by `/start <pin>`.
    pub pin: Option<u64>,
    /// Chat bound at start-up, skipping the PIN handshake.
    pub chat_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default = "default_stream_interface")]
    pub stream_interface: String,
    #[serde(default = "default_stream_port")]
    pub stream_port: u16,
    #[serde(default = "default_snapshot_addr")]
    pub snapshot_addr: String,
    #[serde(default = "default_reboot_command")]
    pub reboot_command: String,
    #[serde(default = "default_shutdown_command")]
    pub shutdown_command: String,
    #[serde(default = "default_action_timeout_secs")]
    pub action_timeout_secs: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            stream_interface: default_stream_interface(),
            stream_port: default_stream_port(),
            snapshot_addr: default_snapshot_addr(),
            reboot_command: default_reboot_command(),
            shutdown_command: default_shutdown_command(),
            action_timeout_secs: default_action_timeout_secs(),
        }
    }
}

/// Reply-keyboard labels. Each label also works as a typed command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelsConfig {
    #[serde(default = "default_label_help")]
    pub help: String,
    #[serde(default = "default_label_stream_url")]
    pub stream_url: String,
    #[serde(default = "default_label_snapshot")]
    pub snapshot: String,
    #[serde(default = "default_label_uptime")]
    pub uptime: String,
    #[serde(default = "default_label_reboot")]
    pub reboot: String,
    #[serde(default = "default_label_shutdown")]
    pub shutdown: String,
}

impl Default for LabelsConfig {
    fn default() -> Self {
        Self {
            help: default_label_help(),
            stream_url: default_label_stream_url(),
            snapshot: default_label_snapshot(),
            uptime: default_label_uptime(),
            reboot: default_label_reboot(),
            shutdown: default_label_shutdown(),
        }
    }
}

impl LabelsConfig {
    pub fn entries(&self) -> [(&'static str, &str); 6] {
        [
            ("help", &self.help),
            ("stream_url", &self.stream_url),
            ("snapshot", &self.snapshot),
            ("uptime", &self.uptime),
            ("reboot", &self.reboot),
            ("shutdown", &self.shutdown),
        ]
    }
}

fn default_stream_interface() -> String {
    "wlan0".to_string()
}

fn default_stream_port() -> u16 {
    8080
}

fn default_snapshot_addr() -> String {
    "127.0.0.1:8081".to_string()
}

fn default_reboot_command() -> String {
    "/usr/bin/sudo reboot".to_string()
}

fn default_shutdown_command() -> String {
    "/usr/bin/sudo shutdown -h now".to_string()
}

fn default_action_timeout_secs() -> u64 {
    15
}

fn default_label_help() -> String {
    "Help".to_string()
}

fn default_label_stream_url() -> String {
    "URL of Live-Stream".to_string()
}

fn default_label_snapshot() -> String {
    "Snapshot".to_string()
}

fn default_label_uptime() -> String {
    "Uptime".to_string()
}

fn default_label_reboot() -> String {
    "Reboot".to_string()
}

fn default_label_shutdown() -> String {
    "Shutdown".to_string()
}

pub fn expand_user_path(path: &str) -> PathBuf {
    if path == "~" || path.starts_with("~/") {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        if path == "~" {
            home
        } else {
            home.join(path.trim_start_matches("~/"))
        }
    } else {
        PathBuf::from(path)
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let config = Self::read(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Parses without validating, for callers that apply overrides first.
    pub fn read<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;
        Ok(toml::from_str(&content)?)
    }

    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("babyphone").join("config.toml"))
    }

    pub fn data_dir(&self) -> PathBuf {
        match &self.core.data_dir {
            Some(data_dir) => expand_user_path(data_dir),
            None => dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".babyphone"),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.telegram.bot_token.trim().is_empty()
            && self
                .telegram
                .token_file
                .as_deref()
                .map(str::trim)
                .is_none_or(str::is_empty)
        {
            anyhow::bail!("Either telegram.bot_token or telegram.token_file must be set");
        }

        if self.auth.pin.is_none() && self.auth.chat_id.is_none() {
            anyhow::bail!("Either auth.pin or auth.chat_id must be set");
        }

        if self.device.stream_interface.trim().is_empty() {
            anyhow::bail!("device.stream_interface cannot be empty");
        }
        if self.device.stream_port == 0 {
            anyhow::bail!("device.stream_port cannot be 0");
        }
        if self.device.snapshot_addr.trim().is_empty() {
            anyhow::bail!("device.snapshot_addr cannot be empty");
        }
        if self.device.reboot_command.trim().is_empty() {
            anyhow::bail!("device.reboot_command cannot be empty");
        }
        if self.device.shutdown_command.trim().is_empty() {
            anyhow::bail!("device.shutdown_command cannot be empty");
        }
        if self.device.action_timeout_secs == 0 {
            anyhow::bail!("device.action_timeout_secs cannot be 0");
        }

        let mut seen_labels = HashSet::new();
        for (name, label) in self.labels.entries() {
            let normalized = label.trim().to_lowercase();
            if normalized.is_empty() {
                anyhow::bail!("labels.{} cannot be empty", name);
            }
            if normalized.starts_with('/') {
                anyhow::bail!(
                    "labels.{} '{}' cannot start with '/', slash commands are reserved",
                    name,
                    label
                );
            }
            if !seen_labels.insert(normalized) {
                anyhow::bail!("Duplicate label '{}' in labels.{}", label, name);
            }
        }

        Ok(())
    }
}
