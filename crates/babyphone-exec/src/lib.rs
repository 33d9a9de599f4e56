//! Babyphone Exec
//!
//! Device actions behind the bot: stream address lookup, uptime, camera
//! snapshot, and guarded execution of the reboot/shutdown commands.

use async_trait::async_trait;
use babyphone_config::DeviceConfig;
use std::path::PathBuf;
use std::process::Stdio;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::time::{timeout, Duration};
use tracing::{debug, info};

const DEFAULT_MAX_OUTPUT_CHARS: usize = 3500;
const PROC_UPTIME_PATH: &str = "/proc/uptime";
const SNAPSHOT_REQUEST: &[u8] = b"SNAPSHOT\n";
// Telegram rejects photos above 10 MB.
const MAX_SNAPSHOT_BYTES: u64 = 10 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("no IPv4 address on interface '{0}'")]
    Interface(String),

    #[error("snapshot failed: {0}")]
    Snapshot(String),

    #[error("cannot read uptime: {0}")]
    Uptime(String),

    #[error("invalid command '{command}': {reason}")]
    Command { command: String, reason: String },

    #[error("'{0}' timed out")]
    Timeout(String),

    #[error("'{command}' exited with code {exit_code}: {stderr}")]
    Failed {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ExecError>;

/// What the bot can ask of the device it runs on.
#[async_trait]
pub trait DeviceActions: Send + Sync {
    /// `ip:port/` of the live stream served on `interface`.
    async fn stream_url(&self, interface: &str, port: u16) -> Result<String>;

    async fn uptime(&self) -> Result<String>;

    async fn snapshot(&self) -> Result<Vec<u8>>;

    async fn reboot(&self) -> Result<()>;

    async fn shutdown(&self) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct ExecResult {
    pub command: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl ExecResult {
    fn into_checked(self) -> Result<Self> {
        if self.timed_out {
            return Err(ExecError::Timeout(self.command));
        }
        if self.exit_code != 0 {
            return Err(ExecError::Failed {
                command: self.command,
                exit_code: self.exit_code,
                stderr: self.stderr.trim().to_string(),
            });
        }
        Ok(self)
    }
}

pub async fn run_command(raw_command: &str, timeout_secs: u64) -> Result<ExecResult> {
    let invalid = |reason: &str| ExecError::Command {
        command: raw_command.to_string(),
        reason: reason.to_string(),
    };

    let tokens = shlex::split(raw_command).ok_or_else(|| invalid("invalid command syntax"))?;
    if tokens.is_empty() {
        return Err(invalid("missing command"));
    }

    let command = tokens[0].clone();
    let args = tokens[1..].to_vec();

    for arg in &args {
        validate_argument(arg).map_err(|reason| invalid(reason))?;
    }

    let mut process = Command::new(&command);
    process
        .args(args.clone())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(Stdio::null())
        .kill_on_drop(true);

    debug!("Running '{}'", join_for_display(&command, &args));

    let timeout_secs = timeout_secs.max(1);
    let output = match timeout(Duration::from_secs(timeout_secs), process.output()).await {
        Ok(result) => result?,
        Err(_) => {
            return Ok(ExecResult {
                command: join_for_display(&command, &args),
                exit_code: -1,
                stdout: String::new(),
                stderr: String::new(),
                timed_out: true,
            });
        }
    };

    let stdout = truncate_output(&String::from_utf8_lossy(&output.stdout), DEFAULT_MAX_OUTPUT_CHARS);
    let stderr = truncate_output(&String::from_utf8_lossy(&output.stderr), DEFAULT_MAX_OUTPUT_CHARS);

    Ok(ExecResult {
        command: join_for_display(&command, &args),
        exit_code: output.status.code().unwrap_or(-1),
        stdout,
        stderr,
        timed_out: false,
    })
}

/// The device the bot is installed on.
#[derive(Debug, Clone)]
pub struct SystemDevice {
    snapshot_addr: String,
    reboot_command: String,
    shutdown_command: String,
    timeout_secs: u64,
    uptime_path: PathBuf,
}

impl SystemDevice {
    pub fn new(config: &DeviceConfig) -> Self {
        Self {
            snapshot_addr: config.snapshot_addr.clone(),
            reboot_command: config.reboot_command.clone(),
            shutdown_command: config.shutdown_command.clone(),
            timeout_secs: config.action_timeout_secs,
            uptime_path: PathBuf::from(PROC_UPTIME_PATH),
        }
    }

    pub fn with_uptime_path(mut self, path: PathBuf) -> Self {
        self.uptime_path = path;
        self
    }

    async fn run_privileged(&self, raw_command: &str) -> Result<()> {
        info!("Executing '{}'", raw_command);
        run_command(raw_command, self.timeout_secs)
            .await?
            .into_checked()
            .map(|_| ())
    }
}

#[async_trait]
impl DeviceActions for SystemDevice {
    async fn stream_url(&self, interface: &str, port: u16) -> Result<String> {
        let raw = format!("ip -4 -o addr show dev {}", shlex::try_quote(interface).map_err(
            |_| ExecError::Interface(interface.to_string()),
        )?);
        let result = run_command(&raw, self.timeout_secs)
            .await?
            .into_checked()?;
        let ip = parse_ipv4(&result.stdout)
            .ok_or_else(|| ExecError::Interface(interface.to_string()))?;
        Ok(format!("{}:{}/", ip, port))
    }

    async fn uptime(&self) -> Result<String> {
        let content = tokio::fs::read_to_string(&self.uptime_path)
            .await
            .map_err(|e| ExecError::Uptime(format!("{}: {}", self.uptime_path.display(), e)))?;
        let secs = parse_proc_uptime(&content)
            .ok_or_else(|| ExecError::Uptime(format!("unexpected content '{}'", content.trim())))?;
        Ok(format_uptime(secs))
    }

    async fn snapshot(&self) -> Result<Vec<u8>> {
        let limit = Duration::from_secs(self.timeout_secs.max(1));
        let addr = self.snapshot_addr.as_str();

        let mut stream = timeout(limit, TcpStream::connect(addr))
            .await
            .map_err(|_| ExecError::Timeout(format!("connect {}", addr)))?
            .map_err(|e| ExecError::Snapshot(format!("connect {}: {}", addr, e)))?;

        stream.write_all(SNAPSHOT_REQUEST).await?;
        stream.shutdown().await?;

        let mut image = Vec::new();
        timeout(
            limit,
            (&mut stream)
                .take(MAX_SNAPSHOT_BYTES + 1)
                .read_to_end(&mut image),
        )
        .await
        .map_err(|_| ExecError::Timeout(format!("read snapshot from {}", addr)))??;

        if image.is_empty() {
            return Err(ExecError::Snapshot(format!("{} returned no data", addr)));
        }
        if image.len() as u64 > MAX_SNAPSHOT_BYTES {
            return Err(ExecError::Snapshot(format!(
                "{} returned more than {} bytes",
                addr, MAX_SNAPSHOT_BYTES
            )));
        }
        Ok(image)
    }

    async fn reboot(&self) -> Result<()> {
        self.run_privileged(&self.reboot_command).await
    }

    async fn shutdown(&self) -> Result<()> {
        self.run_privileged(&self.shutdown_command).await
    }
}

/// First IPv4 address in `ip -4 -o addr show` output.
pub fn parse_ipv4(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let mut tokens = line.split_whitespace();
        tokens.find(|token| *token == "inet")?;
        let cidr = tokens.next()?;
        let ip = cidr.split('/').next()?;
        ip.parse::<std::net::Ipv4Addr>().ok().map(|ip| ip.to_string())
    })
}

/// Whole seconds from the first field of `/proc/uptime`.
pub fn parse_proc_uptime(content: &str) -> Option<u64> {
    let first = content.split_whitespace().next()?;
    let secs: f64 = first.parse().ok()?;
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    Some(secs as u64)
}

/// Renders seconds the way `uptime -p` does, e.g. `up 2 days, 1 hour, 5 minutes`.
pub fn format_uptime(total_secs: u64) -> String {
    let days = total_secs / 86_400;
    let hours = (total_secs % 86_400) / 3_600;
    let minutes = (total_secs % 3_600) / 60;

    let unit = |value: u64, name: &str| {
        if value == 1 {
            format!("1 {}", name)
        } else {
            format!("{} {}s", value, name)
        }
    };

    let mut parts = Vec::new();
    if days > 0 {
        parts.push(unit(days, "day"));
    }
    if hours > 0 {
        parts.push(unit(hours, "hour"));
    }
    if minutes > 0 || parts.is_empty() {
        parts.push(unit(minutes, "minute"));
    }

    format!("up {}", parts.join(", "))
}

fn validate_argument(arg: &str) -> std::result::Result<(), &'static str> {
    if arg.contains('\0') {
        return Err("argument contains null byte");
    }
    if arg.contains('|')
        || arg.contains(';')
        || arg.contains('&')
        || arg.contains('>')
        || arg.contains('<')
        || arg.contains('`')
    {
        return Err("shell operators are not interpreted, run a script instead");
    }
    Ok(())
}

fn join_for_display(command: &str, args: &[String]) -> String {
    if args.is_empty() {
        return command.to_string();
    }
    format!("{} {}", command, args.join(" "))
}

fn truncate_output(content: &str, max_chars: usize) -> String {
    let mut chars = content.chars();
    let truncated: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{}\n...[truncated]", truncated)
    } else {
        truncated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn device_with(snapshot_addr: &str) -> SystemDevice {
        SystemDevice::new(&DeviceConfig {
            snapshot_addr: snapshot_addr.to_string(),
            action_timeout_secs: 5,
            ..Default::default()
        })
    }

    #[test]
    fn parse_ipv4_reads_inet_field() {
        let output = "3: wlan0    inet 192.168.1.23/24 brd 192.168.1.255 scope global dynamic wlan0\\       valid_lft 85000sec preferred_lft 85000sec\n";
        assert_eq!(parse_ipv4(output), Some("192.168.1.23".to_string()));
    }

    #[test]
    fn parse_ipv4_returns_none_without_address() {
        assert_eq!(parse_ipv4(""), None);
        assert_eq!(parse_ipv4("3: wlan0 inet6 fe80::1/64 scope link"), None);
    }

    #[test]
    fn parse_proc_uptime_takes_first_field() {
        assert_eq!(parse_proc_uptime("12345.67 54321.00\n"), Some(12345));
        assert_eq!(parse_proc_uptime("garbage"), None);
        assert_eq!(parse_proc_uptime(""), None);
    }

    #[test]
    fn format_uptime_pluralizes_and_skips_zero_units() {
        assert_eq!(format_uptime(0), "up 0 minutes");
        assert_eq!(format_uptime(61), "up 1 minute");
        assert_eq!(format_uptime(3_600), "up 1 hour");
        assert_eq!(format_uptime(2 * 86_400 + 3 * 3_600 + 4 * 60), "up 2 days, 3 hours, 4 minutes");
    }

    #[test]
    fn validate_argument_rejects_shell_operators() {
        assert!(validate_argument("now").is_ok());
        assert!(validate_argument("-h").is_ok());
        assert!(validate_argument("now;rm").is_err());
        assert!(validate_argument("a|b").is_err());
    }

    #[test]
    fn truncate_output_marks_cut_content() {
        assert_eq!(truncate_output("abc", 5), "abc");
        assert!(truncate_output("abcdef", 3).ends_with("[truncated]"));
    }

    #[tokio::test]
    async fn run_command_rejects_empty_command() {
        assert!(matches!(
            run_command("   ", 1).await,
            Err(ExecError::Command { .. })
        ));
    }

    #[tokio::test]
    async fn run_command_checked_output() {
        let ok = run_command("echo ready", 5)
            .await
            .unwrap()
            .into_checked()
            .unwrap();
        assert_eq!(ok.stdout.trim(), "ready");

        let failed = run_command("false", 5).await.unwrap();
        assert!(matches!(
            failed.into_checked(),
            Err(ExecError::Failed { exit_code: 1, .. })
        ));
    }

    #[tokio::test]
    async fn run_command_times_out() {
        let result = run_command("sleep 5", 1).await.unwrap();
        assert!(result.timed_out);
        assert!(matches!(result.into_checked(), Err(ExecError::Timeout(_))));
    }

    #[tokio::test]
    async fn uptime_reads_configured_file() {
        let path = std::env::temp_dir().join(format!("babyphone-uptime-{}", std::process::id()));
        tokio::fs::write(&path, "90061.5 100.0\n").await.unwrap();
        let device = device_with("127.0.0.1:1").with_uptime_path(path.clone());
        assert_eq!(device.uptime().await.unwrap(), "up 1 day, 1 hour, 1 minute");
        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn snapshot_reads_image_until_eof() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            socket.read_to_end(&mut request).await.unwrap();
            socket.write_all(b"\xFF\xD8jpeg-bytes\xFF\xD9").await.unwrap();
            request
        });

        let image = device_with(&addr.to_string()).snapshot().await.unwrap();
        assert_eq!(image, b"\xFF\xD8jpeg-bytes\xFF\xD9");
        assert_eq!(server.await.unwrap(), SNAPSHOT_REQUEST);
    }

    #[tokio::test]
    async fn snapshot_fails_on_empty_reply() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let _ = socket.read_to_end(&mut request).await;
        });

        let err = device_with(&addr.to_string()).snapshot().await.unwrap_err();
        assert!(matches!(err, ExecError::Snapshot(_)));
    }

    #[tokio::test]
    async fn snapshot_fails_when_nothing_listens() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        assert!(device_with(&addr.to_string()).snapshot().await.is_err());
    }
}
