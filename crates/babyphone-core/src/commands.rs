//! Command catalog
//!
//! Every user-facing command has one canonical slash form and one
//! configurable keyboard label. The router, the reply keyboard and the
//! Telegram `/` menu are all built from this table.

use babyphone_config::LabelsConfig;
use babyphone_ipc::{InlineButton, Markup};
use babyphone_telegram::BotCommand;
use std::fmt;

pub const START_COMMAND: &str = "/start";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Help,
    StreamUrl,
    Snapshot,
    Uptime,
    Reboot,
    Shutdown,
}

impl Command {
    pub const ALL: [Command; 6] = [
        Command::Help,
        Command::StreamUrl,
        Command::Snapshot,
        Command::Uptime,
        Command::Reboot,
        Command::Shutdown,
    ];

    pub fn slash(self) -> &'static str {
        match self {
            Command::Help => "/help",
            Command::StreamUrl => "/stream_url",
            Command::Snapshot => "/snapshot",
            Command::Uptime => "/uptime",
            Command::Reboot => "/reboot",
            Command::Shutdown => "/shutdown",
        }
    }

    pub fn label(self, labels: &LabelsConfig) -> &str {
        match self {
            Command::Help => &labels.help,
            Command::StreamUrl => &labels.stream_url,
            Command::Snapshot => &labels.snapshot,
            Command::Uptime => &labels.uptime,
            Command::Reboot => &labels.reboot,
            Command::Shutdown => &labels.shutdown,
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Command::Help => "Show help",
            Command::StreamUrl => "URL of the live stream",
            Command::Snapshot => "Take a snapshot",
            Command::Uptime => "Show device uptime",
            Command::Reboot => "Reboot the device",
            Command::Shutdown => "Shut the device down",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slash())
    }
}

/// Device actions that need an inline confirmation first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrivilegedAction {
    Reboot,
    Shutdown,
}

impl PrivilegedAction {
    pub const ALL: [PrivilegedAction; 2] = [PrivilegedAction::Reboot, PrivilegedAction::Shutdown];

    pub fn name(self) -> &'static str {
        match self {
            PrivilegedAction::Reboot => "reboot",
            PrivilegedAction::Shutdown => "shutdown",
        }
    }

    pub fn confirm(self) -> CallbackAction {
        match self {
            PrivilegedAction::Reboot => CallbackAction::ConfirmReboot,
            PrivilegedAction::Shutdown => CallbackAction::ConfirmShutdown,
        }
    }

    pub fn abort(self) -> CallbackAction {
        match self {
            PrivilegedAction::Reboot => CallbackAction::AbortReboot,
            PrivilegedAction::Shutdown => CallbackAction::AbortShutdown,
        }
    }

    pub fn prompt_text(self) -> String {
        format!("Please confirm {}", self.name())
    }
}

impl fmt::Display for PrivilegedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallbackAction {
    ConfirmReboot,
    AbortReboot,
    ConfirmShutdown,
    AbortShutdown,
}

impl CallbackAction {
    pub fn data(self) -> &'static str {
        match self {
            CallbackAction::ConfirmReboot => "confirm_reboot",
            CallbackAction::AbortReboot => "abort_reboot",
            CallbackAction::ConfirmShutdown => "confirm_shutdown",
            CallbackAction::AbortShutdown => "abort_shutdown",
        }
    }
}

/// Persistent keyboard shown after a successful handshake.
pub fn reply_keyboard(labels: &LabelsConfig) -> Markup {
    let row = |commands: &[Command]| {
        commands
            .iter()
            .map(|command| command.label(labels).to_string())
            .collect::<Vec<_>>()
    };

    Markup::Keyboard(vec![
        row(&[Command::StreamUrl, Command::Snapshot]),
        row(&[Command::Uptime, Command::Help]),
        row(&[Command::Reboot, Command::Shutdown]),
    ])
}

pub fn confirmation_keyboard(action: PrivilegedAction) -> Markup {
    Markup::Inline(vec![vec![
        InlineButton::new("Confirm", action.confirm().data()),
        InlineButton::new("Abort", action.abort().data()),
    ]])
}

/// Entries for Telegram's `/` menu, without the leading slash.
pub fn bot_commands() -> Vec<BotCommand> {
    Command::ALL
        .iter()
        .map(|command| BotCommand {
            command: command.slash().trim_start_matches('/').to_string(),
            description: command.description().to_string(),
        })
        .collect()
}
