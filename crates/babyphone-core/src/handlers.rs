//! Device command handlers and router assembly

use crate::commands::{confirmation_keyboard, Command, PrivilegedAction};
use crate::router::{Handler, Router};
use anyhow::Result;
use async_trait::async_trait;
use babyphone_config::Config;
use babyphone_exec::DeviceActions;
use babyphone_ipc::{InboundEvent, Responder};
use std::sync::Arc;
use tracing::{error, info, warn};

pub const HELP_TEXT: &str =
    "Hello, I am your friendly Babyphone Knecht. Use the keyboard to enter your commands.";

pub struct HelpHandler;

#[async_trait]
impl Handler for HelpHandler {
    async fn handle(&self, event: &InboundEvent, responder: &dyn Responder) -> Result<()> {
        responder
            .send_text(event.session_id(), HELP_TEXT, None)
            .await
    }
}

pub struct StreamUrlHandler {
    device: Arc<dyn DeviceActions>,
    interface: String,
    port: u16,
}

#[async_trait]
impl Handler for StreamUrlHandler {
    async fn handle(&self, event: &InboundEvent, responder: &dyn Responder) -> Result<()> {
        match self.device.stream_url(&self.interface, self.port).await {
            Ok(url) => {
                let link = format!("[{}]({})", url, url);
                responder.send_text(event.session_id(), &link, None).await
            }
            Err(e) => {
                warn!(interface = %self.interface, "Stream address lookup failed: {}", e);
                Ok(())
            }
        }
    }
}

pub struct SnapshotHandler {
    device: Arc<dyn DeviceActions>,
}

#[async_trait]
impl Handler for SnapshotHandler {
    async fn handle(&self, event: &InboundEvent, responder: &dyn Responder) -> Result<()> {
        match self.device.snapshot().await {
            Ok(image) => responder.send_photo(event.session_id(), image).await,
            Err(e) => {
                warn!("Snapshot failed: {}", e);
                Ok(())
            }
        }
    }
}

pub struct UptimeHandler {
    device: Arc<dyn DeviceActions>,
}

#[async_trait]
impl Handler for UptimeHandler {
    async fn handle(&self, event: &InboundEvent, responder: &dyn Responder) -> Result<()> {
        match self.device.uptime().await {
            Ok(uptime) => responder.send_text(event.session_id(), &uptime, None).await,
            Err(e) => {
                warn!("Uptime lookup failed: {}", e);
                Ok(())
            }
        }
    }
}

/// Asks for confirmation with Confirm/Abort inline buttons.
pub struct ConfirmPrompt {
    action: PrivilegedAction,
}

#[async_trait]
impl Handler for ConfirmPrompt {
    async fn handle(&self, event: &InboundEvent, responder: &dyn Responder) -> Result<()> {
        responder
            .send_text(
                event.session_id(),
                &self.action.prompt_text(),
                Some(confirmation_keyboard(self.action)),
            )
            .await
    }
}

/// Runs the confirmed action in a detached task. The dispatch returns
/// before the device command finishes; failures are only logged.
pub struct ConfirmedAction {
    device: Arc<dyn DeviceActions>,
    action: PrivilegedAction,
}

#[async_trait]
impl Handler for ConfirmedAction {
    async fn handle(&self, event: &InboundEvent, _responder: &dyn Responder) -> Result<()> {
        info!(
            sender_id = event.sender_id(),
            chat_id = event.session_id(),
            "User confirmed {}",
            self.action
        );

        let device = Arc::clone(&self.device);
        let action = self.action;
        tokio::spawn(async move {
            let result = match action {
                PrivilegedAction::Reboot => device.reboot().await,
                PrivilegedAction::Shutdown => device.shutdown().await,
            };
            if let Err(e) = result {
                error!("Device {} failed: {}", action, e);
            }
        });
        Ok(())
    }
}

pub struct AbortedAction {
    action: PrivilegedAction,
}

#[async_trait]
impl Handler for AbortedAction {
    async fn handle(&self, event: &InboundEvent, _responder: &dyn Responder) -> Result<()> {
        info!(
            sender_id = event.sender_id(),
            chat_id = event.session_id(),
            "User aborted {}",
            self.action
        );
        Ok(())
    }
}

fn command_handler(
    command: Command,
    config: &Config,
    device: &Arc<dyn DeviceActions>,
) -> Arc<dyn Handler> {
    match command {
        Command::Help => Arc::new(HelpHandler),
        Command::StreamUrl => Arc::new(StreamUrlHandler {
            device: Arc::clone(device),
            interface: config.device.stream_interface.clone(),
            port: config.device.stream_port,
        }),
        Command::Snapshot => Arc::new(SnapshotHandler {
            device: Arc::clone(device),
        }),
        Command::Uptime => Arc::new(UptimeHandler {
            device: Arc::clone(device),
        }),
        Command::Reboot => Arc::new(ConfirmPrompt {
            action: PrivilegedAction::Reboot,
        }),
        Command::Shutdown => Arc::new(ConfirmPrompt {
            action: PrivilegedAction::Shutdown,
        }),
    }
}

/// Registers every command under its slash form and its keyboard label,
/// and every confirmation callback with prompt retraction.
pub fn build_router(config: &Config, device: Arc<dyn DeviceActions>) -> Router {
    let mut router = Router::new();

    for command in Command::ALL {
        let handler = command_handler(command, config, &device);
        router.register(command.slash(), Arc::clone(&handler));
        router.register(command.label(&config.labels), handler);
    }

    for action in PrivilegedAction::ALL {
        router.register_callback(
            action.confirm().data(),
            Arc::new(ConfirmedAction {
                device: Arc::clone(&device),
                action,
            }),
            true,
        );
        router.register_callback(action.abort().data(), Arc::new(AbortedAction { action }), true);
    }

    router
}
