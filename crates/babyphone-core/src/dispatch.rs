//! Gate-then-route dispatch of inbound events

use crate::commands::START_COMMAND;
use crate::router::{Route, Router};
use babyphone_gate::IdentityGate;
use babyphone_ipc::{InboundEvent, Markup, Responder};
use std::sync::Arc;
use tracing::{info, warn};

pub const GREETING_TEXT: &str =
    "Hey There! You just have successfully started your personal Babyphone Knecht.";
pub const KEYBOARD_TEXT: &str = "Use the keyboard to enter your commands.";
pub const PIN_FAILURE_TEXT: &str =
    "Sorry, I could not authenticate you via PIN! Please restart me and pass a valid PIN.";

pub fn not_authorized_text(chat_id: i64) -> String {
    format!(
        "Sorry, your chat id {} is invalid! This chat is not authorized to use the Babyphone Knecht.",
        chat_id
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Established,
    Handled,
    Fallback,
    Rejected,
    Dropped,
}

pub struct Dispatcher {
    gate: Arc<IdentityGate>,
    router: Router,
    pin: Option<u64>,
    keyboard: Option<Markup>,
}

impl Dispatcher {
    pub fn new(gate: Arc<IdentityGate>, router: Router, pin: Option<u64>) -> Self {
        Self {
            gate,
            router,
            pin,
            keyboard: None,
        }
    }

    /// Reply keyboard sent after a successful handshake.
    pub fn with_keyboard(mut self, keyboard: Markup) -> Self {
        self.keyboard = Some(keyboard);
        self
    }

    pub fn gate(&self) -> &IdentityGate {
        &self.gate
    }

    pub async fn dispatch(&self, event: &InboundEvent, responder: &dyn Responder) -> Outcome {
        if let InboundEvent::Command { text, .. } = event {
            if let Some(args) = start_arguments(text) {
                return self.handshake(event, args, responder).await;
            }
        }

        if let Err(err) = self.gate.authorize(event) {
            warn!(
                sender_id = event.sender_id(),
                chat_id = event.session_id(),
                kind = event.kind(),
                "Unauthorized access denied: {}",
                err
            );
            self.reply(
                responder,
                event.session_id(),
                &not_authorized_text(event.session_id()),
                None,
            )
            .await;
            return Outcome::Rejected;
        }

        let route = match event {
            InboundEvent::Command { .. } => self.router.dispatch_command(event, responder).await,
            InboundEvent::Callback { .. } => self.router.dispatch_callback(event, responder).await,
        };

        match route {
            Route::Handled | Route::Failed => Outcome::Handled,
            Route::Fallback => Outcome::Fallback,
            Route::Dropped => Outcome::Dropped,
        }
    }

    async fn handshake(&self, event: &InboundEvent, args: &str, responder: &dyn Responder) -> Outcome {
        let chat_id = event.session_id();
        match self.gate.establish(chat_id, args, self.pin) {
            Ok(identifier) => {
                info!(
                    sender_id = event.sender_id(),
                    chat_id = identifier,
                    "Chat authenticated"
                );
                self.reply(responder, chat_id, GREETING_TEXT, None).await;
                self.reply(responder, chat_id, KEYBOARD_TEXT, self.keyboard.clone())
                    .await;
                Outcome::Established
            }
            Err(err) => {
                warn!(
                    sender_id = event.sender_id(),
                    chat_id,
                    "Handshake rejected: {}",
                    err
                );
                self.reply(responder, chat_id, PIN_FAILURE_TEXT, None).await;
                Outcome::Rejected
            }
        }
    }

    async fn reply(&self, responder: &dyn Responder, chat_id: i64, text: &str, markup: Option<Markup>) {
        if let Err(e) = responder.send_text(chat_id, text, markup).await {
            warn!(chat_id, "Failed to send reply: {:#}", e);
        }
    }
}

/// Arguments of a `/start` command, or `None` when `text` is something else.
/// The command word is matched case-insensitively and may carry a
/// `@botname` suffix.
pub fn start_arguments(text: &str) -> Option<&str> {
    let text = text.trim_start();
    let (word, rest) = match text.find(char::is_whitespace) {
        Some(idx) => (&text[..idx], &text[idx..]),
        None => (text, ""),
    };
    let command = word.split('@').next().unwrap_or(word);
    if command.eq_ignore_ascii_case(START_COMMAND) {
        Some(rest.trim())
    } else {
        None
    }
}
