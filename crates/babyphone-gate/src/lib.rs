//! Babyphone Identity Gate
//!
//! Binds the process to exactly one authorized chat, either from
//! configuration or through a one-time PIN handshake

use babyphone_config::AuthConfig;
use babyphone_ipc::InboundEvent;
use std::sync::OnceLock;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GateError {
    #[error("no chat is bound yet, chat {session_id} must complete the PIN handshake first")]
    NotEstablished { session_id: i64 },

    #[error("chat {session_id} is not the authorized chat")]
    NotAuthorized { session_id: i64 },

    #[error("authorized chat is already bound to {identifier}")]
    AlreadyEstablished { identifier: i64 },

    #[error("supplied PIN does not match")]
    SecretMismatch,

    #[error("no PIN is configured, the handshake is disabled")]
    NoSecretConfigured,
}

/// Single-assignment holder of the authorized chat id.
///
/// The cell is written at most once per process; every later write loses,
/// including concurrent ones racing the first.
#[derive(Debug, Default)]
pub struct IdentityGate {
    session: OnceLock<i64>,
}

impl IdentityGate {
    pub fn new(config: &AuthConfig) -> Self {
        let gate = Self::default();
        if let Some(chat_id) = config.chat_id {
            let _ = gate.session.set(chat_id);
            info!(chat_id, "Authorized chat bound from configuration");
        }
        gate
    }

    pub fn identifier(&self) -> Option<i64> {
        self.session.get().copied()
    }

    pub fn is_established(&self) -> bool {
        self.session.get().is_some()
    }

    pub fn authorize(&self, event: &InboundEvent) -> Result<(), GateError> {
        self.authorize_session(event.session_id())
    }

    pub fn authorize_session(&self, session_id: i64) -> Result<(), GateError> {
        match self.session.get() {
            None => Err(GateError::NotEstablished { session_id }),
            Some(&identifier) if identifier == session_id => Ok(()),
            Some(_) => Err(GateError::NotAuthorized { session_id }),
        }
    }

    /// First writer wins: once bound, every call fails regardless of the PIN.
    pub fn establish(
        &self,
        session_id: i64,
        supplied_secret: &str,
        expected_secret: Option<u64>,
    ) -> Result<i64, GateError> {
        if let Some(&identifier) = self.session.get() {
            return Err(GateError::AlreadyEstablished { identifier });
        }

        let expected = expected_secret.ok_or(GateError::NoSecretConfigured)?;
        if parse_pin(supplied_secret) != Some(expected) {
            return Err(GateError::SecretMismatch);
        }

        match self.session.set(session_id) {
            Ok(()) => {
                info!(chat_id = session_id, "Authorized chat bound by PIN handshake");
                Ok(session_id)
            }
            Err(_) => Err(GateError::AlreadyEstablished {
                identifier: self.identifier().unwrap_or(session_id),
            }),
        }
    }
}

/// Parses a PIN argument. Only a single run of ASCII digits is accepted;
/// anything else, including overflow, is treated as no PIN at all.
pub fn parse_pin(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    raw.parse().ok()
}
