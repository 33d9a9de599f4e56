//! Command and callback routing
//!
//! Two flat registries keyed by normalized token. Unknown command text gets
//! the fallback reply; unknown callback data is dropped.

use anyhow::Result;
use async_trait::async_trait;
use babyphone_ipc::{InboundEvent, Responder};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

pub const FALLBACK_TEXT: &str = "Sorry, I didn't understand that command.";

#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, event: &InboundEvent, responder: &dyn Responder) -> Result<()>;
}

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("unknown callback '{0}'")]
    UnknownCallback(String),

    #[error("handler for '{token}' failed: {source:#}")]
    Handler {
        token: String,
        #[source]
        source: anyhow::Error,
    },
}

/// What the router did with one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Handled,
    /// Handler ran and returned an error; already logged.
    Failed,
    Fallback,
    Dropped,
}

/// Canonical form of a command token or label: trimmed and lowercased.
pub fn normalize(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// Deletes the prompt that hosted the pressed inline button, then runs
/// the wrapped handler. Deletion failures never block the handler.
pub struct Retracting {
    inner: Arc<dyn Handler>,
}

impl Retracting {
    pub fn new(inner: Arc<dyn Handler>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Handler for Retracting {
    async fn handle(&self, event: &InboundEvent, responder: &dyn Responder) -> Result<()> {
        if let InboundEvent::Callback {
            session_id,
            prompt_message_id,
            ..
        } = event
        {
            if let Err(e) = responder
                .delete_message(*session_id, *prompt_message_id)
                .await
            {
                warn!(
                    chat_id = session_id,
                    message_id = prompt_message_id,
                    "Failed to delete confirmation prompt: {:#}",
                    e
                );
            }
        }
        self.inner.handle(event, responder).await
    }
}

#[derive(Default)]
pub struct Router {
    commands: HashMap<String, Arc<dyn Handler>>,
    callbacks: HashMap<String, Arc<dyn Handler>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` under the normalized `token`. A later
    /// registration of the same token replaces the earlier one.
    pub fn register(&mut self, token: &str, handler: Arc<dyn Handler>) {
        let key = normalize(token);
        if self.commands.insert(key.clone(), handler).is_some() {
            warn!("Command '{}' registered twice, keeping the last handler", key);
        }
    }

    pub fn register_callback(
        &mut self,
        token: &str,
        handler: Arc<dyn Handler>,
        retract_prompt: bool,
    ) {
        let handler: Arc<dyn Handler> = if retract_prompt {
            Arc::new(Retracting::new(handler))
        } else {
            handler
        };
        let key = normalize(token);
        if self.callbacks.insert(key.clone(), handler).is_some() {
            warn!("Callback '{}' registered twice, keeping the last handler", key);
        }
    }

    pub fn has_command(&self, token: &str) -> bool {
        self.commands.contains_key(&normalize(token))
    }

    pub fn has_callback(&self, token: &str) -> bool {
        self.callbacks.contains_key(&normalize(token))
    }

    pub async fn dispatch_command(&self, event: &InboundEvent, responder: &dyn Responder) -> Route {
        let token = normalize(event.raw());
        match self.commands.get(&token) {
            Some(handler) => run_handler(handler.as_ref(), &token, event, responder).await,
            None => {
                debug!("{}", RouteError::UnknownCommand(token));
                if let Err(e) = responder
                    .send_text(event.session_id(), FALLBACK_TEXT, None)
                    .await
                {
                    warn!("Failed to send fallback reply: {:#}", e);
                }
                Route::Fallback
            }
        }
    }

    pub async fn dispatch_callback(&self, event: &InboundEvent, responder: &dyn Responder) -> Route {
        let token = normalize(event.raw());
        match self.callbacks.get(&token) {
            Some(handler) => run_handler(handler.as_ref(), &token, event, responder).await,
            None => {
                warn!("{}", RouteError::UnknownCallback(token));
                Route::Dropped
            }
        }
    }
}

async fn run_handler(
    handler: &dyn Handler,
    token: &str,
    event: &InboundEvent,
    responder: &dyn Responder,
) -> Route {
    match handler.handle(event, responder).await {
        Ok(()) => Route::Handled,
        Err(source) => {
            let err = RouteError::Handler {
                token: token.to_string(),
                source,
            };
            warn!(chat_id = event.session_id(), "{}", err);
            Route::Failed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingResponder, Sent, SpyHandler};

    fn router_with(token: &str, spy: Arc<SpyHandler>) -> Router {
        let mut router = Router::new();
        router.register(token, spy);
        router
    }

    #[test]
    fn normalize_trims_and_lowercases() {
        assert_eq!(normalize("  URL of Live-Stream \n"), "url of live-stream");
        assert_eq!(normalize("/HELP"), "/help");
        assert_eq!(normalize(""), "");
    }

    #[tokio::test]
    async fn command_lookup_is_case_and_whitespace_insensitive() {
        let spy = Arc::new(SpyHandler::new("help"));
        let router = router_with("/help", spy.clone());
        let responder = RecordingResponder::new();

        for raw in ["/help", " /HELP ", "/Help\n"] {
            let route = router
                .dispatch_command(&InboundEvent::command(1, 900, raw), &responder)
                .await;
            assert_eq!(route, Route::Handled, "raw {:?}", raw);
        }
        assert_eq!(spy.calls(), 3);
    }

    #[tokio::test]
    async fn label_registered_with_mixed_case_matches_lowercase_text() {
        let spy = Arc::new(SpyHandler::new("stream"));
        let router = router_with("URL of Live-Stream", spy.clone());
        let responder = RecordingResponder::new();

        let route = router
            .dispatch_command(&InboundEvent::command(1, 900, "url of live-stream"), &responder)
            .await;
        assert_eq!(route, Route::Handled);
        assert_eq!(spy.calls(), 1);
    }

    #[tokio::test]
    async fn unknown_command_gets_fallback_reply() {
        let spy = Arc::new(SpyHandler::new("help"));
        let router = router_with("/help", spy.clone());
        let responder = RecordingResponder::new();

        let route = router
            .dispatch_command(&InboundEvent::command(1, 900, "/statistics"), &responder)
            .await;

        assert_eq!(route, Route::Fallback);
        assert_eq!(spy.calls(), 0);
        assert_eq!(
            responder.sent().await,
            vec![Sent::text(900, FALLBACK_TEXT)]
        );
    }

    #[tokio::test]
    async fn empty_text_gets_fallback_reply() {
        let router = Router::new();
        let responder = RecordingResponder::new();
        let route = router
            .dispatch_command(&InboundEvent::command(1, 900, "   "), &responder)
            .await;
        assert_eq!(route, Route::Fallback);
        assert_eq!(responder.sent().await.len(), 1);
    }

    #[tokio::test]
    async fn unknown_callback_is_dropped_silently() {
        let router = Router::new();
        let responder = RecordingResponder::new();
        let route = router
            .dispatch_callback(&InboundEvent::callback(1, 900, "confirm_selfdestruct", 7), &responder)
            .await;
        assert_eq!(route, Route::Dropped);
        assert!(responder.sent().await.is_empty());
    }

    #[tokio::test]
    async fn retracting_callback_deletes_prompt_before_handler_runs() {
        let spy = Arc::new(SpyHandler::new("confirmed"));
        let mut router = Router::new();
        router.register_callback("confirm_reboot", spy.clone(), true);
        let responder = RecordingResponder::new();

        let route = router
            .dispatch_callback(&InboundEvent::callback(1, 900, "confirm_reboot", 42), &responder)
            .await;

        assert_eq!(route, Route::Handled);
        assert_eq!(
            responder.sent().await,
            vec![Sent::delete(900, 42), Sent::text(900, "confirmed")]
        );
    }

    #[tokio::test]
    async fn failed_prompt_deletion_does_not_block_handler() {
        let spy = Arc::new(SpyHandler::new("aborted"));
        let mut router = Router::new();
        router.register_callback("abort_reboot", spy.clone(), true);
        let responder = RecordingResponder::failing_deletes();

        let route = router
            .dispatch_callback(&InboundEvent::callback(1, 900, "abort_reboot", 42), &responder)
            .await;

        assert_eq!(route, Route::Handled);
        assert_eq!(spy.calls(), 1);
    }

    #[tokio::test]
    async fn non_retracting_callback_leaves_prompt() {
        let spy = Arc::new(SpyHandler::new("kept"));
        let mut router = Router::new();
        router.register_callback("keep", spy.clone(), false);
        let responder = RecordingResponder::new();

        router
            .dispatch_callback(&InboundEvent::callback(1, 900, "keep", 42), &responder)
            .await;

        assert_eq!(responder.sent().await, vec![Sent::text(900, "kept")]);
    }

    #[tokio::test]
    async fn handler_error_is_contained() {
        let spy = Arc::new(SpyHandler::failing("broken"));
        let router = router_with("/uptime", spy.clone());
        let responder = RecordingResponder::new();

        let route = router
            .dispatch_command(&InboundEvent::command(1, 900, "/uptime"), &responder)
            .await;
        assert_eq!(route, Route::Failed);
        assert_eq!(spy.calls(), 1);
    }

    #[test]
    fn later_registration_replaces_earlier() {
        let mut router = Router::new();
        router.register("/help", Arc::new(SpyHandler::new("a")));
        router.register("/HELP", Arc::new(SpyHandler::new("b")));
        assert!(router.has_command("/help"));
        assert_eq!(router.commands.len(), 1);
    }
}
