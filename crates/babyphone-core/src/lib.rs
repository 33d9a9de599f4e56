//! Babyphone Core
//!
//! Dispatch core of the bot: the command catalog, the router, device
//! handlers, and the runtime that wires the Telegram adapter to them

pub mod commands;
pub mod dispatch;
pub mod handlers;
pub mod router;

#[cfg(test)]
mod testing;

pub use dispatch::{Dispatcher, Outcome};
pub use router::{normalize, Handler, Retracting, Route, RouteError, Router};

use anyhow::{anyhow, Result};
use babyphone_config::Config;
use babyphone_exec::{DeviceActions, SystemDevice};
use babyphone_gate::IdentityGate;
use babyphone_ipc::{Envelope, EventBus, Responder};
use babyphone_telegram::TelegramAdapter;
use std::sync::Arc;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const MAX_INBOUND_CONCURRENCY: usize = 8;

pub struct BabyphoneRuntime {
    config: Config,
    gate: Arc<IdentityGate>,
    event_bus: EventBus,
}

impl BabyphoneRuntime {
    pub fn new(config: Config) -> Self {
        let gate = Arc::new(IdentityGate::new(&config.auth));
        Self {
            config,
            gate,
            event_bus: EventBus::new(),
        }
    }

    pub fn gate(&self) -> Arc<IdentityGate> {
        Arc::clone(&self.gate)
    }

    /// Builds the frozen dispatcher for the given device backend.
    pub fn build_dispatcher(&self, device: Arc<dyn DeviceActions>) -> Dispatcher {
        let router = handlers::build_router(&self.config, device);
        Dispatcher::new(Arc::clone(&self.gate), router, self.config.auth.pin)
            .with_keyboard(commands::reply_keyboard(&self.config.labels))
    }

    pub async fn run(&self) -> Result<()> {
        info!("Babyphone runtime starting...");

        let bot_token = self.config.telegram.resolve_token()?;
        let data_dir = self.config.data_dir();
        let device: Arc<dyn DeviceActions> = Arc::new(SystemDevice::new(&self.config.device));
        let dispatcher = Arc::new(self.build_dispatcher(device));

        let adapter = Arc::new(
            TelegramAdapter::new(&bot_token, &self.config.telegram, data_dir)?
                .with_event_bus(self.event_bus.clone())
                .with_bot_commands(commands::bot_commands()),
        );

        match self.gate.identifier() {
            Some(chat_id) => info!(chat_id, "Authorized chat preconfigured"),
            None => info!("Waiting for /start <pin> to bind the authorized chat"),
        }

        // Subscribe before polling so no early update is missed.
        let inbound_rx = self.event_bus.subscribe();
        let responder: Arc<dyn Responder> = adapter.clone();
        let mut processor = spawn_dispatcher(dispatcher, responder, inbound_rx);

        let poller = Arc::clone(&adapter);
        let mut polling = tokio::spawn(async move { poller.poll().await });

        tokio::select! {
            joined = &mut polling => {
                processor.abort();
                match joined {
                    Ok(Ok(())) => Err(anyhow!("Telegram polling stopped")),
                    Ok(Err(e)) => Err(e.context("Telegram polling failed")),
                    Err(e) => Err(anyhow!("Telegram polling task panicked: {}", e)),
                }
            }
            joined = &mut processor => {
                polling.abort();
                match joined {
                    Ok(()) => Err(anyhow!("Event processor stopped")),
                    Err(e) => Err(anyhow!("Event processor task panicked: {}", e)),
                }
            }
        }
    }
}

/// Receives envelopes until the bus closes and dispatches each one in its
/// own task, at most `MAX_INBOUND_CONCURRENCY` at a time.
pub fn spawn_dispatcher(
    dispatcher: Arc<Dispatcher>,
    responder: Arc<dyn Responder>,
    mut inbound_rx: broadcast::Receiver<Envelope>,
) -> JoinHandle<()> {
    let semaphore = Arc::new(Semaphore::new(MAX_INBOUND_CONCURRENCY));

    tokio::spawn(async move {
        loop {
            match inbound_rx.recv().await {
                Ok(envelope) => {
                    let dispatcher = Arc::clone(&dispatcher);
                    let responder = Arc::clone(&responder);
                    let semaphore = Arc::clone(&semaphore);

                    tokio::spawn(async move {
                        let _permit = match semaphore.acquire_owned().await {
                            Ok(permit) => permit,
                            Err(err) => {
                                error!(
                                    "Inbound worker semaphore closed (trace_id={}): {}",
                                    envelope.trace_id, err
                                );
                                return;
                            }
                        };
                        process_envelope(&dispatcher, &envelope, responder.as_ref()).await;
                    });
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!("Event bus closed, stopping event processor");
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Event bus lagged by {} events", n);
                }
            }
        }
    })
}

async fn process_envelope(
    dispatcher: &Dispatcher,
    envelope: &Envelope,
    responder: &dyn Responder,
) -> Outcome {
    let outcome = dispatcher.dispatch(&envelope.event, responder).await;
    debug!(
        trace_id = %envelope.trace_id,
        channel = %envelope.channel,
        kind = envelope.event.kind(),
        ?outcome,
        "Inbound event dispatched"
    );
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{not_authorized_text, GREETING_TEXT};
    use crate::handlers::HELP_TEXT;
    use crate::testing::{FakeDevice, RecordingResponder};
    use babyphone_config::AuthConfig;
    use babyphone_ipc::InboundEvent;
    use tokio::time::{sleep, Duration};

    fn config_with(auth: AuthConfig) -> Config {
        Config {
            auth,
            ..Config::default()
        }
    }

    async fn wait_for_texts(responder: &RecordingResponder, count: usize) -> Vec<String> {
        for _ in 0..100 {
            let texts = responder.texts().await;
            if texts.len() >= count {
                return texts;
            }
            sleep(Duration::from_millis(10)).await;
        }
        responder.texts().await
    }

    #[test]
    fn configured_chat_id_binds_gate_at_startup() {
        let runtime = BabyphoneRuntime::new(config_with(AuthConfig {
            pin: None,
            chat_id: Some(900),
        }));
        assert_eq!(runtime.gate().identifier(), Some(900));
    }

    #[tokio::test]
    async fn preconfigured_chat_is_served_without_handshake() {
        let runtime = BabyphoneRuntime::new(config_with(AuthConfig {
            pin: None,
            chat_id: Some(900),
        }));
        let dispatcher = runtime.build_dispatcher(Arc::new(FakeDevice::default()));
        let responder = RecordingResponder::new();

        let envelope = Envelope::new("telegram", InboundEvent::command(1, 900, "help"));
        let outcome = process_envelope(&dispatcher, &envelope, &responder).await;

        assert_eq!(outcome, Outcome::Handled);
        assert_eq!(responder.texts().await, vec![HELP_TEXT.to_string()]);
    }

    #[tokio::test]
    async fn bus_events_flow_through_dispatcher() {
        let runtime = BabyphoneRuntime::new(config_with(AuthConfig {
            pin: Some(4821),
            chat_id: None,
        }));
        let dispatcher = Arc::new(runtime.build_dispatcher(Arc::new(FakeDevice::default())));
        let responder = Arc::new(RecordingResponder::new());

        let bus = EventBus::new();
        let processor = spawn_dispatcher(dispatcher, responder.clone(), bus.subscribe());

        bus.publish(Envelope::new("telegram", InboundEvent::command(1, 900, "/start 4821")))
            .expect("publish start");
        let texts = wait_for_texts(&responder, 2).await;
        assert_eq!(texts[0], GREETING_TEXT);

        bus.publish(Envelope::new("telegram", InboundEvent::command(2, 901, "/help")))
            .expect("publish foreign");
        let texts = wait_for_texts(&responder, 3).await;
        assert_eq!(texts[2], not_authorized_text(901));
        assert_eq!(runtime.gate().identifier(), Some(900));

        drop(bus);
        processor.await.expect("processor exits when bus closes");
    }
}
