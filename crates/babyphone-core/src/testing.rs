//! Test doubles shared by the unit tests of this crate.

use crate::router::Handler;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use babyphone_exec::{DeviceActions, ExecError};
use babyphone_ipc::{InboundEvent, Markup, Responder};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sent {
    Text {
        chat_id: i64,
        text: String,
        markup: Option<Markup>,
    },
    Photo {
        chat_id: i64,
        bytes: usize,
    },
    Delete {
        chat_id: i64,
        message_id: i64,
    },
}

impl Sent {
    pub fn text(chat_id: i64, text: &str) -> Self {
        Sent::Text {
            chat_id,
            text: text.to_string(),
            markup: None,
        }
    }

    pub fn delete(chat_id: i64, message_id: i64) -> Self {
        Sent::Delete {
            chat_id,
            message_id,
        }
    }
}

/// Records every outbound call in order.
#[derive(Default)]
pub struct RecordingResponder {
    sent: Mutex<Vec<Sent>>,
    fail_deletes: bool,
}

impl RecordingResponder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records delete attempts but reports them as failed.
    pub fn failing_deletes() -> Self {
        Self {
            fail_deletes: true,
            ..Self::default()
        }
    }

    pub async fn sent(&self) -> Vec<Sent> {
        self.sent.lock().await.clone()
    }

    pub async fn texts(&self) -> Vec<String> {
        self.sent
            .lock()
            .await
            .iter()
            .filter_map(|s| match s {
                Sent::Text { text, .. } => Some(text.clone()),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl Responder for RecordingResponder {
    async fn send_text(&self, chat_id: i64, text: &str, markup: Option<Markup>) -> Result<()> {
        self.sent.lock().await.push(Sent::Text {
            chat_id,
            text: text.to_string(),
            markup,
        });
        Ok(())
    }

    async fn send_photo(&self, chat_id: i64, image: Vec<u8>) -> Result<()> {
        self.sent.lock().await.push(Sent::Photo {
            chat_id,
            bytes: image.len(),
        });
        Ok(())
    }

    async fn delete_message(&self, chat_id: i64, message_id: i64) -> Result<()> {
        self.sent.lock().await.push(Sent::delete(chat_id, message_id));
        if self.fail_deletes {
            return Err(anyhow!("message to delete not found"));
        }
        Ok(())
    }
}

/// Counts invocations and replies with a fixed marker text.
pub struct SpyHandler {
    reply: String,
    fail: bool,
    calls: AtomicUsize,
}

impl SpyHandler {
    pub fn new(reply: &str) -> Self {
        Self {
            reply: reply.to_string(),
            fail: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(reply: &str) -> Self {
        Self {
            fail: true,
            ..Self::new(reply)
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Handler for SpyHandler {
    async fn handle(&self, event: &InboundEvent, responder: &dyn Responder) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(anyhow!("{} failed", self.reply));
        }
        responder
            .send_text(event.session_id(), &self.reply, None)
            .await
    }
}

#[derive(Default)]
pub struct FakeDevice {
    pub fail: bool,
    pub reboots: AtomicUsize,
    pub shutdowns: AtomicUsize,
}

impl FakeDevice {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    fn check(&self, what: &str) -> babyphone_exec::Result<()> {
        if self.fail {
            return Err(ExecError::Command {
                command: what.to_string(),
                reason: "device unavailable".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl DeviceActions for FakeDevice {
    async fn stream_url(&self, _interface: &str, port: u16) -> babyphone_exec::Result<String> {
        self.check("ip")?;
        Ok(format!("192.168.1.20:{}/", port))
    }

    async fn uptime(&self) -> babyphone_exec::Result<String> {
        self.check("uptime")?;
        Ok("up 1 day, 2 hours, 3 minutes".to_string())
    }

    async fn snapshot(&self) -> babyphone_exec::Result<Vec<u8>> {
        self.check("snapshot")?;
        Ok(vec![0xff, 0xd8, 0xff, 0xe0])
    }

    async fn reboot(&self) -> babyphone_exec::Result<()> {
        self.reboots.fetch_add(1, Ordering::SeqCst);
        self.check("reboot")
    }

    async fn shutdown(&self) -> babyphone_exec::Result<()> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        self.check("shutdown")
    }
}

/// Gives spawned tasks a chance to finish on the current-thread test runtime.
pub async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}
