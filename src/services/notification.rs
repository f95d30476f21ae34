//! Session notifications
//!
//! Fire-and-forget: delivery runs on a spawned task and failures are only
//! logged, so a slow or broken sink never blocks a booking operation.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::NotificationConfig;
use crate::models::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationEvent {
    SessionBooked,
    SessionCancelled,
    SessionCompleted,
    /// Reserved for rescheduling; nothing emits it yet
    SessionRescheduled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub event: NotificationEvent,
    pub user_id: String,
    pub session_id: String,
    pub payload: serde_json::Value,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<()>;
}

/// Writes notifications to the log only
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, notification: &Notification) -> Result<()> {
        info!(
            event = ?notification.event,
            user_id = %notification.user_id,
            session_id = %notification.session_id,
            "notification"
        );
        Ok(())
    }
}

/// POSTs each notification as JSON to a configured endpoint
pub struct WebhookNotifier {
    http: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build notification HTTP client")?;
        Ok(Self { http, url: url.into() })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, notification: &Notification) -> Result<()> {
        self.http
            .post(&self.url)
            .json(notification)
            .send()
            .await
            .context("Notification request failed")?
            .error_for_status()
            .context("Notification endpoint rejected event")?;
        Ok(())
    }
}

/// Build the configured sink
pub fn create_notifier(config: &NotificationConfig) -> Result<Arc<dyn Notifier>> {
    match config.webhook_url.as_deref().filter(|u| !u.is_empty()) {
        Some(url) => Ok(Arc::new(WebhookNotifier::new(url, Duration::from_millis(config.timeout_ms))?)),
        None => Ok(Arc::new(LogNotifier)),
    }
}

#[derive(Clone)]
pub struct NotificationDispatcher {
    notifier: Arc<dyn Notifier>,
}

impl NotificationDispatcher {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self { notifier }
    }

    pub fn dispatch(&self, notification: Notification) -> JoinHandle<()> {
        let notifier = self.notifier.clone();
        tokio::spawn(async move {
            if let Err(e) = notifier.send(&notification).await {
                warn!(
                    event = ?notification.event,
                    user_id = %notification.user_id,
                    session_id = %notification.session_id,
                    error = %e,
                    "Failed to deliver notification"
                );
            }
        })
    }

    /// Notify tutor and student of the same event
    pub fn notify_participants(
        &self,
        session: &Session,
        event: NotificationEvent,
        payload: serde_json::Value,
    ) -> Vec<JoinHandle<()>> {
        [&session.tutor_id, &session.student_id]
            .into_iter()
            .map(|user_id| {
                self.dispatch(Notification {
                    event,
                    user_id: user_id.clone(),
                    session_id: session.id.clone(),
                    payload: payload.clone(),
                })
            })
            .collect()
    }
}
