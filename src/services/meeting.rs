//! Virtual meeting teardown
//!
//! Cancelled sessions release their meeting room on a best-effort basis.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::config::MeetingConfig;

#[async_trait]
pub trait MeetingProvider: Send + Sync {
    async fn teardown(&self, room: &str) -> Result<()>;
}

/// Used when no meeting provider is configured
pub struct NoopMeetings;

#[async_trait]
impl MeetingProvider for NoopMeetings {
    async fn teardown(&self, _room: &str) -> Result<()> {
        Ok(())
    }
}

/// `DELETE {api_base}/rooms/{name}` with a bearer key
pub struct HttpMeetings {
    http: reqwest::Client,
    api_base: String,
    api_key: String,
}

impl HttpMeetings {
    pub fn new(api_base: impl Into<String>, api_key: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build meeting HTTP client")?;
        Ok(Self {
            http,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }
}

#[async_trait]
impl MeetingProvider for HttpMeetings {
    async fn teardown(&self, room: &str) -> Result<()> {
        let resp = self
            .http
            .delete(format!("{}/rooms/{}", self.api_base, room))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .context("Meeting teardown request failed")?;
        // Already gone counts as torn down
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        resp.error_for_status().context("Meeting provider rejected teardown")?;
        Ok(())
    }
}

pub fn create_meeting_provider(config: &MeetingConfig) -> Result<Arc<dyn MeetingProvider>> {
    match config.api_base.as_deref().filter(|u| !u.is_empty()) {
        Some(base) => Ok(Arc::new(HttpMeetings::new(base, config.api_key.clone())?)),
        None => Ok(Arc::new(NoopMeetings)),
    }
}

/// Room name: last non-empty path segment of the meeting URL
pub fn room_name_from_url(url: &str) -> Option<&str> {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    let path = without_query
        .split_once("://")
        .map(|(_, rest)| rest.split_once('/').map(|(_, p)| p).unwrap_or(""))
        .unwrap_or(without_query);
    path.rsplit('/').find(|segment| !segment.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_name_from_url() {
        assert_eq!(room_name_from_url("https://meet.example.com/tutoring-abc123"), Some("tutoring-abc123"));
        assert_eq!(room_name_from_url("https://meet.example.com/rooms/abc/"), Some("abc"));
        assert_eq!(room_name_from_url("https://meet.example.com/abc?t=1"), Some("abc"));
        assert_eq!(room_name_from_url("https://meet.example.com"), None);
        assert_eq!(room_name_from_url("https://meet.example.com/"), None);
    }

    #[tokio::test]
    async fn test_noop_teardown() {
        let provider = create_meeting_provider(&MeetingConfig::default()).unwrap();
        assert!(provider.teardown("room").await.is_ok());
    }
}
