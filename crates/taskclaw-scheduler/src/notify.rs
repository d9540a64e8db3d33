//! Failure alerting — samples consecutive failures and fans alerts out to channels.
//!
//! A trigger that keeps failing is reported on its 1st consecutive failure and then
//! with geometric back-off (3rd, 5th, 9th, 17th, …) so a broken job does not flood
//! the channels. A success resets the count.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use taskclaw_core::error::Result;
use tokio::task::JoinHandle;

/// Alerts kept in memory.
const HISTORY_CAPACITY: usize = 100;

/// An alert to send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub title: String,
    pub body: String,
    pub priority: NotifyPriority,
    /// Trigger that raised it.
    pub source: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl Notification {
    pub fn new(title: &str, body: &str, source: &str, priority: NotifyPriority) -> Self {
        Self {
            title: title.to_string(),
            body: body.to_string(),
            priority,
            source: source.to_string(),
            timestamp: chrono::Utc::now(),
        }
    }

    /// Single-line text form for plain sinks.
    pub fn message(&self) -> String {
        format!("{}: {}", self.title, self.body)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NotifyPriority {
    Low,
    Normal,
    High,
    Urgent,
}

/// A destination for alerts.
#[async_trait]
pub trait NotifyChannel: Send + Sync {
    fn name(&self) -> &str;
    async fn send(&self, notification: &Notification) -> Result<()>;
}

/// Writes alerts to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogChannel;

#[async_trait]
impl NotifyChannel for LogChannel {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, notification: &Notification) -> Result<()> {
        tracing::warn!("📢 [{}] {}", notification.source, notification.message());
        Ok(())
    }
}

/// Hands the formatted message to a closure.
pub struct FnChannel {
    name: String,
    sink: Arc<dyn Fn(&str) + Send + Sync>,
}

impl FnChannel {
    pub fn new<F>(name: &str, sink: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            sink: Arc::new(sink),
        }
    }
}

#[async_trait]
impl NotifyChannel for FnChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, notification: &Notification) -> Result<()> {
        (self.sink)(&notification.message());
        Ok(())
    }
}

/// Should the `n`th consecutive failure raise an alert? True for 1, 3, 5, 9, 17, …
pub fn should_notify(consecutive_failures: u32) -> bool {
    consecutive_failures == 1
        || (consecutive_failures >= 3 && (consecutive_failures - 1).is_power_of_two())
}

pub struct ErrorNotifier {
    channels: RwLock<Vec<Arc<dyn NotifyChannel>>>,
    consecutive: Mutex<HashMap<String, u32>>,
    history: Mutex<VecDeque<Notification>>,
}

impl ErrorNotifier {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(Vec::new()),
            consecutive: Mutex::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
        }
    }

    pub fn with_channels(channels: Vec<Arc<dyn NotifyChannel>>) -> Self {
        let notifier = Self::new();
        if let Ok(mut current) = notifier.channels.write() {
            *current = channels;
        }
        notifier
    }

    pub fn add_channel(&self, channel: Arc<dyn NotifyChannel>) {
        match self.channels.write() {
            Ok(mut channels) => channels.push(channel),
            Err(poisoned) => poisoned.into_inner().push(channel),
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channels.read().map(|c| c.len()).unwrap_or(0)
    }

    /// Count a failure and alert if the sampling policy says so. Delivery runs on a
    /// background task; the returned handle is `None` when the failure was sampled out.
    /// Channel errors are logged, never returned. Must be called inside a tokio runtime.
    pub fn record_failure(&self, event_name: &str, error: &str) -> Option<JoinHandle<()>> {
        let count = {
            let mut counts = match self.consecutive.lock() {
                Ok(c) => c,
                Err(poisoned) => poisoned.into_inner(),
            };
            let n = counts.entry(event_name.to_string()).or_insert(0);
            *n = n.saturating_add(1);
            *n
        };
        if !should_notify(count) {
            tracing::debug!("🔕 '{}' failure #{} not alerted (sampled)", event_name, count);
            return None;
        }

        let priority = if count >= 3 {
            NotifyPriority::High
        } else {
            NotifyPriority::Normal
        };
        let notification = Notification::new(
            &format!("Trigger '{event_name}' failing"),
            &format!("{count} consecutive failure(s). Last error: {error}"),
            event_name,
            priority,
        );
        Some(self.dispatch(notification))
    }

    /// A success ends the failure streak.
    pub fn record_success(&self, event_name: &str) {
        let mut counts = match self.consecutive.lock() {
            Ok(c) => c,
            Err(poisoned) => poisoned.into_inner(),
        };
        counts.remove(event_name);
    }

    pub fn consecutive_failures(&self, event_name: &str) -> u32 {
        self.consecutive
            .lock()
            .ok()
            .and_then(|c| c.get(event_name).copied())
            .unwrap_or(0)
    }

    /// Recent alerts, oldest first.
    pub fn history(&self) -> Vec<Notification> {
        self.history
            .lock()
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn dispatch(&self, notification: Notification) -> JoinHandle<()> {
        if let Ok(mut history) = self.history.lock() {
            history.push_back(notification.clone());
            while history.len() > HISTORY_CAPACITY {
                history.pop_front();
            }
        }

        let channels: Vec<Arc<dyn NotifyChannel>> = self
            .channels
            .read()
            .map(|c| c.clone())
            .unwrap_or_default();
        tokio::spawn(async move {
            let sends = channels.iter().map(|channel| {
                let notification = &notification;
                async move {
                    if let Err(e) = channel.send(notification).await {
                        tracing::warn!("⚠️ Alert via {} failed: {e}", channel.name());
                    }
                }
            });
            join_all(sends).await;
        })
    }
}

impl Default for ErrorNotifier {
    fn default() -> Self {
        Self::new()
    }
}
