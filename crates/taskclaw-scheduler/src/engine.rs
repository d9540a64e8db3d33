//! Scheduler loop — turns cron expressions into `fire` calls.
//! Uses tokio::interval for ticking; nothing in the registry depends on this loop,
//! it is just one caller of `TriggerRegistry::fire_scheduled`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::task::JoinHandle;

use crate::cron;
use crate::priority::PriorityScheduler;
use crate::registry::TriggerRegistry;
use crate::tasks::{FireResult, TriggerConfig};

/// A trigger whose fire time has passed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueTrigger {
    pub event_name: String,
    pub priority: i32,
    /// The cron instant it was due at.
    pub scheduled_at: DateTime<Utc>,
}

/// Tracks each trigger's next fire time between ticks.
#[derive(Debug, Default)]
pub struct DueTracker {
    next_run: HashMap<String, DateTime<Utc>>,
}

impl DueTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enabled triggers due at `now`. A trigger first seen on this tick is scheduled
    /// from `now` and does not fire immediately; missed instants collapse into one firing.
    pub fn collect_due(&mut self, triggers: &[TriggerConfig], now: DateTime<Utc>) -> Vec<DueTrigger> {
        self.next_run
            .retain(|name, _| triggers.iter().any(|t| t.enabled && &t.event_name == name));

        let mut due = Vec::new();
        for trigger in triggers.iter().filter(|t| t.enabled) {
            let next = match self.next_run.get(&trigger.event_name) {
                Some(next) => *next,
                None => {
                    if let Some(next) = cron::next_run_from_cron(&trigger.cron_expression, now) {
                        self.next_run.insert(trigger.event_name.clone(), next);
                    }
                    continue;
                }
            };
            if next > now {
                continue;
            }
            due.push(DueTrigger {
                event_name: trigger.event_name.clone(),
                priority: trigger.priority,
                scheduled_at: next,
            });
            match cron::next_run_from_cron(&trigger.cron_expression, now) {
                Some(following) => {
                    self.next_run.insert(trigger.event_name.clone(), following);
                }
                None => {
                    self.next_run.remove(&trigger.event_name);
                }
            }
        }
        due
    }

    pub fn next_run(&self, event_name: &str) -> Option<DateTime<Utc>> {
        self.next_run.get(event_name).copied()
    }
}

/// Start every due firing, highest priority first, and wait for all of them.
pub async fn fire_due(registry: Arc<TriggerRegistry>, due: Vec<DueTrigger>) -> Vec<FireResult> {
    let queue: PriorityScheduler<JoinHandle<FireResult>> = PriorityScheduler::new();
    for trigger in due {
        let registry = registry.clone();
        let DueTrigger {
            event_name,
            priority,
            scheduled_at,
        } = trigger;
        let id = event_name.clone();
        queue
            .schedule(
                &id,
                Box::new(move || {
                    async move {
                        tokio::spawn(async move { registry.fire_scheduled(&event_name, scheduled_at).await })
                    }
                    .boxed()
                }),
                priority,
            )
            .await;
    }

    let mut handles = Vec::new();
    while let Some((handle, _more)) = queue.execute_next().await {
        handles.push(handle);
    }

    let mut results = Vec::with_capacity(handles.len());
    for handle in handles {
        match handle.await {
            Ok(result) => results.push(result),
            Err(e) => tracing::error!("❌ Firing task aborted: {e}"),
        }
    }
    results
}

/// Spawn the scheduler loop as a background tokio task.
pub fn spawn_scheduler(registry: Arc<TriggerRegistry>, tick_interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!("⏰ Scheduler started (check every {:?})", tick_interval);
        let mut interval = tokio::time::interval(tick_interval);
        let mut tracker = DueTracker::new();

        loop {
            interval.tick().await;
            let now = registry.clock().now();
            let triggers = registry.list_triggers().await;
            let due = tracker.collect_due(&triggers, now);
            if due.is_empty() {
                continue;
            }

            tracing::info!("🔔 {} trigger(s) due", due.len());
            let registry = registry.clone();
            tokio::spawn(async move {
                for result in fire_due(registry, due).await {
                    tracing::debug!("📣 {} → {}", result.execution_id, result.status);
                }
            });
        }
    })
}
