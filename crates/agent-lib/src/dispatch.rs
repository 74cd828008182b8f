//! Message dispatch pipeline
//!
//! Every notification text goes through the same steps:
//! fingerprint, in-flight claim, cache lookup, delivery, cache mark.
//! A message is only marked after the sink accepted it, so a failed
//! delivery is retried by the next trigger that produces the same text.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashSet;
use tracing::{debug, warn};
use url::Url;

use crate::cache::{DedupCache, Fingerprint};
use crate::detector::OomKillDetector;
use crate::error::DispatchError;
use crate::health::{Component, HealthRegistry};
use crate::models::{NamespaceScope, Notification, ResourceChangeEvent};
use crate::notifier::Notifier;
use crate::observability::{AgentMetrics, StructuredLogger};
use crate::watch::ChangeHandler;

/// What happened to a dispatched message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Accepted by the sink and recorded in the cache
    Delivered,
    /// Found in the cache, nothing sent
    AlreadySent,
    /// Another trigger is delivering the same message right now
    InFlight,
}

/// Routes messages through the deduplication cache to the notifier
pub struct AlertDispatcher {
    cache: Arc<DedupCache>,
    notifier: Arc<dyn Notifier>,
    destination: Url,
    in_flight: DashSet<Fingerprint>,
    health: HealthRegistry,
    metrics: AgentMetrics,
    logger: StructuredLogger,
}

/// Releases an in-flight claim when dropped
struct Claim<'a> {
    in_flight: &'a DashSet<Fingerprint>,
    fingerprint: Fingerprint,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.in_flight.remove(&self.fingerprint);
    }
}

impl AlertDispatcher {
    pub fn new(
        cache: Arc<DedupCache>,
        notifier: Arc<dyn Notifier>,
        destination: Url,
        health: HealthRegistry,
        metrics: AgentMetrics,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            cache,
            notifier,
            destination,
            in_flight: DashSet::new(),
            health,
            metrics,
            logger,
        }
    }

    fn claim(&self, fingerprint: Fingerprint) -> Option<Claim<'_>> {
        self.in_flight.insert(fingerprint).then(|| Claim {
            in_flight: &self.in_flight,
            fingerprint,
        })
    }

    /// Deliver `text` unless an identical message was already delivered
    pub async fn dispatch(&self, text: &str) -> Result<DispatchOutcome, DispatchError> {
        let fingerprint = Fingerprint::of(text);
        let fp = fingerprint.to_string();

        let Some(_claim) = self.claim(fingerprint) else {
            self.metrics.inc_notifications_suppressed();
            self.logger.log_notification_suppressed(&fp, "in flight");
            return Ok(DispatchOutcome::InFlight);
        };

        if self.cache.check_if_seen(&fingerprint)? {
            self.metrics.inc_notifications_suppressed();
            self.logger.log_notification_suppressed(&fp, "already sent");
            return Ok(DispatchOutcome::AlreadySent);
        }

        let notification = Notification {
            text: text.to_string(),
            destination: self.destination.clone(),
        };

        if let Err(e) = self.notifier.publish(&notification).await {
            self.metrics.inc_delivery_failures();
            self.logger.log_notification_failed(&fp, &e.to_string());
            self.health
                .set_degraded(Component::Notifier, e.to_string())
                .await;
            return Err(e.into());
        }
        self.health.set_healthy(Component::Notifier).await;

        if self.cache.test_and_mark_seen(&fingerprint)? {
            debug!(fingerprint = %fp, "Fingerprint was marked concurrently");
        }

        self.metrics.inc_notifications_sent();
        self.logger.log_notification_sent(&fp, text);
        Ok(DispatchOutcome::Delivered)
    }
}

/// Sends the add/delete message of every change it receives
pub struct NotificationHandler {
    dispatcher: Arc<AlertDispatcher>,
}

impl NotificationHandler {
    pub fn new(dispatcher: Arc<AlertDispatcher>) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl ChangeHandler for NotificationHandler {
    async fn handle(&self, change: &ResourceChangeEvent) {
        let Some(text) = change.describe() else {
            return;
        };
        match self.dispatcher.dispatch(&text).await {
            Err(e) if !e.is_recoverable() => {
                warn!(object = %change.object().key(), error = %e, "Change notification dropped");
            }
            Err(e) => {
                debug!(object = %change.object().key(), error = %e, "Change notification not delivered");
            }
            Ok(_) => {}
        }
    }
}

/// Runs an OOM scan on every change and dispatches one message per
/// OOM-killed container
pub struct OomScanHandler {
    detector: Arc<OomKillDetector>,
    dispatcher: Arc<AlertDispatcher>,
    scope: NamespaceScope,
    health: HealthRegistry,
    logger: StructuredLogger,
}

impl OomScanHandler {
    pub fn new(
        detector: Arc<OomKillDetector>,
        dispatcher: Arc<AlertDispatcher>,
        scope: NamespaceScope,
        health: HealthRegistry,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            detector,
            dispatcher,
            scope,
            health,
            logger,
        }
    }
}

#[async_trait]
impl ChangeHandler for OomScanHandler {
    async fn handle(&self, change: &ResourceChangeEvent) {
        let records = match self.detector.scan(&self.scope).await {
            Ok(records) => records,
            Err(e) => {
                warn!(trigger = %change.object().key(), error = %e, "OOM scan failed");
                self.health
                    .set_degraded(Component::Detector, e.to_string())
                    .await;
                return;
            }
        };
        self.health.set_healthy(Component::Detector).await;

        for record in &records {
            match self.dispatcher.dispatch(&record.message()).await {
                Ok(DispatchOutcome::Delivered) => self.logger.log_oom_kill(record),
                Ok(_) => {}
                Err(e) => {
                    debug!(pod = %record.pod_name, container = %record.container_name, error = %e, "OOM notification not delivered");
                }
            }
        }
    }
}
