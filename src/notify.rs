//! Notification dispatch.
//!
//! Rules map event types to channels. Webhooks deliver via HTTP POST;
//! email and slack channels are recorded for an external sink to drain.
//! Every attempt lands in the notification_events audit table.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};

use crate::model::{ChannelKind, DriftSeverity, NotificationEvent};
use crate::store::SharedStore;

pub struct Notifier {
    store: SharedStore,
    http: reqwest::Client,
}

impl Notifier {
    pub fn new(store: SharedStore) -> Arc<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Arc::new(Self { store, http })
    }

    /// Fan an event out to every enabled rule matching its type. Failures
    /// are recorded, never propagated; notification must not break the
    /// operation that triggered it.
    pub async fn dispatch(&self, event_type: &str, payload: Value, severity: Option<DriftSeverity>) {
        let rules = match self.store.rules_for_event(event_type) {
            Ok(rules) => rules,
            Err(e) => {
                tracing::warn!(event_type, error = %e, "could not load notification rules");
                return;
            }
        };

        for rule in rules {
            if let (Some(min), Some(actual)) = (rule.min_severity, severity) {
                // Severity orders security (highest) before cosmetic.
                if actual > min {
                    continue;
                }
            }
            let channel = match self.store.get_channel(rule.channel_id) {
                Ok(c) if c.enabled => c,
                Ok(_) => continue,
                Err(e) => {
                    tracing::warn!(rule = rule.id, error = %e, "notification channel missing");
                    continue;
                }
            };

            let (success, error) = match channel.kind {
                ChannelKind::Webhook => self.deliver_webhook(&channel.settings, &payload).await,
                // Recorded only; delivery is an external sink's job.
                ChannelKind::Email | ChannelKind::Slack => (true, None),
            };

            if let Some(err) = &error {
                tracing::warn!(
                    channel = %channel.name,
                    event_type,
                    error = %err,
                    "notification delivery failed"
                );
            }
            let event = NotificationEvent {
                id: 0,
                rule_id: Some(rule.id),
                channel_id: channel.id,
                event_type: event_type.to_string(),
                payload: payload.clone(),
                success,
                error,
                created_at: Utc::now(),
            };
            if let Err(e) = self.store.append_notification_event(&event) {
                tracing::warn!(error = %e, "could not record notification event");
            }
        }
    }

    async fn deliver_webhook(&self, settings: &Value, payload: &Value) -> (bool, Option<String>) {
        let Some(url) = settings.get("url").and_then(Value::as_str) else {
            return (false, Some("webhook channel has no url".to_string()));
        };
        let body = json!({
            "payload": payload,
            "sent_at": Utc::now().to_rfc3339(),
        });
        match self.http.post(url).json(&body).send().await {
            Ok(resp) if resp.status().is_success() => (true, None),
            Ok(resp) => (false, Some(format!("webhook returned HTTP {}", resp.status()))),
            Err(e) => (false, Some(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Provider;
    use crate::model::{NotificationChannel, NotificationRule};
    use crate::store::SqliteProvider;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn store() -> SharedStore {
        let provider = SqliteProvider::open_in_memory().unwrap();
        provider.migrate().unwrap();
        Arc::new(provider)
    }

    fn wire(store: &SharedStore, url: &str, event_type: &str, min: Option<DriftSeverity>) {
        let channel = store
            .insert_channel(&NotificationChannel {
                id: 0,
                name: "hook".into(),
                kind: ChannelKind::Webhook,
                settings: json!({"url": url}),
                enabled: true,
                created_at: Utc::now(),
            })
            .unwrap();
        store
            .insert_rule(&NotificationRule {
                id: 0,
                name: "r".into(),
                event_type: event_type.into(),
                channel_id: channel.id,
                min_severity: min,
                enabled: true,
                created_at: Utc::now(),
            })
            .unwrap();
    }

    #[tokio::test]
    async fn test_webhook_delivery_recorded() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let store = store();
        wire(&store, &format!("{}/hook", server.uri()), "drift.detected", None);

        let notifier = Notifier::new(store.clone());
        notifier.dispatch("drift.detected", json!({"device_id": 1}), None).await;

        let events = store.list_notification_events(10).unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].success);
    }

    #[tokio::test]
    async fn test_failed_webhook_recorded_as_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let store = store();
        wire(&store, &format!("{}/hook", server.uri()), "drift.detected", None);

        let notifier = Notifier::new(store.clone());
        notifier.dispatch("drift.detected", json!({}), None).await;

        let events = store.list_notification_events(10).unwrap();
        assert_eq!(events.len(), 1);
        assert!(!events[0].success);
        assert!(events[0].error.as_deref().unwrap().contains("500"));
    }

    #[tokio::test]
    async fn test_min_severity_filters() {
        let server = MockServer::start().await;
        let store = store();
        wire(
            &store,
            &format!("{}/hook", server.uri()),
            "drift.detected",
            Some(DriftSeverity::Network),
        );

        let notifier = Notifier::new(store.clone());
        // Cosmetic is below the network threshold: no event.
        notifier
            .dispatch("drift.detected", json!({}), Some(DriftSeverity::Cosmetic))
            .await;
        assert!(store.list_notification_events(10).unwrap().is_empty());

        // Security clears it.
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        notifier
            .dispatch("drift.detected", json!({}), Some(DriftSeverity::Security))
            .await;
        assert_eq!(store.list_notification_events(10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unmatched_event_type_is_noop() {
        let store = store();
        let notifier = Notifier::new(store.clone());
        notifier.dispatch("import.completed", json!({}), None).await;
        assert!(store.list_notification_events(10).unwrap().is_empty());
    }
}
