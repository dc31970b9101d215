//! Submission inputs and their validation.
//!
//! Validation is collected into a field -> messages map so the HTTP
//! layer can return it verbatim in a 400 body. Field names therefore
//! use the wire spelling (`tenantId`, `events[0].type`, ...).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::id::TenantId;

/// Accumulated validation failures, keyed by wire field name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ValidationErrors(BTreeMap<String, Vec<String>>);

impl ValidationErrors {
    pub fn add(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.0.entry(field.into()).or_default().push(message.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}

/// A raw, not-yet-validated event as it arrives at the port.
#[derive(Debug, Clone)]
pub struct EventDraft {
    pub event_type: String,
    pub occurred_at: Option<DateTime<Utc>>,
    pub payload: serde_json::Value,
}

/// A validated event ready to be persisted.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub event_type: String,
    pub occurred_at: DateTime<Utc>,
    /// Stored verbatim; the engine never looks inside.
    pub payload: serde_json::Value,
}

/// A validated submission: one job plus its events.
#[derive(Debug, Clone)]
pub struct NewSubmission {
    pub tenant_id: TenantId,
    pub idempotency_key: Option<String>,
    pub events: Vec<NewEvent>,
}

impl NewSubmission {
    /// Validate raw inputs into a submission, or report every failing
    /// field at once.
    pub fn build(
        tenant_id: &str,
        idempotency_key: Option<String>,
        events: Vec<EventDraft>,
    ) -> Result<Self, ValidationErrors> {
        let mut errors = ValidationErrors::default();

        let tenant = match TenantId::new(tenant_id) {
            Ok(t) => Some(t),
            Err(_) => {
                errors.add("tenantId", "must not be blank");
                None
            }
        };

        if let Some(key) = idempotency_key.as_deref() {
            if key.trim().is_empty() {
                errors.add("idempotencyKey", "must not be blank when provided");
            }
        }

        if events.is_empty() {
            errors.add("events", "at least one event is required");
        }

        let mut validated = Vec::with_capacity(events.len());
        for (i, draft) in events.into_iter().enumerate() {
            if draft.event_type.trim().is_empty() {
                errors.add(format!("events[{i}].type"), "must not be blank");
            }
            match draft.occurred_at {
                None => errors.add(format!("events[{i}].timestamp"), "is required"),
                Some(ts) if ts == DateTime::<Utc>::UNIX_EPOCH => {
                    errors.add(format!("events[{i}].timestamp"), "must not be the zero timestamp");
                }
                Some(ts) => validated.push(NewEvent {
                    event_type: draft.event_type,
                    occurred_at: ts,
                    payload: draft.payload,
                }),
            }
        }

        if !errors.is_empty() {
            return Err(errors);
        }

        Ok(Self {
            tenant_id: tenant.expect("tenant validated above"),
            idempotency_key,
            events: validated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(event_type: &str) -> EventDraft {
        EventDraft {
            event_type: event_type.to_string(),
            occurred_at: Some(Utc::now()),
            payload: serde_json::json!({}),
        }
    }

    #[test]
    fn valid_submission_passes() {
        let sub = NewSubmission::build("t1", Some("k1".into()), vec![draft("a"), draft("b")])
            .expect("valid submission");
        assert_eq!(sub.tenant_id.as_str(), "t1");
        assert_eq!(sub.events.len(), 2);
    }

    #[test]
    fn blank_tenant_and_empty_events_are_both_reported() {
        let err = NewSubmission::build(" ", None, vec![]).unwrap_err();
        let fields: Vec<_> = err.fields().collect();
        assert_eq!(fields, vec!["events", "tenantId"]);
    }

    #[test]
    fn blank_event_type_is_reported_with_index() {
        let err = NewSubmission::build("t1", None, vec![draft("ok"), draft("")]).unwrap_err();
        assert_eq!(err.fields().collect::<Vec<_>>(), vec!["events[1].type"]);
    }

    #[test]
    fn missing_or_epoch_timestamp_is_rejected() {
        let mut missing = draft("a");
        missing.occurred_at = None;
        let err = NewSubmission::build("t1", None, vec![missing]).unwrap_err();
        assert_eq!(err.fields().collect::<Vec<_>>(), vec!["events[0].timestamp"]);

        let mut epoch = draft("a");
        epoch.occurred_at = Some(DateTime::<Utc>::UNIX_EPOCH);
        let err = NewSubmission::build("t1", None, vec![epoch]).unwrap_err();
        assert_eq!(err.fields().collect::<Vec<_>>(), vec!["events[0].timestamp"]);
    }

    #[test]
    fn blank_idempotency_key_is_rejected() {
        let err = NewSubmission::build("t1", Some("  ".into()), vec![draft("a")]).unwrap_err();
        assert_eq!(err.fields().collect::<Vec<_>>(), vec!["idempotencyKey"]);
    }
}
