use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Ledger row for a gateway event, keyed by the gateway's own event id
#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::webhook_events)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct WebhookEventRecord {
    pub id: Uuid,
    pub gateway_event_id: String,
    pub event_type: String,
    pub processed: bool,
    pub processing_error: Option<String>,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::webhook_events)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct NewWebhookEvent {
    pub gateway_event_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
}
