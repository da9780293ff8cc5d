//! # CRM Event Mapping
//!
//! Translation between CRM webhook vocabulary and sync changes, in both
//! directions. Everything here is table-driven so the set of supported events
//! and fields is visible in one place.
//!
//! ```text
//!   CRM webhook                                       change log
//!  ─────────────                                     ────────────
//!   kind: order.status_changed        INBOUND_ROUTES   entity_type: order
//!   data: { id, status }        ───────────────────►   operation:   update
//!                                      FIELD_MAP       payload: { status }
//!
//!   change log                                        CRM webhook
//!  ────────────                                      ─────────────
//!   contact / update            ───────────────────►  event: contact.updated
//!   payload: { referredBy }        OutboundEvent       data: { referrer_id }
//! ```
//!
//! Field names on the CRM side are snake_case, domain fields are camelCase.
//! Fields without a mapping entry are dropped inbound and passed through
//! unchanged outbound.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{CoreError, ValidationError};
use crate::types::{ChangeRecord, Operation, Origin};

// =============================================================================
// Field Map
// =============================================================================

/// `(entity_type, crm_field, domain_field)`
pub static FIELD_MAP: &[(&str, &str, &str)] = &[
    ("order", "title", "title"),
    ("order", "description", "description"),
    ("order", "address", "address"),
    ("order", "scheduled_at", "scheduledAt"),
    ("order", "amount_cents", "priceCents"),
    ("order", "client_id", "clientId"),
    ("order", "master_id", "masterId"),
    ("order", "status", "status"),
    ("contact", "name", "name"),
    ("contact", "phone", "phone"),
    ("contact", "email", "email"),
    ("contact", "role", "role"),
    ("contact", "referrer_id", "referredBy"),
    ("deal", "title", "title"),
    ("deal", "stage", "stage"),
    ("deal", "amount_cents", "amountCents"),
    ("deal", "contact_id", "contactId"),
];

fn domain_field(entity_type: &str, crm_field: &str) -> Option<&'static str> {
    FIELD_MAP
        .iter()
        .find(|(t, c, _)| *t == entity_type && *c == crm_field)
        .map(|(_, _, d)| *d)
}

fn crm_field(entity_type: &str, domain: &str) -> Option<&'static str> {
    FIELD_MAP
        .iter()
        .find(|(t, _, d)| *t == entity_type && *d == domain)
        .map(|(_, c, _)| *c)
}

// =============================================================================
// Inbound
// =============================================================================

/// Webhook event kinds accepted from the CRM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CrmEventKind {
    OrderCreated,
    OrderUpdated,
    OrderStatusChanged,
    OrderCancelled,
    ContactCreated,
    ContactUpdated,
    ContactDeleted,
    DealStageChanged,
}

/// How one inbound event kind becomes a change.
#[derive(Debug)]
pub struct InboundRoute {
    pub kind: CrmEventKind,
    pub name: &'static str,
    pub entity_type: &'static str,
    pub operation: Operation,
    /// CRM fields that must be present besides `id`.
    pub required: &'static [&'static str],
    /// Domain fields set regardless of the payload.
    pub implied: &'static [(&'static str, &'static str)],
}

static ORDER_CREATED: InboundRoute = InboundRoute {
    kind: CrmEventKind::OrderCreated,
    name: "order.created",
    entity_type: "order",
    operation: Operation::Create,
    required: &[],
    implied: &[],
};

static ORDER_UPDATED: InboundRoute = InboundRoute {
    kind: CrmEventKind::OrderUpdated,
    name: "order.updated",
    entity_type: "order",
    operation: Operation::Update,
    required: &[],
    implied: &[],
};

static ORDER_STATUS_CHANGED: InboundRoute = InboundRoute {
    kind: CrmEventKind::OrderStatusChanged,
    name: "order.status_changed",
    entity_type: "order",
    operation: Operation::Update,
    required: &["status"],
    implied: &[],
};

static ORDER_CANCELLED: InboundRoute = InboundRoute {
    kind: CrmEventKind::OrderCancelled,
    name: "order.cancelled",
    entity_type: "order",
    operation: Operation::Update,
    required: &[],
    implied: &[("status", "cancelled")],
};

static CONTACT_CREATED: InboundRoute = InboundRoute {
    kind: CrmEventKind::ContactCreated,
    name: "contact.created",
    entity_type: "contact",
    operation: Operation::Create,
    required: &[],
    implied: &[],
};

static CONTACT_UPDATED: InboundRoute = InboundRoute {
    kind: CrmEventKind::ContactUpdated,
    name: "contact.updated",
    entity_type: "contact",
    operation: Operation::Update,
    required: &[],
    implied: &[],
};

static CONTACT_DELETED: InboundRoute = InboundRoute {
    kind: CrmEventKind::ContactDeleted,
    name: "contact.deleted",
    entity_type: "contact",
    operation: Operation::Delete,
    required: &[],
    implied: &[],
};

static DEAL_STAGE_CHANGED: InboundRoute = InboundRoute {
    kind: CrmEventKind::DealStageChanged,
    name: "deal.stage_changed",
    entity_type: "deal",
    operation: Operation::Update,
    required: &["stage"],
    implied: &[],
};

pub static INBOUND_ROUTES: &[&InboundRoute] = &[
    &ORDER_CREATED,
    &ORDER_UPDATED,
    &ORDER_STATUS_CHANGED,
    &ORDER_CANCELLED,
    &CONTACT_CREATED,
    &CONTACT_UPDATED,
    &CONTACT_DELETED,
    &DEAL_STAGE_CHANGED,
];

impl CrmEventKind {
    pub fn route(&self) -> &'static InboundRoute {
        match self {
            CrmEventKind::OrderCreated => &ORDER_CREATED,
            CrmEventKind::OrderUpdated => &ORDER_UPDATED,
            CrmEventKind::OrderStatusChanged => &ORDER_STATUS_CHANGED,
            CrmEventKind::OrderCancelled => &ORDER_CANCELLED,
            CrmEventKind::ContactCreated => &CONTACT_CREATED,
            CrmEventKind::ContactUpdated => &CONTACT_UPDATED,
            CrmEventKind::ContactDeleted => &CONTACT_DELETED,
            CrmEventKind::DealStageChanged => &DEAL_STAGE_CHANGED,
        }
    }

    pub fn as_str(&self) -> &'static str {
        self.route().name
    }
}

impl fmt::Display for CrmEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CrmEventKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        INBOUND_ROUTES
            .iter()
            .find(|r| r.name == s)
            .map(|r| r.kind)
            .ok_or_else(|| CoreError::UnknownCrmEvent(s.to_string()))
    }
}

/// Body of an inbound CRM webhook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrmEnvelope {
    /// CRM-assigned event id, the dedup key.
    #[serde(alias = "eventId")]
    pub event_id: String,
    #[serde(default, alias = "occurredAt")]
    pub occurred_at: Option<DateTime<Utc>>,
    /// Entity fields in CRM vocabulary. Must contain `id`.
    pub data: Value,
}

/// An inbound event translated into sync vocabulary.
#[derive(Debug, Clone, PartialEq)]
pub struct MappedChange {
    pub entity_type: String,
    pub entity_id: String,
    pub operation: Operation,
    pub payload: Value,
}

/// Maximum length of a CRM event id.
pub const MAX_EVENT_ID_LEN: usize = 128;

/// Translates an inbound webhook into a change.
pub fn map_inbound(
    kind: CrmEventKind,
    envelope: &CrmEnvelope,
) -> Result<MappedChange, ValidationError> {
    let event_id = envelope.event_id.trim();
    if event_id.is_empty() {
        return Err(ValidationError::required("event_id"));
    }
    if event_id.len() > MAX_EVENT_ID_LEN {
        return Err(ValidationError::TooLong {
            field: "event_id".to_string(),
            max: MAX_EVENT_ID_LEN,
        });
    }

    let route = kind.route();
    let data = envelope
        .data
        .as_object()
        .ok_or_else(|| ValidationError::invalid_format("data", "must be an object"))?;

    let entity_id = data
        .get("id")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ValidationError::required("data.id"))?;

    for field in route.required {
        if data.get(*field).map_or(true, Value::is_null) {
            return Err(ValidationError::required(format!("data.{field}")));
        }
    }

    let mut payload = Map::new();
    if route.operation != Operation::Delete {
        for (key, value) in data {
            if let Some(domain) = domain_field(route.entity_type, key) {
                payload.insert(domain.to_string(), value.clone());
            }
        }
        for (field, value) in route.implied {
            payload.insert(field.to_string(), Value::String(value.to_string()));
        }
    }

    Ok(MappedChange {
        entity_type: route.entity_type.to_string(),
        entity_id: entity_id.to_string(),
        operation: route.operation,
        payload: Value::Object(payload),
    })
}

// =============================================================================
// Outbound
// =============================================================================

/// Entity data carried by an outbound event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundEntity {
    pub id: String,
    pub version: i64,
    /// Changed fields in CRM vocabulary. Empty for deletes.
    pub fields: Value,
}

/// Events pushed to the CRM webhook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum OutboundEvent {
    #[serde(rename = "order.created")]
    OrderCreated(OutboundEntity),
    #[serde(rename = "order.updated")]
    OrderUpdated(OutboundEntity),
    #[serde(rename = "order.deleted")]
    OrderDeleted(OutboundEntity),
    #[serde(rename = "contact.created")]
    ContactCreated(OutboundEntity),
    #[serde(rename = "contact.updated")]
    ContactUpdated(OutboundEntity),
    #[serde(rename = "contact.deleted")]
    ContactDeleted(OutboundEntity),
    #[serde(rename = "deal.created")]
    DealCreated(OutboundEntity),
    #[serde(rename = "deal.updated")]
    DealUpdated(OutboundEntity),
    #[serde(rename = "deal.deleted")]
    DealDeleted(OutboundEntity),
}

impl OutboundEvent {
    /// Maps a change record to its outbound event.
    ///
    /// Returns `None` for entity types the CRM does not model.
    pub fn from_change(record: &ChangeRecord) -> Option<Self> {
        let entity = OutboundEntity {
            id: record.entity_id.clone(),
            version: record.entity_version,
            fields: to_crm_fields(&record.entity_type, &record.payload),
        };
        let event = match (record.entity_type.as_str(), record.operation) {
            ("order", Operation::Create) => OutboundEvent::OrderCreated(entity),
            ("order", Operation::Update) => OutboundEvent::OrderUpdated(entity),
            ("order", Operation::Delete) => OutboundEvent::OrderDeleted(entity),
            ("contact", Operation::Create) => OutboundEvent::ContactCreated(entity),
            ("contact", Operation::Update) => OutboundEvent::ContactUpdated(entity),
            ("contact", Operation::Delete) => OutboundEvent::ContactDeleted(entity),
            ("deal", Operation::Create) => OutboundEvent::DealCreated(entity),
            ("deal", Operation::Update) => OutboundEvent::DealUpdated(entity),
            ("deal", Operation::Delete) => OutboundEvent::DealDeleted(entity),
            _ => return None,
        };
        Some(event)
    }

    pub fn name(&self) -> &'static str {
        match self {
            OutboundEvent::OrderCreated(_) => "order.created",
            OutboundEvent::OrderUpdated(_) => "order.updated",
            OutboundEvent::OrderDeleted(_) => "order.deleted",
            OutboundEvent::ContactCreated(_) => "contact.created",
            OutboundEvent::ContactUpdated(_) => "contact.updated",
            OutboundEvent::ContactDeleted(_) => "contact.deleted",
            OutboundEvent::DealCreated(_) => "deal.created",
            OutboundEvent::DealUpdated(_) => "deal.updated",
            OutboundEvent::DealDeleted(_) => "deal.deleted",
        }
    }
}

fn to_crm_fields(entity_type: &str, payload: &Value) -> Value {
    let Some(fields) = payload.as_object() else {
        return Value::Object(Map::new());
    };
    let mapped = fields
        .iter()
        .map(|(key, value)| {
            let name = crm_field(entity_type, key).unwrap_or(key.as_str());
            (name.to_string(), value.clone())
        })
        .collect();
    Value::Object(mapped)
}

/// Full outbound webhook body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundWebhook {
    /// Server sequence of the change, monotonically increasing per system.
    pub sequence: i64,
    pub change_id: String,
    pub occurred_at: DateTime<Utc>,
    pub origin: Origin,
    #[serde(flatten)]
    pub event: OutboundEvent,
}

impl OutboundWebhook {
    pub fn from_change(record: &ChangeRecord) -> Option<Self> {
        OutboundEvent::from_change(record).map(|event| OutboundWebhook {
            sequence: record.server_sequence,
            change_id: record.id.clone(),
            occurred_at: record.created_at,
            origin: record.origin.clone(),
            event,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn envelope(data: Value) -> CrmEnvelope {
        CrmEnvelope {
            event_id: "evt-1".to_string(),
            occurred_at: None,
            data,
        }
    }

    #[test]
    fn test_every_kind_has_one_route() {
        let kinds = [
            CrmEventKind::OrderCreated,
            CrmEventKind::OrderUpdated,
            CrmEventKind::OrderStatusChanged,
            CrmEventKind::OrderCancelled,
            CrmEventKind::ContactCreated,
            CrmEventKind::ContactUpdated,
            CrmEventKind::ContactDeleted,
            CrmEventKind::DealStageChanged,
        ];
        for kind in kinds {
            let matches = INBOUND_ROUTES.iter().filter(|r| r.kind == kind).count();
            assert_eq!(matches, 1, "{kind:?}");
            assert_eq!(kind.route().kind, kind);
            assert_eq!(kind.as_str().parse::<CrmEventKind>().unwrap(), kind);
        }
        assert_eq!(INBOUND_ROUTES.len(), kinds.len());
    }

    #[test]
    fn test_unknown_kind() {
        assert!(matches!(
            "invoice.paid".parse::<CrmEventKind>(),
            Err(CoreError::UnknownCrmEvent(_))
        ));
    }

    #[test]
    fn test_inbound_renames_and_drops_fields() {
        let mapped = map_inbound(
            CrmEventKind::OrderCreated,
            &envelope(json!({
                "id": "o-1",
                "title": "Boiler",
                "amount_cents": 12000,
                "master_id": "m-3",
                "crm_internal_flag": true
            })),
        )
        .unwrap();
        assert_eq!(mapped.entity_type, "order");
        assert_eq!(mapped.entity_id, "o-1");
        assert_eq!(mapped.operation, Operation::Create);
        assert_eq!(
            mapped.payload,
            json!({ "title": "Boiler", "priceCents": 12000, "masterId": "m-3" })
        );
    }

    #[test]
    fn test_cancelled_implies_status() {
        let mapped =
            map_inbound(CrmEventKind::OrderCancelled, &envelope(json!({ "id": "o-1" }))).unwrap();
        assert_eq!(mapped.operation, Operation::Update);
        assert_eq!(mapped.payload, json!({ "status": "cancelled" }));
    }

    #[test]
    fn test_required_fields() {
        let err = map_inbound(CrmEventKind::DealStageChanged, &envelope(json!({ "id": "d-1" })))
            .unwrap_err();
        assert_eq!(err.to_string(), "data.stage is required");

        let err = map_inbound(CrmEventKind::ContactUpdated, &envelope(json!({ "name": "x" })))
            .unwrap_err();
        assert_eq!(err.to_string(), "data.id is required");

        let mut blank = envelope(json!({ "id": "c-1" }));
        blank.event_id = "  ".to_string();
        assert!(map_inbound(CrmEventKind::ContactDeleted, &blank).is_err());
    }

    #[test]
    fn test_delete_has_empty_payload() {
        let mapped = map_inbound(
            CrmEventKind::ContactDeleted,
            &envelope(json!({ "id": "c-1", "name": "gone" })),
        )
        .unwrap();
        assert_eq!(mapped.operation, Operation::Delete);
        assert_eq!(mapped.payload, json!({}));
    }

    #[test]
    fn test_outbound_webhook_shape() {
        let record = ChangeRecord {
            id: "chg-1".to_string(),
            entity_type: "contact".to_string(),
            entity_id: "c-1".to_string(),
            operation: Operation::Update,
            payload: json!({ "referredBy": "c-0", "nickname": "Bo" }),
            origin: Origin::device("d-1"),
            server_sequence: 42,
            client_version: Some(1),
            entity_version: 2,
            created_at: Utc::now(),
        };
        let webhook = OutboundWebhook::from_change(&record).unwrap();
        assert_eq!(webhook.event.name(), "contact.updated");

        let body = serde_json::to_value(&webhook).unwrap();
        assert_eq!(body["event"], "contact.updated");
        assert_eq!(body["sequence"], 42);
        assert_eq!(
            body["data"],
            json!({ "id": "c-1", "version": 2, "fields": { "referrer_id": "c-0", "nickname": "Bo" } })
        );
    }

    #[test]
    fn test_outbound_ignores_unmodelled_types() {
        let record = ChangeRecord {
            id: "chg-2".to_string(),
            entity_type: "review".to_string(),
            entity_id: "r-1".to_string(),
            operation: Operation::Create,
            payload: json!({}),
            origin: Origin::device("d-1"),
            server_sequence: 1,
            client_version: Some(0),
            entity_version: 1,
            created_at: Utc::now(),
        };
        assert!(OutboundEvent::from_change(&record).is_none());
    }
}
