// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Engine error taxonomy.
//!
//! Every public operation returns [`EngineError`]; callers never see raw
//! transport errors. Each variant carries an `error_code` string and maps to
//! a structured `{kind, message, details?}` wire form the REST shim serializes
//! directly.

use std::fmt;

use uuid::Uuid;

/// Result type using EngineError.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors produced by engine operations.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum EngineError {
    /// Payload or parameter constraint violated. Never retried.
    Validation {
        /// The field that failed validation.
        field: String,
        /// Human-readable message.
        message: String,
    },

    /// Zone geometry or attribute constraint violated.
    ZoneValidation {
        /// Human-readable message.
        message: String,
    },

    /// New or updated zone intersects another active zone.
    ZoneOverlap {
        /// The zone being created or updated.
        zone_id: Option<Uuid>,
        /// The active zone it conflicts with.
        conflicting_zone_id: Uuid,
    },

    /// Entity does not exist.
    NotFound {
        /// Entity kind ("zone", "webhook", "location").
        entity: &'static str,
        /// Identifier that was looked up.
        id: String,
    },

    /// Index connection could not be established within the retry budget.
    ConnectionFailed {
        /// Underlying transport message.
        message: String,
    },

    /// Write requested while the primary connection is down.
    PrimaryUnavailable {
        /// Underlying transport message.
        message: String,
    },

    /// No read handle is connected.
    NoHealthyConnection,

    /// Index did not answer within the query budget.
    QueryTimeout {
        /// The budget that elapsed.
        timeout_ms: u64,
    },

    /// The index answered with an error reply.
    Index {
        /// The error text from the index.
        message: String,
    },

    /// Some items of a batch failed; the batch operation itself succeeded.
    BatchPartial {
        /// Failed item count.
        failed: usize,
        /// Total item count.
        total: usize,
    },

    /// All delivery retries exhausted for a webhook.
    WebhookDeliveryFailed {
        /// The webhook that failed.
        webhook_id: Uuid,
        /// Last failure message.
        message: String,
    },

    /// Operation invoked before wiring completed, or after shutdown.
    NotInitialized,

    /// Request rejected because the governor queue was cleared on shutdown.
    QueueCleared,

    /// Anything else; treated as a 5xx.
    Internal {
        /// Details.
        message: String,
    },
}

impl EngineError {
    /// Convenience constructor for validation failures.
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Stable code for this error kind.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "VALIDATION",
            Self::ZoneValidation { .. } => "ZONE_VALIDATION",
            Self::ZoneOverlap { .. } => "ZONE_OVERLAP",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::ConnectionFailed { .. } => "CONNECTION_FAILED",
            Self::PrimaryUnavailable { .. } => "PRIMARY_UNAVAILABLE",
            Self::NoHealthyConnection => "NO_HEALTHY_CONNECTION",
            Self::QueryTimeout { .. } => "QUERY_TIMEOUT",
            Self::Index { .. } => "INDEX_ERROR",
            Self::BatchPartial { .. } => "BATCH_PARTIAL",
            Self::WebhookDeliveryFailed { .. } => "WEBHOOK_DELIVERY_FAILED",
            Self::NotInitialized => "NOT_INITIALIZED",
            Self::QueueCleared => "QUEUE_CLEARED",
            Self::Internal { .. } => "INTERNAL",
        }
    }

    /// HTTP status class the REST shim maps this error to.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation { .. } | Self::ZoneValidation { .. } | Self::ZoneOverlap { .. } => 400,
            Self::NotFound { .. } => 404,
            Self::PrimaryUnavailable { .. }
            | Self::NoHealthyConnection
            | Self::ConnectionFailed { .. }
            | Self::QueryTimeout { .. } => 503,
            _ => 500,
        }
    }

    /// Whether the governor may retry the operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed { .. }
                | Self::NoHealthyConnection
                | Self::QueryTimeout { .. }
        )
    }

    /// Structured `{kind, message, details?}` wire form.
    pub fn to_wire(&self) -> serde_json::Value {
        let details = match self {
            Self::Validation { field, .. } => Some(serde_json::json!({ "field": field })),
            Self::ZoneOverlap {
                zone_id,
                conflicting_zone_id,
            } => Some(serde_json::json!({
                "zoneId": zone_id,
                "conflictingZoneId": conflicting_zone_id,
            })),
            Self::NotFound { entity, id } => {
                Some(serde_json::json!({ "entity": entity, "id": id }))
            }
            Self::QueryTimeout { timeout_ms } => {
                Some(serde_json::json!({ "timeoutMs": timeout_ms }))
            }
            Self::BatchPartial { failed, total } => {
                Some(serde_json::json!({ "failed": failed, "total": total }))
            }
            Self::WebhookDeliveryFailed { webhook_id, .. } => {
                Some(serde_json::json!({ "webhookId": webhook_id }))
            }
            _ => None,
        };
        match details {
            Some(details) => serde_json::json!({
                "kind": self.error_code(),
                "message": self.to_string(),
                "details": details,
            }),
            None => serde_json::json!({
                "kind": self.error_code(),
                "message": self.to_string(),
            }),
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation { field, message } => write!(f, "validation failed on {field}: {message}"),
            Self::ZoneValidation { message } => write!(f, "zone validation failed: {message}"),
            Self::ZoneOverlap {
                zone_id,
                conflicting_zone_id,
            } => match zone_id {
                Some(id) => write!(f, "zone {id} overlaps active zone {conflicting_zone_id}"),
                None => write!(f, "zone overlaps active zone {conflicting_zone_id}"),
            },
            Self::NotFound { entity, id } => write!(f, "{entity} {id} not found"),
            Self::ConnectionFailed { message } => write!(f, "index connection failed: {message}"),
            Self::PrimaryUnavailable { message } => {
                write!(f, "primary index connection unavailable: {message}")
            }
            Self::NoHealthyConnection => write!(f, "no healthy index connection"),
            Self::QueryTimeout { timeout_ms } => {
                write!(f, "index query timed out after {timeout_ms}ms")
            }
            Self::Index { message } => write!(f, "index error: {message}"),
            Self::BatchPartial { failed, total } => {
                write!(f, "{failed} of {total} batch items failed")
            }
            Self::WebhookDeliveryFailed {
                webhook_id,
                message,
            } => write!(f, "webhook {webhook_id} delivery failed: {message}"),
            Self::NotInitialized => write!(f, "engine is not initialized"),
            Self::QueueCleared => write!(f, "request rejected: queue cleared"),
            Self::Internal { message } => write!(f, "internal error: {message}"),
        }
    }
}

impl std::error::Error for EngineError {}

/// Turn an index error reply into `EngineError::Index`; pass others through.
pub(crate) fn expect_reply(
    reply: tourguard_protocol::RespValue,
) -> Result<tourguard_protocol::RespValue> {
    match reply {
        tourguard_protocol::RespValue::Error(message) => Err(EngineError::Index { message }),
        other => Ok(other),
    }
}

impl From<tourguard_protocol::PoolError> for EngineError {
    fn from(e: tourguard_protocol::PoolError) -> Self {
        use tourguard_protocol::{ConnectionError, PoolError};
        match e {
            PoolError::PrimaryUnavailable(message) => Self::PrimaryUnavailable { message },
            PoolError::NoHealthyConnection => Self::NoHealthyConnection,
            PoolError::UnknownConnection(id) => Self::Internal {
                message: format!("unknown connection: {id}"),
            },
            PoolError::Connection(ConnectionError::RequestTimeout(timeout_ms)) => {
                Self::QueryTimeout { timeout_ms }
            }
            PoolError::Connection(other) => Self::ConnectionFailed {
                message: other.to_string(),
            },
        }
    }
}

impl From<tourguard_geo::GeoError> for EngineError {
    fn from(e: tourguard_geo::GeoError) -> Self {
        Self::ZoneValidation {
            message: e.to_string(),
        }
    }
}

impl From<tourguard_protocol::ReplyError> for EngineError {
    fn from(e: tourguard_protocol::ReplyError) -> Self {
        use tourguard_protocol::ReplyError;
        match e {
            ReplyError::Index(message) => Self::Index { message },
            other => Self::Internal {
                message: other.to_string(),
            },
        }
    }
}
