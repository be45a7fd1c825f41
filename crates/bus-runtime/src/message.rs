//! Message types for transport operations including core domain identifiers.

use crate::error::ValidationError;
use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Well-known header keys.
///
/// The core only interprets [`MESSAGE_ID`], [`SENT_TIME`] together with
/// [`TIME_TO_BE_RECEIVED`], [`DEFERRED_UNTIL`] and [`DEFER_RECIPIENT`]; every
/// other header is carried through untouched for collaborators.
pub mod headers {
    /// Unique message identifier
    pub const MESSAGE_ID: &str = "bus-msg-id";
    /// Instant the message was created, RFC 3339
    pub const SENT_TIME: &str = "bus-senttime";
    /// Time-to-live in whole milliseconds, measured from [`SENT_TIME`]
    pub const TIME_TO_BE_RECEIVED: &str = "bus-time-to-be-received";
    /// Instant before which the message must not be delivered, RFC 3339
    pub const DEFERRED_UNTIL: &str = "bus-deferred-until";
    /// Queue a deferred message is forwarded to once it is due
    pub const DEFER_RECIPIENT: &str = "bus-defer-recipient";
    /// Payload content type
    pub const CONTENT_TYPE: &str = "bus-content-type";
    /// Number of times the message has been delivered
    pub const DELIVERY_COUNT: &str = "bus-delivery-count";
}

/// Header collection of a transport message, ordered by key
pub type Headers = BTreeMap<String, String>;

// ============================================================================
// Core Domain Identifiers
// ============================================================================

/// Validated, normalized logical queue address
///
/// Accepts either a bare queue name (`orders`) or a fully-qualified endpoint
/// URL (`memory://broker/orders`). Both resolve to the same logical name so a
/// producer using one form and a consumer using the other still meet.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct QueueAddress(String);

impl QueueAddress {
    /// Parse and normalize an address
    pub fn new(address: impl AsRef<str>) -> Result<Self, ValidationError> {
        let raw = address.as_ref().trim();
        let name = if raw.contains("://") {
            Self::name_from_url(raw)?
        } else {
            raw.to_string()
        };

        let name = name.to_ascii_lowercase();
        Self::validate(&name)?;
        Ok(Self(name))
    }

    fn name_from_url(raw: &str) -> Result<String, ValidationError> {
        let url = url::Url::parse(raw).map_err(|e| ValidationError::InvalidFormat {
            field: "queue_address".to_string(),
            message: e.to_string(),
        })?;

        let from_path = url
            .path_segments()
            .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
            .map(str::to_string);

        from_path
            .or_else(|| url.host_str().map(str::to_string))
            .ok_or_else(|| ValidationError::Required {
                field: "queue_address".to_string(),
            })
    }

    fn validate(name: &str) -> Result<(), ValidationError> {
        if name.is_empty() || name.len() > 260 {
            return Err(ValidationError::OutOfRange {
                field: "queue_address".to_string(),
                message: "must be 1-260 characters".to_string(),
            });
        }

        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        {
            return Err(ValidationError::InvalidFormat {
                field: "queue_address".to_string(),
                message: "only ASCII alphanumeric, hyphens, underscores, and dots allowed"
                    .to_string(),
            });
        }

        if name.starts_with('-') || name.ends_with('-') || name.contains("--") {
            return Err(ValidationError::InvalidFormat {
                field: "queue_address".to_string(),
                message: "no leading/trailing hyphens or consecutive hyphens".to_string(),
            });
        }

        Ok(())
    }

    /// Get the logical queue name
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for QueueAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for QueueAddress {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for QueueAddress {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<QueueAddress> for String {
    fn from(address: QueueAddress) -> Self {
        address.0
    }
}

/// Unique identifier for messages within the bus
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    /// Generate new random message ID
    pub fn new() -> Self {
        let id = uuid::Uuid::new_v4();
        Self(id.to_string())
    }

    /// Get message ID as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ValidationError::Required {
                field: "message_id".to_string(),
            });
        }

        Ok(Self(s.to_string()))
    }
}

/// Identity of one bus (transport) instance
///
/// A transaction may only carry work enlisted by a single bus.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BusId(String);

impl BusId {
    /// Create a bus identity from a readable name
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Generate a random bus identity
    pub fn generate() -> Self {
        Self(format!("bus-{}", uuid::Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BusId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Format an instant the way time headers carry it
pub fn format_timestamp(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a time header value, ignoring values that are not RFC 3339
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

// ============================================================================
// Transport Message
// ============================================================================

/// A message as the transport sees it: headers plus an opaque payload
///
/// Immutable once constructed; the `with_*` methods consume the message and
/// return a modified copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportMessage {
    headers: Headers,
    body: Bytes,
}

impl TransportMessage {
    /// Create message from headers and body
    pub fn new(headers: Headers, body: impl Into<Bytes>) -> Self {
        Self {
            headers,
            body: body.into(),
        }
    }

    /// Create message carrying a fresh message ID and the current sent time
    pub fn from_body(body: impl Into<Bytes>) -> Self {
        let mut headers = Headers::new();
        headers.insert(headers::MESSAGE_ID.to_string(), MessageId::new().to_string());
        headers.insert(headers::SENT_TIME.to_string(), format_timestamp(Utc::now()));
        Self::new(headers, body)
    }

    /// Add or replace a header
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Remove a header
    pub fn without_header(mut self, key: &str) -> Self {
        self.headers.remove(key);
        self
    }

    /// Set time-to-live, measured from the sent time
    pub fn with_time_to_live(self, ttl: std::time::Duration) -> Self {
        self.with_header(headers::TIME_TO_BE_RECEIVED, ttl.as_millis().to_string())
    }

    /// Hold the message back until the given instant
    pub fn with_deferred_until(self, due: DateTime<Utc>) -> Self {
        self.with_header(headers::DEFERRED_UNTIL, format_timestamp(due))
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Get a single header value
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    /// Get the message ID header, if present
    pub fn message_id(&self) -> Option<&str> {
        self.header(headers::MESSAGE_ID)
    }

    /// Split into headers and body
    pub fn into_parts(self) -> (Headers, Bytes) {
        (self.headers, self.body)
    }

    /// Instant after which the message must no longer be delivered
    ///
    /// Requires both a parsable sent time and time-to-live. A time-to-live
    /// that overflows the timestamp range never expires.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let sent = parse_timestamp(self.header(headers::SENT_TIME)?)?;
        let ttl_ms: i64 = self.header(headers::TIME_TO_BE_RECEIVED)?.parse().ok()?;
        sent.checked_add_signed(chrono::TimeDelta::try_milliseconds(ttl_ms)?)
    }

    /// Check whether the time-to-live has elapsed at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().is_some_and(|expires| now >= expires)
    }

    /// Instant before which the message must not be delivered
    pub fn deferred_until(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(self.header(headers::DEFERRED_UNTIL)?)
    }
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
