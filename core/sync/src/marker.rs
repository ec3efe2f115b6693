//! Sync marker codec.
//!
//! A marker records "as of `timestamp`, `resource_identifier` was the
//! counterpart synced for `region`". It is stored as a single tag so each
//! synced counterpart costs one tag slot:
//!
//! ```text
//! Sync[-<subtype>]-<region> = <YYYYmmddHHMMSS+0000> / <resource identifier>
//! ```

use chrono::{DateTime, TimeZone, Utc};

use xregion_common::{Error, Result, Tag};

/// Prefix of every marker key.
pub const MARKER_PREFIX: &str = "Sync";

/// Separator between the timestamp and the resource identifier.
pub const VALUE_SEPARATOR: &str = " / ";

/// Timestamp layout of a marker value, second precision with explicit offset.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S%z";

/// Subtype used on destination resources to point back at their source.
pub const FROM_SUBTYPE: &str = "From";

/// Decoded content of a marker value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncMarker {
    /// When the counterpart was synced, normalized to UTC.
    pub timestamp: DateTime<Utc>,
    /// Identifier of the counterpart resource.
    pub resource_identifier: String,
}

/// Build the marker key for `region` and an optional subtype.
pub fn marker_key(region: &str, subtype: Option<&str>) -> String {
    match subtype {
        Some(subtype) => format!("{}-{}-{}", MARKER_PREFIX, subtype, region),
        None => format!("{}-{}", MARKER_PREFIX, region),
    }
}

/// Encode a marker into a tag.
///
/// The timestamp is normalized to UTC first, so instants given with
/// different offsets encode identically. Sub-second precision is dropped.
pub fn encode<Tz: TimeZone>(
    region: &str,
    resource_identifier: &str,
    timestamp: &DateTime<Tz>,
    subtype: Option<&str>,
) -> Tag {
    let utc = timestamp.with_timezone(&Utc);
    Tag::new(
        marker_key(region, subtype),
        format!(
            "{}{}{}",
            utc.format(TIMESTAMP_FORMAT),
            VALUE_SEPARATOR,
            resource_identifier
        ),
    )
}

/// Decode a marker value.
///
/// # Returns
/// - `Ok(None)` if the value is absent or empty
///
/// # Errors
/// - `MalformedMarker` if the separator or timestamp cannot be parsed
pub fn decode(value: Option<&str>) -> Result<Option<SyncMarker>> {
    let Some(value) = value.filter(|v| !v.is_empty()) else {
        return Ok(None);
    };

    let (timestamp, identifier) = value
        .split_once(VALUE_SEPARATOR)
        .ok_or_else(|| Error::MalformedMarker(format!("missing separator in '{}'", value)))?;

    let timestamp = DateTime::parse_from_str(timestamp, TIMESTAMP_FORMAT)
        .map_err(|e| Error::MalformedMarker(format!("bad timestamp in '{}': {}", value, e)))?;

    Ok(Some(SyncMarker {
        timestamp: timestamp.with_timezone(&Utc),
        resource_identifier: identifier.to_string(),
    }))
}

/// Find and decode the marker for `region`/`subtype` in a tag list.
pub fn find(tags: &[Tag], region: &str, subtype: Option<&str>) -> Result<Option<SyncMarker>> {
    decode(Tag::find(tags, &marker_key(region, subtype)))
}
