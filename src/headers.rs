use axum::http::{HeaderMap, HeaderName, HeaderValue, header};
use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};
use tracing::warn;

use crate::config::HeaderOverrides;
use crate::store::ObjectMetadata;

/// Builds the outbound headers for a fetched object.
///
/// `Cache-Control` and `Expires` take the configured override when it is set;
/// everything else comes from the object. Empty values, a zero length and an
/// unset modification time produce no header.
pub fn effective_headers(metadata: &ObjectMetadata, overrides: &HeaderOverrides) -> HeaderMap {
    let mut headers = HeaderMap::new();

    set_str(
        &mut headers,
        header::CACHE_CONTROL,
        prefer_override(&overrides.cache_control, metadata.cache_control.as_deref()),
    );
    set_str(
        &mut headers,
        header::EXPIRES,
        prefer_override(&overrides.expires, metadata.expires.as_deref()),
    );
    set_str(
        &mut headers,
        header::CONTENT_DISPOSITION,
        metadata.content_disposition.as_deref(),
    );
    set_str(
        &mut headers,
        header::CONTENT_ENCODING,
        metadata.content_encoding.as_deref(),
    );
    set_str(
        &mut headers,
        header::CONTENT_LANGUAGE,
        metadata.content_language.as_deref(),
    );
    if let Some(length) = metadata.content_length.filter(|length| *length > 0) {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    }
    set_str(
        &mut headers,
        header::CONTENT_RANGE,
        metadata.content_range.as_deref(),
    );
    set_str(
        &mut headers,
        header::CONTENT_TYPE,
        metadata.content_type.as_deref(),
    );
    if let Some(modified) = metadata.last_modified {
        set_str(
            &mut headers,
            header::LAST_MODIFIED,
            http_date(modified).as_deref(),
        );
    }

    headers
}

fn prefer_override<'a>(configured: &'a str, object: Option<&'a str>) -> Option<&'a str> {
    if configured.is_empty() {
        object
    } else {
        Some(configured)
    }
}

fn set_str(headers: &mut HeaderMap, name: HeaderName, value: Option<&str>) {
    let Some(value) = value.filter(|value| !value.is_empty()) else {
        return;
    };
    match HeaderValue::from_str(value) {
        Ok(value) => {
            headers.insert(name, value);
        }
        Err(_) => warn!(header = %name, value, "skipping invalid header value"),
    }
}

/// Formats a timestamp as an IMF-fixdate, e.g. `Sun, 06 Nov 1994 08:49:37 GMT`.
pub fn http_date(value: OffsetDateTime) -> Option<String> {
    value
        .to_offset(UtcOffset::UTC)
        .format(format_description!(
            "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
        ))
        .ok()
}
