//! Opaque cursor pagination over `(created_at, id)`.
//!
//! Cursors are base64-encoded and stable under concurrent insertion: new
//! rows sort after the cursor position because ids are time-ordered V7
//! UUIDs and `created_at` is the primary sort key.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::error::{Error, Result};

pub const DEFAULT_PAGE_SIZE: i64 = 25;
pub const MAX_PAGE_SIZE: i64 = 100;

/// Position of the last item of the previous page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    pub created_at: DateTime<Utc>,
    pub id: Uuid,
}

impl Cursor {
    pub fn new(created_at: DateTime<Utc>, id: Uuid) -> Self {
        Self { created_at, id }
    }

    pub fn encode(&self) -> String {
        let raw = format!("{}|{}", self.created_at.to_rfc3339(), self.id);
        URL_SAFE_NO_PAD.encode(raw.as_bytes())
    }

    pub fn decode(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidRequest("invalid cursor".into());
        let bytes = URL_SAFE_NO_PAD.decode(s).map_err(|_| invalid())?;
        let raw = String::from_utf8(bytes).map_err(|_| invalid())?;
        let (ts, id) = raw.split_once('|').ok_or_else(invalid)?;
        let created_at = DateTime::parse_from_rfc3339(ts)
            .map_err(|_| invalid())?
            .with_timezone(&Utc);
        let id = id.parse::<Uuid>().map_err(|_| invalid())?;
        Ok(Self { created_at, id })
    }
}

/// One page of results plus the cursor of the next one, if any.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

impl<T> Page<T> {
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            next_cursor: None,
        }
    }
}

/// Clamp a requested page size into `1..=MAX_PAGE_SIZE`, defaulting to
/// `DEFAULT_PAGE_SIZE` when absent.
pub fn clamp_limit(limit: Option<i64>) -> i64 {
    limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE)
}

/// Build a page from `limit + 1` fetched items. The extra item, when
/// present, only signals that another page exists.
pub fn build_page<T>(mut items: Vec<T>, limit: i64, cursor_of: impl Fn(&T) -> Cursor) -> Page<T> {
    let has_more = items.len() > limit as usize;
    if has_more {
        items.truncate(limit as usize);
    }
    let next_cursor = if has_more {
        items.last().map(|item| cursor_of(item).encode())
    } else {
        None
    };
    Page { items, next_cursor }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_round_trips() {
        let cursor = Cursor::new(Utc::now(), Uuid::now_v7());
        let decoded = Cursor::decode(&cursor.encode()).unwrap();
        assert_eq!(cursor.id, decoded.id);
        assert_eq!(
            cursor.created_at.timestamp_millis(),
            decoded.created_at.timestamp_millis()
        );
    }

    #[test]
    fn garbage_cursor_is_invalid_request() {
        assert!(matches!(
            Cursor::decode("not-base64!!!"),
            Err(Error::InvalidRequest(_))
        ));
        let junk = URL_SAFE_NO_PAD.encode(b"no separator here");
        assert!(Cursor::decode(&junk).is_err());
    }

    #[test]
    fn limit_clamps_and_defaults() {
        assert_eq!(clamp_limit(None), DEFAULT_PAGE_SIZE);
        assert_eq!(clamp_limit(Some(0)), 1);
        assert_eq!(clamp_limit(Some(1_000)), MAX_PAGE_SIZE);
        assert_eq!(clamp_limit(Some(10)), 10);
    }

    #[test]
    fn page_trims_sentinel_row_and_sets_cursor() {
        let now = Utc::now();
        let items: Vec<(DateTime<Utc>, Uuid)> = (0..11).map(|_| (now, Uuid::now_v7())).collect();
        let page = build_page(items.clone(), 10, |&(ts, id)| Cursor::new(ts, id));
        assert_eq!(page.items.len(), 10);
        let expected = Cursor::new(items[9].0, items[9].1).encode();
        assert_eq!(page.next_cursor.as_deref(), Some(expected.as_str()));
    }

    #[test]
    fn short_page_has_no_cursor() {
        let now = Utc::now();
        let items: Vec<(DateTime<Utc>, Uuid)> = (0..3).map(|_| (now, Uuid::now_v7())).collect();
        let page = build_page(items, 10, |&(ts, id)| Cursor::new(ts, id));
        assert_eq!(page.items.len(), 3);
        assert!(page.next_cursor.is_none());
    }
}
