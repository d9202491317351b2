//! Cursor and offset pagination for log-style listings.
//!
//! Event log entries carry a monotonically increasing sequence number. The
//! cursor handed to clients is that sequence, base64-encoded so it stays
//! opaque; offset pagination is supported alongside it for simple UIs.
//!
//! ```rust,ignore
//! let page = PageRequest::new(Some(50), None, Some(cursor_str)).validate()?;
//! let (items, has_more) = trim_results(store.fetch(page.fetch_limit()).await?, page.limit);
//! ```

use anyhow::{Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

/// Default page size when the caller does not ask for one.
pub const DEFAULT_PAGE_SIZE: usize = 100;

/// Upper bound on a single page.
pub const MAX_PAGE_SIZE: usize = 1000;

// ============================================================================
// Cursor
// ============================================================================

/// Opaque cursor (base64-encoded log sequence number).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor(i64);

impl Cursor {
    pub fn new(sequence: i64) -> Self {
        Cursor(sequence)
    }

    /// Encode the cursor as a URL-safe base64 string.
    pub fn encode(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.0.to_be_bytes())
    }

    /// Decode a cursor string produced by [`Cursor::encode`].
    pub fn decode(s: &str) -> Result<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(s)
            .context("Invalid cursor: not valid base64")?;
        let raw: [u8; 8] = bytes
            .as_slice()
            .try_into()
            .context("Invalid cursor: wrong length")?;
        Ok(Cursor(i64::from_be_bytes(raw)))
    }

    pub fn sequence(&self) -> i64 {
        self.0
    }
}

// ============================================================================
// Page request
// ============================================================================

/// Raw pagination input as it arrives from a query string.
#[derive(Debug, Clone, Default)]
pub struct PageRequest {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub cursor: Option<String>,
}

impl PageRequest {
    pub fn new(limit: Option<usize>, offset: Option<usize>, cursor: Option<String>) -> Self {
        Self {
            limit,
            offset,
            cursor,
        }
    }

    /// Apply defaults and bounds, and decode the cursor.
    ///
    /// A cursor and a non-zero offset are mutually exclusive.
    pub fn validate(&self) -> Result<ValidatedPage, &'static str> {
        let after = self
            .cursor
            .as_deref()
            .map(Cursor::decode)
            .transpose()
            .map_err(|_| "Invalid cursor")?
            .map(|c| c.sequence());

        let offset = self.offset.unwrap_or(0);
        if after.is_some() && offset > 0 {
            return Err("Cannot combine cursor with offset");
        }

        let limit = self
            .limit
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE);

        Ok(ValidatedPage {
            limit,
            offset,
            after,
        })
    }
}

/// Pagination input after defaults and bounds were applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidatedPage {
    pub limit: usize,
    pub offset: usize,
    /// Only return entries with a sequence strictly greater than this.
    pub after: Option<i64>,
}

impl Default for ValidatedPage {
    fn default() -> Self {
        Self {
            limit: DEFAULT_PAGE_SIZE,
            offset: 0,
            after: None,
        }
    }
}

impl ValidatedPage {
    /// Number of rows to fetch (limit + 1 to detect has_more).
    pub fn fetch_limit(&self) -> usize {
        self.limit + 1
    }
}

/// Trim results to the requested limit and report whether more exist.
///
/// Queries should fetch `limit + 1` items.
pub fn trim_results<T>(mut results: Vec<T>, limit: usize) -> (Vec<T>, bool) {
    let has_more = results.len() > limit;
    results.truncate(limit);
    (results, has_more)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_encode_decode() {
        let cursor = Cursor::new(42_000);
        let decoded = Cursor::decode(&cursor.encode()).unwrap();
        assert_eq!(decoded.sequence(), 42_000);
    }

    #[test]
    fn cursor_rejects_garbage() {
        assert!(Cursor::decode("not a cursor!").is_err());
        assert!(Cursor::decode(&URL_SAFE_NO_PAD.encode([1u8, 2, 3])).is_err());
    }

    #[test]
    fn validate_applies_defaults() {
        let page = PageRequest::default().validate().unwrap();
        assert_eq!(page.limit, DEFAULT_PAGE_SIZE);
        assert_eq!(page.offset, 0);
        assert!(page.after.is_none());
    }

    #[test]
    fn validate_clamps_limit() {
        let page = PageRequest::new(Some(5_000), None, None).validate().unwrap();
        assert_eq!(page.limit, MAX_PAGE_SIZE);

        let page = PageRequest::new(Some(0), None, None).validate().unwrap();
        assert_eq!(page.limit, 1);
    }

    #[test]
    fn validate_rejects_cursor_with_offset() {
        let cursor = Cursor::new(7).encode();
        let request = PageRequest::new(None, Some(10), Some(cursor));
        assert!(request.validate().is_err());
    }

    #[test]
    fn trim_results_reports_more() {
        let (items, has_more) = trim_results((1..=12).collect::<Vec<_>>(), 10);
        assert_eq!(items.len(), 10);
        assert!(has_more);

        let (items, has_more) = trim_results((1..=5).collect::<Vec<_>>(), 10);
        assert_eq!(items.len(), 5);
        assert!(!has_more);
    }
}
