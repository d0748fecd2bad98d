//! Opaque continuation tokens for chunked list results.
//!
//! A cursor is base64 (URL-safe, unpadded) over a small tagged payload so that
//! clients treat it as an opaque string. Cursors are only meaningful to the
//! list operation that issued them.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CursorError {
    #[error("cursor is not valid base64")]
    Encoding,

    #[error("cursor payload is malformed: {0}")]
    Malformed(String),
}

/// Position in a server-side sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cursor {
    /// Numeric offset into a bounded sequence
    Offset(usize),
    /// Resume after the given key
    Key(String),
}

impl Cursor {
    pub fn encode(&self) -> String {
        let raw = match self {
            Self::Offset(n) => format!("o:{}", n),
            Self::Key(k) => format!("k:{}", k),
        };
        URL_SAFE_NO_PAD.encode(raw.as_bytes())
    }

    pub fn decode(token: &str) -> Result<Self, CursorError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(token.as_bytes())
            .map_err(|_| CursorError::Encoding)?;
        let raw = String::from_utf8(bytes).map_err(|_| CursorError::Encoding)?;

        if let Some(n) = raw.strip_prefix("o:") {
            let offset = n
                .parse::<usize>()
                .map_err(|_| CursorError::Malformed(raw.clone()))?;
            Ok(Self::Offset(offset))
        } else if let Some(k) = raw.strip_prefix("k:") {
            Ok(Self::Key(k.to_string()))
        } else {
            Err(CursorError::Malformed(raw))
        }
    }
}

/// One page of a list result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<String>,
}

impl<T> Page<T> {
    pub fn last(items: Vec<T>) -> Self {
        Self {
            items,
            next_cursor: None,
        }
    }
}

/// Slice a bounded sequence by offset cursor.
///
/// A cursor past the end yields an empty final page rather than an error.
pub fn paginate<T: Clone>(
    items: &[T],
    cursor: Option<&str>,
    page_size: usize,
) -> Result<Page<T>, CursorError> {
    let start = match cursor {
        None => 0,
        Some(token) => match Cursor::decode(token)? {
            Cursor::Offset(n) => n,
            Cursor::Key(k) => {
                return Err(CursorError::Malformed(format!(
                    "key cursor '{}' used for offset listing",
                    k
                )))
            }
        },
    };

    if start >= items.len() {
        return Ok(Page::last(Vec::new()));
    }

    let end = std::cmp::min(start + page_size.max(1), items.len());
    let next_cursor = (end < items.len()).then(|| Cursor::Offset(end).encode());

    Ok(Page {
        items: items[start..end].to_vec(),
        next_cursor,
    })
}
