//! Client-side loop over cursor-paginated list operations.

use crate::error::McpResult;
use std::collections::HashSet;
use std::future::Future;
use switchyard_core::cursor::Page;
use tracing::{debug, warn};

/// Follow `next_cursor` until the listing is exhausted.
///
/// Exhaustion is an absent (or empty) cursor, a cursor seen before, an empty
/// continuation page, or an invalid-params rejection of a continuation
/// cursor. Errors on the first page are returned as is.
pub async fn collect_pages<T, F, Fut>(label: &str, mut fetch: F) -> McpResult<Vec<T>>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = McpResult<Page<T>>>,
{
    let mut items = Vec::new();
    let mut cursor: Option<String> = None;
    let mut seen = HashSet::new();

    loop {
        let page = match fetch(cursor.clone()).await {
            Ok(page) => page,
            Err(e) if cursor.is_some() && e.is_invalid_params() => {
                warn!(list = label, error = %e, "Continuation cursor rejected, treating as end of list");
                break;
            }
            Err(e) => return Err(e),
        };

        let continuation = cursor.is_some();
        let empty = page.items.is_empty();
        items.extend(page.items);

        if continuation && empty {
            debug!(list = label, "Empty continuation page, stopping");
            break;
        }

        match page.next_cursor.filter(|c| !c.is_empty()) {
            None => break,
            Some(next) => {
                if !seen.insert(next.clone()) {
                    warn!(list = label, cursor = %next, "Server repeated a cursor, stopping");
                    break;
                }
                cursor = Some(next);
            }
        }
    }

    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::McpError;
    use crate::protocol::JsonRpcError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use switchyard_core::cursor::paginate;

    #[tokio::test]
    async fn test_follows_cursors_to_the_end() {
        let source: Vec<u32> = (0..1000).collect();
        let calls = AtomicUsize::new(0);

        let all = collect_pages("numbers", |cursor| {
            calls.fetch_add(1, Ordering::SeqCst);
            let page = paginate(&source, cursor.as_deref(), 100)
                .map_err(|e| McpError::from(JsonRpcError::invalid_params(e.to_string())));
            async move { page }
        })
        .await
        .unwrap();

        assert_eq!(all, source);
        assert_eq!(calls.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn test_repeated_cursor_stops() {
        let all = collect_pages("loop", |_cursor| async {
            Ok(Page {
                items: vec![1],
                next_cursor: Some("same".to_string()),
            })
        })
        .await
        .unwrap();
        // first page, then one continuation that repeats the cursor
        assert_eq!(all, vec![1, 1]);
    }

    #[tokio::test]
    async fn test_invalid_continuation_is_exhaustion() {
        let all = collect_pages("past-end", |cursor| async move {
            match cursor {
                None => Ok(Page {
                    items: vec!["a"],
                    next_cursor: Some("stale".into()),
                }),
                Some(_) => Err(McpError::from(JsonRpcError::invalid_params("bad cursor"))),
            }
        })
        .await
        .unwrap();
        assert_eq!(all, vec!["a"]);
    }

    #[tokio::test]
    async fn test_first_page_error_propagates() {
        let err = collect_pages::<u8, _, _>("broken", |_| async {
            Err(McpError::from(JsonRpcError::invalid_params("nope")))
        })
        .await
        .unwrap_err();
        assert!(err.is_invalid_params());
    }

    #[tokio::test]
    async fn test_empty_continuation_page_stops() {
        let all = collect_pages("sparse", |cursor| async move {
            Ok(match cursor {
                None => Page {
                    items: vec![7],
                    next_cursor: Some("next".into()),
                },
                Some(_) => Page {
                    items: Vec::<i32>::new(),
                    next_cursor: Some("more".into()),
                },
            })
        })
        .await
        .unwrap();
        assert_eq!(all, vec![7]);
    }
}
