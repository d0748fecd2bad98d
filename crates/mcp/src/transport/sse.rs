//! Server-sent event bodies returned by streamable HTTP servers.
//!
//! Only `data:` fields matter; each blank-line-terminated event carries one
//! JSON-RPC envelope.

/// Split an SSE body into the data payload of each event.
pub fn decode_events(body: &str) -> Vec<String> {
    let mut events = Vec::new();
    let mut data: Vec<&str> = Vec::new();

    for raw in body.split('\n') {
        let line = raw.trim_end_matches('\r');

        if line.is_empty() {
            if !data.is_empty() {
                events.push(data.join("\n"));
                data.clear();
            }
            continue;
        }

        // comments, event names and ids
        if line.starts_with(':') {
            continue;
        }

        if let Some(rest) = line.strip_prefix("data:") {
            data.push(rest.strip_prefix(' ').unwrap_or(rest));
        }
    }

    if !data.is_empty() {
        events.push(data.join("\n"));
    }

    events
}
