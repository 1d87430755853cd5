use std::sync::Arc;

use shared::domain::SecurityMatch;
use terminal_integration::SecurityLookup;
use tokio::sync::Mutex;
use tracing::debug;

/// Result cap passed to every lookup query.
pub const LOOKUP_MAX_RESULTS: usize = 10;

/// Serializes access to the terminal's single-cursor security lookup.
/// The lock is held for exactly one query.
pub struct LookupGuard {
    session: Mutex<Arc<dyn SecurityLookup>>,
    max_results: usize,
}

impl LookupGuard {
    pub fn new(session: Arc<dyn SecurityLookup>) -> Self {
        Self {
            session: Mutex::new(session),
            max_results: LOOKUP_MAX_RESULTS,
        }
    }

    pub async fn search(&self, text: &str) -> anyhow::Result<Vec<SecurityMatch>> {
        let raw = {
            let session = self.session.lock().await;
            session.query(text, self.max_results).await?
        };
        let matches: Vec<SecurityMatch> = raw
            .iter()
            .filter_map(|entry| parse_lookup_result(entry))
            .collect();
        debug!(
            query = text,
            returned = raw.len(),
            parsed = matches.len(),
            "lookup: query complete"
        );
        Ok(matches)
    }

    /// Waits for any in-flight query before releasing the session.
    pub async fn dispose(&self) -> anyhow::Result<()> {
        let session = self.session.lock().await;
        session.dispose().await
    }
}

/// Parses `"<name> <TYPE>"` entries such as `"AAPL US<equity>"`.
/// Entries without a `<` are not results and yield `None`.
pub fn parse_lookup_result(raw: &str) -> Option<SecurityMatch> {
    let split = raw.rfind('<')?;
    let name = raw[..split].trim();
    let kind = raw[split + 1..].trim();
    let kind = kind.strip_suffix('>').unwrap_or(kind);
    Some(SecurityMatch {
        name: name.to_string(),
        kind: capitalize_first(kind),
    })
}

fn capitalize_first(value: &str) -> String {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use terminal_integration::{memory::InMemoryTerminal, TerminalSession};

    use super::*;

    #[test]
    fn parses_name_and_capitalized_type() {
        let parsed = parse_lookup_result("AAPL US<equity>").expect("parsed");
        assert_eq!(parsed.name, "AAPL US");
        assert_eq!(parsed.kind, "Equity");
    }

    #[test]
    fn splits_on_last_angle_bracket() {
        let parsed = parse_lookup_result("ODD <NAME> X<corp>").expect("parsed");
        assert_eq!(parsed.name, "ODD <NAME> X");
        assert_eq!(parsed.kind, "Corp");
    }

    #[test]
    fn entry_without_bracket_is_dropped() {
        assert_eq!(parse_lookup_result("no type here"), None);
    }

    #[test]
    fn tolerates_missing_closing_bracket() {
        let parsed = parse_lookup_result("SPX Index <index").expect("parsed");
        assert_eq!(parsed.name, "SPX Index");
        assert_eq!(parsed.kind, "Index");
    }

    #[tokio::test]
    async fn search_drops_malformed_entries() {
        let terminal = InMemoryTerminal::new();
        terminal
            .set_lookup_results(&["IBM US<equity>", "garbage", "IBM 5 1/2 Corp<corp>"])
            .await;
        let guard = LookupGuard::new(terminal.open_security_lookup().await.expect("open"));

        let results = guard.search("IBM").await.expect("search");
        assert_eq!(results.len(), 2);
        assert_eq!(results[1].kind, "Corp");
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_searches_never_overlap() {
        let terminal = InMemoryTerminal::new();
        terminal.set_lookup_results(&["IBM US<equity>"]).await;
        terminal.set_query_delay(Some(Duration::from_millis(50))).await;
        let guard = Arc::new(LookupGuard::new(
            terminal.open_security_lookup().await.expect("open"),
        ));

        let mut tasks = Vec::new();
        for query in ["a", "b", "c", "d"] {
            let guard = Arc::clone(&guard);
            tasks.push(tokio::spawn(async move { guard.search(query).await }));
        }
        for task in tasks {
            task.await.expect("join").expect("search");
        }

        let calls = terminal.calls().await;
        assert_eq!(calls.lookup_queries.len(), 4);
        assert_eq!(calls.max_concurrent_queries, 1);
    }
}
