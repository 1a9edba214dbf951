use std::collections::HashSet;

/// Identities whose person processing is force-disabled, parsed from
/// `PERSONS_PROCESSING_SKIP_TOKENS`. An entry is either a bare token
/// (covering every event for that token) or `token:distinct_id`
/// (covering one identity). Entries are kept verbatim in one flat set;
/// lookup probes the composite key and the bare token.
#[derive(Debug, Default)]
pub struct PersonlessTokens {
    entries: HashSet<String>,
}

impl PersonlessTokens {
    pub fn parse(config: &str) -> Self {
        let entries = config
            .split(',')
            .map(str::trim)
            // A leading colon means no token, which can never match
            .filter(|entry| !entry.is_empty() && !entry.starts_with(':'))
            .map(|entry| entry.trim_end_matches(':').to_string())
            .collect();
        Self { entries }
    }

    pub fn forces_personless(&self, token: &str, distinct_id: &str) -> bool {
        if token.is_empty() {
            return false;
        }
        self.entries.contains(&format!("{token}:{distinct_id}")) || self.entries.contains(token)
    }
}
