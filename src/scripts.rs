//! Script Registry (C3, §4.3).
//!
//! An append-only index of `scriptId -> url` built from `Debugger.scriptParsed`
//! events. The Breakpoint Manager consults it to rank candidate scripts when
//! `Debugger.setBreakpointByUrl` can't resolve a path directly (bundlers and
//! transpilers routinely rewrite source paths beyond recognition).

use tokio::sync::RwLock;

use crate::types::Script;

/// Ranking of a candidate script against a requested file path. Higher is
/// a better match; `None` means "not a match at all".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum MatchRank {
    Substring,
    Basename,
    ExactSuffix,
}

#[derive(Default)]
pub struct ScriptRegistry {
    scripts: RwLock<Vec<Script>>,
}

impl ScriptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a `Debugger.scriptParsed` event. Events missing `scriptId` or
    /// `url` are dropped — CDP emits synthetic/internal scripts with empty
    /// urls that can't be looked up by path and would only pollute ranking.
    pub async fn record(&self, script_id: impl Into<String>, url: impl Into<String>) {
        let script_id = script_id.into();
        let url = url.into();
        if script_id.is_empty() || url.is_empty() {
            return;
        }
        let mut guard = self.scripts.write().await;
        guard.push(Script { script_id, url });
    }

    /// All scripts seen so far, oldest first.
    pub async fn list(&self) -> Vec<Script> {
        self.scripts.read().await.clone()
    }

    pub async fn get(&self, script_id: &str) -> Option<Script> {
        self.scripts
            .read()
            .await
            .iter()
            .find(|s| s.script_id == script_id)
            .cloned()
    }

    /// Best-effort resolution of `file` to a known script, used when
    /// `Debugger.setBreakpointByUrl` has already failed on the literal path.
    ///
    /// Ranking: exact-suffix match beats a basename match beats a bare
    /// substring match. Ties keep the earliest-registered (most likely
    /// entry-point) script. Returns `None` if nothing matches at all.
    pub async fn resolve_fallback(&self, file: &str) -> Option<Script> {
        let basename = basename_of(file);
        let guard = self.scripts.read().await;

        let mut best: Option<(MatchRank, usize, &Script)> = None;
        for (index, script) in guard.iter().enumerate() {
            let Some(rank) = rank_match(&script.url, file, basename) else {
                continue;
            };
            let better = match &best {
                None => true,
                Some((best_rank, _, _)) => rank > *best_rank,
            };
            if better {
                best = Some((rank, index, script));
            }
        }
        best.map(|(_, _, script)| script.clone())
    }

    /// Discard all state; called on disconnect/terminate since script ids
    /// are only valid within one connection.
    pub async fn clear(&self) {
        self.scripts.write().await.clear();
    }
}

fn rank_match(url: &str, file: &str, file_basename: &str) -> Option<MatchRank> {
    if url == file || url.ends_with(file) {
        return Some(MatchRank::ExactSuffix);
    }
    let url_basename = basename_of(url);
    if !file_basename.is_empty() && url_basename == file_basename {
        return Some(MatchRank::Basename);
    }
    if !file_basename.is_empty() && url.contains(file_basename) {
        return Some(MatchRank::Substring);
    }
    None
}

fn basename_of(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn record_ignores_events_missing_id_or_url() {
        let registry = ScriptRegistry::new();
        registry.record("", "file:///app.js").await;
        registry.record("1", "").await;
        assert!(registry.list().await.is_empty());
    }

    #[tokio::test]
    async fn get_finds_recorded_script_by_id() {
        let registry = ScriptRegistry::new();
        registry.record("42", "file:///dist/app.js").await;
        let found = registry.get("42").await.expect("should be present");
        assert_eq!(found.url, "file:///dist/app.js");
    }

    #[tokio::test]
    async fn resolve_fallback_prefers_exact_suffix_over_basename() {
        let registry = ScriptRegistry::new();
        registry.record("1", "file:///build/other/app.js").await;
        registry.record("2", "file:///src/app.js").await;
        let found = registry
            .resolve_fallback("src/app.js")
            .await
            .expect("should match");
        assert_eq!(found.script_id, "2");
    }

    #[tokio::test]
    async fn resolve_fallback_falls_back_to_basename_match() {
        let registry = ScriptRegistry::new();
        registry.record("1", "webpack:///./lib/widget.js").await;
        let found = registry
            .resolve_fallback("src/widget.js")
            .await
            .expect("should match on basename");
        assert_eq!(found.script_id, "1");
    }

    #[tokio::test]
    async fn resolve_fallback_falls_back_to_substring_match() {
        let registry = ScriptRegistry::new();
        registry
            .record("1", "webpack:///./node_modules/pkg/widget.bundle.js")
            .await;
        let found = registry
            .resolve_fallback("widget.js")
            .await
            .expect("should match on substring");
        assert_eq!(found.script_id, "1");
    }

    #[tokio::test]
    async fn resolve_fallback_returns_none_when_nothing_matches() {
        let registry = ScriptRegistry::new();
        registry.record("1", "file:///app.js").await;
        assert!(registry.resolve_fallback("completely-unrelated.js").await.is_none());
    }

    #[tokio::test]
    async fn clear_empties_the_registry() {
        let registry = ScriptRegistry::new();
        registry.record("1", "file:///app.js").await;
        registry.clear().await;
        assert!(registry.list().await.is_empty());
    }
}
