//! Source-Map Cache (C5, §4.5).
//!
//! Loads and caches V3 source maps so call frames and breakpoint locations
//! can be translated between the source the caller reasons about and the
//! compiled code V8 actually runs. Concurrent requests for the same file
//! share one load (single-flight) so a hot breakpoint path doesn't thrash
//! the filesystem.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sourcemap::SourceMap;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::types::{CompiledLocation, SourceLocation};

enum CacheEntry {
    Loading(Arc<tokio::sync::Notify>),
    Loaded(Option<Arc<SourceMap>>),
}

#[derive(Default)]
pub struct SourceMapCache {
    entries: RwLock<HashMap<PathBuf, CacheEntry>>,
}

impl SourceMapCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load (or return the cached) source map for `compiled_file`. Returns
    /// `None` if the file has no map, or the map can't be parsed — source
    /// mapping is best-effort, never fatal to a kernel operation.
    pub async fn load(&self, compiled_file: &Path) -> Option<Arc<SourceMap>> {
        loop {
            let notify = {
                let mut guard = self.entries.write().await;
                match guard.get(compiled_file) {
                    Some(CacheEntry::Loaded(map)) => return map.clone(),
                    Some(CacheEntry::Loading(notify)) => Some(notify.clone()),
                    None => {
                        let notify = Arc::new(tokio::sync::Notify::new());
                        guard.insert(
                            compiled_file.to_path_buf(),
                            CacheEntry::Loading(notify.clone()),
                        );
                        None
                    }
                }
            };

            if let Some(notify) = notify {
                notify.notified().await;
                continue;
            }

            let map = read_and_parse(compiled_file).await;
            let mut guard = self.entries.write().await;
            if let Some(CacheEntry::Loading(notify)) = guard.get(compiled_file) {
                notify.notify_waiters();
            }
            guard.insert(compiled_file.to_path_buf(), CacheEntry::Loaded(map.clone()));
            return map;
        }
    }

    /// Translate a source-facing location (1-indexed line, matching every
    /// external convention in this crate) into compiled coordinates, by
    /// trying the candidate compiled paths derived from `source.file`, then
    /// checking each candidate's map for a token whose source position
    /// matches. Returns the first hit, with the generated line converted
    /// back to 1-indexed (the `sourcemap` crate's tokens are 0-indexed,
    /// matching the wire format the maps themselves describe).
    pub async fn source_to_compiled(&self, source: SourceLocation<'_>) -> Option<CompiledLocation> {
        let wanted_line = source.line.saturating_sub(1);
        for candidate in candidate_compiled_paths(source.file) {
            let Some(map) = self.load(Path::new(&candidate)).await else {
                continue;
            };
            if let Some(token) = map
                .tokens()
                .find(|t| t.get_src_line() == wanted_line && source_matches(t.get_source(), source.file))
            {
                return Some(CompiledLocation {
                    file: candidate,
                    line: token.get_dst_line() + 1,
                    column: token.get_dst_col(),
                });
            }
        }
        None
    }

    /// Translate a compiled-code location back to source, using
    /// `compiled.file`'s own map if one is cached/loadable. `line` is
    /// 1-indexed on the way in and out, matching every other boundary in
    /// this crate; the `sourcemap` crate's own lookup is 0-indexed.
    pub async fn compiled_to_source(&self, compiled_file: &Path, line: u32, column: u32) -> Option<SourceLocationOwned> {
        let map = self.load(compiled_file).await?;
        let token = map.lookup_token(line.saturating_sub(1), column)?;
        Some(SourceLocationOwned {
            file: token.get_source().unwrap_or_default().to_string(),
            line: token.get_src_line() + 1,
            column: token.get_src_col(),
        })
    }

    /// Map a variable name through the map's name table at the given
    /// compiled location (1-indexed line), falling back to the original
    /// name if there is no better mapping.
    pub async fn map_variable_name(
        &self,
        compiled_file: &Path,
        line: u32,
        column: u32,
        name: &str,
    ) -> String {
        let Some(map) = self.load(compiled_file).await else {
            return name.to_string();
        };
        map.lookup_token(line.saturating_sub(1), column)
            .and_then(|t| t.get_name())
            .map(str::to_string)
            .unwrap_or_else(|| name.to_string())
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }
}

#[derive(Debug, Clone)]
pub struct SourceLocationOwned {
    pub file: String,
    pub line: u32,
    pub column: u32,
}

fn source_matches(token_source: Option<&str>, file: &str) -> bool {
    match token_source {
        Some(src) => src == file || src.ends_with(file) || file.ends_with(src),
        None => false,
    }
}

/// Candidate compiled paths for a source file, in preference order: the
/// file itself (already compiled, no build step), then the common
/// `.ts`/`.tsx` -> `.js`/`.jsx` and `/src/` -> `/dist/` rewrites.
fn candidate_compiled_paths(source_file: &str) -> Vec<String> {
    let mut candidates = vec![source_file.to_string()];

    let ext_mapped = if let Some(stem) = source_file.strip_suffix(".tsx") {
        Some(format!("{stem}.jsx"))
    } else {
        source_file.strip_suffix(".ts").map(|stem| format!("{stem}.js"))
    };
    if let Some(mapped) = ext_mapped {
        candidates.push(mapped.clone());
        if mapped.contains("/src/") {
            candidates.push(mapped.replace("/src/", "/dist/"));
        }
    } else if source_file.contains("/src/") {
        candidates.push(source_file.replace("/src/", "/dist/"));
    }

    candidates
}

async fn read_and_parse(compiled_file: &Path) -> Option<Arc<SourceMap>> {
    let map_path = PathBuf::from(format!("{}.map", compiled_file.display()));
    let contents = match tokio::fs::read(&map_path).await {
        Ok(bytes) => bytes,
        Err(err) => {
            debug!(path = %map_path.display(), %err, "no source map file");
            return None;
        }
    };
    match SourceMap::from_slice(&contents) {
        Ok(map) => Some(Arc::new(map)),
        Err(err) => {
            warn!(path = %map_path.display(), %err, "failed to parse source map");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_map_json() -> &'static str {
        r#"{
            "version": 3,
            "file": "app.js",
            "sources": ["app.ts"],
            "names": ["doThing"],
            "mappings": "AAAAA"
        }"#
    }

    #[tokio::test]
    async fn load_reads_and_caches_sibling_map_file() {
        let dir = tempfile::tempdir().unwrap();
        let compiled = dir.path().join("app.js");
        std::fs::write(&compiled, "console.log(1);").unwrap();
        let mut map_file = std::fs::File::create(dir.path().join("app.js.map")).unwrap();
        map_file.write_all(sample_map_json().as_bytes()).unwrap();

        let cache = SourceMapCache::new();
        let first = cache.load(&compiled).await;
        assert!(first.is_some());
        // second call should hit the cache, not re-read the file
        std::fs::remove_file(dir.path().join("app.js.map")).unwrap();
        let second = cache.load(&compiled).await;
        assert!(second.is_some());
    }

    #[tokio::test]
    async fn load_returns_none_when_no_map_exists() {
        let dir = tempfile::tempdir().unwrap();
        let compiled = dir.path().join("app.js");
        std::fs::write(&compiled, "console.log(1);").unwrap();
        let cache = SourceMapCache::new();
        assert!(cache.load(&compiled).await.is_none());
    }

    #[tokio::test]
    async fn concurrent_loads_of_the_same_file_share_one_parse() {
        let dir = tempfile::tempdir().unwrap();
        let compiled = dir.path().join("app.js");
        std::fs::write(&compiled, "console.log(1);").unwrap();
        std::fs::write(dir.path().join("app.js.map"), sample_map_json()).unwrap();

        let cache = Arc::new(SourceMapCache::new());
        let a = {
            let cache = cache.clone();
            let compiled = compiled.clone();
            tokio::spawn(async move { cache.load(&compiled).await })
        };
        let b = {
            let cache = cache.clone();
            let compiled = compiled.clone();
            tokio::spawn(async move { cache.load(&compiled).await })
        };
        let (ra, rb) = tokio::join!(a, b);
        assert!(ra.unwrap().is_some());
        assert!(rb.unwrap().is_some());
    }

    #[test]
    fn candidate_compiled_paths_covers_ts_and_src_dist() {
        let candidates = candidate_compiled_paths("/project/src/app.ts");
        assert!(candidates.contains(&"/project/src/app.ts".to_string()));
        assert!(candidates.contains(&"/project/src/app.js".to_string()));
        assert!(candidates.contains(&"/project/dist/app.js".to_string()));
    }

    #[tokio::test]
    async fn compiled_to_source_returns_one_indexed_line() {
        let dir = tempfile::tempdir().unwrap();
        let compiled = dir.path().join("app.js");
        std::fs::write(&compiled, "console.log(1);").unwrap();
        std::fs::write(dir.path().join("app.js.map"), sample_map_json()).unwrap();

        let cache = SourceMapCache::new();
        // generated (1,0) is CDP's 0-indexed (0,0) already turned 1-indexed by
        // the caller; the single mapping in the sample map sits at source
        // (0,0), which this cache must report back as 1-indexed (1,0).
        let mapped = cache.compiled_to_source(&compiled, 1, 0).await.unwrap();
        assert_eq!(mapped.line, 1);
        assert_eq!(mapped.file, "app.ts");
    }

    #[tokio::test]
    async fn source_to_compiled_returns_one_indexed_line() {
        let dir = tempfile::tempdir().unwrap();
        let compiled = dir.path().join("app.ts").with_extension("js");
        std::fs::write(&compiled, "console.log(1);").unwrap();
        std::fs::write(dir.path().join("app.js.map"), sample_map_json()).unwrap();

        let cache = SourceMapCache::new();
        let source_file = dir.path().join("app.ts");
        let source_file = source_file.to_str().unwrap();
        let mapped = cache
            .source_to_compiled(SourceLocation {
                file: source_file,
                line: 1,
                column: 0,
            })
            .await
            .unwrap();
        assert_eq!(mapped.line, 1);
    }

    #[test]
    fn candidate_compiled_paths_passes_through_plain_js() {
        let candidates = candidate_compiled_paths("/project/app.js");
        assert_eq!(candidates, vec!["/project/app.js".to_string()]);
    }

    #[tokio::test]
    async fn clear_drops_cached_entries() {
        let dir = tempfile::tempdir().unwrap();
        let compiled = dir.path().join("app.js");
        std::fs::write(&compiled, "console.log(1);").unwrap();
        std::fs::write(dir.path().join("app.js.map"), sample_map_json()).unwrap();

        let cache = SourceMapCache::new();
        assert!(cache.load(&compiled).await.is_some());
        cache.clear().await;
        std::fs::remove_file(dir.path().join("app.js.map")).unwrap();
        assert!(cache.load(&compiled).await.is_none());
    }
}
