//! SQL UDF runtime
//!
//! `rvbbit('instructions', value)` and `rvbbit_run('path', value)` each
//! execute a cascade against one row's input. Identity is inherited from
//! the ambient context so the originating query's caller id attaches to
//! every produced session row. Results are cached process-wide (LRU,
//! optional TTL); failures return the literal string `"ERROR"` so
//! downstream SQL can filter deterministically.

use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, warn};

use crate::cascade::Cascade;
use crate::runner::{CascadeRunner, RunOptions};

/// The deterministic error scalar
pub const ERROR_SCALAR: &str = "ERROR";

/// Default cache capacity (entries)
const DEFAULT_CACHE_CAPACITY: usize = 10_000;

struct CacheEntry {
    value: String,
    inserted_at: Instant,
}

/// Bounded LRU with optional per-entry TTL
struct UdfCache {
    entries: HashMap<u64, CacheEntry>,
    order: VecDeque<u64>,
    capacity: usize,
}

impl UdfCache {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn get(&mut self, key: u64, ttl: Option<Duration>) -> Option<String> {
        let entry = self.entries.get(&key)?;
        if let Some(ttl) = ttl {
            if entry.inserted_at.elapsed() > ttl {
                self.entries.remove(&key);
                self.order.retain(|k| *k != key);
                return None;
            }
        }
        // Touch for LRU
        self.order.retain(|k| *k != key);
        self.order.push_back(key);
        Some(self.entries[&key].value.clone())
    }

    fn insert(&mut self, key: u64, value: String) {
        if self.entries.insert(
            key,
            CacheEntry {
                value,
                inserted_at: Instant::now(),
            },
        )
        .is_none()
        {
            self.order.push_back(key);
        }
        while self.entries.len() > self.capacity {
            let Some(oldest) = self.order.pop_front() else { break };
            self.entries.remove(&oldest);
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Executes cascade-backed scalar UDFs
pub struct UdfRuntime {
    runner: CascadeRunner,
    cache: Mutex<UdfCache>,
    /// TTL applied when a call carries no per-call spec
    default_ttl: Option<Duration>,
}

impl UdfRuntime {
    pub fn new(runner: CascadeRunner) -> Self {
        Self {
            runner,
            cache: Mutex::new(UdfCache::new(DEFAULT_CACHE_CAPACITY)),
            default_ttl: None,
        }
    }

    pub fn with_default_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn with_cache_capacity(self, capacity: usize) -> Self {
        Self {
            cache: Mutex::new(UdfCache::new(capacity)),
            ..self
        }
    }

    /// `rvbbit('instructions', value)` - a minimal one-cell cascade
    pub async fn rvbbit(&self, instructions: &str, value: &Value) -> String {
        // Instructions that don't reference the input get it appended
        let instructions = if instructions.contains("{{input.value}}") {
            instructions.to_string()
        } else {
            format!("{}\n\nInput:\n{{{{input.value}}}}", instructions)
        };
        let cascade = Cascade::single_cell("rvbbit-inline", &instructions);
        self.execute(&cascade, &instructions, value, None).await
    }

    /// `rvbbit_run('path', value)` - a cascade file per row
    pub async fn rvbbit_run(&self, path: &str, value: &Value, cache_ttl: Option<Duration>) -> String {
        let cascade = match Cascade::from_path(path) {
            Ok(cascade) => cascade,
            Err(e) => {
                warn!(%path, error = %e, "rvbbit_run: cascade load failed");
                return ERROR_SCALAR.to_string();
            }
        };
        self.execute(&cascade, path, value, cache_ttl).await
    }

    async fn execute(&self, cascade: &Cascade, key_source: &str, value: &Value, cache_ttl: Option<Duration>) -> String {
        let ttl = cache_ttl.or(self.default_ttl);
        let caching_enabled = ttl != Some(Duration::ZERO);
        let key = cache_key(key_source, value, self.runner.model_name());

        if caching_enabled {
            let hit = self
                .cache
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .get(key, ttl.filter(|t| !t.is_zero()));
            if let Some(value) = hit {
                debug!(key, "UdfRuntime: cache hit");
                return value;
            }
        }

        let inputs = match value {
            Value::Object(_) => value.clone(),
            other => serde_json::json!({"value": other}),
        };
        let result = self
            .runner
            .run(cascade, inputs, RunOptions::default())
            .await;

        let scalar = match result {
            Ok(session) if session.succeeded() => match session.output {
                Value::String(s) => s,
                other => other.to_string(),
            },
            Ok(session) => {
                warn!(session_id = %session.session_id, "UdfRuntime: cascade failed, returning error scalar");
                ERROR_SCALAR.to_string()
            }
            Err(e) => {
                warn!(error = %e, "UdfRuntime: cascade run errored, returning error scalar");
                ERROR_SCALAR.to_string()
            }
        };

        // Errors are never cached; the next call may succeed
        if caching_enabled && scalar != ERROR_SCALAR {
            self.cache
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .insert(key, scalar.clone());
        }
        scalar
    }

    /// Cached entry count (metrics/tests)
    pub fn cache_len(&self) -> usize {
        self.cache.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

/// hash(cascade-or-instructions + normalized input + model)
fn cache_key(source: &str, value: &Value, model: &str) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    source.hash(&mut hasher);
    normalize(value).hash(&mut hasher);
    model.hash(&mut hasher);
    hasher.finish()
}

/// Canonical JSON: object keys sorted recursively
fn normalize(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let inner = keys
                .iter()
                .map(|k| format!("{}:{}", k, normalize(&map[k.as_str()])))
                .collect::<Vec<_>>()
                .join(",");
            format!("{{{}}}", inner)
        }
        Value::Array(items) => {
            let inner = items.iter().map(normalize).collect::<Vec<_>>().join(",");
            format!("[{}]", inner)
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::client::mock::{MockLlmClient, MockReply};
    use crate::session::SessionStore;
    use echolog::{LogStore, MemoryStore};
    use std::sync::Arc;

    fn runtime(replies: Vec<MockReply>) -> (UdfRuntime, Arc<MemoryStore>, Arc<MockLlmClient>) {
        let log = Arc::new(MemoryStore::new());
        let sessions = SessionStore::new(log.clone() as Arc<dyn LogStore>);
        let llm = Arc::new(MockLlmClient::new(replies));
        let runner = CascadeRunner::new(llm.clone(), sessions);
        (UdfRuntime::new(runner), log, llm)
    }

    #[tokio::test]
    async fn test_rvbbit_executes_one_cell_cascade() {
        let (udf, log, _) = runtime(vec![MockReply::text("positive")]);
        let result = udf.rvbbit("Classify the sentiment", &serde_json::json!("love it")).await;
        assert_eq!(result, "positive");

        // A full session was produced, replayable
        let sessions = log.sessions().unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].cascade_id, "rvbbit-inline");
        assert!(sessions[0].parent_session_id.is_none());
    }

    #[tokio::test]
    async fn test_cache_hit_skips_model() {
        let (udf, _, llm) = runtime(vec![MockReply::text("cached answer"), MockReply::text("never used")]);
        let a = udf.rvbbit("Classify", &serde_json::json!("same input")).await;
        let b = udf.rvbbit("Classify", &serde_json::json!("same input")).await;
        assert_eq!(a, "cached answer");
        assert_eq!(b, "cached answer");
        assert_eq!(llm.call_count(), 1);
        assert_eq!(udf.cache_len(), 1);
    }

    #[tokio::test]
    async fn test_zero_ttl_disables_caching() {
        let (udf, _, llm) = runtime(vec![MockReply::text("first"), MockReply::text("second")]);
        let udf = udf.with_default_ttl(Some(Duration::ZERO));
        let a = udf.rvbbit("Classify", &serde_json::json!("x")).await;
        let b = udf.rvbbit("Classify", &serde_json::json!("x")).await;
        assert_eq!(a, "first");
        assert_eq!(b, "second");
        assert_eq!(llm.call_count(), 2);
        assert_eq!(udf.cache_len(), 0);
    }

    #[tokio::test]
    async fn test_ttl_expiry_causes_one_reexecution() {
        let (udf, _, llm) = runtime(vec![MockReply::text("v1"), MockReply::text("v2")]);
        let udf = udf.with_default_ttl(Some(Duration::from_millis(30)));
        assert_eq!(udf.rvbbit("C", &serde_json::json!("x")).await, "v1");
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(udf.rvbbit("C", &serde_json::json!("x")).await, "v2");
        // Fresh entry serves subsequent calls again
        assert_eq!(udf.rvbbit("C", &serde_json::json!("x")).await, "v2");
        assert_eq!(llm.call_count(), 2);
    }

    #[tokio::test]
    async fn test_failure_returns_error_scalar_uncached() {
        let (udf, _, llm) = runtime(vec![
            MockReply::failure("down"),
            MockReply::failure("down"),
            MockReply::failure("down"),
            MockReply::text("recovered"),
        ]);
        let a = udf.rvbbit("C", &serde_json::json!("x")).await;
        assert_eq!(a, ERROR_SCALAR);
        // The error was not cached; the next call re-executes and succeeds
        let b = udf.rvbbit("C", &serde_json::json!("x")).await;
        assert_eq!(b, "recovered");
        assert!(llm.call_count() >= 4);
    }

    #[tokio::test]
    async fn test_distinct_inputs_distinct_cache_keys() {
        let (udf, _, llm) = runtime(vec![MockReply::text("a"), MockReply::text("b")]);
        udf.rvbbit("C", &serde_json::json!("one")).await;
        udf.rvbbit("C", &serde_json::json!("two")).await;
        assert_eq!(llm.call_count(), 2);
        assert_eq!(udf.cache_len(), 2);
    }

    #[test]
    fn test_normalize_sorts_keys() {
        let a = serde_json::json!({"b": 1, "a": {"d": 2, "c": 3}});
        let b = serde_json::json!({"a": {"c": 3, "d": 2}, "b": 1});
        assert_eq!(normalize(&a), normalize(&b));
    }

    #[test]
    fn test_lru_eviction_bounded() {
        let mut cache = UdfCache::new(2);
        cache.insert(1, "a".into());
        cache.insert(2, "b".into());
        cache.insert(3, "c".into());
        assert_eq!(cache.len(), 2);
        assert!(cache.get(1, None).is_none());
        assert!(cache.get(3, None).is_some());
    }
}
