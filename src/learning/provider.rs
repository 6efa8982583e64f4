//! Pattern sets consumed by the refiner, and the providers that supply them.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::debug;

use super::pattern::PatternKind;
use crate::error::LearningError;
use crate::store::{Database, LearnedPattern};

/// Active learned exceptions, grouped by kind.
#[derive(Debug, Clone, Default)]
pub struct PatternSet {
    by_kind: HashMap<PatternKind, Vec<String>>,
}

impl PatternSet {
    /// Build from stored patterns, keeping active ones of known kinds.
    pub fn from_patterns(patterns: impl IntoIterator<Item = LearnedPattern>) -> Self {
        let mut set = Self::default();
        for p in patterns.into_iter().filter(|p| p.is_active) {
            if let Some(kind) = PatternKind::parse(&p.pattern_type) {
                set.insert(kind, p.value);
            }
        }
        set
    }

    pub fn insert(&mut self, kind: PatternKind, value: impl Into<String>) {
        let value = value.into();
        let values = self.by_kind.entry(kind).or_default();
        if !values.contains(&value) {
            values.push(value);
        }
    }

    pub fn values(&self, kind: PatternKind) -> &[String] {
        self.by_kind.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_active(&self, kind: PatternKind) -> bool {
        !self.values(kind).is_empty()
    }

    /// Exact match.
    pub fn contains(&self, kind: PatternKind, value: &str) -> bool {
        self.values(kind).iter().any(|v| v == value)
    }

    /// Case-insensitive lookup returning the stored spelling.
    pub fn lookup(&self, kind: PatternKind, value: &str) -> Option<&str> {
        let lower = value.to_lowercase();
        self.values(kind)
            .iter()
            .find(|v| v.to_lowercase() == lower)
            .map(String::as_str)
    }
}

/// Source of the active pattern set.
#[async_trait]
pub trait PatternProvider: Send + Sync {
    async fn patterns(&self) -> Result<Arc<PatternSet>, LearningError>;

    /// Drop any cached set so the next read sees current patterns.
    fn invalidate(&self);
}

/// Reads patterns from the database, caching the set for `ttl`.
pub struct CachedPatternProvider {
    db: Arc<dyn Database>,
    ttl: Duration,
    cached: RwLock<Option<(Instant, Arc<PatternSet>)>>,
}

impl CachedPatternProvider {
    pub fn new(db: Arc<dyn Database>, ttl: Duration) -> Self {
        Self {
            db,
            ttl,
            cached: RwLock::new(None),
        }
    }

    fn fresh(&self) -> Option<Arc<PatternSet>> {
        let guard = self.cached.read().ok()?;
        guard
            .as_ref()
            .filter(|(loaded, _)| loaded.elapsed() < self.ttl)
            .map(|(_, set)| Arc::clone(set))
    }
}

#[async_trait]
impl PatternProvider for CachedPatternProvider {
    async fn patterns(&self) -> Result<Arc<PatternSet>, LearningError> {
        if let Some(set) = self.fresh() {
            return Ok(set);
        }
        let set = Arc::new(PatternSet::from_patterns(
            self.db.list_patterns(None).await?,
        ));
        debug!("Loaded learned pattern set");
        if let Ok(mut guard) = self.cached.write() {
            *guard = Some((Instant::now(), Arc::clone(&set)));
        }
        Ok(set)
    }

    fn invalidate(&self) {
        if let Ok(mut guard) = self.cached.write() {
            *guard = None;
        }
    }
}

/// Fixed, settable pattern set.
#[derive(Default)]
pub struct StaticPatternProvider {
    set: RwLock<Arc<PatternSet>>,
}

impl StaticPatternProvider {
    pub fn new(set: PatternSet) -> Self {
        Self {
            set: RwLock::new(Arc::new(set)),
        }
    }

    pub fn replace(&self, set: PatternSet) {
        if let Ok(mut guard) = self.set.write() {
            *guard = Arc::new(set);
        }
    }
}

#[async_trait]
impl PatternProvider for StaticPatternProvider {
    async fn patterns(&self) -> Result<Arc<PatternSet>, LearningError> {
        Ok(self
            .set
            .read()
            .map(|guard| Arc::clone(&*guard))
            .unwrap_or_default())
    }

    fn invalidate(&self) {}
}

/// Provider used when learning is disabled.
pub struct NoopPatternProvider;

#[async_trait]
impl PatternProvider for NoopPatternProvider {
    async fn patterns(&self) -> Result<Arc<PatternSet>, LearningError> {
        Ok(Arc::default())
    }

    fn invalidate(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LibSqlBackend;

    #[test]
    fn set_keeps_only_active_known_patterns() {
        let now = chrono::Utc::now();
        let pattern = |t: &str, v: &str, active: bool| LearnedPattern {
            pattern_type: t.into(),
            value: v.into(),
            success_count: 0,
            failure_count: 1,
            is_active: active,
            last_updated: now,
        };
        let set = PatternSet::from_patterns([
            pattern("proper_noun", "iPhone", true),
            pattern("ignore_cap", "ebay", false),
            pattern("mystery", "x", true),
        ]);
        assert_eq!(set.lookup(PatternKind::ProperNoun, "IPHONE"), Some("iPhone"));
        assert!(!set.is_active(PatternKind::IgnoreCap));
        assert!(set.contains(PatternKind::ProperNoun, "iPhone"));
        assert!(!set.contains(PatternKind::ProperNoun, "iphone"));
    }

    #[tokio::test]
    async fn cache_serves_stale_set_until_invalidated() {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let provider = CachedPatternProvider::new(db.clone(), Duration::from_secs(3600));

        assert!(!provider.patterns().await.unwrap().is_active(PatternKind::IgnoreCap));
        db.record_pattern_failure("ignore_cap", "ebay").await.unwrap();
        assert!(!provider.patterns().await.unwrap().is_active(PatternKind::IgnoreCap));

        provider.invalidate();
        assert!(provider
            .patterns()
            .await
            .unwrap()
            .contains(PatternKind::IgnoreCap, "ebay"));
    }

    #[tokio::test]
    async fn zero_ttl_always_reloads() {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let provider = CachedPatternProvider::new(db.clone(), Duration::ZERO);
        provider.patterns().await.unwrap();
        db.record_pattern_failure("proper_noun", "London").await.unwrap();
        assert!(provider.patterns().await.unwrap().is_active(PatternKind::ProperNoun));
    }

    #[tokio::test]
    async fn static_provider_is_replaceable() {
        let provider = StaticPatternProvider::default();
        let mut set = PatternSet::default();
        set.insert(PatternKind::AllowHtmlStyle, "style");
        provider.replace(set);
        assert!(provider.patterns().await.unwrap().is_active(PatternKind::AllowHtmlStyle));
        assert!(!NoopPatternProvider.patterns().await.unwrap().is_active(PatternKind::AllowHtmlStyle));
    }
}
