//! Aspect ratio lookups
//!
//! The resolver sits between the engine and a `MetadataSource` (IMDb in
//! production). It bounds every attempt with a timeout, retries a fixed
//! number of times, and caches the outcome per title for the life of the
//! process, found or not, so seeking around in the same film never triggers
//! another request. Failures never reach the caller: they come back as
//! `Lookup::NotFound`.

pub mod imdb;

use crate::aspect::AspectRatio;
use crate::config::MetadataConfig;
use crate::error::ResolveError;
use crate::title::{Title, TitleKey, TitleKind};
use async_trait::async_trait;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

pub use imdb::ImdbSource;

/// External lookup collaborator
#[async_trait]
pub trait MetadataSource: Send + Sync {
    /// `Ok(None)` means the source answered but has no ratio for the title
    async fn lookup(&self, title: &Title) -> Result<Option<AspectRatio>, ResolveError>;
}

/// Outcome of a resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    Found(AspectRatio),
    NotFound,
}

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    lookup: Lookup,
    at: Instant,
}

pub struct MetadataResolver {
    source: Arc<dyn MetadataSource>,
    cache: Mutex<HashMap<TitleKey, CacheEntry>>,
    enabled: bool,
    timeout: Duration,
    attempts: u32,
}

impl MetadataResolver {
    pub fn new(source: Arc<dyn MetadataSource>, config: &MetadataConfig) -> Self {
        Self {
            source,
            cache: Mutex::new(HashMap::new()),
            enabled: config.enabled,
            timeout: config.timeout(),
            attempts: config.attempts.max(1),
        }
    }

    fn cache(&self) -> MutexGuard<'_, HashMap<TitleKey, CacheEntry>> {
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Cached outcome, without querying
    pub fn cached(&self, key: &TitleKey) -> Option<Lookup> {
        self.cache().get(key).map(|entry| {
            debug!("Cache hit for {} ({:?} old)", key, entry.at.elapsed());
            entry.lookup
        })
    }

    /// Whether `resolve` would query the source for this title
    pub fn is_queryable(&self, title: &Title) -> bool {
        self.enabled && title.kind() == TitleKind::Movie
    }

    /// Resolve a title's ratio. Never fails and never blocks for longer than
    /// `attempts * timeout`.
    pub async fn resolve(&self, title: &Title) -> Lookup {
        if let Some(lookup) = self.cached(&title.key) {
            return lookup;
        }

        let lookup = if self.is_queryable(title) {
            self.query(title).await
        } else {
            debug!("Not querying metadata for {}", title.key);
            Lookup::NotFound
        };

        self.cache().insert(
            title.key.clone(),
            CacheEntry {
                lookup,
                at: Instant::now(),
            },
        );
        lookup
    }

    async fn query(&self, title: &Title) -> Lookup {
        for attempt in 1..=self.attempts {
            let result = tokio::time::timeout(self.timeout, self.source.lookup(title))
                .await
                .unwrap_or(Err(ResolveError::Timeout(self.timeout)));

            match result {
                Ok(Some(ratio)) if ratio.is_known() => {
                    info!("Metadata lookup for {}: {}", title, ratio);
                    return Lookup::Found(ratio);
                }
                Ok(_) => {
                    info!("Metadata lookup for {}: no aspect ratio listed", title);
                    return Lookup::NotFound;
                }
                Err(e) => {
                    warn!(
                        "Metadata lookup for {} attempt {}/{}: {}",
                        title, attempt, self.attempts, e
                    );
                }
            }
        }

        Lookup::NotFound
    }
}
