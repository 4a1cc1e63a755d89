//! Bang-command assets listed from object storage.

use crate::config::StorageConfig;
use crate::error::StorageError;
use crate::storage::ObjectStore;
use arc_swap::ArcSwapOption;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Command name to asset URLs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssetMap {
    /// `!name` for a file directly under the prefix.
    pub singles: BTreeMap<String, String>,
    /// `!name` for a directory under the prefix, URLs in listing order.
    pub dirs: BTreeMap<String, Vec<String>>,
}

impl AssetMap {
    /// URLs for a command. Single files win over directories of the same name.
    pub fn lookup(&self, name: &str) -> Vec<String> {
        let name = name.to_lowercase();
        if let Some(url) = self.singles.get(&name) {
            return vec![url.clone()];
        }
        self.dirs.get(&name).cloned().unwrap_or_default()
    }
}

fn extension_of(path: &str) -> Option<String> {
    let file_name = path.rsplit('/').next().unwrap_or(path);
    file_name
        .rsplit_once('.')
        .map(|(_, extension)| extension.to_lowercase())
}

/// Build the map from a raw key listing.
///
/// Directory markers are skipped, as are keys whose extension is not in
/// `extensions` when that list is non-empty.
pub fn build_asset_map(
    keys: &[String],
    prefix: &str,
    extensions: &[String],
    url_for: impl Fn(&str) -> String,
) -> AssetMap {
    let mut map = AssetMap::default();

    for key in keys {
        let Some(remainder) = key.strip_prefix(prefix) else {
            continue;
        };
        if remainder.is_empty() || remainder.ends_with('/') {
            continue;
        }
        if !extensions.is_empty()
            && !extension_of(remainder).is_some_and(|extension| extensions.contains(&extension))
        {
            continue;
        }

        let url = url_for(key);
        match remainder.split_once('/') {
            None => {
                let stem = remainder
                    .rsplit_once('.')
                    .map_or(remainder, |(stem, _)| stem);
                map.singles.insert(stem.to_lowercase(), url);
            }
            Some((directory, _)) => {
                map.dirs
                    .entry(directory.to_lowercase())
                    .or_default()
                    .push(url);
            }
        }
    }

    map
}

struct CachedAssets {
    map: Arc<AssetMap>,
    built_at: Instant,
}

/// Builds asset maps on demand, optionally caching them for a TTL.
pub struct AssetResolver {
    store: Arc<dyn ObjectStore>,
    prefix: String,
    version: Option<String>,
    extensions: Vec<String>,
    ttl: Duration,
    cache: ArcSwapOption<CachedAssets>,
}

impl AssetResolver {
    pub fn new(store: Arc<dyn ObjectStore>, config: &StorageConfig) -> Self {
        Self {
            store,
            prefix: config.asset_prefix.clone(),
            version: config.asset_version.clone(),
            extensions: config.asset_extensions.clone(),
            ttl: config.asset_cache_ttl,
            cache: ArcSwapOption::empty(),
        }
    }

    fn asset_url(&self, key: &str) -> String {
        let url = self.store.public_url(key);
        match &self.version {
            Some(version) => format!("{url}?v={version}"),
            None => url,
        }
    }

    /// The current asset map. Rebuilt from a fresh listing unless a cached
    /// copy younger than the TTL exists.
    pub async fn asset_map(&self) -> Result<Arc<AssetMap>, StorageError> {
        if !self.ttl.is_zero()
            && let Some(cached) = self.cache.load_full()
            && cached.built_at.elapsed() < self.ttl
        {
            return Ok(cached.map.clone());
        }

        let keys = self.store.list_keys(&self.prefix).await?;
        let map = Arc::new(build_asset_map(
            &keys,
            &self.prefix,
            &self.extensions,
            |key| self.asset_url(key),
        ));
        tracing::debug!(
            singles = map.singles.len(),
            dirs = map.dirs.len(),
            "built asset map"
        );

        if !self.ttl.is_zero() {
            self.cache.store(Some(Arc::new(CachedAssets {
                map: map.clone(),
                built_at: Instant::now(),
            })));
        }
        Ok(map)
    }

    /// Drop any cached map so the next lookup lists storage again.
    pub fn invalidate(&self) {
        self.cache.store(None);
    }

    pub async fn lookup(&self, name: &str) -> Result<Vec<String>, StorageError> {
        Ok(self.asset_map().await?.lookup(name))
    }
}
