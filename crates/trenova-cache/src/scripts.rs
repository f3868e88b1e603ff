//! Server-side Lua scripts embedded at build time.
//!
//! Scripts live in `scripts/*.lua` and are addressed by file stem
//! (`incr_with_expiry`). The loader keeps `name -> sha` and `sha -> name`
//! maps; on a `NOSCRIPT` reply (server restarted, `SCRIPT FLUSH`) it reloads
//! that script and retries exactly once.

use std::collections::HashMap;

use async_trait::async_trait;
use include_dir::{Dir, include_dir};
use parking_lot::RwLock;

use crate::error::{CacheError, CacheResult};

static EMBEDDED: Dir<'_> = include_dir!("$CARGO_MANIFEST_DIR/scripts");

pub const INCR_WITH_EXPIRY: &str = "incr_with_expiry";

/// The two server calls the loader needs.
#[async_trait]
pub trait ScriptBackend: Send + Sync {
    /// `SCRIPT LOAD`; returns the script sha.
    async fn script_load(&self, source: &str) -> CacheResult<String>;

    /// `EVALSHA`; must map a `NOSCRIPT` reply to [`CacheError::NoScript`].
    async fn eval_sha(
        &self,
        sha: &str,
        keys: &[String],
        args: &[String],
    ) -> CacheResult<redis::Value>;
}

#[derive(Default)]
struct Hashes {
    by_name: HashMap<String, String>,
    by_sha: HashMap<String, String>,
}

pub struct ScriptLoader {
    sources: HashMap<String, &'static str>,
    hashes: RwLock<Hashes>,
    reload: tokio::sync::Mutex<()>,
}

impl Default for ScriptLoader {
    fn default() -> Self {
        Self::embedded()
    }
}

impl ScriptLoader {
    /// Loader over the scripts compiled into this crate.
    pub fn embedded() -> Self {
        let sources = EMBEDDED
            .files()
            .filter(|f| f.path().extension().is_some_and(|ext| ext == "lua"))
            .filter_map(|f| {
                let name = f.path().file_stem()?.to_str()?.to_string();
                Some((name, f.contents_utf8()?))
            });
        Self::with_sources(sources)
    }

    pub fn with_sources(sources: impl IntoIterator<Item = (String, &'static str)>) -> Self {
        Self {
            sources: sources.into_iter().collect(),
            hashes: RwLock::new(Hashes::default()),
            reload: tokio::sync::Mutex::new(()),
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.sources.keys().map(String::as_str)
    }

    pub fn sha(&self, name: &str) -> Option<String> {
        self.hashes.read().by_name.get(name).cloned()
    }

    pub fn name_for(&self, sha: &str) -> Option<String> {
        self.hashes.read().by_sha.get(sha).cloned()
    }

    /// Load every embedded script. Called once at startup.
    pub async fn load_all(&self, backend: &dyn ScriptBackend) -> CacheResult<()> {
        let _guard = self.reload.lock().await;
        for (name, source) in &self.sources {
            let sha = backend.script_load(source).await?;
            tracing::debug!(script = %name, sha = %sha, "loaded cache script");
            self.record(name, sha);
        }
        Ok(())
    }

    /// Run a script by name.
    pub async fn exec(
        &self,
        backend: &dyn ScriptBackend,
        name: &str,
        keys: &[String],
        args: &[String],
    ) -> CacheResult<redis::Value> {
        let sha = match self.sha(name) {
            Some(sha) => sha,
            None => self.reload(backend, name, None).await?,
        };

        match backend.eval_sha(&sha, keys, args).await {
            Err(CacheError::NoScript(_)) => {
                tracing::warn!(script = %name, "script missing on server, reloading");
                let sha = self.reload(backend, name, Some(&sha)).await?;
                backend.eval_sha(&sha, keys, args).await
            }
            other => other,
        }
    }

    /// Reloads `name` unless another task already replaced `stale`.
    async fn reload(
        &self,
        backend: &dyn ScriptBackend,
        name: &str,
        stale: Option<&str>,
    ) -> CacheResult<String> {
        let source = *self
            .sources
            .get(name)
            .ok_or_else(|| CacheError::UnknownScript(name.to_string()))?;

        let _guard = self.reload.lock().await;
        if let Some(current) = self.sha(name)
            && stale != Some(current.as_str())
        {
            return Ok(current);
        }

        let sha = backend.script_load(source).await?;
        self.record(name, sha.clone());
        Ok(sha)
    }

    fn record(&self, name: &str, sha: String) {
        let mut hashes = self.hashes.write();
        if let Some(old) = hashes.by_name.insert(name.to_string(), sha.clone()) {
            hashes.by_sha.remove(&old);
        }
        hashes.by_sha.insert(sha, name.to_string());
    }
}
