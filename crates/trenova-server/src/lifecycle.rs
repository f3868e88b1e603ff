//! Startup/shutdown registry for process-wide components.
//!
//! `OnStart` hooks run in parallel, each under a deadline. `OnStop` hooks
//! run in reverse registration order, then `OnAfterStop` hooks, also in
//! reverse.

use std::future::Future;
use std::time::Duration;

use anyhow::anyhow;
use futures_util::future::{BoxFuture, join_all};

type HookFn = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

pub const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(30);

pub struct Hook {
    name: String,
    on_start: Option<HookFn>,
    on_stop: Option<HookFn>,
    on_after_stop: Option<HookFn>,
}

impl Hook {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            on_start: None,
            on_stop: None,
            on_after_stop: None,
        }
    }

    pub fn on_start<F, Fut>(mut self, f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.on_start = Some(Box::new(move || Box::pin(f())));
        self
    }

    pub fn on_stop<F, Fut>(mut self, f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.on_stop = Some(Box::new(move || Box::pin(f())));
        self
    }

    pub fn on_after_stop<F, Fut>(mut self, f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.on_after_stop = Some(Box::new(move || Box::pin(f())));
        self
    }
}

pub struct Lifecycle {
    hooks: Vec<Hook>,
    start_timeout: Duration,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            hooks: Vec::new(),
            start_timeout: DEFAULT_START_TIMEOUT,
        }
    }

    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }

    pub fn append(&mut self, hook: Hook) {
        self.hooks.push(hook);
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Runs every `OnStart` hook concurrently. Fails with the first error
    /// in registration order once all hooks have finished or timed out.
    pub async fn start(&mut self) -> anyhow::Result<()> {
        let timeout = self.start_timeout;
        let pending = self.hooks.iter_mut().filter_map(|hook| {
            let name = hook.name.clone();
            hook.on_start.take().map(|f| async move {
                let result = match tokio::time::timeout(timeout, f()).await {
                    Ok(result) => result,
                    Err(_) => Err(anyhow!("timed out after {timeout:?}")),
                };
                (name, result)
            })
        });

        let mut first_error = None;
        for (name, result) in join_all(pending).await {
            match result {
                Ok(()) => tracing::info!(hook = %name, "started"),
                Err(e) => {
                    tracing::error!(hook = %name, error = %e, "start hook failed");
                    first_error.get_or_insert(e.context(format!("starting {name}")));
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Runs stop hooks. Errors are logged and do not interrupt the sequence.
    pub async fn stop(&mut self) {
        for hook in self.hooks.iter_mut().rev() {
            if let Some(f) = hook.on_stop.take()
                && let Err(e) = f().await
            {
                tracing::error!(hook = %hook.name, error = %e, "stop hook failed");
            }
        }
        for hook in self.hooks.iter_mut().rev() {
            if let Some(f) = hook.on_after_stop.take()
                && let Err(e) = f().await
            {
                tracing::error!(hook = %hook.name, error = %e, "after-stop hook failed");
            }
        }
        tracing::info!(hooks = self.hooks.len(), "lifecycle stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Instant;

    #[tokio::test]
    async fn start_hooks_run_concurrently() {
        let mut lifecycle = Lifecycle::new();
        for i in 0..3 {
            lifecycle.append(Hook::new(format!("sleeper-{i}")).on_start(|| async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(())
            }));
        }
        let started = Instant::now();
        lifecycle.start().await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(550));
    }

    #[tokio::test]
    async fn slow_start_hook_times_out() {
        let mut lifecycle = Lifecycle::new().with_start_timeout(Duration::from_millis(50));
        lifecycle.append(Hook::new("fast").on_start(|| async { Ok(()) }));
        lifecycle.append(Hook::new("stuck").on_start(|| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        }));
        let err = lifecycle.start().await.unwrap_err();
        assert!(format!("{err:#}").contains("stuck"));
    }

    #[tokio::test]
    async fn stop_hooks_run_in_reverse() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut lifecycle = Lifecycle::new();
        for name in ["cache", "hub"] {
            let stop = order.clone();
            let after = order.clone();
            lifecycle.append(
                Hook::new(name)
                    .on_stop(move || async move {
                        stop.lock().push(format!("stop:{name}"));
                        Ok(())
                    })
                    .on_after_stop(move || async move {
                        after.lock().push(format!("after:{name}"));
                        Ok(())
                    }),
            );
        }
        lifecycle.stop().await;
        assert_eq!(
            *order.lock(),
            vec!["stop:hub", "stop:cache", "after:hub", "after:cache"]
        );
    }

    #[tokio::test]
    async fn failing_stop_hook_does_not_abort() {
        let ran = Arc::new(Mutex::new(false));
        let flag = ran.clone();
        let mut lifecycle = Lifecycle::new();
        lifecycle.append(Hook::new("last").on_stop(move || async move {
            *flag.lock() = true;
            Ok(())
        }));
        lifecycle.append(Hook::new("broken").on_stop(|| async { Err(anyhow!("boom")) }));
        lifecycle.stop().await;
        assert!(*ran.lock());
    }
}
