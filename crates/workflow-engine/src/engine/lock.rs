//! Cooperative named locks on top of the store.

use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use super::Engine;
use crate::error::{AppError, AppResult};
use crate::result_ext::ResultExt;

impl Engine {
    /// Run `fut` while holding the named lock `name`.
    ///
    /// Acquisition is retried `lock_retry_attempts` times; the lock is
    /// released on every exit path, including a panic inside `fut`.
    pub(crate) async fn with_named_lock<T, Fut>(&self, name: &str, fut: Fut) -> AppResult<T>
    where
        Fut: Future<Output = AppResult<T>>,
    {
        self.acquire_named_lock(name).await?;

        let outcome = AssertUnwindSafe(fut).catch_unwind().await;

        let _ = self
            .store
            .release_named_lock(name)
            .await
            .log(format!("release named lock '{}'", name));

        match outcome {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    async fn acquire_named_lock(&self, name: &str) -> AppResult<()> {
        let attempts = self.config.lock_retry_attempts.max(1);
        for attempt in 1..=attempts {
            if self.store.acquire_named_lock(name, self.config.lock_ttl()).await? {
                if attempt > 1 {
                    tracing::debug!(lock = %name, attempt, "Acquired named lock");
                }
                return Ok(());
            }
            if attempt < attempts {
                tokio::time::sleep(self.config.lock_retry_interval()).await;
            }
        }
        Err(AppError::LockHeld(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use crate::config::EngineConfig;
    use crate::engine::tests::test_engine_with_config;
    use crate::error::AppError;
    use std::time::Duration;

    #[tokio::test]
    async fn test_lock_released_after_error() {
        let (engine, _rx) = test_engine_with_config(EngineConfig::default());
        let result: Result<(), AppError> = engine
            .with_named_lock("l", async { Err(AppError::Internal("boom".to_string())) })
            .await;
        assert!(result.is_err());
        assert!(engine.store.acquire_named_lock("l", Duration::from_secs(5)).await.unwrap());
    }

    #[tokio::test]
    async fn test_held_lock_times_out() {
        let config = EngineConfig {
            lock_retry_attempts: 2,
            lock_retry_interval_ms: 1,
            ..EngineConfig::default()
        };
        let (engine, _rx) = test_engine_with_config(config);
        assert!(engine.store.acquire_named_lock("l", Duration::from_secs(60)).await.unwrap());

        let err = engine.with_named_lock("l", async { Ok(()) }).await.unwrap_err();
        assert!(matches!(err, AppError::LockHeld(name) if name == "l"));
    }

    #[tokio::test]
    async fn test_lock_released_after_panic() {
        let (engine, _rx) = test_engine_with_config(EngineConfig::default());
        let handle = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .with_named_lock("p", async {
                        if true {
                            panic!("inside lock");
                        }
                        Ok(())
                    })
                    .await
            })
        };
        assert!(handle.await.is_err());
        assert!(engine.store.acquire_named_lock("p", Duration::from_secs(5)).await.unwrap());
    }
}
