use anyhow::Result;
use dashmap::DashMap;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use uuid::Uuid;

/// Bounded-concurrency gates around the external service calls.
///
/// `embedding` and `vision` are process-wide; LLM permits are keyed per user
/// so one heavy user cannot starve the others.
#[derive(Clone)]
pub struct Limiters {
    pub embedding: Arc<Semaphore>,
    pub vision: Arc<Semaphore>,
    llm_per_user: Arc<DashMap<Uuid, Arc<Semaphore>>>,
    llm_per_user_permits: usize,
    pub acquire_timeout: Duration,
}

impl Limiters {
    pub fn new(cfg: &crate::config::LimitsConfig) -> Self {
        Self {
            embedding: Arc::new(Semaphore::new(cfg.embedding_concurrency.max(1))),
            vision: Arc::new(Semaphore::new(cfg.vision_concurrency.max(1))),
            llm_per_user: Arc::new(DashMap::new()),
            llm_per_user_permits: cfg.llm_per_user_concurrency.max(1),
            acquire_timeout: Duration::from_millis(cfg.acquire_timeout_ms.max(1)),
        }
    }

    /// Semaphore gating LLM calls for one user (created on first use).
    pub fn llm_for_user(&self, user_id: Uuid) -> Arc<Semaphore> {
        self.llm_per_user
            .entry(user_id)
            .or_insert_with(|| Arc::new(Semaphore::new(self.llm_per_user_permits)))
            .clone()
    }

    pub async fn acquire_timed(
        sem: Arc<Semaphore>,
        acquire_timeout: Duration,
        op: &'static str,
    ) -> Result<(OwnedSemaphorePermit, Duration)> {
        let start = Instant::now();

        let permit = tokio::time::timeout(acquire_timeout, sem.acquire_owned())
            .await
            .map_err(|_| anyhow::anyhow!("Limiter acquire timeout for op={}", op))??;

        Ok((permit, start.elapsed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LimitsConfig;

    fn test_config() -> LimitsConfig {
        LimitsConfig {
            embedding_concurrency: 2,
            vision_concurrency: 5,
            llm_per_user_concurrency: 1,
            acquire_timeout_ms: 50,
            embedding_batch_size: 16,
            ingest_workers: 2,
        }
    }

    #[tokio::test]
    async fn acquire_succeeds_within_capacity() {
        let limiters = Limiters::new(&test_config());
        let (permit, wait) = Limiters::acquire_timed(
            limiters.embedding.clone(),
            limiters.acquire_timeout,
            "embedding",
        )
        .await
        .unwrap();
        assert!(wait < Duration::from_millis(50));
        drop(permit);
    }

    #[tokio::test]
    async fn acquire_times_out_when_exhausted() {
        let limiters = Limiters::new(&test_config());
        let user = Uuid::new_v4();
        let sem = limiters.llm_for_user(user);
        let _held = sem.clone().acquire_owned().await.unwrap();

        let result = Limiters::acquire_timed(sem, limiters.acquire_timeout, "llm").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn per_user_semaphores_are_independent(){
        let limiters = Limiters::new(&test_config());
        let a = limiters.llm_for_user(Uuid::new_v4());
        let b = limiters.llm_for_user(Uuid::new_v4());
        let _held = a.acquire_owned().await.unwrap();
        // Other user is unaffected
        let ok = Limiters::acquire_timed(b, Duration::from_millis(50), "llm").await;
        assert!(ok.is_ok());
    }
}
