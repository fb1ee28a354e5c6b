use crate::env;
use crate::gateway::cache::{
    CacheStats, CompactionReport, FileCacheStore, PersistentCacheStore, ResponseCache,
};
use crate::gateway::credential_pool::{CredentialPool, CredentialSlot, Subscription};
use crate::gateway::error_recovery::{ErrorStatistics, RetryPolicy};
use crate::gateway::orchestrator::InvocationOrchestrator;
use crate::gateway::segmenter::{ReassembledOutput, ReassemblyPolicy, Segmenter};
use crate::gateway::throttle::{ConcurrencyThrottle, ThrottleStatus};
use crate::gateway::types::{GatewayConfig, GatewayError, PoolStatus, RetryMode, Task, TaskId};
use crate::gateway::usage_store::{JsonFileUsageStore, UsageStore};
use crate::provider::{GenerationOutput, GenerationProvider};
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Caller-facing entry point owning the pool, cache, throttle and orchestrator.
///
/// Build it with [`GenerationGateway::init`], share it behind an `Arc`, and call
/// [`GenerationGateway::shutdown`] before dropping it so pending cache writes and
/// the usage snapshot reach their stores.
pub struct GenerationGateway {
    config: GatewayConfig,
    provider: Arc<dyn GenerationProvider>,
    pool: Arc<CredentialPool>,
    cache: Arc<ResponseCache>,
    throttle: Arc<ConcurrencyThrottle>,
    orchestrator: Arc<InvocationOrchestrator>,
    segmenter: Segmenter,
    compaction_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl GenerationGateway {
    /// Initialize with file-backed stores under the configured data directory
    pub async fn init(
        config: GatewayConfig,
        provider: Arc<dyn GenerationProvider>,
    ) -> Result<Self, GatewayError> {
        let data_dir = config.data_dir.clone().unwrap_or_else(env::default_data_dir);
        debug!("Using data directory {}", data_dir.display());

        let usage_store: Option<Arc<dyn UsageStore>> = if config.pool.persist_usage {
            Some(Arc::new(JsonFileUsageStore::new(env::usage_file_path(&data_dir))))
        } else {
            None
        };

        let cache_store: Option<Arc<dyn PersistentCacheStore>> = if config.cache.persistent {
            match FileCacheStore::open(env::cache_dir_path(&data_dir)).await {
                Ok(store) => Some(Arc::new(store)),
                Err(e) => {
                    warn!("Persistent cache unavailable, using memory only: {}", e);
                    None
                }
            }
        } else {
            None
        };

        Self::init_with_stores(config, provider, usage_store, cache_store).await
    }

    /// Initialize with caller-supplied stores
    pub async fn init_with_stores(
        config: GatewayConfig,
        provider: Arc<dyn GenerationProvider>,
        usage_store: Option<Arc<dyn UsageStore>>,
        cache_store: Option<Arc<dyn PersistentCacheStore>>,
    ) -> Result<Self, GatewayError> {
        let pool = CredentialPool::new(config.pool.clone(), usage_store)
            .await
            .map_err(|e| GatewayError::Configuration(e.to_string()))?;
        let pool = Arc::new(pool);
        let cache = Arc::new(ResponseCache::new(config.cache.clone(), cache_store));
        let throttle = Arc::new(ConcurrencyThrottle::new(config.throttle.clone()));
        let orchestrator = Arc::new(InvocationOrchestrator::new(
            Arc::clone(&provider),
            Arc::clone(&pool),
            Arc::clone(&cache),
            Arc::clone(&throttle),
            RetryPolicy::new(config.retry.clone()),
        ));
        let segmenter = Segmenter::new(
            Arc::clone(&orchestrator),
            config.segment.clone(),
            throttle.max_in_flight(),
        );

        let compaction_task = tokio::spawn(compaction_loop(
            Arc::clone(&cache),
            config.cache.compaction_interval,
        ));

        info!(
            "Generation gateway ready with provider {} and {} credential(s)",
            provider.provider_name(),
            pool.status().await.total_slots
        );

        Ok(Self {
            config,
            provider,
            pool,
            cache,
            throttle,
            orchestrator,
            segmenter,
            compaction_task: std::sync::Mutex::new(Some(compaction_task)),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    fn ensure_running(&self) -> Result<(), GatewayError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(GatewayError::ShuttingDown);
        }
        Ok(())
    }

    fn is_oversized(&self, task: &Task) -> bool {
        task.payload.content.chars().count() > self.config.segment.threshold
    }

    /// Submit one task with the configured retry mode
    pub async fn submit(&self, task: Task) -> Result<GenerationOutput, GatewayError> {
        self.submit_with_mode(task, self.config.retry.mode).await
    }

    /// Submit one task; oversized content is segmented and must fully succeed
    pub async fn submit_with_mode(
        &self,
        task: Task,
        mode: RetryMode,
    ) -> Result<GenerationOutput, GatewayError> {
        self.ensure_running()?;
        if self.is_oversized(&task) {
            return self
                .segmenter
                .run(&task, mode, ReassemblyPolicy::RequireAll)
                .await
                .map(|reassembled| reassembled.output);
        }
        self.orchestrator.invoke(&task, mode).await
    }

    /// Submit one task through the segmenter with an explicit reassembly policy
    pub async fn submit_segmented(
        &self,
        task: Task,
        policy: ReassemblyPolicy,
    ) -> Result<ReassembledOutput, GatewayError> {
        self.ensure_running()?;
        self.segmenter
            .run(&task, self.config.retry.mode, policy)
            .await
    }

    /// Run a batch with bounded parallelism.
    ///
    /// Tasks start in priority order (lower first, unprioritized last). Results are
    /// keyed by task id; failed tasks map to `None`. `on_progress` receives
    /// `(completed, total, task_id)` after each task finishes.
    pub async fn submit_batch<F>(
        &self,
        tasks: Vec<Task>,
        mut on_progress: F,
    ) -> HashMap<TaskId, Option<GenerationOutput>>
    where
        F: FnMut(usize, usize, &str),
    {
        let total = tasks.len();
        let mut tasks = tasks;
        tasks.sort_by_key(|task| task.priority.unwrap_or(u32::MAX));

        let mut results = HashMap::with_capacity(total);
        let mut completed = 0;
        let mut finished = stream::iter(tasks)
            .map(|task| async move {
                let id = task.id.clone();
                let result = self.submit(task).await;
                (id, result)
            })
            .buffer_unordered(self.throttle.max_in_flight());

        while let Some((id, result)) = finished.next().await {
            completed += 1;
            let output = match result {
                Ok(output) => Some(output),
                Err(e) => {
                    warn!("Batch task {} failed: {}", id, e);
                    None
                }
            };
            on_progress(completed, total, &id);
            if results.insert(id.clone(), output).is_some() {
                warn!("Duplicate task id {} in batch, keeping the last result", id);
            }
        }

        info!(
            "Batch finished: {} of {} tasks succeeded",
            results.values().filter(|r| r.is_some()).count(),
            total
        );
        results
    }

    pub async fn status(&self) -> PoolStatus {
        self.pool.status().await
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&PoolStatus) + Send + Sync + 'static,
    {
        self.pool.subscribe(listener)
    }

    pub fn watch_status(&self) -> watch::Receiver<PoolStatus> {
        self.pool.watch_status()
    }

    /// Returns false when the secret is malformed or already present
    pub async fn add_credential(&self, secret: &str) -> bool {
        match self.pool.add_credential(secret).await {
            Ok(_) => true,
            Err(e) => {
                warn!("Credential not added: {}", e);
                false
            }
        }
    }

    pub async fn remove_credential(&self, id: &str) -> bool {
        self.pool.remove_credential(id).await
    }

    pub async fn reset_usage(&self) {
        self.pool.reset_usage().await
    }

    pub async fn credentials(&self) -> Vec<CredentialSlot> {
        self.pool.slots().await
    }

    pub async fn throttle_status(&self) -> ThrottleStatus {
        self.throttle.get_status().await
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.cache.stats().await
    }

    pub async fn compact_cache(&self) -> Result<CompactionReport, GatewayError> {
        self.cache
            .compact()
            .await
            .map_err(|e| GatewayError::Storage(format!("cache compaction failed: {}", e)))
    }

    pub async fn error_statistics(&self) -> ErrorStatistics {
        self.orchestrator.statistics().await
    }

    /// Stop accepting work, flush cache writes and persist credential usage
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down generation gateway");

        self.throttle.close();
        let task = self.compaction_task.lock().ok().and_then(|mut task| task.take());
        if let Some(task) = task {
            task.abort();
        }

        self.cache.flush().await;
        self.pool.shutdown().await;
        if let Err(e) = self.provider.shutdown().await {
            warn!("Provider shutdown failed: {}", e);
        }
    }
}

impl std::fmt::Debug for GenerationGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationGateway")
            .field("provider", &self.provider.provider_name())
            .field("pool", &self.pool)
            .field("cache", &self.cache)
            .field("shut_down", &self.shut_down.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

async fn compaction_loop(cache: Arc<ResponseCache>, interval: Duration) {
    // The first tick fires immediately, so compaction also runs at startup
    let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        match cache.compact().await {
            Ok(report) => debug!("Cache compaction finished: {:?}", report),
            Err(e) => warn!("Cache compaction failed: {}", e),
        }
    }
}
