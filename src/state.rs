//! Shared state closed over by the built-in pipeline stages.

use std::sync::Arc;

use async_trait::async_trait;
use moka::future::Cache;

use crate::config::{ServerConfig, DATABASE_HEALTH_CACHE_TTL};
use crate::metrics::Metrics;
use crate::templates::ViewRenderer;

/// Version information reported by the readiness endpoint.
#[derive(Debug, Clone)]
pub struct BuildInfo {
    pub version: String,
    pub commit: String,
}

impl Default for BuildInfo {
    fn default() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            commit: option_env!("PORTICO_BUILD_COMMIT")
                .unwrap_or("unknown")
                .to_string(),
        }
    }
}

/// Failure reported by a [`HealthProbe`].
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct ProbeError(pub String);

/// Liveness check against the persistence layer.
#[async_trait]
pub trait HealthProbe: Send + Sync + 'static {
    async fn ping(&self) -> Result<(), ProbeError>;
}

/// Probe used when the embedding process has no persistence to check.
pub struct NoPersistence;

#[async_trait]
impl HealthProbe for NoPersistence {
    async fn ping(&self) -> Result<(), ProbeError> {
        Ok(())
    }
}

/// Immutable state shared by every in-flight request.
///
/// Cloning is cheap; all fields are reference counted.
#[derive(Clone)]
pub struct PipelineState {
    pub config: Arc<ServerConfig>,
    pub views: ViewRenderer,
    pub metrics: Metrics,
    pub build: Arc<BuildInfo>,
    /// True when serving https or h2
    pub tls: bool,
    probe: Arc<dyn HealthProbe>,
    database_health: Cache<(), bool>,
}

impl PipelineState {
    pub fn new(
        config: Arc<ServerConfig>,
        views: ViewRenderer,
        metrics: Metrics,
        build: BuildInfo,
        probe: Arc<dyn HealthProbe>,
        tls: bool,
    ) -> Self {
        let database_health = Cache::builder()
            .max_capacity(1)
            .time_to_live(DATABASE_HEALTH_CACHE_TTL)
            .build();

        Self {
            config,
            views,
            metrics,
            build: Arc::new(build),
            tls,
            probe,
            database_health,
        }
    }

    /// Whether persistence answered its last ping.
    ///
    /// Results are reused for a few seconds so probe storms do not reach the
    /// database.
    pub async fn database_healthy(&self) -> bool {
        let probe = self.probe.clone();
        self.database_health
            .get_with((), async move {
                match probe.ping().await {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::warn!(error = %e, "Database health probe failed");
                        false
                    }
                }
            })
            .await
    }
}
