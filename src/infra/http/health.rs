//! Health aggregation over the core's dependencies.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::infra::db::PostgresRepositories;
use crate::infra::eventlog::EventLog;
use crate::infra::substrate::Substrate;

const CHECK_TIMEOUT: Duration = Duration::from_secs(3);

/// One probed dependency.
#[async_trait]
pub trait DependencyCheck: Send + Sync {
    fn name(&self) -> &'static str;
    async fn check(&self) -> Result<(), String>;
}

#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HealthReport {
    /// `healthy` when every dependency answers, `degraded` otherwise.
    pub status: &'static str,
    pub checks: BTreeMap<&'static str, CheckResult>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

/// The set of dependency probes behind `/health`.
#[derive(Default)]
pub struct HealthRegistry {
    checks: Vec<Arc<dyn DependencyCheck>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, check: Arc<dyn DependencyCheck>) -> Self {
        self.checks.push(check);
        self
    }

    /// Probe every dependency with a bounded timeout each.
    pub async fn report(&self) -> HealthReport {
        let mut checks = BTreeMap::new();
        let mut all_healthy = true;

        for check in &self.checks {
            let outcome = tokio::time::timeout(CHECK_TIMEOUT, check.check()).await;
            let result = match outcome {
                Ok(Ok(())) => CheckResult {
                    healthy: true,
                    error: None,
                },
                Ok(Err(err)) => {
                    all_healthy = false;
                    CheckResult {
                        healthy: false,
                        error: Some(err),
                    }
                }
                Err(_) => {
                    all_healthy = false;
                    CheckResult {
                        healthy: false,
                        error: Some("health check timed out".to_string()),
                    }
                }
            };
            checks.insert(check.name(), result);
        }

        HealthReport {
            status: if all_healthy { "healthy" } else { "degraded" },
            checks,
        }
    }
}

pub struct DatabaseCheck(pub Arc<PostgresRepositories>);

#[async_trait]
impl DependencyCheck for DatabaseCheck {
    fn name(&self) -> &'static str {
        "database"
    }

    async fn check(&self) -> Result<(), String> {
        self.0.health_check().await.map_err(|err| err.to_string())
    }
}

pub struct SubstrateCheck(pub Arc<dyn Substrate>);

#[async_trait]
impl DependencyCheck for SubstrateCheck {
    fn name(&self) -> &'static str {
        "substrate"
    }

    async fn check(&self) -> Result<(), String> {
        self.0.ping().await.map_err(|err| err.to_string())
    }
}

pub struct EventLogCheck(pub Arc<dyn EventLog>);

#[async_trait]
impl DependencyCheck for EventLogCheck {
    fn name(&self) -> &'static str {
        "event_log"
    }

    async fn check(&self) -> Result<(), String> {
        self.0.ping().await.map_err(|err| err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use crate::infra::eventlog::MemoryEventLog;
    use crate::infra::substrate::MemorySubstrate;

    use super::*;

    struct FailingCheck;

    #[async_trait]
    impl DependencyCheck for FailingCheck {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn check(&self) -> Result<(), String> {
            Err("down".to_string())
        }
    }

    #[tokio::test]
    async fn healthy_when_all_pass() {
        let registry = HealthRegistry::new()
            .register(Arc::new(SubstrateCheck(Arc::new(MemorySubstrate::new()))))
            .register(Arc::new(EventLogCheck(Arc::new(MemoryEventLog::new()))));

        let report = registry.report().await;
        assert!(report.is_healthy());
        assert_eq!(report.checks.len(), 2);
    }

    #[tokio::test]
    async fn degraded_when_any_fails() {
        let registry = HealthRegistry::new()
            .register(Arc::new(SubstrateCheck(Arc::new(MemorySubstrate::new()))))
            .register(Arc::new(FailingCheck));

        let report = registry.report().await;
        assert_eq!(report.status, "degraded");
        assert!(!report.checks["failing"].healthy);
        assert_eq!(report.checks["failing"].error.as_deref(), Some("down"));
    }
}
