use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use taskforge_core::{Agent, TaskforgeError, TaskforgeResult};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Health classification of a registered agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// The probe succeeded.
    Healthy,
    /// The agent exposes no probe; liveness is unknown but assumed.
    Limited,
    /// The probe failed.
    Unhealthy,
    /// Never probed.
    Unknown,
}

/// Per-agent workload counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentUtilization {
    /// Tasks dispatched to this agent.
    pub assigned: u64,
    /// Tasks that completed successfully.
    pub completed: u64,
    /// Tasks that failed terminally.
    pub failed: u64,
    /// Running average execution time in milliseconds.
    pub avg_duration_ms: f64,
    /// completed / (completed + failed); 1.0 while nothing has finished.
    pub success_rate: f64,
}

impl Default for AgentUtilization {
    fn default() -> Self {
        Self {
            assigned: 0,
            completed: 0,
            failed: 0,
            avg_duration_ms: 0.0,
            success_rate: 1.0,
        }
    }
}

impl AgentUtilization {
    fn record_finished(&mut self, duration_ms: u64, success: bool) {
        if success {
            self.completed += 1;
        } else {
            self.failed += 1;
        }
        let finished = (self.completed + self.failed) as f64;
        self.avg_duration_ms += (duration_ms as f64 - self.avg_duration_ms) / finished;
        self.success_rate = self.completed as f64 / finished;
    }

    /// Tasks assigned but not yet completed.
    pub fn load_factor(&self) -> i64 {
        self.assigned as i64 - self.completed as i64
    }
}

/// Health record of a registered agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentHealth {
    /// Last classification.
    pub status: HealthStatus,
    /// When the agent was last probed.
    pub last_checked: Option<DateTime<Utc>>,
    /// Probe wall-clock latency in milliseconds.
    pub response_time_ms: Option<u64>,
    /// Number of probe failures observed.
    pub error_count: u32,
}

impl Default for AgentHealth {
    fn default() -> Self {
        Self {
            status: HealthStatus::Unknown,
            last_checked: None,
            response_time_ms: None,
            error_count: 0,
        }
    }
}

/// Serializable registration record exposed by status queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStats {
    /// The capability name tasks target.
    pub capability: String,
    /// What the agent says it can do.
    pub declared_capabilities: Vec<String>,
    /// Workload counters.
    pub utilization: AgentUtilization,
    /// Health record.
    pub health: AgentHealth,
}

/// One row of the load-balancing advisory report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentLoad {
    /// The capability name.
    pub capability: String,
    /// assigned − completed.
    pub load_factor: i64,
    /// Running average execution time in milliseconds.
    pub avg_duration_ms: f64,
    /// Whether the average exceeds the bottleneck threshold.
    pub bottleneck: bool,
}

struct AgentEntry {
    handle: Arc<dyn Agent>,
    declared_capabilities: Vec<String>,
    utilization: AgentUtilization,
    health: AgentHealth,
}

/// Registry of agent capabilities with health probing and utilization stats.
///
/// Registration is idempotent: re-registering a capability replaces the
/// handle and preserves the accumulated statistics.
pub struct AgentRegistry {
    agents: RwLock<HashMap<String, AgentEntry>>,
}

impl AgentRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
        }
    }

    /// Register or replace the agent handle for a capability.
    pub async fn register(
        &self,
        capability: impl Into<String>,
        handle: Arc<dyn Agent>,
        declared_capabilities: Vec<String>,
    ) {
        let capability = capability.into();
        let mut agents = self.agents.write().await;
        match agents.get_mut(&capability) {
            Some(entry) => {
                // Replace the handle; stats survive re-registration.
                entry.handle = handle;
                entry.declared_capabilities = declared_capabilities;
                debug!(capability = %capability, "agent re-registered");
            }
            None => {
                agents.insert(
                    capability.clone(),
                    AgentEntry {
                        handle,
                        declared_capabilities,
                        utilization: AgentUtilization::default(),
                        health: AgentHealth::default(),
                    },
                );
                info!(capability = %capability, "agent registered");
            }
        }
    }

    /// Resolve the handle for a capability.
    pub async fn resolve(&self, capability: &str) -> Option<Arc<dyn Agent>> {
        let agents = self.agents.read().await;
        agents.get(capability).map(|entry| Arc::clone(&entry.handle))
    }

    /// Record a task dispatch against a capability.
    pub async fn record_assignment(&self, capability: &str) {
        let mut agents = self.agents.write().await;
        if let Some(entry) = agents.get_mut(capability) {
            entry.utilization.assigned += 1;
        }
    }

    /// Record a successful completion with its execution time.
    pub async fn record_completion(&self, capability: &str, duration_ms: u64) {
        let mut agents = self.agents.write().await;
        if let Some(entry) = agents.get_mut(capability) {
            entry.utilization.record_finished(duration_ms, true);
        }
    }

    /// Record a terminal failure with its execution time.
    pub async fn record_failure(&self, capability: &str, duration_ms: u64) {
        let mut agents = self.agents.write().await;
        if let Some(entry) = agents.get_mut(capability) {
            entry.utilization.record_finished(duration_ms, false);
        }
    }

    /// Probe an agent's health and update its record.
    ///
    /// Classification: `healthy` if the probe succeeded, `limited` if the
    /// agent exposes no probe, `unhealthy` if the probe failed.
    pub async fn check_health(&self, capability: &str) -> TaskforgeResult<AgentHealth> {
        let handle = self
            .resolve(capability)
            .await
            .ok_or_else(|| TaskforgeError::AgentNotRegistered(capability.to_string()))?;

        let start = Instant::now();
        let probe = handle.health_probe().await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        let mut agents = self.agents.write().await;
        let entry = agents
            .get_mut(capability)
            .ok_or_else(|| TaskforgeError::AgentNotRegistered(capability.to_string()))?;

        entry.health.last_checked = Some(Utc::now());
        entry.health.response_time_ms = Some(elapsed_ms);
        entry.health.status = match probe {
            Some(Ok(())) => HealthStatus::Healthy,
            None => HealthStatus::Limited,
            Some(Err(e)) => {
                entry.health.error_count += 1;
                debug!(capability = %capability, error = %e, "health probe failed");
                HealthStatus::Unhealthy
            }
        };

        Ok(entry.health.clone())
    }

    /// Weighted system efficiency in `[0, 1]`.
    ///
    /// `0.7 × global success + 0.3 × mean per-agent success rate` over agents
    /// with at least one assigned task.
    pub async fn system_efficiency(&self, global_completed: u64, global_failed: u64) -> f64 {
        let global_finished = global_completed + global_failed;
        let global_success = if global_finished == 0 {
            1.0
        } else {
            global_completed as f64 / global_finished as f64
        };

        let agents = self.agents.read().await;
        let active: Vec<f64> = agents
            .values()
            .filter(|entry| entry.utilization.assigned > 0)
            .map(|entry| entry.utilization.success_rate)
            .collect();
        let agent_success = if active.is_empty() {
            1.0
        } else {
            active.iter().sum::<f64>() / active.len() as f64
        };

        (0.7 * global_success + 0.3 * agent_success).clamp(0.0, 1.0)
    }

    /// Load-balancing advisory: per-agent load factor plus a bottleneck flag
    /// for agents whose average execution time exceeds the threshold.
    pub async fn load_report(&self, bottleneck_threshold_ms: u64) -> Vec<AgentLoad> {
        let agents = self.agents.read().await;
        let mut report: Vec<AgentLoad> = agents
            .iter()
            .map(|(capability, entry)| AgentLoad {
                capability: capability.clone(),
                load_factor: entry.utilization.load_factor(),
                avg_duration_ms: entry.utilization.avg_duration_ms,
                bottleneck: entry.utilization.avg_duration_ms > bottleneck_threshold_ms as f64,
            })
            .collect();
        report.sort_by(|a, b| a.capability.cmp(&b.capability));
        report
    }

    /// Snapshot of all registrations.
    pub async fn snapshot(&self) -> Vec<AgentStats> {
        let agents = self.agents.read().await;
        let mut stats: Vec<AgentStats> = agents
            .iter()
            .map(|(capability, entry)| AgentStats {
                capability: capability.clone(),
                declared_capabilities: entry.declared_capabilities.clone(),
                utilization: entry.utilization.clone(),
                health: entry.health.clone(),
            })
            .collect();
        stats.sort_by(|a, b| a.capability.cmp(&b.capability));
        stats
    }

    /// Number of registered capabilities.
    pub async fn len(&self) -> usize {
        self.agents.read().await.len()
    }

    /// Whether no agents are registered.
    pub async fn is_empty(&self) -> bool {
        self.agents.read().await.is_empty()
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}
