//! Signal-driven workflow triggers
//!
//! Workflows declaring `triggers: [{ type: signal, name }]` start a fresh
//! execution whenever an application signal with that name is processed.

use crate::definition::{TriggerConfig, WorkflowConfig};
use crate::scheduling::WorkflowLauncher;
use crate::Result;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info};
use weft_core::Payload;

/// Signal trigger manager
pub struct TriggerManager {
    launcher: Arc<dyn WorkflowLauncher>,
    /// Signal name -> workflow IDs, ordered for deterministic start order
    triggers: RwLock<HashMap<String, BTreeSet<String>>>,
    disabled: RwLock<BTreeSet<String>>,
}

impl TriggerManager {
    pub fn new(launcher: Arc<dyn WorkflowLauncher>) -> Self {
        Self {
            launcher,
            triggers: RwLock::new(HashMap::new()),
            disabled: RwLock::new(BTreeSet::new()),
        }
    }

    /// Index the triggers declared by a workflow
    pub async fn register_workflow(&self, workflow: &WorkflowConfig) -> usize {
        let mut triggers = self.triggers.write().await;
        let mut added = 0;
        for trigger in &workflow.triggers {
            match trigger {
                TriggerConfig::Signal { name } => {
                    if triggers
                        .entry(name.clone())
                        .or_default()
                        .insert(workflow.id.clone())
                    {
                        added += 1;
                        info!(
                            workflow_id = %workflow.id,
                            signal = %name,
                            "Registered signal trigger"
                        );
                    }
                }
            }
        }
        added
    }

    /// Drop every trigger pointing at a workflow
    pub async fn unregister_workflow(&self, workflow_id: &str) {
        let mut triggers = self.triggers.write().await;
        for workflows in triggers.values_mut() {
            workflows.remove(workflow_id);
        }
        triggers.retain(|_, workflows| !workflows.is_empty());
    }

    /// Stop a workflow from being started by triggers
    pub async fn disable(&self, workflow_id: &str) {
        self.disabled.write().await.insert(workflow_id.to_string());
        info!(workflow_id = %workflow_id, "Disabled triggers");
    }

    pub async fn enable(&self, workflow_id: &str) {
        self.disabled.write().await.remove(workflow_id);
        info!(workflow_id = %workflow_id, "Enabled triggers");
    }

    /// Enabled workflows triggered by a signal name
    pub async fn triggers_for(&self, name: &str) -> Vec<String> {
        let triggers = self.triggers.read().await;
        let disabled = self.disabled.read().await;
        triggers
            .get(name)
            .map(|workflows| {
                workflows
                    .iter()
                    .filter(|id| !disabled.contains(*id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Start one execution per matching workflow; returns the started
    /// execution IDs. A failed start is logged and does not stop the rest.
    pub async fn process_signal(&self, name: &str, payload: &Payload) -> Result<Vec<String>> {
        let workflows = self.triggers_for(name).await;
        debug!(signal = %name, matches = workflows.len(), "Processing signal triggers");

        let mut started = Vec::with_capacity(workflows.len());
        for workflow_id in workflows {
            match self.launcher.launch(&workflow_id, payload.clone()).await {
                Ok(exec_id) => {
                    info!(
                        signal = %name,
                        workflow_id = %workflow_id,
                        workflow_exec_id = %exec_id,
                        "Triggered workflow"
                    );
                    started.push(exec_id);
                }
                Err(e) => {
                    error!(
                        signal = %name,
                        workflow_id = %workflow_id,
                        error = %e,
                        "Failed to start triggered workflow"
                    );
                }
            }
        }

        Ok(started)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WorkflowError;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingLauncher {
        launched: Mutex<Vec<(String, Payload)>>,
    }

    #[async_trait]
    impl WorkflowLauncher for RecordingLauncher {
        async fn launch(&self, workflow_id: &str, input: Payload) -> Result<String> {
            if workflow_id == "broken" {
                return Err(WorkflowError::NotFound(workflow_id.to_string()));
            }
            let mut launched = self.launched.lock().unwrap();
            launched.push((workflow_id.to_string(), input));
            Ok(format!("{}-run-{}", workflow_id, launched.len()))
        }

        async fn is_unfinished(&self, _workflow_exec_id: &str) -> Result<bool> {
            Ok(false)
        }
    }

    fn triggered(id: &str, signal: &str) -> WorkflowConfig {
        WorkflowConfig::new(id).with_trigger(TriggerConfig::Signal { name: signal.into() })
    }

    #[tokio::test]
    async fn test_signal_starts_matching_workflows() {
        let launcher = Arc::new(RecordingLauncher::default());
        let manager = TriggerManager::new(launcher.clone());
        manager.register_workflow(&triggered("billing", "order-placed")).await;
        manager.register_workflow(&triggered("shipping", "order-placed")).await;
        manager.register_workflow(&triggered("audit", "refund")).await;

        let mut payload = Payload::new();
        payload.insert("order".into(), serde_json::json!(42));
        let started = manager.process_signal("order-placed", &payload).await.unwrap();

        assert_eq!(started.len(), 2);
        let launched = launcher.launched.lock().unwrap();
        let ids: Vec<_> = launched.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["billing", "shipping"]);
        assert_eq!(launched[0].1["order"], 42);
    }

    #[tokio::test]
    async fn test_failed_start_does_not_block_others() {
        let launcher = Arc::new(RecordingLauncher::default());
        let manager = TriggerManager::new(launcher.clone());
        manager.register_workflow(&triggered("broken", "tick")).await;
        manager.register_workflow(&triggered("healthy", "tick")).await;

        let started = manager.process_signal("tick", &Payload::new()).await.unwrap();
        assert_eq!(started, vec!["healthy-run-1".to_string()]);
    }

    #[tokio::test]
    async fn test_disabled_and_unknown_signals() {
        let launcher = Arc::new(RecordingLauncher::default());
        let manager = TriggerManager::new(launcher.clone());
        manager.register_workflow(&triggered("nightly", "tick")).await;
        manager.disable("nightly").await;

        assert!(manager.process_signal("tick", &Payload::new()).await.unwrap().is_empty());
        assert!(manager.process_signal("nope", &Payload::new()).await.unwrap().is_empty());

        manager.enable("nightly").await;
        assert_eq!(manager.triggers_for("tick").await, vec!["nightly".to_string()]);

        manager.unregister_workflow("nightly").await;
        assert!(manager.triggers_for("tick").await.is_empty());
    }
}
