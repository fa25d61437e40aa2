use crate::types::{Task, Workflow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use taskforge_core::{TaskforgeError, TaskforgeResult};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Durable snapshot of a workflow's task states.
///
/// Self-describing: carries the full task list plus the explicit completed
/// and failed id sets that recovery reconciles against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    /// The workflow this snapshot belongs to.
    pub workflow_id: Uuid,
    /// Workflow name at snapshot time.
    pub name: String,
    /// Workflow description at snapshot time.
    pub description: String,
    /// When the snapshot was written.
    pub saved_at: DateTime<Utc>,
    /// Every task with its full state (status, result, error, timing).
    pub tasks: Vec<Task>,
    /// Ids of tasks that had completed.
    pub completed_ids: HashSet<Uuid>,
    /// Ids of tasks that had failed terminally or been cancelled.
    pub failed_ids: HashSet<Uuid>,
}

impl WorkflowSnapshot {
    /// Capture the current state of a workflow.
    pub fn capture(workflow: &Workflow) -> Self {
        Self {
            workflow_id: workflow.id,
            name: workflow.name.clone(),
            description: workflow.description.clone(),
            saved_at: Utc::now(),
            tasks: workflow.tasks.clone(),
            completed_ids: workflow.completed_ids(),
            failed_ids: workflow.failed_ids(),
        }
    }
}

/// Keyed storage for workflow snapshots.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Write (or replace) the snapshot for a workflow.
    async fn put(&self, snapshot: &WorkflowSnapshot) -> TaskforgeResult<()>;
    /// Load the snapshot for a workflow, if one exists.
    async fn get(&self, workflow_id: Uuid) -> TaskforgeResult<Option<WorkflowSnapshot>>;
    /// Ids of all workflows with a stored snapshot.
    async fn list(&self) -> TaskforgeResult<Vec<Uuid>>;
    /// Delete the snapshot for a workflow, if one exists.
    async fn delete(&self, workflow_id: Uuid) -> TaskforgeResult<()>;
}

/// File-backed snapshot store: one JSON document per workflow.
///
/// Writes go to a temp file in the same directory and are renamed into
/// place, so a crash mid-write never leaves a partial snapshot behind.
pub struct FileSnapshotStore {
    dir: PathBuf,
}

impl FileSnapshotStore {
    /// Create the store, creating the directory if needed.
    pub async fn new(dir: PathBuf) -> TaskforgeResult<Self> {
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn snapshot_path(&self, workflow_id: Uuid) -> PathBuf {
        self.dir.join(format!("{workflow_id}.json"))
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn put(&self, snapshot: &WorkflowSnapshot) -> TaskforgeResult<()> {
        let path = self.snapshot_path(snapshot.workflow_id);
        let tmp = self.dir.join(format!("{}.json.tmp", snapshot.workflow_id));
        let json = serde_json::to_string_pretty(snapshot)?;
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn get(&self, workflow_id: Uuid) -> TaskforgeResult<Option<WorkflowSnapshot>> {
        let path = self.snapshot_path(workflow_id);
        if !path.exists() {
            return Ok(None);
        }
        let data = tokio::fs::read_to_string(path).await?;
        let snapshot: WorkflowSnapshot = serde_json::from_str(&data).map_err(|e| {
            TaskforgeError::Checkpoint(format!(
                "failed to parse snapshot for workflow {workflow_id}: {e}"
            ))
        })?;
        Ok(Some(snapshot))
    }

    async fn list(&self) -> TaskforgeResult<Vec<Uuid>> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if let Some(stem) = name.strip_suffix(".json") {
                    if let Ok(id) = Uuid::parse_str(stem) {
                        ids.push(id);
                    }
                }
            }
        }
        Ok(ids)
    }

    async fn delete(&self, workflow_id: Uuid) -> TaskforgeResult<()> {
        let path = self.snapshot_path(workflow_id);
        if path.exists() {
            tokio::fs::remove_file(path).await?;
        }
        Ok(())
    }
}

/// In-memory snapshot store for tests and embedding without a filesystem.
#[derive(Default)]
pub struct MemorySnapshotStore {
    snapshots: RwLock<std::collections::HashMap<Uuid, WorkflowSnapshot>>,
}

impl MemorySnapshotStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn put(&self, snapshot: &WorkflowSnapshot) -> TaskforgeResult<()> {
        self.snapshots
            .write()
            .await
            .insert(snapshot.workflow_id, snapshot.clone());
        Ok(())
    }

    async fn get(&self, workflow_id: Uuid) -> TaskforgeResult<Option<WorkflowSnapshot>> {
        Ok(self.snapshots.read().await.get(&workflow_id).cloned())
    }

    async fn list(&self) -> TaskforgeResult<Vec<Uuid>> {
        Ok(self.snapshots.read().await.keys().copied().collect())
    }

    async fn delete(&self, workflow_id: Uuid) -> TaskforgeResult<()> {
        self.snapshots.write().await.remove(&workflow_id);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::types::TaskStatus;
    use serde_json::json;

    fn sample_workflow() -> Workflow {
        let mut a = Task::new("a", "echo");
        let mut b = Task::new("b", "echo");
        let c = Task::new("c", "echo").with_dependencies(vec![a.id, b.id]);
        a.mark_running();
        a.mark_completed(json!({"ok": true}));
        b.mark_running();
        b.mark_failed("boom");
        Workflow::new("sample", "three tasks", vec![a, b, c])
    }

    #[test]
    fn test_capture_id_sets() {
        let workflow = sample_workflow();
        let snapshot = WorkflowSnapshot::capture(&workflow);
        assert_eq!(snapshot.tasks.len(), 3);
        assert_eq!(snapshot.completed_ids.len(), 1);
        assert_eq!(snapshot.failed_ids.len(), 1);
        assert!(snapshot.completed_ids.contains(&workflow.tasks[0].id));
        assert!(snapshot.failed_ids.contains(&workflow.tasks[1].id));
    }

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::new(dir.path().to_path_buf())
            .await
            .unwrap();

        let workflow = sample_workflow();
        let snapshot = WorkflowSnapshot::capture(&workflow);
        store.put(&snapshot).await.unwrap();

        let loaded = store.get(workflow.id).await.unwrap().unwrap();
        assert_eq!(loaded.workflow_id, workflow.id);
        assert_eq!(loaded.tasks.len(), 3);
        assert_eq!(loaded.completed_ids, snapshot.completed_ids);
        assert_eq!(
            loaded.tasks[0].status,
            TaskStatus::Completed,
            "full task state must survive the round trip"
        );
        assert_eq!(loaded.tasks[0].result, Some(json!({"ok": true})));
    }

    #[tokio::test]
    async fn test_file_store_missing_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::new(dir.path().to_path_buf())
            .await
            .unwrap();
        assert!(store.get(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_store_list_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::new(dir.path().to_path_buf())
            .await
            .unwrap();

        let wf1 = sample_workflow();
        let wf2 = sample_workflow();
        store.put(&WorkflowSnapshot::capture(&wf1)).await.unwrap();
        store.put(&WorkflowSnapshot::capture(&wf2)).await.unwrap();

        let mut ids = store.list().await.unwrap();
        ids.sort();
        let mut expected = vec![wf1.id, wf2.id];
        expected.sort();
        assert_eq!(ids, expected);

        store.delete(wf1.id).await.unwrap();
        assert!(store.get(wf1.id).await.unwrap().is_none());
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_no_temp_files_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::new(dir.path().to_path_buf())
            .await
            .unwrap();
        let workflow = sample_workflow();
        store
            .put(&WorkflowSnapshot::capture(&workflow))
            .await
            .unwrap();

        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            let name = entry.file_name();
            assert!(
                !name.to_string_lossy().ends_with(".tmp"),
                "temp file left behind: {name:?}"
            );
        }
    }

    #[tokio::test]
    async fn test_put_replaces_previous_snapshot() {
        let store = MemorySnapshotStore::new();
        let mut workflow = sample_workflow();
        store
            .put(&WorkflowSnapshot::capture(&workflow))
            .await
            .unwrap();

        // Complete the last task and snapshot again.
        let remaining = workflow.tasks[2].id;
        if let Some(task) = workflow.tasks.iter_mut().find(|t| t.id == remaining) {
            task.mark_running();
            task.mark_completed(serde_json::Value::Null);
        }
        store
            .put(&WorkflowSnapshot::capture(&workflow))
            .await
            .unwrap();

        let loaded = store.get(workflow.id).await.unwrap().unwrap();
        assert_eq!(loaded.completed_ids.len(), 2);
    }
}
