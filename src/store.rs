//! Plan Store (C6): durable, atomic plan persistence with a per-box mutex
//! and at-most-one-active invariant (§4.6).
//!
//! Grounded in the teacher's `Repositories`/`repo::pg::PgRepo`
//! repository-trait shape (`src/repo/mod.rs`, `src/repo/pg.rs`):
//! generalized from a Postgres connection pool to a directory of JSON
//! files, since the spec requires filesystem atomic-rename persistence,
//! not database-format compatibility (see DESIGN.md's dependency-drop
//! note on `sqlx`).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::plan::{Plan, PlanKind, PlanStatus};
use crate::domain::types::Timestamp;
use crate::errors::CoreError;

#[derive(Debug, Default, Clone, Copy)]
pub struct PlanFilter {
    pub kind: Option<PlanKind>,
    pub status: Option<PlanStatus>,
}

impl PlanFilter {
    fn matches(&self, plan: &Plan) -> bool {
        self.kind.map(|k| k == plan.kind).unwrap_or(true) && self.status.map(|s| s == plan.status).unwrap_or(true)
    }
}

#[async_trait]
pub trait PlanStore: Send + Sync {
    async fn create(&self, box_id: &str, plan: Plan) -> Result<Uuid, CoreError>;
    async fn activate(&self, box_id: &str, plan_id: Uuid, now: Timestamp) -> Result<(), CoreError>;
    async fn deactivate(&self, box_id: &str, plan_id: Uuid, now: Timestamp) -> Result<(), CoreError>;
    async fn get_active(&self, box_id: &str) -> Result<Option<Plan>, CoreError>;
    async fn list(&self, box_id: &str, filter: PlanFilter) -> Result<Vec<Plan>, CoreError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredPlan {
    checksum: String,
    plan: Plan,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct IndexFile {
    active_plan_id: Option<Uuid>,
}

/// File-backed `PlanStore`: one directory per box under `root`, a
/// `plan_<id>.json` file per plan plus an `index.json` recording the
/// active plan id. All writes go through `write_atomic` (temp file, fsync,
/// rename). A per-box `tokio::sync::Mutex<()>` serializes the write path
/// (§5: "Plan Store transitions are serialized through a single mutex per
/// box").
pub struct FilePlanStore {
    root: PathBuf,
    box_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl FilePlanStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root, box_locks: Mutex::new(HashMap::new()) }
    }

    async fn lock_for(&self, box_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.box_locks.lock().await;
        locks.entry(box_id.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    fn box_dir(&self, box_id: &str) -> PathBuf {
        self.root.join(box_id)
    }

    fn plan_path(&self, box_id: &str, plan_id: Uuid) -> PathBuf {
        self.box_dir(box_id).join(format!("plan_{plan_id}.json"))
    }

    fn index_path(&self, box_id: &str) -> PathBuf {
        self.box_dir(box_id).join("index.json")
    }

    async fn read_index(&self, box_id: &str) -> Result<IndexFile, CoreError> {
        let path = self.index_path(box_id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                warn!(box_id, error = %e, "plan store index corrupt, will reconcile from disk");
                CoreError::CorruptState { box_id: box_id.to_string() }
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(IndexFile::default()),
            Err(e) => Err(CoreError::ProviderUnavailable { source: format!("index read failed: {e}") }),
        }
    }

    async fn write_index(&self, box_id: &str, index: &IndexFile) -> Result<(), CoreError> {
        let dir = self.box_dir(box_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| CoreError::ProviderUnavailable { source: format!("mkdir failed: {e}") })?;
        let body = serde_json::to_vec_pretty(index)
            .map_err(|e| CoreError::ProviderUnavailable { source: format!("index serialize failed: {e}") })?;
        write_atomic(&self.index_path(box_id), &body).await
    }

    async fn write_plan(&self, box_id: &str, plan: &Plan) -> Result<(), CoreError> {
        let dir = self.box_dir(box_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| CoreError::ProviderUnavailable { source: format!("mkdir failed: {e}") })?;
        let plan_body = serde_json::to_vec(plan)
            .map_err(|e| CoreError::ProviderUnavailable { source: format!("plan serialize failed: {e}") })?;
        let checksum = format!("{:x}", Sha256::digest(&plan_body));
        let stored = StoredPlan { checksum, plan: plan.clone() };
        let body = serde_json::to_vec_pretty(&stored)
            .map_err(|e| CoreError::ProviderUnavailable { source: format!("stored plan serialize failed: {e}") })?;
        write_atomic(&self.plan_path(box_id, plan.plan_id), &body).await
    }

    async fn read_plan(&self, box_id: &str, plan_id: Uuid) -> Result<Option<Plan>, CoreError> {
        let path = self.plan_path(box_id, plan_id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CoreError::ProviderUnavailable { source: format!("plan read failed: {e}") }),
        };

        let stored: StoredPlan = match serde_json::from_slice(&bytes) {
            Ok(s) => s,
            Err(e) => {
                warn!(box_id, %plan_id, error = %e, "plan file unparseable, quarantining");
                quarantine(&path).await;
                return Err(CoreError::CorruptState { box_id: box_id.to_string() });
            }
        };

        let plan_body = serde_json::to_vec(&stored.plan)
            .map_err(|e| CoreError::ProviderUnavailable { source: format!("plan re-serialize failed: {e}") })?;
        let checksum = format!("{:x}", Sha256::digest(&plan_body));
        if checksum != stored.checksum {
            warn!(box_id, %plan_id, "plan checksum mismatch, quarantining");
            quarantine(&path).await;
            return Err(CoreError::CorruptState { box_id: box_id.to_string() });
        }

        Ok(Some(stored.plan))
    }

    async fn list_plan_ids(&self, box_id: &str) -> Result<Vec<Uuid>, CoreError> {
        let dir = self.box_dir(box_id);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(CoreError::ProviderUnavailable { source: format!("readdir failed: {e}") }),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CoreError::ProviderUnavailable { source: format!("readdir entry failed: {e}") })?
        {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(rest) = name.strip_prefix("plan_").and_then(|s| s.strip_suffix(".json")) {
                if let Ok(id) = Uuid::parse_str(rest) {
                    ids.push(id);
                }
            }
        }
        Ok(ids)
    }

    /// Startup reconciliation (§4.6): if the index is missing/corrupt, elect
    /// the newest valid `simulated` plan as active with a logged warning.
    pub async fn reconcile(&self, box_id: &str) -> Result<(), CoreError> {
        let index = self.read_index(box_id).await;
        if index.is_ok() {
            return Ok(());
        }

        warn!(box_id, "reconciling plan store index from disk after corruption");
        let ids = self.list_plan_ids(box_id).await?;
        let mut candidates = Vec::new();
        for id in ids {
            if let Ok(Some(plan)) = self.read_plan(box_id, id).await {
                if plan.status == PlanStatus::Simulated || plan.status == PlanStatus::Active {
                    candidates.push(plan);
                }
            }
        }
        candidates.sort_by_key(|p| p.created_ts.inner());
        if let Some(newest) = candidates.into_iter().last() {
            warn!(box_id, plan_id = %newest.plan_id, "elected newest valid plan as active during reconciliation");
            self.write_index(box_id, &IndexFile { active_plan_id: Some(newest.plan_id) }).await?;
        } else {
            self.write_index(box_id, &IndexFile::default()).await?;
        }
        Ok(())
    }
}

async fn write_atomic(dest: &Path, body: &[u8]) -> Result<(), CoreError> {
    let dir = dest.parent().ok_or_else(|| CoreError::ProviderUnavailable { source: "destination has no parent directory".into() })?;
    let tmp_name = format!(".{}.{}.tmp", dest.file_name().and_then(|n| n.to_str()).unwrap_or("plan"), Uuid::new_v4());
    let tmp_path = dir.join(tmp_name);

    let mut file = tokio::fs::File::create(&tmp_path)
        .await
        .map_err(|e| CoreError::ProviderUnavailable { source: format!("temp file create failed: {e}") })?;
    use tokio::io::AsyncWriteExt;
    file.write_all(body)
        .await
        .map_err(|e| CoreError::ProviderUnavailable { source: format!("temp file write failed: {e}") })?;
    file.sync_all()
        .await
        .map_err(|e| CoreError::ProviderUnavailable { source: format!("temp file fsync failed: {e}") })?;
    drop(file);

    tokio::fs::rename(&tmp_path, dest)
        .await
        .map_err(|e| CoreError::ProviderUnavailable { source: format!("atomic rename failed: {e}") })?;
    Ok(())
}

async fn quarantine(path: &Path) {
    let corrupt_path = path.with_extension("json.corrupt");
    if let Err(e) = tokio::fs::rename(path, &corrupt_path).await {
        warn!(error = %e, "failed to quarantine corrupt plan file");
    }
}

#[async_trait]
impl PlanStore for FilePlanStore {
    async fn create(&self, box_id: &str, plan: Plan) -> Result<Uuid, CoreError> {
        let lock = self.lock_for(box_id).await;
        let _guard = lock.lock().await;
        let plan_id = plan.plan_id;
        self.write_plan(box_id, &plan).await?;
        info!(box_id, %plan_id, kind = %plan.kind, "plan created");
        Ok(plan_id)
    }

    async fn activate(&self, box_id: &str, plan_id: Uuid, now: Timestamp) -> Result<(), CoreError> {
        let lock = self.lock_for(box_id).await;
        let _guard = lock.lock().await;

        let mut target = self
            .read_plan(box_id, plan_id)
            .await?
            .ok_or_else(|| CoreError::Validation { reason: format!("plan {plan_id} not found") })?;
        target.transition(PlanStatus::Active, now)?;

        let index = self.read_index(box_id).await.unwrap_or_default();
        if let Some(prior_id) = index.active_plan_id {
            if prior_id != plan_id {
                if let Ok(Some(mut prior)) = self.read_plan(box_id, prior_id).await {
                    if prior.status == PlanStatus::Active {
                        prior.transition(PlanStatus::Deactivated, now)?;
                        self.write_plan(box_id, &prior).await?;
                    }
                }
            }
        }

        self.write_plan(box_id, &target).await?;
        self.write_index(box_id, &IndexFile { active_plan_id: Some(plan_id) }).await?;
        info!(box_id, %plan_id, "plan activated");
        Ok(())
    }

    async fn deactivate(&self, box_id: &str, plan_id: Uuid, now: Timestamp) -> Result<(), CoreError> {
        let lock = self.lock_for(box_id).await;
        let _guard = lock.lock().await;

        let mut plan = self
            .read_plan(box_id, plan_id)
            .await?
            .ok_or_else(|| CoreError::Validation { reason: format!("plan {plan_id} not found") })?;
        plan.transition(PlanStatus::Deactivated, now)?;
        self.write_plan(box_id, &plan).await?;

        let mut index = self.read_index(box_id).await.unwrap_or_default();
        if index.active_plan_id == Some(plan_id) {
            index.active_plan_id = None;
            self.write_index(box_id, &index).await?;
        }
        info!(box_id, %plan_id, "plan deactivated");
        Ok(())
    }

    async fn get_active(&self, box_id: &str) -> Result<Option<Plan>, CoreError> {
        let index = self.read_index(box_id).await?;
        match index.active_plan_id {
            Some(plan_id) => self.read_plan(box_id, plan_id).await,
            None => Ok(None),
        }
    }

    async fn list(&self, box_id: &str, filter: PlanFilter) -> Result<Vec<Plan>, CoreError> {
        let ids = self.list_plan_ids(box_id).await?;
        let mut plans = Vec::new();
        for id in ids {
            match self.read_plan(box_id, id).await {
                Ok(Some(plan)) if filter.matches(&plan) => plans.push(plan),
                Ok(_) => {}
                Err(CoreError::CorruptState { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        plans.sort_by_key(|p| p.created_ts.inner());
        Ok(plans)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::plan::{ContextSummary, PlanSummaryMetrics, TargetSocPolicy};
    use crate::domain::types::Energy;

    fn dummy_plan(status: PlanStatus) -> Plan {
        Plan {
            plan_id: Uuid::new_v4(),
            kind: PlanKind::Automatic,
            status,
            created_ts: Timestamp::now(),
            activated_ts: None,
            deactivated_ts: None,
            context_summary: ContextSummary {
                capacity: Energy::kwh(15.36),
                initial_soc: Energy::kwh(5.0),
                user_min_soc: Energy::kwh(5.0),
                target_policy: TargetSocPolicy::Soft,
                holding_window: None,
            },
            intervals: Vec::new(),
            total_cost_czk: 0.0,
            summary_metrics: PlanSummaryMetrics {
                total_import_kwh: 0.0,
                total_export_kwh: 0.0,
                final_soc_kwh: 5.0,
                horizon_truncated: true,
            },
        }
    }

    #[tokio::test]
    async fn create_then_activate_then_get_active_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilePlanStore::new(dir.path().to_path_buf());
        let plan = dummy_plan(PlanStatus::Simulated);
        let plan_id = plan.plan_id;
        let box_id = "box-a".to_string();
        store.create(&box_id, plan).await.unwrap();
        store.activate(&box_id, plan_id, Timestamp::now()).await.unwrap();

        let active = store.get_active(&box_id).await.unwrap().unwrap();
        assert_eq!(active.plan_id, plan_id);
        assert_eq!(active.status, PlanStatus::Active);
    }

    #[tokio::test]
    async fn activating_a_successor_deactivates_the_prior_active_plan() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilePlanStore::new(dir.path().to_path_buf());
        let box_id = "shared-box".to_string();

        let mut first = dummy_plan(PlanStatus::Simulated);
        first.plan_id = Uuid::new_v4();
        let first_id = first.plan_id;
        let first_json = serde_json::to_vec(&first).unwrap();
        let checksum = format!("{:x}", Sha256::digest(&first_json));
        let stored = StoredPlan { checksum, plan: first };
        let body = serde_json::to_vec_pretty(&stored).unwrap();
        write_atomic(&store.plan_path(&box_id, first_id), &body).await.unwrap();
        store.activate(&box_id, first_id, Timestamp::now()).await.unwrap();

        let mut second = dummy_plan(PlanStatus::Simulated);
        second.plan_id = Uuid::new_v4();
        let second_id = second.plan_id;
        let second_json = serde_json::to_vec(&second).unwrap();
        let checksum = format!("{:x}", Sha256::digest(&second_json));
        let stored = StoredPlan { checksum, plan: second };
        let body = serde_json::to_vec_pretty(&stored).unwrap();
        write_atomic(&store.plan_path(&box_id, second_id), &body).await.unwrap();
        store.activate(&box_id, second_id, Timestamp::now()).await.unwrap();

        let active = store.get_active(&box_id).await.unwrap().unwrap();
        assert_eq!(active.plan_id, second_id);

        let list = store.list(&box_id, PlanFilter::default()).await.unwrap();
        let prior = list.iter().find(|p| p.plan_id == first_id).unwrap();
        assert_eq!(prior.status, PlanStatus::Deactivated);
    }

    #[tokio::test]
    async fn corrupt_plan_file_is_quarantined_and_omitted_from_listings() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilePlanStore::new(dir.path().to_path_buf());
        let box_id = "box-1".to_string();
        let plan_id = Uuid::new_v4();

        tokio::fs::create_dir_all(store.box_dir(&box_id)).await.unwrap();
        tokio::fs::write(store.plan_path(&box_id, plan_id), b"not valid json").await.unwrap();

        let result = store.read_plan(&box_id, plan_id).await;
        assert!(matches!(result, Err(CoreError::CorruptState { .. })));
        assert!(tokio::fs::metadata(store.plan_path(&box_id, plan_id).with_extension("json.corrupt")).await.is_ok());

        let list = store.list(&box_id, PlanFilter::default()).await.unwrap();
        assert!(list.is_empty());
    }
}
