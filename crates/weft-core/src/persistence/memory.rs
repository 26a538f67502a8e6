//! In-memory persistence backend.
//!
//! Preserves every port invariant (status monotonicity, id uniqueness,
//! strictly increasing message `seq`, atomic node version bumps) so tests
//! and single-process runs exercise the same contract a SQL backend must
//! honor.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::{
    CleanupReport, InvocationAggregates, InvocationPage, InvocationPatch, ListFilters, ListSort,
    NodeInvocationEnd, NodeInvocationStart, PersistenceError, PersistencePort, SortDir, SortField,
    TraceBundle, TxCallback,
};
use crate::dsl::{NodeConfig, DSL_SCHEMA_VERSION};
use crate::model::{
    InvocationStatus, Message, NodeInvocation, NodeInvocationStatus, NodeVersionRecord,
    WorkflowInvocation, WorkflowRecord, WorkflowVersion,
};

type PResult<T> = std::result::Result<T, PersistenceError>;

#[derive(Debug, Clone, Default)]
struct Store {
    workflows: HashMap<String, WorkflowRecord>,
    versions: HashMap<String, WorkflowVersion>,
    invocations: HashMap<Uuid, WorkflowInvocation>,
    node_versions: Vec<NodeVersionRecord>,
    node_invocations: HashMap<Uuid, NodeInvocation>,
    messages: Vec<Message>,
}

/// Mutex-guarded map store behind the [`PersistencePort`] trait.
#[derive(Debug, Default)]
pub struct InMemoryPersistence {
    store: Mutex<Store>,
    /// Serializes transactions; plain writes outside a transaction only
    /// contend on the store lock.
    tx_lock: Mutex<()>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    fn from_store(store: Store) -> Self {
        Self {
            store: Mutex::new(store),
            tx_lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl PersistencePort for InMemoryPersistence {
    async fn ensure_workflow(&self, workflow_id: &str, description: &str) -> PResult<()> {
        let mut store = self.store.lock().await;
        store
            .workflows
            .entry(workflow_id.to_string())
            .and_modify(|w| w.description = description.to_string())
            .or_insert_with(|| WorkflowRecord {
                workflow_id: workflow_id.to_string(),
                description: description.to_string(),
            });
        Ok(())
    }

    async fn create_workflow_version(&self, mut version: WorkflowVersion) -> PResult<()> {
        // Annotate the blob with the current schema version if absent;
        // refuse anything annotated with a version we do not understand.
        match version.dsl.get("schema_version").and_then(|v| v.as_u64()) {
            None => {
                if let Some(obj) = version.dsl.as_object_mut() {
                    obj.insert(
                        "schema_version".to_string(),
                        serde_json::json!(DSL_SCHEMA_VERSION),
                    );
                }
            }
            Some(found) if found as u32 != DSL_SCHEMA_VERSION => {
                return Err(PersistenceError::Conflict(format!(
                    "dsl schema version {found} is not supported"
                )));
            }
            Some(_) => {}
        }

        let mut store = self.store.lock().await;
        if !store.workflows.contains_key(&version.workflow_id) {
            return Err(PersistenceError::NotFound(format!(
                "workflow '{}'",
                version.workflow_id
            )));
        }
        store
            .versions
            .insert(version.version_id.clone(), version);
        Ok(())
    }

    async fn workflow_version(&self, version_id: &str) -> PResult<WorkflowVersion> {
        let store = self.store.lock().await;
        store
            .versions
            .get(version_id)
            .cloned()
            .ok_or_else(|| PersistenceError::NotFound(format!("workflow version '{version_id}'")))
    }

    async fn create_workflow_invocation(&self, invocation: WorkflowInvocation) -> PResult<()> {
        if invocation.status != InvocationStatus::Running {
            return Err(PersistenceError::Conflict(
                "new invocations must be created in 'running'".into(),
            ));
        }

        let mut store = self.store.lock().await;
        if !store.versions.contains_key(&invocation.version_id) {
            return Err(PersistenceError::NotFound(format!(
                "workflow version '{}'",
                invocation.version_id
            )));
        }
        if store.invocations.contains_key(&invocation.invocation_id) {
            return Err(PersistenceError::DuplicateKey(format!(
                "invocation {}",
                invocation.invocation_id
            )));
        }
        store
            .invocations
            .insert(invocation.invocation_id, invocation);
        Ok(())
    }

    async fn update_workflow_invocation(
        &self,
        invocation_id: Uuid,
        patch: InvocationPatch,
    ) -> PResult<()> {
        let mut store = self.store.lock().await;
        let row = store.invocations.get_mut(&invocation_id).ok_or_else(|| {
            PersistenceError::NotFound(format!("invocation {invocation_id}"))
        })?;

        if let Some(status) = patch.status {
            if row.status.is_terminal() && status != row.status {
                return Err(PersistenceError::Conflict(format!(
                    "invocation {invocation_id} is already {} and cannot become {}",
                    row.status.label(),
                    status.label()
                )));
            }
            row.status = status;
        }
        if let Some(end_time) = patch.end_time {
            row.end_time = Some(end_time);
        }
        if let Some(usd_cost) = patch.usd_cost {
            row.usd_cost = usd_cost;
        }
        if let Some(output) = patch.workflow_output {
            row.workflow_output = Some(output);
        }
        if let Some(fitness) = patch.fitness {
            row.fitness = Some(fitness);
        }
        if let Some(accuracy) = patch.accuracy {
            row.accuracy = Some(accuracy.round());
        }
        if let Some(score) = patch.fitness_score {
            row.fitness_score = Some(score);
        }
        if let Some(extras) = patch.extras {
            row.extras = Some(extras);
        }
        Ok(())
    }

    async fn workflow_invocation(&self, invocation_id: Uuid) -> PResult<WorkflowInvocation> {
        let store = self.store.lock().await;
        store
            .invocations
            .get(&invocation_id)
            .cloned()
            .ok_or_else(|| PersistenceError::NotFound(format!("invocation {invocation_id}")))
    }

    async fn save_node_version(
        &self,
        config: NodeConfig,
        wf_version_id: &str,
    ) -> PResult<NodeVersionRecord> {
        let mut store = self.store.lock().await;
        let next = store
            .node_versions
            .iter()
            .filter(|nv| nv.node_id == config.node_id && nv.wf_version_id == wf_version_id)
            .map(|nv| nv.version)
            .max()
            .unwrap_or(0)
            + 1;

        let record = NodeVersionRecord {
            node_version_id: Uuid::new_v4(),
            node_id: config.node_id.clone(),
            wf_version_id: wf_version_id.to_string(),
            version: next,
            config,
        };
        store.node_versions.push(record.clone());
        Ok(record)
    }

    async fn latest_node_version(
        &self,
        node_id: &str,
        wf_version_id: &str,
    ) -> PResult<Option<NodeVersionRecord>> {
        let store = self.store.lock().await;
        Ok(store
            .node_versions
            .iter()
            .filter(|nv| nv.node_id == node_id && nv.wf_version_id == wf_version_id)
            .max_by_key(|nv| nv.version)
            .cloned())
    }

    async fn start_node_invocation(&self, start: NodeInvocationStart) -> PResult<Uuid> {
        let mut store = self.store.lock().await;
        if !store.invocations.contains_key(&start.invocation_id) {
            return Err(PersistenceError::NotFound(format!(
                "invocation {}",
                start.invocation_id
            )));
        }

        let node_invocation_id = Uuid::new_v4();
        store.node_invocations.insert(
            node_invocation_id,
            NodeInvocation {
                node_invocation_id,
                node_id: start.node_id,
                node_version_id: start.node_version_id,
                invocation_id: start.invocation_id,
                start_time: start.start_time,
                end_time: None,
                status: NodeInvocationStatus::Running,
                model: start.model,
                attempt_no: start.attempt_no,
                usd_cost: 0.0,
                output: None,
                summary: String::new(),
                files: Vec::new(),
                error: None,
                extras: None,
            },
        );
        Ok(node_invocation_id)
    }

    async fn end_node_invocation(&self, end: NodeInvocationEnd) -> PResult<()> {
        let mut store = self.store.lock().await;
        let row = store
            .node_invocations
            .get_mut(&end.node_invocation_id)
            .ok_or_else(|| {
                PersistenceError::NotFound(format!("node invocation {}", end.node_invocation_id))
            })?;

        if row.status.is_terminal() {
            return Err(PersistenceError::Conflict(format!(
                "node invocation {} is already terminal",
                end.node_invocation_id
            )));
        }

        row.status = end.status;
        row.end_time = Some(end.end_time);
        row.usd_cost = end.usd_cost;
        row.output = end.output;
        row.summary = end.summary;
        row.files = end.files;
        row.error = end.error;
        row.extras = end.extras;
        Ok(())
    }

    async fn save_message(&self, msg: Message) -> PResult<()> {
        let mut store = self.store.lock().await;
        if store.messages.iter().any(|m| m.msg_id == msg.msg_id) {
            return Err(PersistenceError::DuplicateKey(format!(
                "message {}",
                msg.msg_id
            )));
        }
        let max_seq = store
            .messages
            .iter()
            .filter(|m| m.invocation_id == msg.invocation_id)
            .map(|m| m.seq)
            .max()
            .unwrap_or(0);
        if msg.seq <= max_seq {
            return Err(PersistenceError::Conflict(format!(
                "message seq {} is not strictly increasing (last was {max_seq})",
                msg.seq
            )));
        }
        store.messages.push(msg);
        Ok(())
    }

    async fn list_invocations(
        &self,
        page: u32,
        page_size: u32,
        filters: ListFilters,
        sort: ListSort,
    ) -> PResult<InvocationPage> {
        let store = self.store.lock().await;

        let mut rows: Vec<WorkflowInvocation> = store
            .invocations
            .values()
            .filter(|inv| matches_filters(inv, &filters))
            .cloned()
            .collect();

        let total_count = rows.len() as u64;
        let aggregates = InvocationAggregates {
            total_spent_usd: rows.iter().map(|r| r.usd_cost).sum(),
            avg_accuracy: {
                let known: Vec<f64> = rows.iter().filter_map(|r| r.accuracy).collect();
                if known.is_empty() {
                    None
                } else {
                    Some(known.iter().sum::<f64>() / known.len() as f64)
                }
            },
            failed_count: rows
                .iter()
                .filter(|r| r.status == InvocationStatus::Failed)
                .count() as u64,
        };

        sort_rows(&mut rows, sort);

        let page = page.max(1);
        let start = ((page - 1) as usize).saturating_mul(page_size as usize);
        let rows = rows
            .into_iter()
            .skip(start)
            .take(page_size as usize)
            .collect();

        Ok(InvocationPage {
            rows,
            total_count,
            aggregates,
        })
    }

    async fn delete_invocations(&self, ids: &[Uuid]) -> PResult<u64> {
        let mut store = self.store.lock().await;
        let mut removed = 0;
        for id in ids {
            if store.invocations.remove(id).is_some() {
                removed += 1;
            }
        }
        store.node_invocations.retain(|_, ni| !ids.contains(&ni.invocation_id));
        store.messages.retain(|m| !ids.contains(&m.invocation_id));
        debug!(removed, "deleted invocations with cascade");
        Ok(removed)
    }

    async fn cleanup_stale(&self, grace: Duration) -> PResult<CleanupReport> {
        let mut store = self.store.lock().await;
        let now = Utc::now();
        let cutoff = now - chrono::Duration::from_std(grace).unwrap_or(chrono::Duration::zero());

        let mut report = CleanupReport::default();

        let stale_invocations: Vec<Uuid> = store
            .invocations
            .values()
            .filter(|inv| inv.status == InvocationStatus::Running && inv.start_time < cutoff)
            .map(|inv| inv.invocation_id)
            .collect();

        for id in &stale_invocations {
            if let Some(inv) = store.invocations.get_mut(id) {
                inv.status = InvocationStatus::Failed;
                inv.end_time = Some(now);
                inv.extras = Some(serde_json::json!({"error": "stale invocation cleanup"}));
                report.workflow_invocations += 1;
            }
        }

        for ni in store.node_invocations.values_mut() {
            let own_stale = ni.status == NodeInvocationStatus::Running && ni.start_time < cutoff;
            let parent_failed = stale_invocations.contains(&ni.invocation_id)
                && ni.status == NodeInvocationStatus::Running;
            if own_stale || parent_failed {
                ni.status = NodeInvocationStatus::Failed;
                ni.end_time = Some(now);
                ni.error = Some("stale invocation cleanup".into());
                report.node_invocations += 1;
            }
        }

        Ok(report)
    }

    async fn get_trace(&self, invocation_id: Uuid) -> PResult<TraceBundle> {
        let store = self.store.lock().await;
        let invocation = store
            .invocations
            .get(&invocation_id)
            .cloned()
            .ok_or_else(|| PersistenceError::NotFound(format!("invocation {invocation_id}")))?;
        let version = store
            .versions
            .get(&invocation.version_id)
            .cloned()
            .ok_or_else(|| {
                PersistenceError::NotFound(format!("workflow version '{}'", invocation.version_id))
            })?;
        let workflow = store
            .workflows
            .get(&version.workflow_id)
            .cloned()
            .ok_or_else(|| {
                PersistenceError::NotFound(format!("workflow '{}'", version.workflow_id))
            })?;

        let mut node_invocations: Vec<NodeInvocation> = store
            .node_invocations
            .values()
            .filter(|ni| ni.invocation_id == invocation_id)
            .cloned()
            .collect();
        node_invocations.sort_by_key(|ni| ni.start_time);

        let mut messages: Vec<Message> = store
            .messages
            .iter()
            .filter(|m| m.invocation_id == invocation_id)
            .cloned()
            .collect();
        messages.sort_by_key(|m| m.seq);

        Ok(TraceBundle {
            workflow,
            version,
            invocation,
            node_invocations,
            messages,
        })
    }

    async fn with_transaction(&self, callback: TxCallback) -> PResult<()> {
        let _tx = self.tx_lock.lock().await;

        let snapshot = self.store.lock().await.clone();
        let scratch = Arc::new(InMemoryPersistence::from_store(snapshot));

        callback(Arc::clone(&scratch) as Arc<dyn PersistencePort>).await?;

        let committed = scratch.store.lock().await.clone();
        *self.store.lock().await = committed;
        Ok(())
    }
}

fn matches_filters(inv: &WorkflowInvocation, f: &ListFilters) -> bool {
    if let Some(status) = f.status {
        if inv.status != status {
            return false;
        }
    }
    if let Some(min) = f.min_cost {
        if inv.usd_cost < min {
            return false;
        }
    }
    if let Some(max) = f.max_cost {
        if inv.usd_cost > max {
            return false;
        }
    }
    if f.min_accuracy.is_some() || f.max_accuracy.is_some() {
        let Some(acc) = inv.accuracy else { return false };
        if f.min_accuracy.is_some_and(|min| acc < min) {
            return false;
        }
        if f.max_accuracy.is_some_and(|max| acc > max) {
            return false;
        }
    }
    if f.min_fitness.is_some() || f.max_fitness.is_some() {
        let score = inv
            .fitness_score
            .or_else(|| inv.fitness.as_ref().and_then(|fit| fit.as_score()));
        let Some(score) = score else { return false };
        if f.min_fitness.is_some_and(|min| score < min) {
            return false;
        }
        if f.max_fitness.is_some_and(|max| score > max) {
            return false;
        }
    }
    if f.date_from.is_some_and(|from| inv.start_time < from) {
        return false;
    }
    if f.date_to.is_some_and(|to| inv.start_time > to) {
        return false;
    }
    if let Some(run_id) = &f.run_id {
        if inv.run_id.as_deref() != Some(run_id.as_str()) {
            return false;
        }
    }
    if let Some(generation_id) = &f.generation_id {
        if inv.generation_id.as_deref() != Some(generation_id.as_str()) {
            return false;
        }
    }
    if let Some(version_id) = &f.wf_version_id {
        if &inv.version_id != version_id {
            return false;
        }
    }
    true
}

fn sort_rows(rows: &mut [WorkflowInvocation], sort: ListSort) {
    rows.sort_by(|a, b| {
        let ord = match sort.field {
            SortField::StartTime => a.start_time.cmp(&b.start_time),
            SortField::UsdCost => total_cmp(a.usd_cost, b.usd_cost),
            SortField::Status => a.status.label().cmp(b.status.label()),
            SortField::Fitness => total_cmp(
                a.fitness_score.unwrap_or(f64::NEG_INFINITY),
                b.fitness_score.unwrap_or(f64::NEG_INFINITY),
            ),
            SortField::Accuracy => total_cmp(
                a.accuracy.unwrap_or(f64::NEG_INFINITY),
                b.accuracy.unwrap_or(f64::NEG_INFINITY),
            ),
            SortField::Duration => a
                .duration_ms()
                .unwrap_or(i64::MAX)
                .cmp(&b.duration_ms().unwrap_or(i64::MAX)),
        };
        match sort.dir {
            SortDir::Asc => ord,
            SortDir::Desc => ord.reverse(),
        }
    });
}

fn total_cmp(a: f64, b: f64) -> std::cmp::Ordering {
    a.partial_cmp(&b).unwrap_or(std::cmp::Ordering::Equal)
}
