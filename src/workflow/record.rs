use crate::core::{ActorKey, IndexError, Result, WorkflowId};
use crate::update::{IndexUpdates, MemberUpdate};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::hash::{Hash, Hasher};

/// The index updates of one actor write for one indexed interface.
/// Identity is the workflow id alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRecord {
    workflow_id: WorkflowId,
    actor: ActorKey,
    interface: String,
    updates: IndexUpdates,
    created_at: DateTime<Utc>,
}

impl WorkflowRecord {
    pub fn new(actor: ActorKey, interface: impl Into<String>, updates: IndexUpdates) -> Self {
        Self {
            workflow_id: WorkflowId::new(),
            actor,
            interface: interface.into(),
            updates,
            created_at: Utc::now(),
        }
    }

    pub fn workflow_id(&self) -> WorkflowId {
        self.workflow_id
    }

    pub fn actor(&self) -> &ActorKey {
        &self.actor
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn updates(&self) -> impl Iterator<Item = (&str, &MemberUpdate)> {
        self.updates.iter().map(|(index, update)| (index.as_str(), update))
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

impl PartialEq for WorkflowRecord {
    fn eq(&self, other: &Self) -> bool {
        self.workflow_id == other.workflow_id
    }
}

impl Eq for WorkflowRecord {}

impl Hash for WorkflowRecord {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.workflow_id.hash(state);
    }
}

/// A queue node: a record, or a punctuation closing a drain batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowRecordNode {
    record: Option<WorkflowRecord>,
}

impl WorkflowRecordNode {
    pub fn record(record: WorkflowRecord) -> Self {
        Self {
            record: Some(record),
        }
    }

    pub fn punctuation() -> Self {
        Self { record: None }
    }

    pub fn is_punctuation(&self) -> bool {
        self.record.is_none()
    }

    pub fn workflow(&self) -> Option<&WorkflowRecord> {
        self.record.as_ref()
    }
}

/// Durable state of a workflow queue: the node list from head to tail.
///
/// Appends push at the tail; drains pop whole segments from the head, a
/// segment being the records before the first punctuation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowQueueEntry {
    nodes: VecDeque<WorkflowRecordNode>,
}

impl WorkflowQueueEntry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of records, punctuation excluded.
    pub fn record_count(&self) -> usize {
        self.records().count()
    }

    pub fn punctuation_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_punctuation()).count()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &WorkflowRecordNode> {
        self.nodes.iter()
    }

    pub fn records(&self) -> impl Iterator<Item = &WorkflowRecord> {
        self.nodes.iter().filter_map(WorkflowRecordNode::workflow)
    }

    pub fn ends_with_punctuation(&self) -> bool {
        self.nodes.back().is_some_and(WorkflowRecordNode::is_punctuation)
    }

    pub fn append(&mut self, record: WorkflowRecord) {
        self.nodes.push_back(WorkflowRecordNode::record(record));
    }

    /// Closes the open tail segment.
    ///
    /// # Errors
    ///
    /// Returns `IndexError::DoublePunctuation` when there is no open segment:
    /// the list is empty or already ends with a punctuation.
    pub fn append_punctuation(&mut self, queue: &str) -> Result<()> {
        if self.nodes.is_empty() || self.ends_with_punctuation() {
            return Err(IndexError::DoublePunctuation(queue.to_string()));
        }
        self.nodes.push_back(WorkflowRecordNode::punctuation());
        Ok(())
    }

    /// Records of the head segment.
    pub fn first_segment(&self) -> Vec<WorkflowRecord> {
        self.nodes
            .iter()
            .map_while(|node| node.workflow().cloned())
            .collect()
    }

    /// Pops the head segment together with its closing punctuation.
    pub fn remove_first_segment(&mut self) -> Vec<WorkflowRecord> {
        let mut removed = Vec::new();
        while let Some(node) = self.nodes.pop_front() {
            match node.record {
                Some(record) => removed.push(record),
                None => break,
            }
        }
        removed
    }

    /// Pops punctuation-only segments at the head. Returns true if any were
    /// dropped.
    pub fn drop_empty_head_segments(&mut self) -> bool {
        let mut dropped = false;
        while self.nodes.front().is_some_and(WorkflowRecordNode::is_punctuation) {
            self.nodes.pop_front();
            dropped = true;
        }
        dropped
    }

    pub fn records_in(&self, ids: &BTreeSet<WorkflowId>) -> Vec<WorkflowRecord> {
        self.records()
            .filter(|record| ids.contains(&record.workflow_id()))
            .cloned()
            .collect()
    }

    /// Removes records by id, leaving punctuation in place so segment
    /// boundaries stay where the drain expects them. Returns how many were
    /// removed.
    pub fn remove_all(&mut self, ids: &BTreeSet<WorkflowId>) -> usize {
        let before = self.nodes.len();
        self.nodes.retain(|node| {
            node.workflow()
                .is_none_or(|record| !ids.contains(&record.workflow_id()))
        });
        before - self.nodes.len()
    }
}
