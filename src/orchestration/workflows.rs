//! # Workflow Engine
//!
//! Team coordination primitives layered on the shared store and the event
//! stream: majority-vote consensus, round-robin parallel distribution, and
//! persisted sequential workflows advanced one step per
//! `workflow.step_completed`.

use crate::error::{HivemindError, Result};
use crate::events::{Event, EventKind, EventPublisher};
use crate::store::{keys, SharedStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Outcome of a consensus round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusResult {
    pub proposal_id: String,
    pub approved: bool,
    pub approve_votes: usize,
    pub reject_votes: usize,
}

/// One vote on a proposal, pushed onto the proposal's vote list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vote {
    pub proposal_id: String,
    pub voter: String,
    pub approve: bool,
}

/// A single step of a sequential workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub name: String,
    pub agent_id: String,
    #[serde(default)]
    pub data: Value,
}

/// Persisted record of an in-flight sequential workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub id: String,
    pub steps: Vec<WorkflowStep>,
    /// Index of the step currently executing.
    pub cursor: usize,
    pub started_at: DateTime<Utc>,
}

/// Consensus, parallel and sequential coordination over a team of agents.
pub struct WorkflowEngine {
    store: Arc<dyn SharedStore>,
    publisher: EventPublisher,
    vote_window: Duration,
}

impl WorkflowEngine {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        let publisher = EventPublisher::new(store.clone(), "workflow_engine");
        Self {
            store,
            publisher,
            vote_window: Duration::from_secs(5),
        }
    }

    /// Override the vote collection window. Tests use a short one.
    pub fn with_vote_window(mut self, window: Duration) -> Self {
        self.vote_window = window;
        self
    }

    /// Broadcast a proposal, wait out the vote window, then tally the votes
    /// that arrived. Majority of received votes decides; zero votes rejects.
    pub async fn run_consensus(&self, proposal_id: &str, proposal: Value) -> Result<ConsensusResult> {
        self.publisher
            .publish(
                EventKind::Proposal,
                json!({"proposal_id": proposal_id, "proposal": proposal}),
            )
            .await;

        tokio::time::sleep(self.vote_window).await;

        let ballots = self
            .store
            .drain_list(&keys::consensus_votes(proposal_id))
            .await?;
        let mut approve_votes = 0usize;
        let mut reject_votes = 0usize;
        for payload in ballots {
            match serde_json::from_str::<Vote>(&payload) {
                Ok(vote) if vote.approve => approve_votes += 1,
                Ok(_) => reject_votes += 1,
                Err(e) => {
                    warn!(proposal_id = proposal_id, error = %e, "Undecodable vote discarded");
                }
            }
        }

        let approved = approve_votes > reject_votes;
        info!(
            proposal_id = proposal_id,
            approve_votes = approve_votes,
            reject_votes = reject_votes,
            approved = approved,
            "Consensus round closed"
        );
        Ok(ConsensusResult {
            proposal_id: proposal_id.to_string(),
            approved,
            approve_votes,
            reject_votes,
        })
    }

    /// Record a vote for an open proposal. Called on behalf of agents that
    /// reply through the event stream.
    pub async fn cast_vote(&self, vote: &Vote) -> Result<()> {
        let payload = serde_json::to_string(vote)?;
        self.store
            .push_list(&keys::consensus_votes(&vote.proposal_id), &payload)
            .await
    }

    /// Distribute task payloads round-robin across the team's agent queues.
    /// Returns how many tasks each agent received, in team order.
    pub async fn run_parallel(&self, team: &[String], tasks: Vec<Value>) -> Result<Vec<usize>> {
        if team.is_empty() {
            return Err(HivemindError::WorkflowError(
                "Parallel distribution requires at least one agent".to_string(),
            ));
        }

        let mut per_agent = vec![0usize; team.len()];
        for (index, task) in tasks.into_iter().enumerate() {
            let slot = index % team.len();
            let agent_id = &team[slot];
            let payload = serde_json::to_string(&task)?;
            self.store
                .push_list(&keys::agent_queue(agent_id), &payload)
                .await?;
            per_agent[slot] += 1;
        }
        Ok(per_agent)
    }

    /// Start a sequential workflow: persist the record and dispatch the
    /// first step to its agent.
    pub async fn start_sequential(
        &self,
        workflow_id: &str,
        steps: Vec<WorkflowStep>,
    ) -> Result<()> {
        if steps.is_empty() {
            return Err(HivemindError::WorkflowError(
                "Sequential workflow requires at least one step".to_string(),
            ));
        }

        let record = WorkflowRecord {
            id: workflow_id.to_string(),
            steps,
            cursor: 0,
            started_at: Utc::now(),
        };
        self.persist(&record).await?;
        self.dispatch_step(&record).await?;
        info!(workflow_id = workflow_id, steps = record.steps.len(), "Workflow started");
        Ok(())
    }

    /// Advance the workflow named in a `workflow.step_completed` event.
    /// The final step's completion removes the record.
    pub async fn handle_step_completed(&self, event: &Event) -> Result<()> {
        let Some(workflow_id) = event.data.get("workflow_id").and_then(Value::as_str) else {
            return Err(HivemindError::EventError(
                "Missing field: workflow_id".to_string(),
            ));
        };

        let Some(mut record) = self.load(workflow_id).await? else {
            debug!(workflow_id = workflow_id, "Step completion for unknown workflow ignored");
            return Ok(());
        };

        record.cursor += 1;
        if record.cursor >= record.steps.len() {
            self.store.delete(&keys::workflow(workflow_id)).await?;
            info!(workflow_id = workflow_id, "Workflow completed");
            return Ok(());
        }

        self.persist(&record).await?;
        self.dispatch_step(&record).await?;
        debug!(workflow_id = workflow_id, cursor = record.cursor, "Workflow advanced");
        Ok(())
    }

    pub async fn load(&self, workflow_id: &str) -> Result<Option<WorkflowRecord>> {
        match self.store.get(&keys::workflow(workflow_id)).await? {
            Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    async fn persist(&self, record: &WorkflowRecord) -> Result<()> {
        let payload = serde_json::to_string(record)?;
        self.store.set(&keys::workflow(&record.id), &payload).await
    }

    /// Push the cursor's step onto its agent's queue, tagged with the
    /// workflow id so the agent's completion report can route back here.
    async fn dispatch_step(&self, record: &WorkflowRecord) -> Result<()> {
        let step = &record.steps[record.cursor];
        let payload = serde_json::to_string(&json!({
            "workflow_id": record.id,
            "step": step.name,
            "step_index": record.cursor,
            "data": step.data,
        }))?;
        self.store
            .push_list(&keys::agent_queue(&step.agent_id), &payload)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn build_engine(store: Arc<MemoryStore>) -> WorkflowEngine {
        WorkflowEngine::new(store).with_vote_window(Duration::from_millis(20))
    }

    fn step(name: &str, agent_id: &str) -> WorkflowStep {
        WorkflowStep {
            name: name.to_string(),
            agent_id: agent_id.to_string(),
            data: json!({}),
        }
    }

    #[tokio::test]
    async fn consensus_tallies_majority_of_received_votes() {
        let store = Arc::new(MemoryStore::new());
        let engine = build_engine(store.clone());

        let voter = build_engine(store.clone());
        let handle = tokio::spawn(async move {
            for (voter_id, approve) in [("a1", true), ("a2", true), ("a3", false)] {
                voter
                    .cast_vote(&Vote {
                        proposal_id: "p1".to_string(),
                        voter: voter_id.to_string(),
                        approve,
                    })
                    .await
                    .unwrap();
            }
        });

        let result = engine.run_consensus("p1", json!({"action": "restart"})).await.unwrap();
        handle.await.unwrap();
        assert!(result.approved);
        assert_eq!(result.approve_votes, 2);
        assert_eq!(result.reject_votes, 1);
    }

    #[tokio::test]
    async fn consensus_with_no_votes_rejects() {
        let store = Arc::new(MemoryStore::new());
        let result = build_engine(store)
            .run_consensus("p1", json!({}))
            .await
            .unwrap();
        assert!(!result.approved);
        assert_eq!(result.approve_votes + result.reject_votes, 0);
    }

    #[tokio::test]
    async fn parallel_distributes_round_robin() {
        let store = Arc::new(MemoryStore::new());
        let engine = build_engine(store.clone());
        let team = vec!["a1".to_string(), "a2".to_string()];
        let tasks = (0..5).map(|i| json!({"n": i})).collect();

        let per_agent = engine.run_parallel(&team, tasks).await.unwrap();
        assert_eq!(per_agent, vec![3, 2]);
        assert_eq!(store.list_len(&keys::agent_queue("a1")).await.unwrap(), 3);
        assert_eq!(store.list_len(&keys::agent_queue("a2")).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn parallel_requires_a_team() {
        let store = Arc::new(MemoryStore::new());
        let result = build_engine(store).run_parallel(&[], vec![json!({})]).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn sequential_threads_steps_and_removes_record() {
        let store = Arc::new(MemoryStore::new());
        let engine = build_engine(store.clone());
        engine
            .start_sequential("w1", vec![step("collect", "a1"), step("report", "a2")])
            .await
            .unwrap();

        // First step queued for a1, record persisted at cursor 0.
        assert_eq!(store.list_len(&keys::agent_queue("a1")).await.unwrap(), 1);
        assert_eq!(engine.load("w1").await.unwrap().unwrap().cursor, 0);

        engine
            .handle_step_completed(&Event::new(
                EventKind::WorkflowStepCompleted,
                "a1",
                json!({"workflow_id": "w1", "step": "collect"}),
            ))
            .await
            .unwrap();

        // Second step queued for a2.
        assert_eq!(store.list_len(&keys::agent_queue("a2")).await.unwrap(), 1);
        assert_eq!(engine.load("w1").await.unwrap().unwrap().cursor, 1);

        engine
            .handle_step_completed(&Event::new(
                EventKind::WorkflowStepCompleted,
                "a2",
                json!({"workflow_id": "w1", "step": "report"}),
            ))
            .await
            .unwrap();

        assert!(engine.load("w1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unknown_workflow_completion_is_ignored() {
        let store = Arc::new(MemoryStore::new());
        let engine = build_engine(store);
        engine
            .handle_step_completed(&Event::new(
                EventKind::WorkflowStepCompleted,
                "a1",
                json!({"workflow_id": "ghost"}),
            ))
            .await
            .unwrap();
    }
}
