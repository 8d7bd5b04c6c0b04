//! In-memory agent registry and delivery correlation.
//!
//! The broker never calls agents. Agents register, attach a stream (see
//! [`TaskBroker::open_stream`]) and pull envelopes from their queue; results come
//! back through [`TaskBroker::submit_result`] and are handed to whoever waits in
//! [`TaskBroker::await_result`].

mod envelope;
mod stream;

pub use envelope::*;

use crate::config::BrokerConfig;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("no connected agent advertises capability '{0}'")]
    NoCapableAgent(String),
}

#[derive(Debug)]
struct AgentRecord {
    name: String,
    capabilities: BTreeSet<String>,
    last_heartbeat: DateTime<Utc>,
    registered_at: DateTime<Utc>,
    /// Registration order; the earliest capable agent gets new work
    seq: u64,
    /// Session id of the attached stream, if any
    stream_session: Option<u64>,
}

#[derive(Debug)]
struct InFlight {
    agent_id: String,
}

#[derive(Debug, Default)]
struct BrokerState {
    agents: HashMap<String, AgentRecord>,
    /// Survives unregistration so a reconnecting agent picks up where it left
    queues: HashMap<String, VecDeque<PendingTaskEnvelope>>,
    /// Wake-ups for attached streams; kept across re-registrations
    notifiers: HashMap<String, Arc<Notify>>,
    /// Deliveries whose result is still wanted
    in_flight: HashMap<String, InFlight>,
    waiters: HashMap<String, oneshot::Sender<TaskResult>>,
    /// Results posted before anyone started waiting
    early_results: HashMap<String, TaskResult>,
    next_seq: u64,
}

impl BrokerState {
    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn notifier(&mut self, agent_id: &str) -> Arc<Notify> {
        self.notifiers
            .entry(agent_id.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    /// Drops the wake-up handle once neither a registration nor queued work
    /// refers to the agent
    fn release_notifier(&mut self, agent_id: &str) {
        if !self.agents.contains_key(agent_id) && !self.queues.contains_key(agent_id) {
            self.notifiers.remove(agent_id);
        }
    }

    fn remove_agent(&mut self, agent_id: &str) -> bool {
        let removed = self.agents.remove(agent_id).is_some();
        self.release_notifier(agent_id);
        removed
    }

    fn purge_envelope(&mut self, delivery_id: &str, agent_id: &str) -> bool {
        let Some(queue) = self.queues.get_mut(agent_id) else {
            return false;
        };
        let before = queue.len();
        queue.retain(|e| e.delivery_id != delivery_id);
        let purged = queue.len() != before;
        if queue.is_empty() {
            self.queues.remove(agent_id);
            self.release_notifier(agent_id);
        }
        purged
    }
}

/// An agent counts as connected while its heartbeat is within `timeout`
fn is_live(record: &AgentRecord, now: DateTime<Utc>, timeout: chrono::Duration) -> bool {
    now - record.last_heartbeat <= timeout
}

/// What a stream iteration found when it polled the broker
#[derive(Debug)]
pub(crate) enum StreamPoll {
    Ready(Vec<PendingTaskEnvelope>),
    /// The agent is no longer registered and has to register again
    Unregistered,
    /// A newer stream took over this agent
    Superseded,
}

/// Registry of connected agents, their pending queues, and result correlation
#[derive(Debug)]
pub struct TaskBroker {
    config: BrokerConfig,
    state: Mutex<BrokerState>,
}

impl TaskBroker {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BrokerState::default()),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    fn agent_timeout(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.config.agent_timeout)
            .unwrap_or_else(|_| chrono::Duration::weeks(52))
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("Broker state lock poisoned, recovering...");
                poisoned.into_inner()
            }
        }
    }

    /// Registers an agent, overwriting any previous record with the same id
    ///
    /// A re-registration detaches whatever stream the old record had; that stream
    /// ends on its next iteration.
    pub fn register(&self, agent_id: &str, name: &str, capabilities: &[String]) -> AgentInfo {
        let now = Utc::now();
        let mut state = self.state();
        let seq = state.next_seq();
        let previous = state.agents.insert(
            agent_id.to_string(),
            AgentRecord {
                name: name.to_string(),
                capabilities: capabilities.iter().cloned().collect(),
                last_heartbeat: now,
                registered_at: now,
                seq,
                stream_session: None,
            },
        );
        info!(
            agent_id,
            name,
            ?capabilities,
            reregistered = previous.is_some(),
            "Agent registered"
        );
        AgentInfo {
            agent_id: agent_id.to_string(),
            name: name.to_string(),
            capabilities: capabilities.to_vec(),
            connected: true,
            streaming: false,
            last_heartbeat: now,
            registered_at: now,
            queued: state.queues.get(agent_id).map_or(0, VecDeque::len),
        }
    }

    /// Removes an agent from the registry. Its queued envelopes are kept.
    pub fn unregister(&self, agent_id: &str) -> bool {
        let removed = self.state().remove_agent(agent_id);
        if removed {
            info!(agent_id, "Agent removed from registry");
        }
        removed
    }

    /// Refreshes an agent's heartbeat
    ///
    /// # Returns
    ///
    /// `false` if the agent is unknown, in which case it must register again
    pub fn update_heartbeat(&self, agent_id: &str) -> bool {
        let mut state = self.state();
        match state.agents.get_mut(agent_id) {
            Some(record) => {
                record.last_heartbeat = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Queues an envelope for the first connected agent advertising `capability`
    ///
    /// An agent is connected while its last heartbeat is within `agent_timeout`;
    /// stale agents get no new work even before the reaper removes them.
    ///
    /// Returns immediately with the new delivery id; use [`TaskBroker::await_result`]
    /// to wait for the outcome.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::NoCapableAgent` if no connected agent has the capability
    pub fn submit_task(
        &self,
        kind: &str,
        payload: Value,
        capability: &str,
    ) -> Result<String, BrokerError> {
        let now = Utc::now();
        let timeout = self.agent_timeout();
        let mut state = self.state();
        let agent_id = state
            .agents
            .iter()
            .filter(|(_, record)| {
                record.capabilities.contains(capability) && is_live(record, now, timeout)
            })
            .min_by_key(|(_, record)| record.seq)
            .map(|(agent_id, _)| agent_id.clone())
            .ok_or_else(|| BrokerError::NoCapableAgent(capability.to_string()))?;

        let delivery_id = Uuid::new_v4().to_string();
        state
            .queues
            .entry(agent_id.clone())
            .or_default()
            .push_back(PendingTaskEnvelope {
                delivery_id: delivery_id.clone(),
                kind: kind.to_string(),
                payload,
            });
        state.in_flight.insert(
            delivery_id.clone(),
            InFlight {
                agent_id: agent_id.clone(),
            },
        );
        state.notifier(&agent_id).notify_one();

        info!(%delivery_id, %agent_id, kind, "Task queued for agent");
        Ok(delivery_id)
    }

    /// Records an agent's result and wakes the caller waiting on it
    ///
    /// # Returns
    ///
    /// `false` if nobody wants this delivery anymore (unknown id, already
    /// answered, or the waiter timed out); the result is discarded
    pub fn submit_result(&self, delivery_id: &str, payload: Value, success: bool) -> bool {
        let result = TaskResult {
            delivery_id: delivery_id.to_string(),
            success,
            payload,
        };

        let mut state = self.state();
        if state.in_flight.remove(delivery_id).is_none() {
            warn!(delivery_id, "Discarding result for unknown or abandoned delivery");
            return false;
        }

        match state.waiters.remove(delivery_id) {
            Some(waiter) => {
                if waiter.send(result).is_err() {
                    warn!(delivery_id, "Waiter went away before the result arrived");
                    return false;
                }
            }
            None => {
                state.early_results.insert(delivery_id.to_string(), result);
            }
        }
        debug!(delivery_id, success, "Result recorded");
        true
    }

    /// Waits up to `timeout` for the result of a delivery
    ///
    /// On timeout the delivery is abandoned: a still-queued envelope is purged
    /// so no agent runs it late, and any later result is discarded.
    ///
    /// # Returns
    ///
    /// `None` on timeout or if the delivery id is unknown
    pub async fn await_result(&self, delivery_id: &str, timeout: Duration) -> Option<TaskResult> {
        let receiver = {
            let mut state = self.state();
            if let Some(result) = state.early_results.remove(delivery_id) {
                return Some(result);
            }
            if !state.in_flight.contains_key(delivery_id) {
                return None;
            }
            let (sender, receiver) = oneshot::channel();
            state.waiters.insert(delivery_id.to_string(), sender);
            receiver
        };

        let mut receiver = receiver;
        if let Ok(Ok(result)) = tokio::time::timeout(timeout, &mut receiver).await {
            return Some(result);
        }

        let mut state = self.state();
        state.waiters.remove(delivery_id);
        // The result may have been sent between the timeout firing and the lock.
        if let Ok(result) = receiver.try_recv() {
            return Some(result);
        }
        if let Some(in_flight) = state.in_flight.remove(delivery_id) {
            let purged = state.purge_envelope(delivery_id, &in_flight.agent_id);
            warn!(
                delivery_id,
                agent_id = %in_flight.agent_id,
                purged_from_queue = purged,
                "Timed out waiting for result, delivery abandoned"
            );
        }
        None
    }

    /// Removes agents whose last heartbeat is older than the configured timeout
    pub fn prune_stale_agents(&self, now: DateTime<Utc>) -> Vec<String> {
        let timeout = self.agent_timeout();
        let mut state = self.state();
        let stale: Vec<String> = state
            .agents
            .iter()
            .filter(|(_, record)| !is_live(record, now, timeout))
            .map(|(agent_id, _)| agent_id.clone())
            .collect();
        for agent_id in &stale {
            state.remove_agent(agent_id);
            warn!(%agent_id, "Agent heartbeat timed out, removed from registry");
        }
        stale
    }

    pub fn agents(&self) -> Vec<AgentInfo> {
        let now = Utc::now();
        let timeout = self.agent_timeout();
        let state = self.state();
        let mut agents: Vec<AgentInfo> = state
            .agents
            .keys()
            .filter_map(|agent_id| Self::snapshot(&state, agent_id, now, timeout))
            .collect();
        agents.sort_by(|a, b| a.registered_at.cmp(&b.registered_at));
        agents
    }

    pub fn agent(&self, agent_id: &str) -> Option<AgentInfo> {
        Self::snapshot(&self.state(), agent_id, Utc::now(), self.agent_timeout())
    }

    fn snapshot(
        state: &BrokerState,
        agent_id: &str,
        now: DateTime<Utc>,
        timeout: chrono::Duration,
    ) -> Option<AgentInfo> {
        let record = state.agents.get(agent_id)?;
        Some(AgentInfo {
            agent_id: agent_id.to_string(),
            name: record.name.clone(),
            capabilities: record.capabilities.iter().cloned().collect(),
            connected: is_live(record, now, timeout),
            streaming: record.stream_session.is_some(),
            last_heartbeat: record.last_heartbeat,
            registered_at: record.registered_at,
            queued: state.queues.get(agent_id).map_or(0, VecDeque::len),
        })
    }

    /// Attaches a new stream to a registered agent
    ///
    /// Returns the stream's session id and the agent's wake-up handle, or `None`
    /// if the agent is not registered.
    pub(crate) fn attach_stream(&self, agent_id: &str) -> Option<(u64, Arc<Notify>)> {
        let mut state = self.state();
        if !state.agents.contains_key(agent_id) {
            return None;
        }
        let session = state.next_seq();
        let notify = state.notifier(agent_id);
        if let Some(record) = state.agents.get_mut(agent_id) {
            record.stream_session = Some(session);
            record.last_heartbeat = Utc::now();
        }
        Some((session, notify))
    }

    /// Refreshes the heartbeat of a streaming agent and drains its queue
    pub(crate) fn poll_stream(&self, agent_id: &str, session: u64) -> StreamPoll {
        let mut state = self.state();
        match state.agents.get_mut(agent_id) {
            None => return StreamPoll::Unregistered,
            Some(record) if record.stream_session != Some(session) => {
                return StreamPoll::Superseded
            }
            Some(record) => record.last_heartbeat = Utc::now(),
        }
        let envelopes = state
            .queues
            .remove(agent_id)
            .map(Vec::from)
            .unwrap_or_default();
        StreamPoll::Ready(envelopes)
    }

    /// Called when a stream ends; removes the agent unless a newer stream owns it
    pub(crate) fn detach_stream(&self, agent_id: &str, session: u64) {
        let mut state = self.state();
        let owned = state
            .agents
            .get(agent_id)
            .is_some_and(|record| record.stream_session == Some(session));
        if owned {
            state.remove_agent(agent_id);
            info!(agent_id, session, "Agent stream closed, removed from registry");
        }
    }
}
