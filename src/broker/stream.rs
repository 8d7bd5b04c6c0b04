use super::{StreamPoll, TaskBroker};
use crate::event::StreamEvent;
use chrono::Utc;
use futures::Stream;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info};

/// Removes the agent when its stream is dropped (client disconnect or loop end)
struct StreamGuard {
    broker: Arc<TaskBroker>,
    agent_id: String,
    session: u64,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.broker.detach_stream(&self.agent_id, self.session);
    }
}

impl TaskBroker {
    /// Opens the long-lived event stream for a registered agent
    ///
    /// Each iteration refreshes the agent's heartbeat, emits one `task` event per
    /// queued envelope in FIFO order, emits a `heartbeat` event on the configured
    /// cadence, then idles until new work arrives or the poll interval elapses.
    /// The loop is bounded by `max_stream_iterations`. When the stream ends or is
    /// dropped, the agent is removed from the registry.
    pub fn open_stream(self: &Arc<Self>, agent_id: &str) -> impl Stream<Item = StreamEvent> + Send + 'static {
        let broker = Arc::clone(self);
        let agent_id = agent_id.to_string();

        async_stream::stream! {
            let (session, notify) = match broker.attach_stream(&agent_id) {
                Some(attached) => attached,
                None => {
                    info!(%agent_id, "Stream requested by unregistered agent");
                    yield StreamEvent::Error {
                        message: format!("agent {} is not registered", agent_id),
                    };
                    return;
                }
            };
            let _guard = StreamGuard {
                broker: broker.clone(),
                agent_id: agent_id.clone(),
                session,
            };
            info!(%agent_id, session, "Agent stream opened");
            yield StreamEvent::Connected { agent_id: agent_id.clone() };

            let poll_interval = broker.config.stream_poll_interval;
            let heartbeat_interval = broker.config.stream_heartbeat_interval;
            let mut last_heartbeat = Instant::now();

            for _ in 0..broker.config.max_stream_iterations {
                match broker.poll_stream(&agent_id, session) {
                    StreamPoll::Unregistered => {
                        yield StreamEvent::Error {
                            message: format!("agent {} is not registered", agent_id),
                        };
                        return;
                    }
                    StreamPoll::Superseded => {
                        // Reported as an error so the agent backs off before
                        // registering again.
                        yield StreamEvent::Error {
                            message: format!("agent {} was superseded by a newer registration", agent_id),
                        };
                        return;
                    }
                    StreamPoll::Ready(envelopes) => {
                        for envelope in envelopes {
                            debug!(%agent_id, delivery_id = %envelope.delivery_id, "Delivering envelope");
                            yield StreamEvent::Task(envelope);
                        }
                    }
                }

                if last_heartbeat.elapsed() >= heartbeat_interval {
                    last_heartbeat = Instant::now();
                    yield StreamEvent::Heartbeat { timestamp: Utc::now() };
                }

                let _ = tokio::time::timeout(poll_interval, notify.notified()).await;
            }

            info!(%agent_id, session, "Stream iteration limit reached");
            yield StreamEvent::Disconnect {
                reason: "iteration limit reached".to_string(),
            };
        }
    }
}
