//! Scripted message bus.

use crate::error::{PortalError, PortalResult};
use crate::tools::bus::{MessageBus, RestartPolicy};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::time::Duration;

#[derive(Debug)]
struct BusState {
    healthy: bool,
    failing_starts: u32,
    start_calls: u32,
    stop_calls: u32,
    topics: Vec<String>,
    deleted: Vec<String>,
    compatibility_resets: u32,
}

#[derive(Debug)]
pub struct FakeBus {
    policy: RestartPolicy,
    state: Mutex<BusState>,
}

impl Default for FakeBus {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeBus {
    /// Healthy bus with the default restart policy (3 attempts, 5 s apart)
    pub fn new() -> Self {
        Self::with_policy(RestartPolicy {
            attempts: 3,
            backoff: Duration::from_secs(5),
        })
    }

    pub fn with_policy(policy: RestartPolicy) -> Self {
        Self {
            policy,
            state: Mutex::new(BusState {
                healthy: true,
                failing_starts: 0,
                start_calls: 0,
                stop_calls: 0,
                topics: Vec::new(),
                deleted: Vec::new(),
                compatibility_resets: 0,
            }),
        }
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.state.lock().healthy = healthy;
    }

    /// The next `count` start attempts fail
    pub fn fail_starts(&self, count: u32) {
        self.state.lock().failing_starts = count;
    }

    pub fn start_calls(&self) -> u32 {
        self.state.lock().start_calls
    }

    pub fn stop_calls(&self) -> u32 {
        self.state.lock().stop_calls
    }

    pub fn add_topic(&self, topic: &str) {
        self.state.lock().topics.push(topic.to_string());
    }

    pub fn topics(&self) -> Vec<String> {
        self.state.lock().topics.clone()
    }

    pub fn deleted_topics(&self) -> Vec<String> {
        self.state.lock().deleted.clone()
    }

    pub fn compatibility_resets(&self) -> u32 {
        self.state.lock().compatibility_resets
    }
}

#[async_trait]
impl MessageBus for FakeBus {
    async fn is_healthy(&self) -> bool {
        self.state.lock().healthy
    }

    async fn start(&self) -> PortalResult<()> {
        let mut state = self.state.lock();
        state.start_calls += 1;
        if state.failing_starts > 0 {
            state.failing_starts -= 1;
            return Err(PortalError::Bus("broker refused to start".to_string()));
        }
        state.healthy = true;
        Ok(())
    }

    async fn stop(&self) {
        let mut state = self.state.lock();
        state.stop_calls += 1;
        state.healthy = false;
    }

    fn restart_policy(&self) -> RestartPolicy {
        self.policy
    }

    async fn list_topics(&self) -> PortalResult<Vec<String>> {
        Ok(self.topics())
    }

    async fn delete_topic(&self, topic: &str) -> PortalResult<()> {
        let mut state = self.state.lock();
        state.topics.retain(|existing| existing != topic);
        state.deleted.push(topic.to_string());
        Ok(())
    }

    async fn reset_schema_compatibility(&self) -> PortalResult<()> {
        self.state.lock().compatibility_resets += 1;
        Ok(())
    }
}
