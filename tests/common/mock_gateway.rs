//! Recording mock for the local map gateway.

use mapsync::error::{AgentError, Result};
use mapsync::gateway::MapGateway;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// One call the gateway received, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppliedCall {
    Upsert { key: i32, value: i32 },
    Delete { key: i32 },
}

#[derive(Debug, Default)]
struct Inner {
    calls: Vec<AppliedCall>,
    map: HashMap<i32, i32>,
    /// When set, fail every call once this many have succeeded.
    fail_after: Option<usize>,
}

/// A map gateway that records calls and applies them to an in-process
/// table. Clones share state, so a test can hand one clone to the agent
/// and keep another to assert on.
#[derive(Debug, Clone, Default)]
pub struct MockGateway {
    inner: Arc<Mutex<Inner>>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every call after the first `n` have succeeded.
    pub fn fail_after(&self, n: usize) {
        self.inner.lock().unwrap().fail_after = Some(n);
    }

    /// All calls received so far, in arrival order.
    pub fn calls(&self) -> Vec<AppliedCall> {
        self.inner.lock().unwrap().calls.clone()
    }

    /// Current table contents.
    pub fn snapshot(&self) -> HashMap<i32, i32> {
        self.inner.lock().unwrap().map.clone()
    }

    /// Value currently stored for `key`.
    pub fn get(&self, key: i32) -> Option<i32> {
        self.inner.lock().unwrap().map.get(&key).copied()
    }

    fn check_fail(inner: &Inner) -> Result<()> {
        if let Some(limit) = inner.fail_after {
            if inner.calls.len() > limit {
                return Err(AgentError::bpf("mock apply", "injected failure"));
            }
        }
        Ok(())
    }
}

impl MapGateway for MockGateway {
    fn upsert(&mut self, key: i32, value: i32) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(AppliedCall::Upsert { key, value });
        Self::check_fail(&inner)?;
        inner.map.insert(key, value);
        Ok(())
    }

    fn delete(&mut self, key: i32) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(AppliedCall::Delete { key });
        Self::check_fail(&inner)?;
        inner.map.remove(&key);
        Ok(())
    }
}
