//! Endpoint pool with failover and periodic reintroduction.
//!
//! The pool keeps the configured endpoint list untouched and a separate
//! live list that shrinks as endpoints refuse connections. Every
//! `reintroduce_every` calls the live list is reset to the configured one,
//! which gives recovered nodes another chance without health checks.
//! A single-endpoint pool skips all bookkeeping.

use std::sync::Mutex;

use tracing::{debug, warn};

use crate::error::ClientError;

struct PoolState {
    live: Vec<String>,
    cursor: usize,
    calls: u64,
}

pub struct EndpointPool {
    configured: Vec<String>,
    reintroduce_every: u64,
    state: Mutex<PoolState>,
}

impl EndpointPool {
    /// Build a pool. Duplicates and trailing slashes are dropped.
    pub fn new(endpoints: &[String], reintroduce_every: u64) -> Result<Self, ClientError> {
        let mut configured: Vec<String> = Vec::new();
        for endpoint in endpoints {
            let endpoint = endpoint.trim().trim_end_matches('/').to_string();
            if endpoint.is_empty() {
                continue;
            }
            if !configured.contains(&endpoint) {
                configured.push(endpoint);
            }
        }
        if configured.is_empty() {
            return Err(ClientError::Config("no backend endpoint configured".into()));
        }
        Ok(Self {
            state: Mutex::new(PoolState {
                live: configured.clone(),
                cursor: 0,
                calls: 0,
            }),
            configured,
            reintroduce_every: reintroduce_every.max(1),
        })
    }

    pub fn len(&self) -> usize {
        self.configured.len()
    }

    pub fn is_empty(&self) -> bool {
        self.configured.is_empty()
    }

    pub fn is_single(&self) -> bool {
        self.configured.len() == 1
    }

    pub fn configured(&self) -> &[String] {
        &self.configured
    }

    /// Endpoints currently eligible for selection.
    pub fn live(&self) -> Vec<String> {
        if self.is_single() {
            return self.configured.clone();
        }
        self.lock().live.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Pick the endpoint for the next request, round-robin over the live list.
    pub fn next(&self) -> Result<String, ClientError> {
        if self.is_single() {
            return Ok(self.configured[0].clone());
        }

        let mut state = self.lock();
        state.calls += 1;
        if state.calls % self.reintroduce_every == 0 && state.live.len() < self.configured.len() {
            debug!(
                live = state.live.len(),
                configured = self.configured.len(),
                "reintroducing all configured endpoints"
            );
            state.live = self.configured.clone();
            state.cursor = 0;
        }

        if state.live.is_empty() {
            return Err(ClientError::AllEndpointsExhausted {
                tried: self.configured.clone(),
            });
        }

        let index = state.cursor % state.live.len();
        state.cursor = (index + 1) % state.live.len();
        Ok(state.live[index].clone())
    }

    /// Remove `endpoint` from the live list after a failed connection.
    pub fn remove(&self, endpoint: &str) {
        if self.is_single() {
            return;
        }
        let mut state = self.lock();
        let Some(position) = state.live.iter().position(|e| e == endpoint) else {
            return;
        };
        state.live.remove(position);
        if state.cursor > position {
            state.cursor -= 1;
        }
        if state.cursor >= state.live.len() {
            state.cursor = 0;
        }
        warn!(
            endpoint,
            remaining = state.live.len(),
            "endpoint removed from the live pool"
        );
    }
}
