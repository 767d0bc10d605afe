//! Backend failover state machine.
//!
//! Tracks consecutive failures per backend and decides, after each
//! invocation, whether to keep going, retry the same backend on the next
//! iteration, switch to another backend, or give up because every backend is
//! at the threshold. The machine never runs anything itself; the scheduler
//! consults it and acts on the decision.

use std::collections::HashMap;

use anyhow::{Result, bail};

use crate::classifier::Classification;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailoverDecision {
    /// The invocation succeeded.
    Continue,
    /// Failed, but the current backend is still below the threshold.
    Retry { failures: u32 },
    /// Current backend hit the threshold; use `to` from the next iteration on.
    Switch {
        from: String,
        to: String,
        failures: u32,
        last_error: String,
    },
    /// Every backend is at or above the threshold.
    AllExhausted,
}

#[derive(Debug, Clone)]
pub struct FailoverState {
    order: Vec<String>,
    current: usize,
    counters: HashMap<String, u32>,
    last_errors: HashMap<String, String>,
    threshold: u32,
}

impl FailoverState {
    /// `order` is the priority list; `initial` becomes the current backend and
    /// is added to the front of the order if missing.
    pub fn new(order: Vec<String>, initial: &str, threshold: u32) -> Result<Self> {
        if threshold == 0 {
            bail!("failover threshold must be at least 1");
        }
        let mut order = dedup(order);
        let current = match order.iter().position(|b| b == initial) {
            Some(idx) => idx,
            None => {
                order.insert(0, initial.to_string());
                0
            }
        };
        Ok(Self {
            order,
            current,
            counters: HashMap::new(),
            last_errors: HashMap::new(),
            threshold,
        })
    }

    /// Backend the next non-pinned iteration should use.
    pub fn current(&self) -> &str {
        &self.order[self.current]
    }

    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn failures(&self, backend: &str) -> u32 {
        self.counters.get(backend).copied().unwrap_or(0)
    }

    pub fn last_error(&self, backend: &str) -> Option<&str> {
        self.last_errors.get(backend).map(String::as_str)
    }

    /// True when every backend in the order is at or above the threshold.
    pub fn all_failed(&self) -> bool {
        self.order.iter().all(|b| self.failures(b) >= self.threshold)
    }

    /// Feed the outcome of an invocation on `backend`.
    ///
    /// `Fatal` is treated like a retryable failure here; the scheduler stops
    /// the run on fatal outcomes before consulting the machine.
    pub fn record(
        &mut self,
        backend: &str,
        classification: Classification,
        error: &str,
    ) -> FailoverDecision {
        if classification.is_success() {
            self.counters.insert(backend.to_string(), 0);
            self.last_errors.remove(backend);
            return FailoverDecision::Continue;
        }

        let count = self.counters.entry(backend.to_string()).or_insert(0);
        *count += 1;
        let failures = *count;
        self.last_errors
            .insert(backend.to_string(), error.to_string());

        if failures < self.threshold {
            return FailoverDecision::Retry { failures };
        }
        if self.all_failed() {
            return FailoverDecision::AllExhausted;
        }

        // Scan cyclically after the failing backend (or the current pointer
        // when the failure came from a backend outside the order).
        let start = self
            .order
            .iter()
            .position(|b| b == backend)
            .unwrap_or(self.current);
        let len = self.order.len();
        let next = (1..=len)
            .map(|step| (start + step) % len)
            .find(|&idx| self.failures(&self.order[idx]) < self.threshold);

        match next {
            Some(idx) => {
                self.current = idx;
                FailoverDecision::Switch {
                    from: backend.to_string(),
                    to: self.order[idx].clone(),
                    failures,
                    last_error: error.to_string(),
                }
            }
            None => FailoverDecision::AllExhausted,
        }
    }
}

fn dedup(order: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(order.len());
    for name in order {
        if !out.contains(&name) {
            out.push(name);
        }
    }
    out
}
