//! Mutable scheduling state shared by the engine actions

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use serde::Serialize;

use crate::engine::kv_cache::{KVCacheConfig, PageTable};
use crate::engine::request_state::RequestState;

/// Counters accumulated while serving
#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineStats {
    pub requests_added: u64,
    pub requests_finished: u64,
    pub requests_aborted: u64,
    pub requests_preempted: u64,
    pub prefill_steps: u64,
    pub decode_steps: u64,
    pub prefill_tokens: u64,
    pub decode_tokens: u64,
    pub draft_tokens_proposed: u64,
    pub draft_tokens_accepted: u64,
    #[serde(serialize_with = "as_secs")]
    pub prefill_time: Duration,
    #[serde(serialize_with = "as_secs")]
    pub decode_time: Duration,
}

fn as_secs<S: serde::Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64())
}

impl EngineStats {
    /// Fraction of proposed draft tokens the target model accepted
    pub fn draft_acceptance_rate(&self) -> f64 {
        if self.draft_tokens_proposed == 0 {
            0.0
        } else {
            self.draft_tokens_accepted as f64 / self.draft_tokens_proposed as f64
        }
    }

    pub fn decode_tokens_per_sec(&self) -> f64 {
        let secs = self.decode_time.as_secs_f64();
        if secs == 0.0 {
            0.0
        } else {
            self.decode_tokens as f64 / secs
        }
    }
}

/// Look up `running_queue`'s states in order
///
/// # Panics
/// If a running id has no state, which the actions never allow.
pub fn running_states<'a>(
    running_queue: &[String],
    request_states: &'a mut HashMap<String, RequestState>,
) -> Vec<&'a mut RequestState> {
    let mut by_id: HashMap<&str, &mut RequestState> = request_states
        .iter_mut()
        .map(|(id, state)| (id.as_str(), state))
        .collect();
    running_queue
        .iter()
        .map(|id| match by_id.remove(id.as_str()) {
            Some(state) => state,
            None => panic!("internal invariant violated: running request {} has no state", id),
        })
        .collect()
}

/// Queues, per-request states and cache accounting
#[derive(Debug)]
pub struct EngineState {
    /// Requests not yet admitted, FIFO
    pub waiting_queue: VecDeque<String>,

    /// Admitted requests in admission order
    pub running_queue: Vec<String>,

    /// Ids to abort at the start of the next step
    pub abort_queue: Vec<String>,

    pub request_states: HashMap<String, RequestState>,

    /// One page table per model, index-aligned with the model set
    pub page_tables: Vec<PageTable>,

    pub stats: EngineStats,

    next_internal_id: i64,
}

impl EngineState {
    pub fn new(kv_cache_config: &KVCacheConfig, num_models: usize) -> Self {
        Self {
            waiting_queue: VecDeque::new(),
            running_queue: Vec::new(),
            abort_queue: Vec::new(),
            request_states: HashMap::new(),
            page_tables: (0..num_models).map(|_| PageTable::new(kv_cache_config)).collect(),
            stats: EngineStats::default(),
            next_internal_id: 0,
        }
    }

    /// Clear queues, request states, cache accounting and statistics
    pub fn reset(&mut self) {
        self.waiting_queue.clear();
        self.running_queue.clear();
        self.abort_queue.clear();
        self.request_states.clear();
        self.page_tables.iter_mut().for_each(PageTable::clear);
        self.stats = EngineStats::default();
        self.next_internal_id = 0;
    }

    /// Hand out a fresh cache sequence handle
    pub fn next_internal_id(&mut self) -> i64 {
        let id = self.next_internal_id;
        self.next_internal_id += 1;
        id
    }

    pub fn num_models(&self) -> usize {
        self.page_tables.len()
    }

    pub fn is_live(&self, request_id: &str) -> bool {
        self.request_states.contains_key(request_id)
    }

    pub fn has_pending_work(&self) -> bool {
        !self.waiting_queue.is_empty() || !self.running_queue.is_empty() || !self.abort_queue.is_empty()
    }

    /// States of the running requests, in running order
    pub fn running_states_mut(&mut self) -> Vec<&mut RequestState> {
        running_states(&self.running_queue, &mut self.request_states)
    }

    /// Cache handles of the running requests on model `model_index`
    pub fn running_internal_ids(&self, model_index: usize) -> Vec<i64> {
        self.running_queue
            .iter()
            .filter_map(|id| self.request_states.get(id)?.model_states.get(model_index)?.internal_id)
            .collect()
    }

    /// Statistics, cache occupancy and queue lengths as JSON
    pub fn stats_json(&self) -> String {
        let occupancy: Vec<serde_json::Value> = self
            .page_tables
            .iter()
            .map(|table| {
                serde_json::json!({
                    "used_tokens": table.num_used_tokens(),
                    "capacity_tokens": table.capacity_tokens(),
                    "free_pages": table.num_free_pages(),
                    "total_pages": table.num_total_pages(),
                })
            })
            .collect();

        serde_json::json!({
            "stats": &self.stats,
            "draft_acceptance_rate": self.stats.draft_acceptance_rate(),
            "decode_tokens_per_sec": self.stats.decode_tokens_per_sec(),
            "num_waiting": self.waiting_queue.len(),
            "num_running": self.running_queue.len(),
            "kv_cache": occupancy,
        })
        .to_string()
    }
}
