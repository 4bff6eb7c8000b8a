//! Append-only history of world/instance transitions.
//!
//! Entries keep the order in which they were read from the log. Each entry is
//! searchable at `effective_at = max(logged time, previous effective_at)`,
//! which keeps the sequence sorted for binary search even when the producer
//! writes a timestamp that runs backwards. The context itself keeps its raw
//! `joined_at`. A leave is a transition to no context.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};

use crate::models::LogContext;

pub const DEFAULT_HISTORY_CAPACITY: usize = 512;

#[derive(Debug, Clone)]
struct Transition {
    effective_at: DateTime<Utc>,
    /// `None` after a leave.
    context: Option<LogContext>,
}

#[derive(Debug)]
pub struct ContextHistory {
    entries: VecDeque<Transition>,
    capacity: usize,
}

impl Default for ContextHistory {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_HISTORY_CAPACITY)
    }
}

impl ContextHistory {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(DEFAULT_HISTORY_CAPACITY)),
            capacity: capacity.max(1),
        }
    }

    /// Returns false when an identical transition is already retained.
    pub fn push(&mut self, context: LogContext) -> bool {
        if self
            .entries
            .iter()
            .filter_map(|entry| entry.context.as_ref())
            .any(|retained| retained.same_join(&context))
        {
            return false;
        }

        let logged_at = context.joined_at;
        self.append(logged_at, Some(context));
        true
    }

    /// Ends the current context at `at`. Returns false when no context is
    /// active, so repeated leave lines add nothing.
    pub fn leave(&mut self, at: DateTime<Utc>) -> bool {
        if self.latest().is_none() {
            return false;
        }
        self.append(at, None);
        true
    }

    fn append(&mut self, logged_at: DateTime<Utc>, context: Option<LogContext>) {
        let effective_at = match self.entries.back() {
            Some(last) if last.effective_at > logged_at => last.effective_at,
            _ => logged_at,
        };
        self.entries.push_back(Transition {
            effective_at,
            context,
        });
        if self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }

    /// Names the most recent context, if it has no name yet.
    pub fn name_latest(&mut self, world_name: &str) {
        if let Some(context) = self.entries.back_mut().and_then(|last| last.context.as_mut()) {
            if context.world_name.is_none() {
                context.world_name = Some(world_name.to_string());
            }
        }
    }

    /// Context active at `at`: the last transition at or before it, unless
    /// that transition was a leave.
    pub fn context_at(&self, at: DateTime<Utc>) -> Option<LogContext> {
        let idx = self.entries.partition_point(|entry| entry.effective_at <= at);
        idx.checked_sub(1)
            .and_then(|i| self.entries.get(i))
            .and_then(|entry| entry.context.clone())
    }

    pub fn latest(&self) -> Option<&LogContext> {
        self.entries.back().and_then(|entry| entry.context.as_ref())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
