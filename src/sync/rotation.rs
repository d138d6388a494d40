// src/sync/rotation.rs
//! Full-reversal round-robin.
//!
//! The remote service caps calls per minute (and, separately, per batched
//! request), so not every entity fits in one cycle. Each cycle takes the
//! longest prefix of the current order that fits the call budget, then the
//! whole order is reversed for the next cycle. Entities at the tail of one
//! cycle's order sit at the head of the next.
//!
//! This is a static heuristic, not an adaptive scheduler: it does not react
//! to quota rejections or weight entities by importance.

use crate::sync::types::Entity;

#[derive(Debug, Clone)]
pub struct RotationPolicy {
    order: Vec<Entity>,
    call_budget: usize,
    calls_per_entity: usize,
    cycle: u64,
}

impl RotationPolicy {
    /// `calls_per_entity` of zero is treated as one.
    pub fn new(entities: Vec<Entity>, call_budget: usize, calls_per_entity: usize) -> Self {
        Self {
            order: entities,
            call_budget,
            calls_per_entity: calls_per_entity.max(1),
            cycle: 0,
        }
    }

    /// Entities that fit in one cycle's budget.
    pub fn capacity(&self) -> usize {
        (self.call_budget / self.calls_per_entity).min(self.order.len())
    }

    /// True when every entity is polled at least once in any two consecutive
    /// cycles, i.e. at least half of the set fits per cycle.
    pub fn starvation_bound(&self) -> bool {
        let n = self.order.len();
        self.capacity() >= n.div_ceil(2)
    }

    /// Cycles completed so far.
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    /// Full order the next selection is drawn from.
    pub fn order(&self) -> &[Entity] {
        &self.order
    }

    /// Selection for the upcoming cycle. Does not advance the rotation.
    pub fn select(&self) -> Vec<Entity> {
        self.order[..self.capacity()].to_vec()
    }

    /// Reverse the full order for the next cycle.
    pub fn advance(&mut self) {
        self.order.reverse();
        self.cycle += 1;
    }

    /// `select` followed by `advance`.
    pub fn next_cycle(&mut self) -> Vec<Entity> {
        let picked = self.select();
        self.advance();
        picked
    }
}
