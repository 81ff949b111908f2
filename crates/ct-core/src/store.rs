//! Cached, position-addressable view of one chain's rules.
//!
//! The kernel is the source of truth; a [`RuleStore`] only mirrors the most
//! recent listing. Positions handed out by the store carry the listing
//! generation they were taken from, so a delete issued against an outdated
//! listing is rejected instead of removing whichever rule moved into place.

use crate::error::{StalePositionError, StaleReason};
use crate::model::{ChainKey, Rule};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 1-based ordinal of a rule inside its chain, as reported by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Position(u32);

impl Position {
    pub fn new(value: u32) -> Option<Self> {
        (value > 0).then_some(Self(value))
    }

    /// Position of the rule at a 0-based index.
    pub fn from_index(index: usize) -> Self {
        Self(u32::try_from(index).map_or(u32::MAX, |i| i.saturating_add(1)))
    }

    pub fn get(&self) -> u32 {
        self.0
    }

    pub fn index(&self) -> usize {
        self.0 as usize - 1
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A position stamped with the listing it was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PositionRef {
    pub key: ChainKey,
    pub position: Position,
    pub generation: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    pub packets: u64,
    pub bytes: u64,
}

/// What a listing row turned out to be.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RuleEntry {
    Parsed { rule: Rule },
    /// The row could not be understood; the raw text is all there is.
    Opaque { reason: String },
}

/// One row of a chain listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListedRule {
    pub position: Position,
    pub counters: Counters,
    pub raw: String,
    pub entry: RuleEntry,
}

impl ListedRule {
    pub fn rule(&self) -> Option<&Rule> {
        match &self.entry {
            RuleEntry::Parsed { rule } => Some(rule),
            RuleEntry::Opaque { .. } => None,
        }
    }

    pub fn is_opaque(&self) -> bool {
        matches!(self.entry, RuleEntry::Opaque { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Freshness {
    /// Never listed.
    Empty,
    /// Mirrors the most recent listing.
    Fresh,
    /// A mutation happened since the last listing.
    Stale,
}

#[derive(Debug, Clone)]
pub struct RuleStore {
    key: ChainKey,
    rules: Vec<ListedRule>,
    policy: Option<String>,
    generation: u64,
    freshness: Freshness,
}

impl RuleStore {
    pub fn new(key: ChainKey) -> Self {
        Self {
            key,
            rules: Vec::new(),
            policy: None,
            generation: 0,
            freshness: Freshness::Empty,
        }
    }

    pub fn key(&self) -> ChainKey {
        self.key
    }

    /// Replaces the whole cached sequence with a fresh listing.
    pub fn refresh(&mut self, rules: Vec<ListedRule>, policy: Option<String>) -> &[ListedRule] {
        self.rules = rules;
        self.policy = policy;
        self.generation += 1;
        self.freshness = Freshness::Fresh;
        tracing::debug!(
            key = %self.key,
            generation = self.generation,
            rules = self.rules.len(),
            "rule store refreshed"
        );
        &self.rules
    }

    /// Marks every handed-out position as unusable until the next refresh.
    pub fn invalidate(&mut self) {
        if self.freshness == Freshness::Fresh {
            self.freshness = Freshness::Stale;
        }
    }

    pub fn rules(&self) -> &[ListedRule] {
        &self.rules
    }

    pub fn policy(&self) -> Option<&str> {
        self.policy.as_deref()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn freshness(&self) -> Freshness {
        self.freshness
    }

    pub fn is_fresh(&self) -> bool {
        self.freshness == Freshness::Fresh
    }

    /// Position reference for the rule at a 0-based index of the current listing.
    pub fn position_of(&self, index: usize) -> Option<PositionRef> {
        (index < self.rules.len()).then(|| PositionRef {
            key: self.key,
            position: Position::from_index(index),
            generation: self.generation,
        })
    }

    /// Position reference for a raw 1-based position of the current listing.
    pub fn reference(&self, position: Position) -> PositionRef {
        PositionRef {
            key: self.key,
            position,
            generation: self.generation,
        }
    }

    /// Reference to the last rule matching `predicate`.
    pub fn rfind(&self, predicate: impl Fn(&ListedRule) -> bool) -> Option<PositionRef> {
        self.rules
            .iter()
            .rposition(predicate)
            .and_then(|index| self.position_of(index))
    }

    /// Checks that a reference still points at the rule it was taken for.
    pub fn confirm(&self, reference: &PositionRef) -> Result<&ListedRule, StalePositionError> {
        self.check_listing(reference)?;
        self.rules
            .get(reference.position.index())
            .ok_or_else(|| self.out_of_range(reference))
    }

    /// Checks a reference used as an insertion point, which may also name
    /// the slot just past the last rule.
    pub fn confirm_slot(&self, reference: &PositionRef) -> Result<(), StalePositionError> {
        self.check_listing(reference)?;
        if reference.position.index() > self.rules.len() {
            return Err(self.out_of_range(reference));
        }
        Ok(())
    }

    fn check_listing(&self, reference: &PositionRef) -> Result<(), StalePositionError> {
        let stale = |reason| StalePositionError {
            key: self.key,
            position: reference.position,
            reason,
        };

        if reference.key != self.key {
            return Err(stale(StaleReason::NotLoaded));
        }
        match self.freshness {
            Freshness::Empty => return Err(stale(StaleReason::NotLoaded)),
            Freshness::Stale => return Err(stale(StaleReason::Invalidated)),
            Freshness::Fresh => {}
        }
        if reference.generation != self.generation {
            return Err(stale(StaleReason::Superseded {
                seen: reference.generation,
                current: self.generation,
            }));
        }
        Ok(())
    }

    fn out_of_range(&self, reference: &PositionRef) -> StalePositionError {
        StalePositionError {
            key: self.key,
            position: reference.position,
            reason: StaleReason::OutOfRange {
                len: self.rules.len(),
            },
        }
    }
}
