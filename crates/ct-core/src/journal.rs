use crate::model::{ChainKey, Rule};
use crate::store::Position;
use std::fmt;

/// A single kernel rule-table change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    /// Insert `rule` at `at`, or append it when no position is given.
    Insert { rule: Rule, at: Option<Position> },
    Delete { position: Position },
}

impl Mutation {
    pub fn verb(&self) -> &'static str {
        match self {
            Mutation::Insert { at: None, .. } => "append",
            Mutation::Insert { at: Some(_), .. } => "insert",
            Mutation::Delete { .. } => "delete",
        }
    }
}

impl fmt::Display for Mutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mutation::Insert { rule, at: None } => write!(f, "append {}", rule.target()),
            Mutation::Insert { rule, at: Some(at) } => {
                write!(f, "insert {} at {}", rule.target(), at)
            }
            Mutation::Delete { position } => write!(f, "delete rule {}", position),
        }
    }
}

/// A mutation that reached the kernel, with what is needed to undo it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppliedMutation {
    Inserted {
        key: ChainKey,
        rule: Rule,
        /// Where the rule landed, as seen by the listing that followed.
        position: Option<Position>,
    },
    Deleted {
        key: ChainKey,
        position: Position,
        /// The deleted rule, when its listing row could be parsed.
        rule: Option<Rule>,
    },
}

impl AppliedMutation {
    pub fn key(&self) -> ChainKey {
        match self {
            AppliedMutation::Inserted { key, .. } | AppliedMutation::Deleted { key, .. } => *key,
        }
    }
}

/// Compensating operation that reverses an applied mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compensation {
    /// Remove the rule that was inserted; located again by content.
    RemoveInserted {
        key: ChainKey,
        rule: Rule,
        hint: Option<Position>,
    },
    /// Put a deleted rule back where it was.
    Reinsert {
        key: ChainKey,
        rule: Rule,
        at: Position,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UndoError {
    #[error("nothing to undo")]
    Empty,

    #[error("rule {position} in {key} cannot be restored: {reason}")]
    NotReversible {
        key: ChainKey,
        position: Position,
        reason: &'static str,
    },

    #[error("the rule to remove is no longer in {key}: {rule}")]
    Missing { key: ChainKey, rule: String },
}

impl AppliedMutation {
    pub fn compensation(&self) -> Result<Compensation, UndoError> {
        match self {
            AppliedMutation::Inserted {
                key,
                rule,
                position,
            } => Ok(Compensation::RemoveInserted {
                key: *key,
                rule: rule.clone(),
                hint: *position,
            }),
            AppliedMutation::Deleted {
                key,
                position,
                rule,
            } => {
                let rule = rule.as_ref().ok_or(UndoError::NotReversible {
                    key: *key,
                    position: *position,
                    reason: "its listing row was not understood",
                })?;
                if !rule.is_reproducible() {
                    return Err(UndoError::NotReversible {
                        key: *key,
                        position: *position,
                        reason: "it carries match options this tool does not model",
                    });
                }
                Ok(Compensation::Reinsert {
                    key: *key,
                    rule: rule.clone(),
                    at: *position,
                })
            }
        }
    }
}

/// Most-recent-last record of mutations applied during a session.
#[derive(Debug, Default)]
pub struct MutationJournal {
    entries: Vec<AppliedMutation>,
    limit: usize,
}

impl MutationJournal {
    pub fn new(limit: usize) -> Self {
        Self {
            entries: Vec::new(),
            limit,
        }
    }

    pub fn record(&mut self, applied: AppliedMutation) {
        self.entries.push(applied);
        if self.limit > 0 && self.entries.len() > self.limit {
            self.entries.remove(0);
        }
    }

    pub fn last(&self) -> Option<&AppliedMutation> {
        self.entries.last()
    }

    pub fn pop(&mut self) -> Option<AppliedMutation> {
        self.entries.pop()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Compensations for every entry, newest first.
    pub fn rollback_operations(&self) -> Vec<Result<Compensation, UndoError>> {
        self.entries
            .iter()
            .rev()
            .map(AppliedMutation::compensation)
            .collect()
    }
}
