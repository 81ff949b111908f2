use crate::translator::{self, split_columns};
use ct_core::{ChainKey, Counters, ListedRule, ParseError, Position, RuleEntry};
use serde::Serialize;

/// A parsed `iptables -L` dump of one chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Listing {
    pub key: ChainKey,
    /// Default policy; `None` for chains that have none.
    pub policy: Option<String>,
    pub rows: Vec<ListedRule>,
}

impl Listing {
    pub fn opaque_count(&self) -> usize {
        self.rows.iter().filter(|row| row.is_opaque()).count()
    }

    pub fn totals(&self) -> Counters {
        self.rows.iter().fold(Counters::default(), |acc, row| Counters {
            packets: acc.packets.saturating_add(row.counters.packets),
            bytes: acc.bytes.saturating_add(row.counters.bytes),
        })
    }
}

/// Parses a chain listing.
///
/// A missing or foreign header fails the whole listing. Rows that cannot be
/// understood are kept as opaque entries so one odd rule never hides the rest
/// of the chain.
pub fn parse_listing(key: ChainKey, text: &str) -> Result<Listing, ParseError> {
    let mut lines = text.lines().filter(|line| !line.trim().is_empty());

    let title = lines
        .next()
        .ok_or_else(|| ParseError::BadHeader("listing is empty".to_string()))?;
    let policy = parse_title(key, title)?;

    let legend = lines
        .next()
        .ok_or_else(|| ParseError::BadHeader("column legend is missing".to_string()))?;
    if !legend.trim_start().starts_with("num") {
        return Err(ParseError::BadHeader(legend.to_string()));
    }

    let rows = lines
        .enumerate()
        .map(|(index, line)| parse_listed_row(key, Position::from_index(index), line))
        .collect();

    Ok(Listing { key, policy, rows })
}

fn parse_title(key: ChainKey, title: &str) -> Result<Option<String>, ParseError> {
    let mut words = title.split_whitespace();
    if words.next() != Some("Chain") {
        return Err(ParseError::BadHeader(title.to_string()));
    }
    let name = words
        .next()
        .ok_or_else(|| ParseError::BadHeader(title.to_string()))?;
    if name != key.chain.as_str() {
        return Err(ParseError::WrongChain {
            expected: key.chain,
            found: name.to_string(),
        });
    }

    // "(policy ACCEPT 0 packets, 0 bytes)" or "(2 references)"
    match (words.next(), words.next()) {
        (Some("(policy"), Some(policy)) => Ok(Some(policy.trim_end_matches(')').to_string())),
        _ => Ok(None),
    }
}

fn parse_listed_row(key: ChainKey, ordinal: Position, line: &str) -> ListedRule {
    let raw = line.trim_end().to_string();
    let entry = translator::parse_row(key, line).and_then(|row| {
        if row.position != ordinal {
            return Err(ParseError::PositionMismatch {
                expected: ordinal,
                found: row.position.to_string(),
            });
        }
        Ok(row)
    });

    match entry {
        Ok(row) => ListedRule {
            position: ordinal,
            counters: row.counters,
            raw,
            entry: RuleEntry::Parsed { rule: row.rule },
        },
        Err(e) => {
            tracing::warn!(%key, position = %ordinal, error = %e, line = %raw, "unparsed listing row");
            ListedRule {
                position: ordinal,
                counters: best_effort_counters(line),
                raw,
                entry: RuleEntry::Opaque {
                    reason: e.to_string(),
                },
            }
        }
    }
}

fn best_effort_counters(line: &str) -> Counters {
    let (columns, _) = split_columns(line, 3);
    match columns.as_slice() {
        [_, packets, bytes] => Counters {
            packets: packets.parse().unwrap_or(0),
            bytes: bytes.parse().unwrap_or(0),
        },
        _ => Counters::default(),
    }
}

/// The row text with position and counters removed, for comparisons that
/// must not change as traffic flows.
pub fn row_body(row: &ListedRule) -> String {
    match &row.entry {
        RuleEntry::Parsed { rule } => translator::to_command_args(rule)
            .into_iter()
            .chain(rule.spec().remainder.clone())
            .collect::<Vec<_>>()
            .join(" "),
        RuleEntry::Opaque { .. } => {
            let (columns, rest) = split_columns(&row.raw, 3);
            let skip = if columns.len() == 3
                && columns[1].chars().all(|c| c.is_ascii_digit())
                && columns[2].chars().all(|c| c.is_ascii_digit())
            {
                rest.to_string()
            } else {
                let (_, rest) = split_columns(&row.raw, 1);
                rest.to_string()
            };
            skip.split_whitespace().collect::<Vec<_>>().join(" ")
        }
    }
}
