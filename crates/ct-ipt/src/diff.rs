use crate::listing::row_body;
use ct_core::ListedRule;
use serde::Serialize;
use similar::{ChangeTag, TextDiff};

/// Line diff between two listings of the same chain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ListingDiff {
    pub added: usize,
    pub removed: usize,
    /// `+`/`-`/` ` prefixed rendering of every row.
    pub unified: String,
}

impl ListingDiff {
    pub fn is_empty(&self) -> bool {
        self.added == 0 && self.removed == 0
    }
}

/// Compares two rule sequences by content, ignoring positions and counters.
pub fn diff_rules(old: &[ListedRule], new: &[ListedRule]) -> ListingDiff {
    let old_text = listing_text(old);
    let new_text = listing_text(new);
    let diff = TextDiff::from_lines(&old_text, &new_text);

    let mut result = ListingDiff::default();
    for change in diff.iter_all_changes() {
        let sign = match change.tag() {
            ChangeTag::Delete => {
                result.removed += 1;
                '-'
            }
            ChangeTag::Insert => {
                result.added += 1;
                '+'
            }
            ChangeTag::Equal => ' ',
        };
        result.unified.push(sign);
        result.unified.push_str(change.value());
    }

    result
}

fn listing_text(rows: &[ListedRule]) -> String {
    rows.iter().map(|row| row_body(row) + "\n").collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translator::render_listing_line;
    use crate::listing::parse_listing;
    use ct_core::{Chain, ChainKey, Position, RuleForm, Table};

    fn key() -> ChainKey {
        ChainKey::new(Table::Filter, Chain::Input).unwrap()
    }

    fn listing(ports: &[&str]) -> Vec<ListedRule> {
        let mut text = String::from(
            "Chain INPUT (policy ACCEPT 0 packets, 0 bytes)\nnum pkts bytes target prot opt in out source destination\n",
        );
        for (i, port) in ports.iter().enumerate() {
            let rule = RuleForm {
                protocol: Some("tcp".into()),
                destination_port: Some(port.to_string()),
                ..Default::default()
            }
            .into_rule(key())
            .unwrap();
            text.push_str(&render_listing_line(Position::from_index(i), &rule));
            text.push('\n');
        }
        parse_listing(key(), &text).unwrap().rows
    }

    #[test]
    fn identical_listings_have_no_diff() {
        let diff = diff_rules(&listing(&["22", "80"]), &listing(&["22", "80"]));
        assert!(diff.is_empty());
    }

    #[test]
    fn counts_added_and_removed_rows() {
        let diff = diff_rules(&listing(&["22", "80", "443"]), &listing(&["22", "443", "8080"]));
        assert_eq!(diff.added, 1);
        assert_eq!(diff.removed, 1);
        assert!(diff.unified.contains("--dport 80 -j ACCEPT"));
        assert!(diff.unified.lines().any(|l| l.starts_with('+') && l.contains("8080")));
        assert!(diff.unified.lines().any(|l| l.starts_with('-') && l.contains("dport 80 ")));
    }

    #[test]
    fn positions_do_not_count_as_changes() {
        let diff = diff_rules(&listing(&["22", "80"]), &listing(&["80"]));
        assert_eq!(diff.removed, 1);
        assert_eq!(diff.added, 0);
    }
}
