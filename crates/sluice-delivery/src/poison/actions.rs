//! Redelivery action tables.
//!
//! An action table is written as `;`-separated `count:action` entries:
//!
//! ```text
//! 5:1000; 10:5000; 50:move(queue:dlq$)
//! ```
//!
//! `action` is a delay in milliseconds, `delete`, or
//! `move(queue|topic|same:name)`. In a move target `$` stands for the name of
//! the destination the message was consumed from, and `same` keeps its kind.
//! Counts are encounter counts and must strictly increase; `move` and
//! `delete` may only appear last. A no-op entry at count 1 is added when the
//! table does not start there.

use std::{fmt, time::Duration};

use sluice_core::{Destination, DestinationKind};
use thiserror::Error;

/// Grammar errors in a redelivery action table.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActionParseError {
    /// An entry is not of the form `count:action`.
    #[error("malformed entry '{entry}': {reason}")]
    Malformed {
        /// Offending entry
        entry: String,
        /// What is wrong with it
        reason: &'static str,
    },

    /// Counts start at 1.
    #[error("entry '{entry}' has count 0")]
    ZeroThreshold {
        /// Offending entry
        entry: String,
    },

    /// Counts must strictly increase.
    #[error("count {threshold} does not follow {previous}")]
    NotIncreasing {
        /// Count of the preceding entry
        previous: u32,
        /// Offending count
        threshold: u32,
    },

    /// `move` or `delete` was followed by further entries.
    #[error("terminal action at count {threshold} must be the last entry")]
    TerminalNotLast {
        /// Count of the terminal entry
        threshold: u32,
    },
}

/// What to do with a redelivered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedeliveryAction {
    /// Deliver normally.
    NoOp,
    /// Hold the message back, then deliver.
    Delay(Duration),
    /// Send the message elsewhere instead of delivering it.
    Move(Destination),
    /// Consume the message without delivering it.
    Delete,
}

impl RedeliveryAction {
    /// Whether this action ends the table.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Move(_) | Self::Delete)
    }
}

impl fmt::Display for RedeliveryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoOp => f.write_str("0"),
            Self::Delay(delay) => write!(f, "{}", delay.as_millis()),
            Self::Move(target) => write!(f, "move({}:{})", target.kind, target.name),
            Self::Delete => f.write_str("delete"),
        }
    }
}

/// One `count:action` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionEntry {
    /// Encounter count from which the action applies.
    pub threshold: u32,
    /// Action to execute.
    pub action: RedeliveryAction,
}

/// Parsed, validated action table. Never empty; the first entry always has
/// threshold 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionTable {
    entries: Vec<ActionEntry>,
}

impl Default for ActionTable {
    fn default() -> Self {
        Self { entries: vec![ActionEntry { threshold: 1, action: RedeliveryAction::NoOp }] }
    }
}

impl ActionTable {
    /// Parses `spec` for messages consumed from `origin`.
    ///
    /// # Errors
    ///
    /// Returns an [`ActionParseError`] describing the first grammar violation.
    pub fn parse(spec: &str, origin: &Destination) -> Result<Self, ActionParseError> {
        let mut entries: Vec<ActionEntry> = Vec::new();

        for raw in spec.split(';').map(str::trim).filter(|entry| !entry.is_empty()) {
            let entry = parse_entry(raw, origin)?;

            if let Some(previous) = entries.last() {
                if previous.action.is_terminal() {
                    return Err(ActionParseError::TerminalNotLast {
                        threshold: previous.threshold,
                    });
                }
                if entry.threshold <= previous.threshold {
                    return Err(ActionParseError::NotIncreasing {
                        previous: previous.threshold,
                        threshold: entry.threshold,
                    });
                }
            }
            entries.push(entry);
        }

        if entries.first().map_or(true, |first| first.threshold != 1) {
            entries.insert(0, ActionEntry { threshold: 1, action: RedeliveryAction::NoOp });
        }

        Ok(Self { entries })
    }

    /// Entries in threshold order.
    pub fn entries(&self) -> &[ActionEntry] {
        &self.entries
    }

    /// Entry at `index`, clamped to the last entry.
    pub fn entry(&self, index: usize) -> &ActionEntry {
        let last = self.entries.len().saturating_sub(1);
        &self.entries[index.min(last)]
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Always false; tables hold at least the count-1 entry.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Moves `cursor` forward past every entry whose threshold has been
    /// reached by `encounter` and returns the new cursor.
    pub fn advance(&self, mut cursor: usize, encounter: u32) -> usize {
        while cursor + 1 < self.entries.len() && self.entries[cursor + 1].threshold <= encounter {
            cursor += 1;
        }
        cursor.min(self.entries.len().saturating_sub(1))
    }
}

impl fmt::Display for ActionTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, entry) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}:{}", entry.threshold, entry.action)?;
        }
        Ok(())
    }
}

fn parse_entry(raw: &str, origin: &Destination) -> Result<ActionEntry, ActionParseError> {
    let malformed = |reason| ActionParseError::Malformed { entry: raw.to_string(), reason };

    let (count, action) = raw.split_once(':').ok_or_else(|| malformed("expected count:action"))?;
    let threshold: u32 = count.trim().parse().map_err(|_| malformed("count is not a number"))?;
    if threshold == 0 {
        return Err(ActionParseError::ZeroThreshold { entry: raw.to_string() });
    }

    let action = action.trim();
    let lowered = action.to_ascii_lowercase();
    let action = if lowered == "delete" {
        RedeliveryAction::Delete
    } else if lowered.starts_with("move") {
        let inner = action[4..]
            .trim()
            .strip_prefix('(')
            .and_then(|rest| rest.strip_suffix(')'))
            .ok_or_else(|| malformed("move target must be in parentheses"))?;
        let (kind, name) =
            inner.split_once(':').ok_or_else(|| malformed("move target must be kind:name"))?;
        let kind = match kind.trim().to_ascii_lowercase().as_str() {
            "queue" => DestinationKind::Queue,
            "topic" => DestinationKind::Topic,
            "same" => origin.kind,
            _ => return Err(malformed("move kind must be queue, topic or same")),
        };
        let name = name.trim();
        if name.is_empty() {
            return Err(malformed("move target name is empty"));
        }
        RedeliveryAction::Move(Destination::new(kind, name.replace('$', &origin.name)))
    } else {
        let millis: u64 = action.parse().map_err(|_| malformed("unknown action"))?;
        if millis == 0 {
            RedeliveryAction::NoOp
        } else {
            RedeliveryAction::Delay(Duration::from_millis(millis))
        }
    };

    Ok(ActionEntry { threshold, action })
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn orders() -> Destination {
        Destination::queue("Orders")
    }

    #[test]
    fn delays_get_synthetic_noop_at_one() {
        let table = ActionTable::parse("5:1000; 10:5000", &orders()).unwrap();

        assert_eq!(
            table.entries(),
            &[
                ActionEntry { threshold: 1, action: RedeliveryAction::NoOp },
                ActionEntry {
                    threshold: 5,
                    action: RedeliveryAction::Delay(Duration::from_millis(1000))
                },
                ActionEntry {
                    threshold: 10,
                    action: RedeliveryAction::Delay(Duration::from_millis(5000))
                },
            ]
        );
    }

    #[test]
    fn move_target_substitutes_origin_name() {
        let table = ActionTable::parse("5:move(queue:dlq$)", &orders()).unwrap();

        assert_eq!(table.entry(1).action, RedeliveryAction::Move(Destination::queue("dlqOrders")));
    }

    #[test]
    fn same_kind_follows_origin() {
        let origin = Destination::topic("prices");
        let table = ActionTable::parse("3:move(same:$.poison)", &origin).unwrap();

        assert_eq!(
            table.entry(1).action,
            RedeliveryAction::Move(Destination::topic("prices.poison"))
        );
    }

    #[test]
    fn explicit_first_entry_is_kept() {
        let table = ActionTable::parse("1:50; 3:delete", &orders()).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.entry(0).action, RedeliveryAction::Delay(Duration::from_millis(50)));
        assert_eq!(table.entry(1).action, RedeliveryAction::Delete);
    }

    #[test]
    fn empty_spec_is_single_noop() {
        let table = ActionTable::parse("  ", &orders()).unwrap();
        assert_eq!(table, ActionTable::default());
    }

    #[test]
    fn rejects_terminal_before_end() {
        let error = ActionParseError::TerminalNotLast { threshold: 2 };
        assert_eq!(ActionTable::parse("2:delete; 4:100", &orders()), Err(error));
    }

    #[test]
    fn rejects_duplicate_and_decreasing_counts() {
        assert!(matches!(
            ActionTable::parse("3:100; 3:200", &orders()),
            Err(ActionParseError::NotIncreasing { previous: 3, threshold: 3 })
        ));
        assert!(matches!(
            ActionTable::parse("5:100; 2:200", &orders()),
            Err(ActionParseError::NotIncreasing { previous: 5, threshold: 2 })
        ));
    }

    #[test]
    fn rejects_malformed_entries() {
        for spec in ["5", "x:100", "5:later", "5:move(queue)", "5:move(box:a)", "5:move(queue:)"] {
            assert!(
                matches!(ActionTable::parse(spec, &orders()), Err(ActionParseError::Malformed { .. })),
                "{spec} should be rejected"
            );
        }
        assert!(matches!(
            ActionTable::parse("0:100", &orders()),
            Err(ActionParseError::ZeroThreshold { .. })
        ));
    }

    #[test]
    fn cursor_advances_on_threshold() {
        let table = ActionTable::parse("2:10; 4:20", &orders()).unwrap();

        assert_eq!(table.advance(0, 1), 0);
        assert_eq!(table.advance(0, 2), 1);
        assert_eq!(table.advance(1, 3), 1);
        assert_eq!(table.advance(1, 4), 2);
        assert_eq!(table.advance(2, 40), 2);
        assert_eq!(table.advance(0, 9), 2);
    }

    #[test]
    fn display_renders_parseable_table() {
        let table = ActionTable::parse("5:1000;7:move(topic:x)", &orders()).unwrap();
        assert_eq!(table.to_string(), "1:0; 5:1000; 7:move(topic:x)");
        assert_eq!(ActionTable::parse(&table.to_string(), &orders()).unwrap(), table);
    }

    proptest! {
        #[test]
        fn parsed_tables_uphold_invariants(spec in "[0-9:;a-z()$ ]{0,40}") {
            if let Ok(table) = ActionTable::parse(&spec, &orders()) {
                prop_assert_eq!(table.entry(0).threshold, 1);
                for pair in table.entries().windows(2) {
                    prop_assert!(pair[0].threshold < pair[1].threshold);
                    prop_assert!(!pair[0].action.is_terminal());
                }
            }
        }

        #[test]
        fn increasing_delays_always_parse(counts in prop::collection::btree_set(1u32..500, 1..8)) {
            let spec = counts
                .iter()
                .map(|count| format!("{count}:{}", count * 10))
                .collect::<Vec<_>>()
                .join("; ");
            let table = ActionTable::parse(&spec, &orders()).unwrap();
            let expected = counts.len() + usize::from(!counts.contains(&1));
            prop_assert_eq!(table.len(), expected);
        }
    }
}
