//! Attribution of leader fills to followed positions.
//!
//! Matching only ever uses the leader position id and the size recorded on
//! the mapping the last time the engine acted on it. Everything here is pure;
//! the engine gathers the snapshot and mappings and applies the outcome.

use rust_decimal::Decimal;

use crate::models::{AccountState, Fill, MappingStatus, Position, PositionMapping};

/// Thresholds used when classifying decreases.
#[derive(Debug, Clone, Copy)]
pub struct MatchRules {
    /// Remaining fraction of `last_known_size` below which the position is treated as gone
    pub near_zero_close_ratio: Decimal,
    /// Reduce ratio at or above which a reduce becomes a close
    pub promote_close_ratio: Decimal,
    /// Venue reuses position ids when a position is reopened
    pub virtual_ids: bool,
}

/// A leader position of the fill's symbol and side with its latest mapping.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub position: Position,
    pub mapping: Option<PositionMapping>,
}

/// How a fill relates to the follower's copies.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    /// Leader opened a position after tracking began
    NewOpen { position: Position },
    /// Leader grew a followed position
    Add {
        mapping: PositionMapping,
        position: Option<Position>,
        current_size: Decimal,
    },
    /// Leader shrank a followed position by `ratio`
    Reduce {
        mapping: PositionMapping,
        ratio: Decimal,
        current_size: Decimal,
    },
    /// Leader fully exited a followed position
    Close { mapping: PositionMapping },
    /// Fill is not followed
    Skip { reason: String },
}

impl MatchOutcome {
    fn skip(reason: impl Into<String>) -> Self {
        Self::Skip { reason: reason.into() }
    }
}

/// Classify an increasing fill (open or add).
///
/// Rounds, in order: an unmapped or closed leader position is a new open;
/// otherwise the active mapping that grew the most takes the add; otherwise
/// a single active mapping takes it as a fallback. Growth on an ignored
/// position is never followed.
pub fn match_increase(
    fill: &Fill,
    state: &AccountState,
    candidates: &[Candidate],
    active: &[PositionMapping],
    rules: &MatchRules,
) -> MatchOutcome {
    for candidate in candidates {
        let fresh = match &candidate.mapping {
            None => true,
            Some(m) => match m.status {
                MappingStatus::Closed => true,
                // A reused virtual id that opens from flat is a new position
                MappingStatus::Ignored => rules.virtual_ids && fill.is_fresh_open(),
                MappingStatus::Active => false,
            },
        };
        if fresh {
            return MatchOutcome::NewOpen {
                position: candidate.position.clone(),
            };
        }
    }

    let grown = active
        .iter()
        .map(|m| (m, state.size_of(&m.leader_position)))
        .filter(|(m, current)| *current > m.last_known_size)
        .max_by(|(a, a_size), (b, b_size)| (*a_size - a.last_known_size).cmp(&(*b_size - b.last_known_size)));

    if let Some((mapping, current_size)) = grown {
        return MatchOutcome::Add {
            mapping: mapping.clone(),
            position: state.position(&mapping.leader_position).cloned(),
            current_size,
        };
    }

    let ignored_grew = candidates.iter().any(|c| {
        c.mapping
            .as_ref()
            .is_some_and(|m| m.status == MappingStatus::Ignored && c.position.size > m.last_known_size)
    });
    if ignored_grew {
        return MatchOutcome::skip("add to a position that pre-dates tracking");
    }

    match active {
        [only] => MatchOutcome::Add {
            mapping: only.clone(),
            position: state.position(&only.leader_position).cloned(),
            current_size: state.size_of(&only.leader_position),
        },
        [] => MatchOutcome::skip(format!("no followed {} {} position", fill.symbol, fill.position_side)),
        many => MatchOutcome::skip(format!(
            "ambiguous add: {} followed {} {} positions and none grew",
            many.len(),
            fill.symbol,
            fill.position_side
        )),
    }
}

/// Classify a decreasing fill (reduce or close) by reverse lookup over the
/// active mappings of the fill's symbol and side.
pub fn match_decrease(
    fill: &Fill,
    state: &AccountState,
    active: &[PositionMapping],
    rules: &MatchRules,
) -> MatchOutcome {
    // (mapping, decrease, ratio, current size)
    let mut best: Option<(&PositionMapping, Decimal, Decimal, Decimal)> = None;

    for mapping in active {
        let current = state.size_of(&mapping.leader_position);

        let (decrease, ratio) = if current <= Decimal::ZERO {
            (mapping.last_known_size.max(fill.size), Decimal::ONE)
        } else if mapping.last_known_size <= Decimal::ZERO {
            let before = current + fill.size;
            (fill.size, fill.size / before)
        } else if current < mapping.last_known_size * rules.near_zero_close_ratio {
            (mapping.last_known_size - current, Decimal::ONE)
        } else if current < mapping.last_known_size {
            let decrease = mapping.last_known_size - current;
            (decrease, decrease / mapping.last_known_size)
        } else {
            continue;
        };

        if best.map_or(true, |(_, d, _, _)| decrease > d) {
            best = Some((mapping, decrease, ratio, current));
        }
    }

    let Some((mapping, _, ratio, current_size)) = best else {
        return MatchOutcome::skip(if active.is_empty() {
            format!("no followed {} {} position", fill.symbol, fill.position_side)
        } else {
            format!("no followed {} {} position decreased", fill.symbol, fill.position_side)
        });
    };

    if ratio >= rules.promote_close_ratio {
        MatchOutcome::Close {
            mapping: mapping.clone(),
        }
    } else {
        MatchOutcome::Reduce {
            mapping: mapping.clone(),
            ratio,
            current_size,
        }
    }
}
