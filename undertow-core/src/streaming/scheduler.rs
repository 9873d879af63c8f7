//! Piece priority planning.
//!
//! A [`PriorityPlan`] merges reader demand, outstanding buffer demand and
//! awaited pieces into one priority vector. Its [`Fingerprint`] lets the
//! session skip pushing a vector identical to the last one.

use std::collections::BTreeMap;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::fmt::Write as _;
use std::hash::{Hash, Hasher};

use crate::engine::PiecePriority;
use crate::torrent::{PieceRange, PieceSet};

/// Priority of a piece `position` pieces ahead of a reader's cursor.
pub fn falloff(position: u32) -> PiecePriority {
    match position {
        0 => PiecePriority::Head,
        1..=2 => PiecePriority::Next,
        3..=5 => PiecePriority::Near,
        6..=9 => PiecePriority::Demand,
        _ => PiecePriority::Trailing,
    }
}

/// Everything a plan is derived from.
#[derive(Debug, Clone, Copy)]
pub struct PlanInputs<'a> {
    pub piece_count: u32,
    /// Demand window of every open reader
    pub reader_ranges: &'a [PieceRange],
    /// Pieces a reader is blocked on
    pub awaiting: &'a PieceSet,
    /// Outstanding buffer demand
    pub demand: &'a PieceSet,
    /// Pieces of chosen files, filled at background level. Empty for
    /// memory-backed sessions.
    pub chosen: &'a [PieceRange],
}

/// One reconciliation's priority vector.
#[derive(Debug, Clone)]
pub struct PriorityPlan {
    priorities: Vec<PiecePriority>,
    reader_pieces: Vec<u32>,
    tracked: BTreeMap<u32, f64>,
}

impl PriorityPlan {
    /// Builds the vector.
    ///
    /// Reader windows fall off with distance from the cursor and awaited
    /// pieces inside them jump to the top level. Demand pieces are raised to
    /// [`PiecePriority::Demand`] unless already higher. Overlapping readers
    /// keep the higher level.
    pub fn build(inputs: &PlanInputs<'_>) -> Self {
        let mut priorities = vec![PiecePriority::Skip; inputs.piece_count as usize];
        let mut tracked = BTreeMap::new();

        for range in inputs.reader_ranges {
            for piece in range.iter() {
                let Some(slot) = priorities.get_mut(piece as usize) else {
                    break;
                };
                let level = if inputs.awaiting.contains(piece) {
                    PiecePriority::Overdue
                } else {
                    falloff(piece - range.begin)
                };
                *slot = (*slot).max(level);
                tracked.insert(piece, 0.0);
            }
        }

        for piece in inputs.demand.to_vec() {
            if let Some(slot) = priorities.get_mut(piece as usize) {
                *slot = (*slot).max(PiecePriority::Demand);
                tracked.insert(piece, 0.0);
            }
        }

        let reader_pieces = priorities
            .iter()
            .enumerate()
            .filter(|(_, priority)| **priority > PiecePriority::Skip)
            .map(|(piece, _)| piece as u32)
            .collect();

        for range in inputs.chosen {
            for piece in range.iter() {
                if let Some(slot) = priorities.get_mut(piece as usize) {
                    if *slot == PiecePriority::Skip {
                        *slot = PiecePriority::Background;
                    }
                }
            }
        }

        Self {
            priorities,
            reader_pieces,
            tracked,
        }
    }

    pub fn priorities(&self) -> &[PiecePriority] {
        &self.priorities
    }

    /// Pieces demanded by readers or buffering, ascending.
    pub fn reader_pieces(&self) -> &[u32] {
        &self.reader_pieces
    }

    /// Progress of demanded pieces, to be filled from the engine.
    pub fn tracked_mut(&mut self) -> &mut BTreeMap<u32, f64> {
        &mut self.tracked
    }

    pub fn fingerprint(&self) -> Fingerprint {
        let mut first = None;
        let mut last = None;
        let mut count = 0;

        for (piece, priority) in self.priorities.iter().enumerate() {
            if *priority == PiecePriority::Skip {
                continue;
            }
            let entry = (piece as u32, *priority);
            first.get_or_insert(entry);
            last = Some(entry);
            count += 1;
        }

        let mut hasher = DefaultHasher::new();
        self.priorities.hash(&mut hasher);

        Fingerprint {
            first,
            last,
            count,
            digest: hasher.finish(),
        }
    }

    /// Demanded pieces as `[index:priority:percent, ...]`, contiguous runs
    /// grouped in brackets.
    pub fn status_line(&self) -> String {
        let mut status = String::new();
        let mut previous: Option<u32> = None;

        for (piece, priority) in self.priorities.iter().enumerate() {
            if *priority <= PiecePriority::Background {
                continue;
            }
            let piece = piece as u32;
            let percent = self
                .tracked
                .get(&piece)
                .map_or(0, |fraction| (fraction * 100.0) as u32);

            match previous {
                None => status.push('['),
                Some(prev) if piece > prev + 1 => status.push_str("] ["),
                Some(_) => status.push_str(", "),
            }
            let _ = write!(status, "{}:{}:{}", piece, priority.as_u8(), percent);
            previous = Some(piece);
        }

        if previous.is_some() {
            status.push(']');
        }
        status
    }
}

/// Compact identity of a priority vector.
///
/// First and last prioritized piece with their levels, the prioritized count
/// and a digest of the full vector. Two plans with equal fingerprints push
/// the same vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub first: Option<(u32, PiecePriority)>,
    pub last: Option<(u32, PiecePriority)>,
    pub count: u32,
    pub digest: u64,
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let edge = |entry: Option<(u32, PiecePriority)>| match entry {
            Some((piece, priority)) => format!("{}:{}", piece, priority.as_u8()),
            None => "-1:0".to_string(),
        };
        write!(
            f,
            "{};{};{}#{:016x}",
            edge(self.first),
            edge(self.last),
            self.count,
            self.digest
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(
        piece_count: u32,
        readers: &[PieceRange],
        awaiting: &PieceSet,
        demand: &PieceSet,
        chosen: &[PieceRange],
    ) -> PriorityPlan {
        PriorityPlan::build(&PlanInputs {
            piece_count,
            reader_ranges: readers,
            awaiting,
            demand,
            chosen,
        })
    }

    #[test]
    fn test_falloff_ladder() {
        let levels: Vec<u8> = (0..12).map(|pos| falloff(pos).as_u8()).collect();
        assert_eq!(levels, vec![6, 5, 5, 4, 4, 4, 3, 3, 3, 3, 2, 2]);
    }

    #[test]
    fn test_reader_window_with_awaited_piece() {
        let awaiting = PieceSet::new(32);
        awaiting.insert(12);
        let demand = PieceSet::new(32);

        let plan = plan(32, &[PieceRange::new(10, 22)], &awaiting, &demand, &[]);
        let levels = plan.priorities();

        assert_eq!(levels[9], PiecePriority::Skip);
        assert_eq!(levels[10], PiecePriority::Head);
        assert_eq!(levels[11], PiecePriority::Next);
        assert_eq!(levels[12], PiecePriority::Overdue);
        assert_eq!(levels[13], PiecePriority::Near);
        assert_eq!(levels[19], PiecePriority::Demand);
        assert_eq!(levels[20], PiecePriority::Trailing);
        assert_eq!(levels[23], PiecePriority::Skip);
        assert_eq!(plan.reader_pieces().len(), 13);
    }

    #[test]
    fn test_demand_raised_unless_higher() {
        let awaiting = PieceSet::new(32);
        let demand = PieceSet::new(32);
        demand.insert(0);
        demand.insert(25);
        demand.insert(31);

        let plan = plan(32, &[PieceRange::new(0, 25)], &awaiting, &demand, &[]);
        let levels = plan.priorities();

        assert_eq!(levels[0], PiecePriority::Head);
        // Trailing reader piece lifted to demand level
        assert_eq!(levels[25], PiecePriority::Demand);
        assert_eq!(levels[31], PiecePriority::Demand);
    }

    #[test]
    fn test_chosen_files_filled_at_background() {
        let awaiting = PieceSet::new(16);
        let demand = PieceSet::new(16);

        let plan = plan(
            16,
            &[PieceRange::new(4, 5)],
            &awaiting,
            &demand,
            &[PieceRange::new(2, 9)],
        );
        let levels = plan.priorities();

        assert_eq!(levels[1], PiecePriority::Skip);
        assert_eq!(levels[2], PiecePriority::Background);
        assert_eq!(levels[4], PiecePriority::Head);
        assert_eq!(levels[9], PiecePriority::Background);
        // Background pieces are not reader pieces
        assert_eq!(plan.reader_pieces(), &[4, 5]);
    }

    #[test]
    fn test_reader_range_past_piece_count_is_truncated() {
        let awaiting = PieceSet::new(8);
        let demand = PieceSet::new(8);
        let plan = plan(8, &[PieceRange::new(6, 20)], &awaiting, &demand, &[]);
        assert_eq!(plan.reader_pieces(), &[6, 7]);
    }

    #[test]
    fn test_fingerprint_equality_and_sensitivity() {
        let awaiting = PieceSet::new(64);
        let demand = PieceSet::new(64);
        let readers = [PieceRange::new(10, 30)];

        let a = plan(64, &readers, &awaiting, &demand, &[]).fingerprint();
        let b = plan(64, &readers, &awaiting, &demand, &[]).fingerprint();
        assert_eq!(a, b);
        assert_eq!(a.first, Some((10, PiecePriority::Head)));
        assert_eq!(a.last, Some((30, PiecePriority::Trailing)));
        assert_eq!(a.count, 21);

        // Same ends and count, different middle
        awaiting.insert(20);
        let c = plan(64, &readers, &awaiting, &demand, &[]).fingerprint();
        assert_eq!((c.first, c.last, c.count), (a.first, a.last, a.count));
        assert_ne!(c, a);
    }

    #[test]
    fn test_empty_plan_fingerprint_display() {
        let awaiting = PieceSet::new(4);
        let demand = PieceSet::new(4);
        let fingerprint = plan(4, &[], &awaiting, &demand, &[]).fingerprint();
        assert!(fingerprint.to_string().starts_with("-1:0;-1:0;0#"));
    }

    #[test]
    fn test_status_line_groups_runs() {
        let awaiting = PieceSet::new(32);
        let demand = PieceSet::new(32);
        demand.insert(20);

        let mut plan = plan(32, &[PieceRange::new(0, 1)], &awaiting, &demand, &[]);
        plan.tracked_mut().insert(0, 1.0);

        assert_eq!(plan.status_line(), "[0:6:100, 1:5:0] [20:3:0]");
    }
}
