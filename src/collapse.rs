//! Event de-duplication and the two-stage outcome collapse.
//!
//! Raw test events are first folded into one outcome per
//! `(equipment_id, minute)` and those minute buckets are then folded into
//! one outcome per `(equipment_id, date)`. Both folds use the any-fail-wins
//! rule, so an item tested many times inside one session counts once.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;

use chrono::{NaiveDate, NaiveDateTime, Timelike};

use crate::models::{DateRange, EventKey, Outcome, TestEvent};

// ---

/// Outcome mapping that remembers the order in which keys first appeared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderedOutcomes<K: Eq + Hash> {
    // ---
    order: Vec<K>,
    outcomes: HashMap<K, Outcome>,
}

impl<K: Eq + Hash> Default for OrderedOutcomes<K> {
    fn default() -> Self {
        OrderedOutcomes {
            order: Vec::new(),
            outcomes: HashMap::new(),
        }
    }
}

impl<K: Eq + Hash + Clone> OrderedOutcomes<K> {
    // ---
    /// Record `outcome` under `key`, merging with any outcome already there.
    pub fn merge(&mut self, key: K, outcome: Outcome) {
        // ---
        match self.outcomes.get_mut(&key) {
            Some(existing) => *existing = existing.merge(outcome),
            None => {
                self.order.push(key.clone());
                self.outcomes.insert(key, outcome);
            }
        }
    }

    pub fn get(&self, key: &K) -> Option<Outcome> {
        self.outcomes.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Entries in first-appearance order.
    pub fn iter(&self) -> impl Iterator<Item = (&K, Outcome)> + '_ {
        self.order.iter().map(move |k| (k, self.outcomes[k]))
    }
}

pub type MinuteOutcomes = OrderedOutcomes<(String, NaiveDateTime)>;
pub type DayOutcomes = OrderedOutcomes<(String, NaiveDate)>;

impl DayOutcomes {
    // ---
    /// Distinct equipment ids in first-appearance order.
    pub fn equipment(&self) -> Vec<&str> {
        // ---
        let mut seen = HashSet::new();
        self.order
            .iter()
            .map(|(id, _)| id.as_str())
            .filter(|id| seen.insert(*id))
            .collect()
    }

    /// Distinct dates carrying at least one observation, ascending.
    pub fn dates(&self) -> Vec<NaiveDate> {
        // ---
        let mut dates: Vec<NaiveDate> = self.order.iter().map(|(_, d)| *d).collect();
        dates.sort_unstable();
        dates.dedup();
        dates
    }
}

/// Truncate a timestamp to the start of its minute.
pub fn floor_minute(ts: NaiveDateTime) -> NaiveDateTime {
    ts.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(ts)
}

/// Fold raw events into one outcome per `(equipment_id, minute)`.
pub fn collapse_minutes<'a, I>(events: I) -> MinuteOutcomes
where
    I: IntoIterator<Item = &'a TestEvent>,
{
    // ---
    let mut minutes = MinuteOutcomes::default();
    for event in events {
        minutes.merge(
            (event.equipment_id.clone(), floor_minute(event.time_tested)),
            event.outcome,
        );
    }
    minutes
}

/// Fold minute buckets into one outcome per `(equipment_id, date)`.
pub fn collapse_days(minutes: &MinuteOutcomes) -> DayOutcomes {
    // ---
    let mut days = DayOutcomes::default();
    for ((equipment_id, minute), outcome) in minutes.iter() {
        days.merge((equipment_id.clone(), minute.date()), outcome);
    }
    days
}

/// Re-apply the day fold to an already collapsed mapping.
///
/// Keys are already unique, so the result equals the input.
pub fn recollapse_days(days: &DayOutcomes) -> DayOutcomes {
    // ---
    let mut again = DayOutcomes::default();
    for ((equipment_id, date), outcome) in days.iter() {
        again.merge((equipment_id.clone(), *date), outcome);
    }
    again
}

/// Both collapse stages over the events whose date lies inside `range`.
pub fn collapse_range(events: &[TestEvent], range: &DateRange) -> (MinuteOutcomes, DayOutcomes) {
    // ---
    let minutes = collapse_minutes(
        events
            .iter()
            .filter(|e| range.contains(e.time_tested.date())),
    );
    let days = collapse_days(&minutes);
    (minutes, days)
}

/// Drop events whose `(equipment_id, time_tested)` was already seen.
///
/// `seen` carries keys across calls so duplicates spanning several files,
/// or already in storage, are caught too. Returns the kept events and the
/// number discarded.
pub fn dedup_events(events: Vec<TestEvent>, seen: &mut HashSet<EventKey>) -> (Vec<TestEvent>, usize) {
    // ---
    let before = events.len();
    let kept: Vec<TestEvent> = events.into_iter().filter(|e| seen.insert(e.key())).collect();
    let dropped = before - kept.len();
    (kept, dropped)
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use chrono::NaiveDate;

    fn ts(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    fn ev(id: &str, at: &str, outcome: Outcome) -> TestEvent {
        TestEvent::new(id, ts(at), outcome)
    }

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_single_session_collapses_to_minute_and_day() {
        // ---
        let events = vec![
            ev("E1", "2024-01-01 08:00:00", Outcome::Pass),
            ev("E1", "2024-01-01 08:00:30", Outcome::Fail),
            ev("E1", "2024-01-01 09:15:00", Outcome::Pass),
        ];

        let minutes = collapse_minutes(&events);
        assert_eq!(minutes.len(), 2);
        assert_eq!(
            minutes.get(&("E1".to_string(), ts("2024-01-01 08:00:00"))),
            Some(Outcome::Fail)
        );
        assert_eq!(
            minutes.get(&("E1".to_string(), ts("2024-01-01 09:15:00"))),
            Some(Outcome::Pass)
        );

        let days = collapse_days(&minutes);
        assert_eq!(days.len(), 1);
        assert_eq!(
            days.get(&("E1".to_string(), day(2024, 1, 1))),
            Some(Outcome::Fail)
        );
    }

    #[test]
    fn test_any_fail_wins_regardless_of_position() {
        // ---
        let mut events: Vec<TestEvent> = (0..10)
            .map(|s| ev("E2", &format!("2024-02-02 10:30:{:02}", s), Outcome::Pass))
            .collect();
        events.insert(7, ev("E2", "2024-02-02 10:30:45", Outcome::Fail));

        let minutes = collapse_minutes(&events);
        assert_eq!(minutes.len(), 1);
        assert_eq!(
            minutes.get(&("E2".to_string(), ts("2024-02-02 10:30:00"))),
            Some(Outcome::Fail)
        );
    }

    #[test]
    fn test_floor_minute_discards_seconds_and_fractions() {
        // ---
        let raw = ts("2024-03-04 05:06:59") + chrono::Duration::microseconds(999_999);
        assert_eq!(floor_minute(raw), ts("2024-03-04 05:06:00"));
    }

    #[test]
    fn test_collapse_is_idempotent() {
        // ---
        let events = vec![
            ev("A", "2024-01-01 08:00:00", Outcome::Pass),
            ev("B", "2024-01-01 08:00:00", Outcome::Fail),
            ev("A", "2024-01-02 08:00:00", Outcome::Fail),
            ev("A", "2024-01-02 17:00:00", Outcome::Pass),
        ];
        let days = collapse_days(&collapse_minutes(&events));
        let again = recollapse_days(&days);
        assert_eq!(days, again);
        assert_eq!(recollapse_days(&again), days);
    }

    #[test]
    fn test_range_filters_on_date_only() {
        // ---
        let events = vec![
            ev("A", "2023-12-31 23:59:59", Outcome::Fail),
            ev("A", "2024-01-01 00:00:00", Outcome::Pass),
            ev("A", "2024-01-02 23:59:59", Outcome::Pass),
            ev("B", "2024-01-03 00:00:00", Outcome::Fail),
        ];
        let range = DateRange::new(day(2024, 1, 1), day(2024, 1, 2));
        let (minutes, days) = collapse_range(&events, &range);

        assert_eq!(minutes.len(), 2);
        assert_eq!(days.equipment(), vec!["A"]);
        assert_eq!(days.dates(), vec![day(2024, 1, 1), day(2024, 1, 2)]);
    }

    #[test]
    fn test_equipment_order_follows_first_appearance() {
        // ---
        let events = vec![
            ev("Z9", "2024-01-02 08:00:00", Outcome::Pass),
            ev("A1", "2024-01-01 08:00:00", Outcome::Pass),
            ev("Z9", "2024-01-01 08:00:00", Outcome::Fail),
        ];
        let days = collapse_days(&collapse_minutes(&events));
        assert_eq!(days.equipment(), vec!["Z9", "A1"]);
        assert_eq!(days.dates(), vec![day(2024, 1, 1), day(2024, 1, 2)]);
    }

    #[test]
    fn test_dedup_keeps_first_occurrence() {
        // ---
        let mut seen = HashSet::new();
        let first = vec![
            ev("E1", "2024-01-01 08:00:00", Outcome::Pass),
            ev("E1", "2024-01-01 08:00:00", Outcome::Fail),
            ev("E2", "2024-01-01 08:00:00", Outcome::Fail),
        ];
        let (kept, dropped) = dedup_events(first, &mut seen);
        assert_eq!(dropped, 1);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].outcome, Outcome::Pass);

        // A second batch sharing a key with the first is caught as well.
        let second = vec![ev("E2", "2024-01-01 08:00:00", Outcome::Pass)];
        let (kept, dropped) = dedup_events(second, &mut seen);
        assert!(kept.is_empty());
        assert_eq!(dropped, 1);
    }
}
