use std::collections::HashMap;

use crate::domain::models::SlotState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimestampMs(pub i64);

pub trait Clock {
    fn now(&self) -> TimestampMs;
}

/// A completed occupancy cycle, ready for billing and persistence.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionToRecord {
    pub slot_id: Option<String>,
    pub slot_name: String,
    pub started_at: TimestampMs,
    pub ended_at: TimestampMs,
    pub allowed_minutes: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Entered {
        slot_name: String,
        occupied_since: TimestampMs,
    },
    WentOvertime {
        slot_name: String,
    },
    Vacated {
        session: SessionToRecord,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    Transition(Transition),
    NoChange,
    UnknownSlot,
    UnknownStatus(String),
    DisabledIgnored,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControlOutcome {
    Updated { new_state: SlotState },
    NoChange,
    UnknownSlot,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrackedSlot {
    pub slot_id: String,
    pub allowed_minutes: i64,
    pub state: SlotState,
    pub occupied_since: Option<TimestampMs>,
}

/// Snapshot of one slot as read from the repository, used to (re)build the
/// tracker's cache.
#[derive(Debug, Clone, PartialEq)]
pub struct SlotSnapshot {
    pub slot_id: String,
    pub name: String,
    pub allowed_minutes: i64,
    pub state: SlotState,
    pub occupied_since: Option<TimestampMs>,
}

/// Per-slot occupancy state machine, keyed by the name the device reports.
/// Driven solely by arriving events and explicit control actions; it owns no
/// timers and performs no I/O. Exactly one session is emitted per
/// occupied/overtime -> vacant transition.
#[derive(Debug, Default)]
pub struct OccupancyTracker {
    slots: HashMap<String, TrackedSlot>,
}

impl OccupancyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the tracked slot set from repository state. Slots the device
    /// references but the repository no longer knows disappear; new slots
    /// become trackable. Called at connect time and whenever the repository
    /// change feed fires.
    pub fn sync_slots(&mut self, snapshots: Vec<SlotSnapshot>) {
        let mut slots = HashMap::with_capacity(snapshots.len());
        for snapshot in snapshots {
            slots.insert(
                snapshot.name,
                TrackedSlot {
                    slot_id: snapshot.slot_id,
                    allowed_minutes: snapshot.allowed_minutes,
                    state: snapshot.state,
                    occupied_since: snapshot.occupied_since,
                },
            );
        }
        self.slots = slots;
    }

    pub fn get(&self, slot_name: &str) -> Option<&TrackedSlot> {
        self.slots.get(slot_name)
    }

    /// Applies one occupancy report from the device. The device may name
    /// slots added or removed out of band; unknown names are reported, never
    /// fatal.
    pub fn apply(&mut self, slot_name: &str, raw_status: &str, now: TimestampMs) -> ApplyOutcome {
        let Some(slot) = self.slots.get_mut(slot_name) else {
            return ApplyOutcome::UnknownSlot;
        };

        let reported = match SlotState::parse(raw_status) {
            Some(state @ (SlotState::Vacant | SlotState::Occupied | SlotState::Overtime)) => state,
            _ => return ApplyOutcome::UnknownStatus(raw_status.to_string()),
        };

        if slot.state == SlotState::Disabled {
            return ApplyOutcome::DisabledIgnored;
        }

        match (slot.state, reported) {
            (SlotState::Vacant, SlotState::Occupied | SlotState::Overtime) => {
                slot.state = reported;
                slot.occupied_since = Some(now);
                ApplyOutcome::Transition(Transition::Entered {
                    slot_name: slot_name.to_string(),
                    occupied_since: now,
                })
            }
            (SlotState::Occupied, SlotState::Overtime) => {
                // The clock keeps running from the original entry.
                slot.state = SlotState::Overtime;
                ApplyOutcome::Transition(Transition::WentOvertime {
                    slot_name: slot_name.to_string(),
                })
            }
            (SlotState::Occupied | SlotState::Overtime, SlotState::Vacant) => {
                let started_at = slot.occupied_since.take().unwrap_or(now);
                slot.state = SlotState::Vacant;
                ApplyOutcome::Transition(Transition::Vacated {
                    session: SessionToRecord {
                        slot_id: Some(slot.slot_id.clone()),
                        slot_name: slot_name.to_string(),
                        started_at,
                        ended_at: now,
                        allowed_minutes: slot.allowed_minutes,
                    },
                })
            }
            // Redundant reports and an overtime slot re-reported occupied
            // are no-ops: no new occupied_since, no session.
            _ => ApplyOutcome::NoChange,
        }
    }

    /// Explicit enable/disable control action. Disabling drops any active
    /// cycle without emitting a session; enabling returns the slot to
    /// vacant.
    pub fn set_enabled(&mut self, slot_name: &str, enabled: bool) -> ControlOutcome {
        let Some(slot) = self.slots.get_mut(slot_name) else {
            return ControlOutcome::UnknownSlot;
        };

        if enabled {
            if slot.state != SlotState::Disabled {
                return ControlOutcome::NoChange;
            }
            slot.state = SlotState::Vacant;
            slot.occupied_since = None;
            ControlOutcome::Updated {
                new_state: SlotState::Vacant,
            }
        } else {
            if slot.state == SlotState::Disabled {
                return ControlOutcome::NoChange;
            }
            slot.state = SlotState::Disabled;
            slot.occupied_since = None;
            ControlOutcome::Updated {
                new_state: SlotState::Disabled,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        ApplyOutcome, ControlOutcome, OccupancyTracker, SessionToRecord, SlotSnapshot, TimestampMs,
        Transition,
    };
    use crate::domain::models::SlotState;

    fn tracker_with(name: &str, state: SlotState) -> OccupancyTracker {
        let mut tracker = OccupancyTracker::new();
        tracker.sync_slots(vec![SlotSnapshot {
            slot_id: format!("{name}-id"),
            name: name.to_string(),
            allowed_minutes: 60,
            state,
            occupied_since: None,
        }]);
        tracker
    }

    fn minutes(m: i64) -> TimestampMs {
        TimestampMs(m * 60_000)
    }

    #[test]
    fn vacant_to_occupied_sets_occupied_since() {
        let mut tracker = tracker_with("P1", SlotState::Vacant);

        let outcome = tracker.apply("P1", "occupied", minutes(5));

        assert_eq!(
            outcome,
            ApplyOutcome::Transition(Transition::Entered {
                slot_name: "P1".to_string(),
                occupied_since: minutes(5),
            })
        );
        let slot = tracker.get("P1").expect("slot should be tracked");
        assert_eq!(slot.state, SlotState::Occupied);
        assert_eq!(slot.occupied_since, Some(minutes(5)));
    }

    #[test]
    fn vacate_emits_exactly_one_session_per_cycle() {
        let mut tracker = tracker_with("P1", SlotState::Vacant);

        tracker.apply("P1", "occupied", minutes(0));
        let outcome = tracker.apply("P1", "vacant", minutes(45));

        assert_eq!(
            outcome,
            ApplyOutcome::Transition(Transition::Vacated {
                session: SessionToRecord {
                    slot_id: Some("P1-id".to_string()),
                    slot_name: "P1".to_string(),
                    started_at: minutes(0),
                    ended_at: minutes(45),
                    allowed_minutes: 60,
                },
            })
        );

        // A redundant vacant report must not emit another session.
        assert_eq!(tracker.apply("P1", "vacant", minutes(46)), ApplyOutcome::NoChange);
        assert_eq!(tracker.get("P1").unwrap().occupied_since, None);
    }

    #[test]
    fn overtime_preserves_original_start_time() {
        let mut tracker = tracker_with("P1", SlotState::Vacant);

        tracker.apply("P1", "occupied", minutes(0));
        let overtime = tracker.apply("P1", "overtime", minutes(70));
        assert_eq!(
            overtime,
            ApplyOutcome::Transition(Transition::WentOvertime {
                slot_name: "P1".to_string(),
            })
        );
        assert_eq!(tracker.get("P1").unwrap().occupied_since, Some(minutes(0)));

        let outcome = tracker.apply("P1", "vacant", minutes(130));
        match outcome {
            ApplyOutcome::Transition(Transition::Vacated { session }) => {
                assert_eq!(session.started_at, minutes(0));
                assert_eq!(session.ended_at, minutes(130));
            }
            other => panic!("expected vacated transition, got {other:?}"),
        }
    }

    #[test]
    fn redundant_occupied_report_is_a_no_op() {
        let mut tracker = tracker_with("P1", SlotState::Vacant);

        tracker.apply("P1", "occupied", minutes(0));
        assert_eq!(tracker.apply("P1", "occupied", minutes(10)), ApplyOutcome::NoChange);
        assert_eq!(tracker.get("P1").unwrap().occupied_since, Some(minutes(0)));
    }

    #[test]
    fn unknown_slot_is_reported_and_leaves_known_slots_untouched() {
        let mut tracker = tracker_with("P1", SlotState::Vacant);

        assert_eq!(
            tracker.apply("GHOST", "occupied", minutes(1)),
            ApplyOutcome::UnknownSlot
        );
        assert_eq!(tracker.get("P1").unwrap().state, SlotState::Vacant);
    }

    #[test]
    fn unknown_status_is_reported_without_transition() {
        let mut tracker = tracker_with("P1", SlotState::Vacant);

        assert_eq!(
            tracker.apply("P1", "reserved", minutes(1)),
            ApplyOutcome::UnknownStatus("reserved".to_string())
        );
        assert_eq!(tracker.get("P1").unwrap().state, SlotState::Vacant);
    }

    #[test]
    fn disabled_slot_ignores_occupancy_reports() {
        let mut tracker = tracker_with("P1", SlotState::Disabled);

        assert_eq!(
            tracker.apply("P1", "occupied", minutes(1)),
            ApplyOutcome::DisabledIgnored
        );
        let slot = tracker.get("P1").unwrap();
        assert_eq!(slot.state, SlotState::Disabled);
        assert_eq!(slot.occupied_since, None);
    }

    #[test]
    fn disabling_an_occupied_slot_drops_the_cycle_without_a_session() {
        let mut tracker = tracker_with("P1", SlotState::Vacant);

        tracker.apply("P1", "occupied", minutes(0));
        let outcome = tracker.set_enabled("P1", false);

        assert_eq!(
            outcome,
            ControlOutcome::Updated {
                new_state: SlotState::Disabled,
            }
        );
        assert_eq!(tracker.get("P1").unwrap().occupied_since, None);

        // Re-enabling returns to vacant; the interrupted cycle stays unbilled.
        assert_eq!(
            tracker.set_enabled("P1", true),
            ControlOutcome::Updated {
                new_state: SlotState::Vacant,
            }
        );
        assert_eq!(tracker.apply("P1", "vacant", minutes(9)), ApplyOutcome::NoChange);
    }

    #[test]
    fn overtime_report_while_vacant_counts_as_late_entry() {
        let mut tracker = tracker_with("P1", SlotState::Vacant);

        let outcome = tracker.apply("P1", "overtime", minutes(3));

        assert_eq!(
            outcome,
            ApplyOutcome::Transition(Transition::Entered {
                slot_name: "P1".to_string(),
                occupied_since: minutes(3),
            })
        );
        let slot = tracker.get("P1").unwrap();
        assert_eq!(slot.state, SlotState::Overtime);
        assert_eq!(slot.occupied_since, Some(minutes(3)));
    }

    #[test]
    fn session_count_matches_vacate_transition_count() {
        let mut tracker = tracker_with("P1", SlotState::Vacant);
        let reports = [
            "vacant", "occupied", "occupied", "overtime", "vacant", "vacant", "occupied",
            "vacant", "occupied", "overtime", "overtime", "vacant",
        ];

        let mut sessions = 0;
        for (i, report) in reports.iter().enumerate() {
            if let ApplyOutcome::Transition(Transition::Vacated { .. }) =
                tracker.apply("P1", report, minutes(i as i64))
            {
                sessions += 1;
            }
        }

        assert_eq!(sessions, 3);
    }

    #[test]
    fn sync_slots_replaces_the_tracked_set() {
        let mut tracker = tracker_with("P1", SlotState::Vacant);

        tracker.sync_slots(vec![SlotSnapshot {
            slot_id: "P2-id".to_string(),
            name: "P2".to_string(),
            allowed_minutes: 120,
            state: SlotState::Occupied,
            occupied_since: Some(minutes(2)),
        }]);

        assert!(tracker.get("P1").is_none());
        let slot = tracker.get("P2").expect("P2 should be tracked");
        assert_eq!(slot.allowed_minutes, 120);
        assert_eq!(slot.occupied_since, Some(minutes(2)));
    }
}
