//! Canonical integer codes for the enum-ish string fields.
//!
//! Both sources hand over lowercase strings; the store keeps small
//! integers so queries do not depend on source-specific spellings.
//! Unrecognized values map to `None` and are stored as NULL rather than
//! guessed at.

pub fn schedule_relationship(value: &str) -> Option<i64> {
    match value {
        "scheduled" => Some(0),
        "added" => Some(1),
        "unscheduled" => Some(2),
        "canceled" | "cancelled" => Some(3),
        "skipped" => Some(4),
        _ => None,
    }
}

pub fn congestion_level(value: &str) -> Option<i64> {
    match value {
        "unknown" => Some(0),
        "smooth" | "low" => Some(1),
        "moderate" | "medium" => Some(2),
        "severe" | "heavy" => Some(3),
        _ => None,
    }
}

pub fn occupancy_status(value: &str) -> Option<i64> {
    match value {
        "empty" => Some(0),
        "many_seats_available" => Some(1),
        "few_seats_available" => Some(2),
        "standing_room_only" => Some(3),
        "crushed_standing_room_only" => Some(4),
        "full" => Some(5),
        "not_accepting_passengers" => Some(6),
        _ => None,
    }
}
