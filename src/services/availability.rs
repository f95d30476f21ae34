//! Availability resolver
//!
//! Turns a tutor's recurring weekly hours and already-booked sessions into
//! bookable slots over a bounded window. [`resolve_slots`] is pure; the
//! service wrapper only loads its inputs.

use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use serde::Serialize;

use crate::config::PolicyConfig;
use crate::db::repositories::{SessionRepository, TutorProfileRepository};
use crate::models::{BookingSlot, WeeklyAvailability};

/// Window and granularity for a slot query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotQuery {
    pub window_start: NaiveDate,
    pub window_days: i64,
    pub duration_minutes: i64,
    /// Distance between consecutive candidate starts
    pub step_minutes: i64,
    /// Hard cap on `window_days`
    pub horizon_days: i64,
    /// Candidates starting earlier than this are reported unavailable
    pub not_before: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotResolution {
    pub slots: Vec<BookingSlot>,
    /// The tutor has no weekly hours configured at all
    pub no_availability: bool,
}

/// Enumerate candidate slots for every day of the window.
///
/// A candidate is unavailable when `[start, end)` intersects any booked
/// interval, or when it starts before `query.not_before`. Output is
/// sorted by day, then start time.
pub fn resolve_slots(
    availability: &WeeklyAvailability,
    booked: &[(DateTime<Utc>, DateTime<Utc>)],
    query: &SlotQuery,
) -> SlotResolution {
    if availability.is_empty() {
        return SlotResolution {
            slots: Vec::new(),
            no_availability: true,
        };
    }
    if query.duration_minutes <= 0 || query.step_minutes <= 0 {
        return SlotResolution {
            slots: Vec::new(),
            no_availability: false,
        };
    }

    let days = query.window_days.clamp(0, query.horizon_days.max(0));
    let duration = Duration::minutes(query.duration_minutes);
    let step = Duration::minutes(query.step_minutes);
    let mut slots = Vec::new();

    for offset in 0..days {
        let Some(date) = query.window_start.checked_add_signed(Duration::days(offset)) else {
            break;
        };
        for range in availability.ranges_for(date.weekday()) {
            if !range.is_valid() {
                continue;
            }
            let range_end = date.and_time(range.end).and_utc();
            let mut start = date.and_time(range.start).and_utc();
            while start + duration <= range_end {
                let end = start + duration;
                let clashes = booked.iter().any(|(b_start, b_end)| *b_start < end && *b_end > start);
                let too_soon = query.not_before.is_some_and(|limit| start < limit);
                slots.push(BookingSlot {
                    date,
                    start_time: start,
                    end_time: end,
                    duration_minutes: query.duration_minutes,
                    available: !clashes && !too_soon,
                });
                start += step;
            }
        }
    }

    // Overlapping weekly ranges yield the same start twice
    slots.sort_by_key(|s| (s.date, s.start_time));
    slots.dedup_by_key(|s| (s.date, s.start_time));

    SlotResolution {
        slots,
        no_availability: false,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AvailabilityError {
    #[error("Tutor not found: {0}")]
    TutorNotFound(String),

    #[error("Unsupported session duration: {0} minutes")]
    InvalidDuration(i64),

    #[error("Invalid window: {0}")]
    InvalidWindow(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

pub struct AvailabilityService {
    tutors: Arc<dyn TutorProfileRepository>,
    sessions: Arc<dyn SessionRepository>,
    policy: PolicyConfig,
}

impl AvailabilityService {
    pub fn new(
        tutors: Arc<dyn TutorProfileRepository>,
        sessions: Arc<dyn SessionRepository>,
        policy: PolicyConfig,
    ) -> Self {
        Self {
            tutors,
            sessions,
            policy,
        }
    }

    /// Slots for a tutor starting at `window_start`, honoring lead time
    pub async fn slots_for(
        &self,
        tutor_id: &str,
        window_start: NaiveDate,
        window_days: i64,
        duration_minutes: i64,
        now: DateTime<Utc>,
    ) -> Result<SlotResolution, AvailabilityError> {
        if !self.policy.is_duration_allowed(duration_minutes) {
            return Err(AvailabilityError::InvalidDuration(duration_minutes));
        }
        if window_days < 1 {
            return Err(AvailabilityError::InvalidWindow("days must be at least 1".to_string()));
        }

        let profile = self
            .tutors
            .get(tutor_id)
            .await?
            .ok_or_else(|| AvailabilityError::TutorNotFound(tutor_id.to_string()))?;

        let query = SlotQuery {
            window_start,
            window_days: window_days.min(self.policy.booking_horizon_days),
            duration_minutes,
            step_minutes: self.policy.slot_step_minutes,
            horizon_days: self.policy.booking_horizon_days,
            not_before: Some(now + Duration::hours(self.policy.lead_time_hours)),
        };

        let from = window_start.and_hms_opt(0, 0, 0).map(|d| d.and_utc());
        let to = window_start
            .checked_add_signed(Duration::days(query.window_days))
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|d| d.and_utc());
        let booked: Vec<_> = match (from, to) {
            (Some(from), Some(to)) => self
                .sessions
                .list_active_for_tutor_between(tutor_id, from, to)
                .await?
                .into_iter()
                .map(|s| (s.start_time, s.end_time))
                .collect(),
            _ => return Err(AvailabilityError::InvalidWindow("window out of range".to_string())),
        };

        Ok(resolve_slots(&profile.availability, &booked, &query))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TimeRange;
    use chrono::{NaiveTime, TimeZone};

    fn monday_morning() -> WeeklyAvailability {
        let mut availability = WeeklyAvailability::default();
        availability.monday.push(TimeRange::new(
            NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(12, 0, 0).unwrap(),
        ));
        availability
    }

    fn query(days: i64, duration: i64) -> SlotQuery {
        SlotQuery {
            // 2026-03-02 is a Monday
            window_start: NaiveDate::from_ymd_opt(2026, 3, 2).unwrap(),
            window_days: days,
            duration_minutes: duration,
            step_minutes: 30,
            horizon_days: 28,
            not_before: None,
        }
    }

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, h, m, 0).unwrap()
    }

    #[test]
    fn test_booked_session_blocks_overlapping_slot() {
        let booked = vec![(at(10, 0), at(10, 30))];
        let result = resolve_slots(&monday_morning(), &booked, &query(1, 30));

        let available: Vec<_> = result
            .slots
            .iter()
            .filter(|s| s.available)
            .map(|s| s.start_time)
            .collect();
        assert!(available.contains(&at(9, 0)));
        assert!(available.contains(&at(9, 30)));
        assert!(available.contains(&at(11, 0)));
        assert!(available.contains(&at(11, 30)));
        assert!(!available.contains(&at(10, 0)));

        let ten = result.slots.iter().find(|s| s.start_time == at(10, 0)).unwrap();
        assert!(!ten.available);
    }

    #[test]
    fn test_adjacent_booking_does_not_block() {
        // half-open intervals: a session ending at 10:00 leaves 10:00 free
        let booked = vec![(at(9, 30), at(10, 0))];
        let result = resolve_slots(&monday_morning(), &booked, &query(1, 30));
        let ten = result.slots.iter().find(|s| s.start_time == at(10, 0)).unwrap();
        assert!(ten.available);
    }

    #[test]
    fn test_longer_duration_fits_inside_range() {
        let result = resolve_slots(&monday_morning(), &[], &query(1, 90));
        let starts: Vec<_> = result.slots.iter().map(|s| s.start_time).collect();
        assert_eq!(starts, vec![at(9, 0), at(9, 30), at(10, 0), at(10, 30)]);
        assert!(result.slots.iter().all(|s| s.end_time <= at(12, 0)));
    }

    #[test]
    fn test_no_availability_is_flagged() {
        let result = resolve_slots(&WeeklyAvailability::default(), &[], &query(7, 30));
        assert!(result.no_availability);
        assert!(result.slots.is_empty());
    }

    #[test]
    fn test_window_is_capped_by_horizon() {
        let result = resolve_slots(&monday_morning(), &[], &query(70, 60));
        let last = result.slots.last().unwrap();
        assert!(last.date < NaiveDate::from_ymd_opt(2026, 3, 30).unwrap());
        // four Mondays inside 28 days, five 60-minute starts each
        assert_eq!(result.slots.len(), 4 * 5);
    }

    #[test]
    fn test_not_before_marks_early_slots_unavailable() {
        let mut q = query(1, 30);
        q.not_before = Some(at(10, 0));
        let result = resolve_slots(&monday_morning(), &[], &q);
        for slot in &result.slots {
            assert_eq!(slot.available, slot.start_time >= at(10, 0));
        }
    }

    mod service {
        use super::*;
        use crate::services::testing::Harness;

        /// Monday 2030-03-04 08:00 UTC
        fn now() -> DateTime<Utc> {
            Utc.with_ymd_and_hms(2030, 3, 4, 8, 0, 0).unwrap()
        }

        fn service(h: &Harness) -> AvailabilityService {
            AvailabilityService::new(h.tutors.clone(), h.sessions.clone(), h.policy.clone())
        }

        #[tokio::test]
        async fn test_slots_for_marks_booked_and_lead_time() {
            let h = Harness::new().await;
            h.seed_tutor("tutor-1", None, false).await;
            let booked_start = Utc.with_ymd_and_hms(2030, 3, 4, 14, 0, 0).unwrap();
            h.seed_session_at("tutor-1", "student-1", booked_start).await;

            let result = service(&h)
                .slots_for("tutor-1", now().date_naive(), 1, 60, now())
                .await
                .unwrap();
            assert!(!result.no_availability);

            let slot = |hour: u32, minute: u32| {
                let start = Utc.with_ymd_and_hms(2030, 3, 4, hour, minute, 0).unwrap();
                result.slots.iter().find(|s| s.start_time == start).unwrap().available
            };
            // 3 hour lead time from 08:00
            assert!(!slot(10, 30));
            assert!(slot(11, 0));
            // 14:00-15:00 is taken
            assert!(!slot(13, 30));
            assert!(!slot(14, 0));
            assert!(!slot(14, 30));
            assert!(slot(15, 0));
            // last 60-minute start inside 06:00-22:00
            assert_eq!(
                result.slots.last().unwrap().start_time,
                Utc.with_ymd_and_hms(2030, 3, 4, 21, 0, 0).unwrap()
            );
        }

        #[tokio::test]
        async fn test_slots_for_rejects_bad_requests() {
            let h = Harness::new().await;
            h.seed_tutor("tutor-1", None, false).await;
            let service = service(&h);
            let today = now().date_naive();

            assert!(matches!(
                service.slots_for("tutor-1", today, 1, 45, now()).await,
                Err(AvailabilityError::InvalidDuration(45))
            ));
            assert!(matches!(
                service.slots_for("tutor-1", today, 0, 60, now()).await,
                Err(AvailabilityError::InvalidWindow(_))
            ));
            assert!(matches!(
                service.slots_for("tutor-9", today, 1, 60, now()).await,
                Err(AvailabilityError::TutorNotFound(_))
            ));
        }
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn slots_sorted_and_never_overlap_bookings(
                booked_start in 0i64..180,
                booked_len in 1i64..120,
                duration in prop::sample::select(vec![30i64, 60, 90]),
                days in 1i64..40,
            ) {
                let b_start = at(9, 0) + Duration::minutes(booked_start);
                let booked = vec![(b_start, b_start + Duration::minutes(booked_len))];
                let result = resolve_slots(&monday_morning(), &booked, &query(days, duration));

                for pair in result.slots.windows(2) {
                    prop_assert!((pair[0].date, pair[0].start_time) < (pair[1].date, pair[1].start_time));
                }
                for slot in result.slots.iter().filter(|s| s.available) {
                    prop_assert!(!(booked[0].0 < slot.end_time && booked[0].1 > slot.start_time));
                    prop_assert_eq!(slot.end_time - slot.start_time, Duration::minutes(duration));
                }
            }
        }
    }
}
