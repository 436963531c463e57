use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Datelike, Duration, Local, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Highest accepted weekday index (0 = Sunday … 6 = Saturday).
pub const MAX_WEEKDAY: u8 = 6;

/// A programmed heating interval, optionally repeating on a set of weekdays.
///
/// For one-shot rules `start` is the absolute window start. For repeating
/// rules only its time of day matters: the window opens at that time on every
/// day listed in `repeat_days`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    /// Generated by the store when empty.
    #[serde(default)]
    pub id: String,
    pub start: DateTime<Utc>,
    #[serde(rename = "duration_ms", with = "millis")]
    pub duration: Duration,
    /// Lead time at the start of the window during which heat is withheld.
    #[serde(rename = "delay_ms", with = "millis", default = "zero_delay")]
    pub delay: Duration,
    pub target_temp: f64,
    #[serde(default)]
    pub repeat_days: BTreeSet<u8>,
    #[serde(default)]
    pub is_active: bool,
    /// Instant of the most recent explicit stop.
    #[serde(default)]
    pub stopped_time: Option<DateTime<Utc>>,
}

fn zero_delay() -> Duration {
    Duration::zero()
}

impl Rule {
    pub fn duration_with_delay(&self) -> Duration {
        self.delay + self.duration
    }

    pub fn is_repeating(&self) -> bool {
        !self.repeat_days.is_empty()
    }

    /// Start of the window `now` falls in, or of the upcoming one.
    ///
    /// One-shot rules always return `start`. Repeating rules take today's
    /// occurrence at `start`'s time of day (in `now`'s timezone) and move it
    /// forward to the nearest listed weekday; today counts only while its
    /// window has not yet elapsed. Days are added to the local date, so the
    /// wall-clock start survives a DST change in between.
    pub fn window_start_time<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> DateTime<Utc> {
        if self.repeat_days.is_empty() {
            return self.start;
        }

        let tz = now.timezone();
        let time_of_day = self.start.with_timezone(&tz).time();
        let date = now.date_naive();
        let occurrence =
            |days: i64| resolve_local(&tz, (date + Duration::days(days)).and_time(time_of_day));

        let todays_start = occurrence(0);
        let today = i64::from(now.weekday().num_days_from_sunday());
        let now = now.with_timezone(&Utc);
        let window = self.duration_with_delay();

        let days_until = self
            .repeat_days
            .iter()
            .map(|&day| {
                let days_away = (i64::from(day) - today + 7) % 7;
                if days_away == 0 && todays_start + window < now {
                    7
                } else {
                    days_away
                }
            })
            .min()
            .unwrap_or(7);

        occurrence(days_until)
    }

    pub fn window_end_time<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> DateTime<Utc> {
        self.window_start_time(now) + self.duration_with_delay()
    }

    /// Inside the current window (delay included) and not explicitly stopped.
    pub fn should_be_active<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> bool {
        let start = self.window_start_time(now);
        let end = start + self.duration_with_delay();
        let now_utc = now.with_timezone(&Utc);
        start < now_utc && now_utc < end && !self.should_be_stopped(now)
    }

    /// Inside the delay that opens the current window.
    pub fn is_being_delayed<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> bool {
        let start = self.window_start_time(now);
        let now_utc = now.with_timezone(&Utc);
        start < now_utc && now_utc < start + self.delay
    }

    /// A stop was recorded inside the current window and that moment has passed.
    pub fn should_be_stopped<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> bool {
        let Some(stopped) = self.stopped_time else {
            return false;
        };
        let start = self.window_start_time(now);
        let end = start + self.duration_with_delay();
        stopped < now.with_timezone(&Utc) && start < stopped && stopped < end
    }

    pub fn will_start_in_future<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> bool {
        self.window_start_time(now) > now.with_timezone(&Utc)
    }

    /// Structural checks; temperature bounds are checked by the store.
    pub fn validate(&self) -> Result<()> {
        if self.duration <= Duration::zero() {
            return Err(CoreError::InvalidRule(format!(
                "duration must be positive, got {}ms",
                self.duration.num_milliseconds()
            )));
        }
        if self.delay < Duration::zero() {
            return Err(CoreError::InvalidRule(format!(
                "delay must not be negative, got {}ms",
                self.delay.num_milliseconds()
            )));
        }
        if let Some(day) = self.repeat_days.iter().find(|&&d| d > MAX_WEEKDAY) {
            return Err(CoreError::InvalidRule(format!(
                "repeat day {day} out of range 0..={MAX_WEEKDAY}"
            )));
        }
        if !self.target_temp.is_finite() {
            return Err(CoreError::InvalidRule(
                "target temperature must be a finite number".to_string(),
            ));
        }
        Ok(())
    }
}

// Rendered in the local zone, the one rules are planned in.
impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stopped = self
            .stopped_time
            .map(|t| t.with_timezone(&Local).format("%Y/%m/%d %H:%M").to_string())
            .unwrap_or_else(|| "never".to_string());
        write!(
            f,
            "rule {} days {:?} at {} for {}s target {:.1} (active: {}, stopped: {})",
            self.id,
            self.repeat_days,
            self.start.with_timezone(&Local).format("%H:%M"),
            self.duration.num_seconds(),
            self.target_temp,
            self.is_active,
            stopped
        )
    }
}

/// Map a wall-clock time to an instant. Ambiguous times take the earlier
/// instant; times skipped by a DST jump move forward by an hour.
fn resolve_local<Tz: TimeZone>(tz: &Tz, naive: NaiveDateTime) -> DateTime<Utc> {
    tz.from_local_datetime(&naive)
        .earliest()
        .or_else(|| tz.from_local_datetime(&(naive + Duration::hours(1))).earliest())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| naive.and_utc())
}

mod millis {
    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_i64(d.num_milliseconds())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        i64::deserialize(d).map(Duration::milliseconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::FixedOffset;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    fn one_shot(start: DateTime<Utc>, duration: Duration) -> Rule {
        Rule {
            id: "r".to_string(),
            start,
            duration,
            delay: Duration::zero(),
            target_temp: 20.0,
            repeat_days: BTreeSet::new(),
            is_active: false,
            stopped_time: None,
        }
    }

    fn weekly(start: DateTime<Utc>, duration: Duration, days: &[u8]) -> Rule {
        Rule {
            repeat_days: days.iter().copied().collect(),
            ..one_shot(start, duration)
        }
    }

    #[test]
    fn window_start_sunday_rule() {
        // 2024-01-07 is a Sunday; repeat Mon, Thu, Sun.
        let start = at(2024, 1, 7, 12, 0);
        let hour = Duration::hours(1);
        let rule = weekly(start, hour, &[1, 4, 0]);

        let cases = [
            ("an hour before", start - hour, start),
            ("half way through", start + Duration::minutes(30), start),
            (
                "just after the window",
                start + hour + Duration::milliseconds(1),
                start + Duration::days(1),
            ),
            (
                "a week later, 30 min before",
                start + Duration::days(7) - Duration::minutes(30),
                start + Duration::days(7),
            ),
            ("a week later at start", start + Duration::days(7), start + Duration::days(7)),
            ("five days later", start + Duration::days(5), start + Duration::days(7)),
        ];
        for (name, now, want) in cases {
            assert_eq!(rule.window_start_time(&now), want, "case: {name}");
        }
    }

    #[test]
    fn window_start_monday_rule() {
        // 2024-01-08 is a Monday.
        let start = at(2024, 1, 8, 12, 0);
        let rule = weekly(start, Duration::hours(1), &[1, 4, 0]);

        assert_eq!(rule.window_start_time(&at(2024, 1, 8, 11, 0)), start);
        assert_eq!(rule.window_start_time(&at(2024, 1, 8, 12, 30)), start);
        assert_eq!(
            rule.window_start_time(&at(2024, 1, 8, 13, 1)),
            at(2024, 1, 11, 12, 0)
        );
    }

    #[test]
    fn window_start_never_more_than_a_week_ahead() {
        let start = at(2024, 1, 8, 6, 30);
        let rule = weekly(start, Duration::minutes(45), &[3]);
        let mut now = at(2024, 2, 1, 0, 0);
        for _ in 0..(24 * 14) {
            let w = rule.window_start_time(&now);
            assert!(w + rule.duration_with_delay() >= now, "window already over at {now}");
            assert!(w <= now + Duration::days(7), "window too far ahead at {now}");
            now += Duration::hours(1);
        }
    }

    #[test]
    fn window_start_uses_local_time_of_day() {
        let tz = FixedOffset::east_opt(3600).unwrap();
        // 12:00 in +01:00 is 11:00 UTC; 2024-01-10 is a Wednesday.
        let start = tz.with_ymd_and_hms(2024, 1, 3, 12, 0, 0).unwrap();
        let rule = weekly(start.with_timezone(&Utc), Duration::hours(1), &[3]);

        let now = tz.with_ymd_and_hms(2024, 1, 10, 8, 0, 0).unwrap();
        assert_eq!(rule.window_start_time(&now), at(2024, 1, 10, 11, 0));
    }

    #[test]
    fn weekday_is_read_in_the_local_zone_near_midnight() {
        let tz = FixedOffset::east_opt(3600).unwrap();
        // Monday 00:30 local is still Sunday 23:30 UTC.
        let start = tz.with_ymd_and_hms(2024, 1, 8, 0, 30, 0).unwrap();
        let rule = weekly(start.with_timezone(&Utc), Duration::hours(1), &[1]);

        let next_monday = tz.with_ymd_and_hms(2024, 1, 15, 0, 45, 0).unwrap();
        assert_eq!(
            rule.window_start_time(&next_monday),
            tz.with_ymd_and_hms(2024, 1, 15, 0, 30, 0).unwrap()
        );
        assert!(rule.should_be_active(&next_monday));

        // The same instant seen from UTC is a Sunday.
        assert!(!rule.should_be_active(&next_monday.with_timezone(&Utc)));
    }

    #[test]
    fn display_uses_local_time_of_day() {
        let rule = weekly(at(2024, 1, 8, 6, 15), Duration::minutes(90), &[1]);
        let local = rule.start.with_timezone(&Local).format("%H:%M").to_string();
        let shown = rule.to_string();
        assert!(shown.contains(&format!("at {local} for 5400s")), "{shown}");
    }

    #[test]
    fn one_shot_window_is_start_even_when_past() {
        let start = at(2024, 3, 1, 9, 0);
        let rule = one_shot(start, Duration::hours(2));
        assert_eq!(rule.window_start_time(&at(2025, 1, 1, 0, 0)), start);
        assert_eq!(rule.window_start_time(&at(2020, 1, 1, 0, 0)), start);
    }

    #[test]
    fn active_then_stopped() {
        let now = at(2024, 5, 5, 10, 0);
        let mut rule = one_shot(now - Duration::hours(1), Duration::hours(2));
        assert!(!rule.should_be_stopped(&now));
        assert!(rule.should_be_active(&now));

        rule.stopped_time = Some(now - Duration::seconds(1));
        assert!(rule.should_be_stopped(&now));
        assert!(!rule.should_be_active(&now));
    }

    #[test]
    fn stop_in_the_future_does_not_apply_yet() {
        let now = at(2024, 5, 5, 10, 0);
        let mut rule = one_shot(now - Duration::hours(1), Duration::hours(2));
        rule.stopped_time = Some(now + Duration::minutes(5));
        assert!(!rule.should_be_stopped(&now));
        assert!(rule.should_be_active(&now));
    }

    #[test]
    fn stale_stop_from_previous_week_is_ignored() {
        let start = at(2024, 1, 8, 12, 0);
        let mut rule = weekly(start, Duration::hours(1), &[1]);
        rule.stopped_time = Some(start + Duration::minutes(10));

        let next_week = start + Duration::days(7) + Duration::minutes(5);
        assert!(!rule.should_be_stopped(&next_week));
        assert!(rule.should_be_active(&next_week));
    }

    #[test]
    fn delay_withholds_heat_but_window_is_active() {
        let start = at(2024, 5, 5, 7, 0);
        let mut rule = one_shot(start, Duration::hours(1));
        rule.delay = Duration::minutes(15);

        let during_delay = start + Duration::minutes(5);
        assert!(rule.is_being_delayed(&during_delay));
        assert!(rule.should_be_active(&during_delay));

        let after_delay = start + Duration::minutes(20);
        assert!(!rule.is_being_delayed(&after_delay));
        assert!(rule.should_be_active(&after_delay));

        // The delay extends the window end.
        let tail = start + Duration::minutes(70);
        assert!(rule.should_be_active(&tail));
        assert!(!rule.should_be_active(&(start + Duration::minutes(76))));
    }

    #[test]
    fn active_and_stopped_are_mutually_exclusive() {
        let start = at(2024, 1, 8, 12, 0);
        let mut rules = vec![
            one_shot(start, Duration::hours(1)),
            weekly(start, Duration::hours(1), &[0, 1, 2, 3, 4, 5, 6]),
        ];
        for rule in rules.iter_mut() {
            rule.stopped_time = Some(start + Duration::minutes(20));
            rule.delay = Duration::minutes(5);
        }
        let mut now = start - Duration::hours(2);
        while now < start + Duration::days(3) {
            for rule in &rules {
                assert!(
                    !(rule.should_be_active(&now) && rule.should_be_stopped(&now)),
                    "both active and stopped at {now}"
                );
            }
            now += Duration::minutes(7);
        }
    }

    #[test]
    fn future_start_detection() {
        let now = at(2024, 5, 5, 10, 0);
        let rule = one_shot(now + Duration::minutes(1), Duration::hours(1));
        assert!(rule.will_start_in_future(&now));
        assert!(!rule.should_be_active(&now));
    }

    #[test]
    fn validate_rejects_bad_rules() {
        let base = one_shot(at(2024, 1, 1, 0, 0), Duration::hours(1));
        assert!(base.validate().is_ok());

        let zero = Rule { duration: Duration::zero(), ..base.clone() };
        assert!(matches!(zero.validate(), Err(CoreError::InvalidRule(_))));

        let negative_delay = Rule { delay: Duration::seconds(-1), ..base.clone() };
        assert!(negative_delay.validate().is_err());

        let legacy_day = Rule { repeat_days: [0, 7].into_iter().collect(), ..base.clone() };
        assert!(legacy_day.validate().is_err());

        let nan = Rule { target_temp: f64::NAN, ..base };
        assert!(nan.validate().is_err());
    }

    #[test]
    fn durations_serialise_as_milliseconds() {
        let mut rule = one_shot(at(2024, 1, 1, 0, 0), Duration::milliseconds(1500));
        rule.delay = Duration::milliseconds(250);
        let json = serde_json::to_value(&rule).unwrap();
        assert_eq!(json["duration_ms"], 1500);
        assert_eq!(json["delay_ms"], 250);

        let back: Rule = serde_json::from_value(json).unwrap();
        assert_eq!(back, rule);
    }

    #[test]
    fn missing_optional_fields_take_defaults() {
        let json = r#"{"start":"2024-01-01T08:00:00Z","duration_ms":60000,"target_temp":19.5}"#;
        let rule: Rule = serde_json::from_str(json).unwrap();
        assert!(rule.id.is_empty());
        assert_eq!(rule.delay, Duration::zero());
        assert!(rule.repeat_days.is_empty());
        assert!(!rule.is_active);
        assert!(rule.stopped_time.is_none());
    }
}
