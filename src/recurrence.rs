use chrono::{Datelike, Duration as ChronoDuration, NaiveDate, NaiveDateTime, Timelike};

pub const DATETIME_FMT: &str = "%Y-%m-%dT%H:%M:%S";
pub const DATE_FMT: &str = "%Y-%m-%d";

/// Occurrences generated when neither endDate nor maxOccurrences is given.
pub const DEFAULT_OCCURRENCES: i64 = 10;
/// Hard cap when only endDate bounds the series.
pub const END_DATE_OCCURRENCE_CAP: i64 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frequency {
    Weekly,
    Biweekly,
}

impl Frequency {
    pub fn parse(raw: &str) -> Option<Frequency> {
        match raw {
            "weekly" => Some(Frequency::Weekly),
            "biweekly" => Some(Frequency::Biweekly),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Frequency::Weekly => "weekly",
            Frequency::Biweekly => "biweekly",
        }
    }

    pub fn step_days(self) -> i64 {
        match self {
            Frequency::Weekly => 7,
            Frequency::Biweekly => 14,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Recurrence {
    pub frequency: Frequency,
    pub end_date: Option<NaiveDate>,
    pub max_occurrences: Option<i64>,
}

pub fn parse_datetime(raw: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw.trim(), DATETIME_FMT).ok()
}

pub fn format_datetime(dt: NaiveDateTime) -> String {
    dt.format(DATETIME_FMT).to_string()
}

pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), DATE_FMT).ok()
}

/// Template fields derived from the anchor timestamp: weekday (0 = Monday)
/// and wall-clock time as HH:MM.
pub fn template_slot(anchor: NaiveDateTime) -> (i64, String) {
    let dow = anchor.weekday().num_days_from_monday() as i64;
    let tod = format!("{:02}:{:02}", anchor.hour(), anchor.minute());
    (dow, tod)
}

/// Expands a recurrence into concrete occurrence timestamps, anchor first.
/// Bounds are validated before any timestamp is produced: a partially
/// generated series on bad input is never returned.
pub fn expand_occurrences(
    anchor: NaiveDateTime,
    recurrence: &Recurrence,
) -> Result<Vec<NaiveDateTime>, String> {
    if let Some(max) = recurrence.max_occurrences {
        if max <= 0 {
            return Err("maxOccurrences must be positive".to_string());
        }
    }
    if let Some(end) = recurrence.end_date {
        if end < anchor.date() {
            return Err("endDate is before the first occurrence".to_string());
        }
    }

    let limit = match (recurrence.max_occurrences, recurrence.end_date) {
        (Some(max), _) => max,
        (None, Some(_)) => END_DATE_OCCURRENCE_CAP,
        (None, None) => DEFAULT_OCCURRENCES,
    };

    let step = ChronoDuration::days(recurrence.frequency.step_days());
    let mut out = Vec::new();
    let mut next = anchor;
    while (out.len() as i64) < limit {
        if let Some(end) = recurrence.end_date {
            if next.date() > end {
                break;
            }
        }
        out.push(next);
        next += step;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dt(s: &str) -> NaiveDateTime {
        parse_datetime(s).expect("datetime")
    }

    #[test]
    fn weekly_with_max_occurrences_steps_seven_days() {
        let rec = Recurrence {
            frequency: Frequency::Weekly,
            end_date: None,
            max_occurrences: Some(5),
        };
        let got = expand_occurrences(dt("2026-09-01T16:00:00"), &rec).expect("expand");
        assert_eq!(got.len(), 5);
        assert_eq!(got[0], dt("2026-09-01T16:00:00"));
        assert_eq!(got[1], dt("2026-09-08T16:00:00"));
        assert_eq!(got[4], dt("2026-09-29T16:00:00"));
    }

    #[test]
    fn biweekly_with_end_date_never_oversteps() {
        let rec = Recurrence {
            frequency: Frequency::Biweekly,
            end_date: Some(parse_date("2026-10-15").unwrap()),
            max_occurrences: None,
        };
        let anchor = dt("2026-09-01T10:30:00");
        let got = expand_occurrences(anchor, &rec).expect("expand");
        assert!(!got.is_empty());
        for (i, occ) in got.iter().enumerate() {
            assert!(occ.date() <= parse_date("2026-10-15").unwrap());
            assert_eq!((*occ - anchor).num_days(), 14 * i as i64);
        }
        // 09-01, 09-15, 09-29, 10-13; 10-27 is past the end date.
        assert_eq!(got.len(), 4);
    }

    #[test]
    fn both_bounds_stop_at_whichever_triggers_first() {
        let rec = Recurrence {
            frequency: Frequency::Weekly,
            end_date: Some(parse_date("2026-12-31").unwrap()),
            max_occurrences: Some(3),
        };
        let got = expand_occurrences(dt("2026-09-01T09:00:00"), &rec).expect("expand");
        assert_eq!(got.len(), 3);

        let rec = Recurrence {
            frequency: Frequency::Weekly,
            end_date: Some(parse_date("2026-09-09").unwrap()),
            max_occurrences: Some(10),
        };
        let got = expand_occurrences(dt("2026-09-01T09:00:00"), &rec).expect("expand");
        assert_eq!(got.len(), 2);
    }

    #[test]
    fn no_bounds_defaults_to_ten() {
        let rec = Recurrence {
            frequency: Frequency::Weekly,
            end_date: None,
            max_occurrences: None,
        };
        let got = expand_occurrences(dt("2026-09-01T09:00:00"), &rec).expect("expand");
        assert_eq!(got.len(), DEFAULT_OCCURRENCES as usize);
    }

    #[test]
    fn end_date_only_is_capped() {
        let rec = Recurrence {
            frequency: Frequency::Weekly,
            end_date: Some(parse_date("2099-01-01").unwrap()),
            max_occurrences: None,
        };
        let got = expand_occurrences(dt("2026-09-01T09:00:00"), &rec).expect("expand");
        assert_eq!(got.len(), END_DATE_OCCURRENCE_CAP as usize);
    }

    #[test]
    fn invalid_bounds_are_rejected_up_front() {
        let rec = Recurrence {
            frequency: Frequency::Weekly,
            end_date: Some(parse_date("2026-08-01").unwrap()),
            max_occurrences: None,
        };
        assert!(expand_occurrences(dt("2026-09-01T09:00:00"), &rec).is_err());

        let rec = Recurrence {
            frequency: Frequency::Weekly,
            end_date: None,
            max_occurrences: Some(0),
        };
        assert!(expand_occurrences(dt("2026-09-01T09:00:00"), &rec).is_err());
    }

    #[test]
    fn end_date_equal_to_anchor_date_keeps_the_anchor() {
        let rec = Recurrence {
            frequency: Frequency::Biweekly,
            end_date: Some(parse_date("2026-09-01").unwrap()),
            max_occurrences: None,
        };
        let got = expand_occurrences(dt("2026-09-01T18:00:00"), &rec).expect("expand");
        assert_eq!(got.len(), 1);
    }

    #[test]
    fn template_slot_derives_weekday_and_time() {
        // 2026-09-01 is a Tuesday.
        let (dow, tod) = template_slot(dt("2026-09-01T16:45:00"));
        assert_eq!(dow, 1);
        assert_eq!(tod, "16:45");
    }
}
