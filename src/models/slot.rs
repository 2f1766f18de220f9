use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use thiserror::Error;

use super::vendor::VendorKey;

/// Coarse time-of-day bucket. Used for UI filtering only, never for booking semantics.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum DayPeriod {
    Morning,
    Afternoon,
    Evening,
    Night,
}

impl DayPeriod {
    /// morning 05:00-11:59, afternoon 12:00-16:59, evening 17:00-20:59, night otherwise
    pub fn of(time: NaiveTime) -> Self {
        match time.hour() {
            5..=11 => DayPeriod::Morning,
            12..=16 => DayPeriod::Afternoon,
            17..=20 => DayPeriod::Evening,
            _ => DayPeriod::Night,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SlotTimeError {
    #[error("empty time string")]
    Empty,
    #[error("unrecognised time format: {0:?}")]
    Unrecognised(String),
    #[error("time out of range: {0:?}")]
    OutOfRange(String),
}

static CLOCK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(\d{1,2})(?:[:.](\d{2}))?(?::(\d{2}))?\s*(?:([ap])\.?\s*m\.?)?$")
        .expect("clock pattern compiles")
});

static RANGE_SPLIT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\s*(?:-|–|—|\bto\b)\s*").expect("range pattern compiles"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Meridiem {
    Am,
    Pm,
}

impl Meridiem {
    fn flip(self) -> Self {
        match self {
            Meridiem::Am => Meridiem::Pm,
            Meridiem::Pm => Meridiem::Am,
        }
    }
}

#[derive(Debug)]
struct ClockToken<'a> {
    raw: &'a str,
    hour: u32,
    minute: u32,
    second: u32,
    meridiem: Option<Meridiem>,
}

fn lex_clock(raw: &str) -> Result<ClockToken<'_>, SlotTimeError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(SlotTimeError::Empty);
    }
    let caps = CLOCK_RE
        .captures(trimmed)
        .ok_or_else(|| SlotTimeError::Unrecognised(trimmed.to_string()))?;

    let number = |idx: usize| -> Result<u32, SlotTimeError> {
        caps.get(idx)
            .map(|m| m.as_str().parse::<u32>())
            .transpose()
            .map(|v| v.unwrap_or(0))
            .map_err(|_| SlotTimeError::Unrecognised(trimmed.to_string()))
    };

    let meridiem = caps.get(4).map(|m| {
        if m.as_str().eq_ignore_ascii_case("a") {
            Meridiem::Am
        } else {
            Meridiem::Pm
        }
    });

    Ok(ClockToken {
        raw: trimmed,
        hour: number(1)?,
        minute: number(2)?,
        second: number(3)?,
        meridiem,
    })
}

fn resolve(token: &ClockToken<'_>, meridiem: Option<Meridiem>) -> Result<NaiveTime, SlotTimeError> {
    let out_of_range = || SlotTimeError::OutOfRange(token.raw.to_string());
    let hour = match meridiem {
        None => token.hour,
        Some(m) => {
            if !(1..=12).contains(&token.hour) {
                return Err(out_of_range());
            }
            let base = token.hour % 12;
            match m {
                Meridiem::Am => base,
                Meridiem::Pm => base + 12,
            }
        }
    };
    NaiveTime::from_hms_opt(hour, token.minute, token.second).ok_or_else(out_of_range)
}

/// Parses a single clock reading ("10:00 AM", "10am", "14:30", "07.15").
/// A reading without an AM/PM marker is taken as 24-hour time.
pub fn parse_clock(raw: &str) -> Result<NaiveTime, SlotTimeError> {
    let token = lex_clock(raw)?;
    resolve(&token, token.meridiem)
}

/// Parses a vendor time field that may be a single reading or a range
/// ("10:00 AM - 10:30 AM", "10:00-10:30", "9 to 9:30 pm").
///
/// When only the end of a range carries a marker, the start inherits it unless
/// that would put the start after the end.
pub fn parse_time_range(raw: &str) -> Result<(NaiveTime, Option<NaiveTime>), SlotTimeError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(SlotTimeError::Empty);
    }

    let mut parts = RANGE_SPLIT_RE.splitn(trimmed, 2);
    let start_token = lex_clock(parts.next().unwrap_or_default())?;
    let Some(end_raw) = parts.next() else {
        return Ok((resolve(&start_token, start_token.meridiem)?, None));
    };

    let end_token = lex_clock(end_raw)?;
    let end = resolve(&end_token, end_token.meridiem)?;

    let start = match (start_token.meridiem, end_token.meridiem) {
        (None, Some(marker)) if (1..=12).contains(&start_token.hour) => {
            let inherited = resolve(&start_token, Some(marker))?;
            if inherited <= end {
                inherited
            } else {
                resolve(&start_token, Some(marker.flip()))?
            }
        }
        _ => resolve(&start_token, start_token.meridiem)?,
    };

    Ok((start, Some(end)))
}

/// Slot identity. Two slots with the same display text from different vendors
/// are different slots.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlotKey {
    pub vendor: VendorKey,
    pub slot_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSlot {
    pub vendor: VendorKey,
    pub slot_id: String,
    pub date: NaiveDate,
    /// Canonical 24-hour start time.
    pub start: NaiveTime,
    pub end: Option<NaiveTime>,
    pub period: DayPeriod,
    /// Text as the vendor presented it.
    pub label: String,
}

impl TimeSlot {
    pub fn new(
        vendor: VendorKey,
        slot_id: impl Into<String>,
        date: NaiveDate,
        start: NaiveTime,
        end: Option<NaiveTime>,
        label: impl Into<String>,
    ) -> Self {
        Self {
            vendor,
            slot_id: slot_id.into(),
            date,
            start,
            end,
            period: DayPeriod::of(start),
            label: label.into(),
        }
    }

    /// Builds a slot from a raw vendor time field, normalising it to 24-hour form.
    pub fn from_raw(
        vendor: VendorKey,
        slot_id: impl Into<String>,
        date: NaiveDate,
        raw_time: &str,
    ) -> Result<Self, SlotTimeError> {
        let (start, end) = parse_time_range(raw_time)?;
        Ok(Self::new(vendor, slot_id, date, start, end, raw_time.trim()))
    }

    pub fn key(&self) -> SlotKey {
        SlotKey {
            vendor: self.vendor,
            slot_id: self.slot_id.clone(),
        }
    }

    /// "HH:MM" or "HH:MM-HH:MM".
    pub fn canonical_time(&self) -> String {
        match self.end {
            Some(end) => format!("{}-{}", self.start.format("%H:%M"), end.format("%H:%M")),
            None => self.start.format("%H:%M").to_string(),
        }
    }

    /// Start instant in the vendor's wall-clock offset.
    pub fn starts_at(&self, offset: FixedOffset) -> Option<DateTime<FixedOffset>> {
        offset
            .from_local_datetime(&self.date.and_time(self.start))
            .single()
    }

    /// A slot is bookable only if it starts strictly after `now`.
    pub fn is_bookable_at(&self, now: DateTime<Utc>, offset: FixedOffset) -> bool {
        self.starts_at(offset)
            .map(|start| start > now)
            .unwrap_or(false)
    }
}

/// Parameters for one slot listing call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotQuery {
    pub vendor: VendorKey,
    /// Doctor id for consultations, center id for diagnostics.
    pub provider_ref: String,
    /// Branch/clinic id; required by vendors that partition by branch.
    #[serde(default)]
    pub branch_id: Option<String>,
    pub date: NaiveDate,
    pub period: DayPeriod,
}

/// A slot as a source returned it, before normalisation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawSlot {
    #[serde(default)]
    pub slot_id: Option<String>,
    /// Overrides the query date when the source reports its own.
    #[serde(default)]
    pub date: Option<NaiveDate>,
    /// Start time, or a whole "start - end" range.
    pub start: String,
    #[serde(default)]
    pub end: Option<String>,
}

/// Keeps the slots falling in `period`, preserving their order.
pub fn filter_by_period<I>(slots: I, period: DayPeriod) -> Vec<TimeSlot>
where
    I: IntoIterator<Item = TimeSlot>,
{
    slots.into_iter().filter(|s| s.period == period).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rstest::rstest;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[rstest]
    #[case("10:00 AM", t(10, 0))]
    #[case("10:00AM", t(10, 0))]
    #[case("10 am", t(10, 0))]
    #[case("12:00 AM", t(0, 0))]
    #[case("12:15 PM", t(12, 15))]
    #[case("7:45 p.m.", t(19, 45))]
    #[case("14:30", t(14, 30))]
    #[case("09:05:00", t(9, 5))]
    #[case("07.15", t(7, 15))]
    fn parses_clock_readings(#[case] raw: &str, #[case] expected: NaiveTime) {
        assert_eq!(parse_clock(raw).unwrap(), expected);
    }

    #[rstest]
    #[case("")]
    #[case("noon")]
    #[case("25:00")]
    #[case("13:00 PM")]
    #[case("10:75")]
    fn rejects_bad_readings(#[case] raw: &str) {
        assert!(parse_clock(raw).is_err());
    }

    #[rstest]
    #[case("10:00 AM - 10:30 AM", t(10, 0), Some(t(10, 30)))]
    #[case("10:00-10:30", t(10, 0), Some(t(10, 30)))]
    #[case("1:00 - 1:30 PM", t(13, 0), Some(t(13, 30)))]
    #[case("11:30 - 12:30 PM", t(11, 30), Some(t(12, 30)))]
    #[case("9 to 9:30 pm", t(21, 0), Some(t(21, 30)))]
    #[case("16:00", t(16, 0), None)]
    fn parses_ranges(
        #[case] raw: &str,
        #[case] start: NaiveTime,
        #[case] end: Option<NaiveTime>,
    ) {
        assert_eq!(parse_time_range(raw).unwrap(), (start, end));
    }

    #[test]
    fn period_boundaries() {
        assert_eq!(DayPeriod::of(t(4, 59)), DayPeriod::Night);
        assert_eq!(DayPeriod::of(t(5, 0)), DayPeriod::Morning);
        assert_eq!(DayPeriod::of(t(11, 59)), DayPeriod::Morning);
        assert_eq!(DayPeriod::of(t(12, 0)), DayPeriod::Afternoon);
        assert_eq!(DayPeriod::of(t(17, 0)), DayPeriod::Evening);
        assert_eq!(DayPeriod::of(t(21, 0)), DayPeriod::Night);
    }

    #[test]
    fn slot_one_minute_in_the_past_is_expired() {
        let offset = FixedOffset::east_opt(330 * 60).unwrap();
        let now = Utc::now();
        let local = now.with_timezone(&offset).naive_local();

        let past = local - Duration::minutes(1);
        let future = local + Duration::minutes(1);
        let slot_at = |dt: chrono::NaiveDateTime| {
            TimeSlot::new(VendorKey::Clinic, "s", dt.date(), dt.time(), None, "")
        };

        assert!(!slot_at(past).is_bookable_at(now, offset));
        assert!(slot_at(future).is_bookable_at(now, offset));
    }

    #[test]
    fn identical_labels_from_different_vendors_are_distinct() {
        let date = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
        let a = TimeSlot::from_raw(VendorKey::Clinic, "42", date, "10:00 AM").unwrap();
        let b = TimeSlot::from_raw(VendorKey::PartnerClinic, "42", date, "10:00 AM").unwrap();
        assert_eq!(a.label, b.label);
        assert_ne!(a.key(), b.key());
    }

    #[test]
    fn canonical_time_is_24_hour() {
        let date = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
        let slot = TimeSlot::from_raw(VendorKey::Clinic, "1", date, "2:00 PM - 2:30 PM").unwrap();
        assert_eq!(slot.canonical_time(), "14:00-14:30");
        assert_eq!(slot.period, DayPeriod::Afternoon);
    }
}
