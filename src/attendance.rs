use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttendanceStatus {
    Present,
    #[default]
    Absent,
    Leave,
}

impl AttendanceStatus {
    pub const ALL: [AttendanceStatus; 3] = [Self::Present, Self::Absent, Self::Leave];

    /// Manual marking cycle: absent -> present -> leave -> absent.
    pub fn next(self) -> Self {
        match self {
            Self::Absent => Self::Present,
            Self::Present => Self::Leave,
            Self::Leave => Self::Absent,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Present => "present",
            Self::Absent => "absent",
            Self::Leave => "leave",
        }
    }
}

impl fmt::Display for AttendanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown attendance status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for AttendanceStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Self::ALL
            .into_iter()
            .find(|st| st.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersonKind {
    Student,
    Teacher,
}

impl PersonKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Student => "student",
            Self::Teacher => "teacher",
        }
    }
}

/// One stored mark for a person on some day.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DayRecord {
    pub person_id: String,
    pub status: AttendanceStatus,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEntry {
    pub person_id: String,
    pub status: AttendanceStatus,
    pub notes: Option<String>,
}

/// Builds one entry per entity, in entity order. Entities without a record get
/// `default`; for duplicate records the last one wins; records for unknown ids
/// are dropped.
pub fn merge_statuses<S: AsRef<str>>(
    entity_ids: &[S],
    records: &[DayRecord],
    default: AttendanceStatus,
) -> Vec<StatusEntry> {
    let mut by_id: HashMap<&str, &DayRecord> = HashMap::with_capacity(records.len());
    for r in records {
        by_id.insert(r.person_id.as_str(), r);
    }
    entity_ids
        .iter()
        .map(|id| {
            let id = id.as_ref();
            match by_id.get(id) {
                Some(r) => StatusEntry {
                    person_id: id.to_string(),
                    status: r.status,
                    notes: r.notes.clone(),
                },
                None => StatusEntry {
                    person_id: id.to_string(),
                    status: default,
                    notes: None,
                },
            }
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SheetSource {
    Recorded,
    PreviousDay,
    Default,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DaySheet {
    pub source: SheetSource,
    pub entries: Vec<StatusEntry>,
}

pub fn resolve_day<S: AsRef<str>>(
    entity_ids: &[S],
    day_records: &[DayRecord],
    previous_day_records: &[DayRecord],
    fallback_to_previous_day: bool,
    default: AttendanceStatus,
) -> DaySheet {
    let (source, records) = if !day_records.is_empty() {
        (SheetSource::Recorded, day_records)
    } else if fallback_to_previous_day && !previous_day_records.is_empty() {
        (SheetSource::PreviousDay, previous_day_records)
    } else {
        (SheetSource::Default, &[][..])
    };
    DaySheet {
        source,
        entries: merge_statuses(entity_ids, records, default),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RollUp {
    pub present: usize,
    pub absent: usize,
    pub leave: usize,
    pub total: usize,
    pub present_pct: f64,
    pub absent_pct: f64,
    pub leave_pct: f64,
}

impl RollUp {
    pub fn add(&mut self, status: AttendanceStatus) {
        match status {
            AttendanceStatus::Present => self.present += 1,
            AttendanceStatus::Absent => self.absent += 1,
            AttendanceStatus::Leave => self.leave += 1,
        }
        self.total += 1;
        self.refresh_pcts();
    }

    pub fn merge(&mut self, other: &RollUp) {
        self.present += other.present;
        self.absent += other.absent;
        self.leave += other.leave;
        self.total += other.total;
        self.refresh_pcts();
    }

    fn refresh_pcts(&mut self) {
        self.present_pct = pct(self.present, self.total);
        self.absent_pct = pct(self.absent, self.total);
        self.leave_pct = pct(self.leave, self.total);
    }

    pub fn attendance_rate(&self) -> f64 {
        self.present_pct
    }
}

fn pct(count: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    round_2(100.0 * count as f64 / total as f64)
}

pub fn round_2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

pub fn roll_up<I>(statuses: I) -> RollUp
where
    I: IntoIterator<Item = AttendanceStatus>,
{
    let mut r = RollUp::default();
    for s in statuses {
        r.add(s);
    }
    r
}

pub fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok()
}

pub fn format_date(d: NaiveDate) -> String {
    d.format("%Y-%m-%d").to_string()
}

pub fn shift_day(date: NaiveDate, days: i64) -> NaiveDate {
    date + Duration::days(days)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn rec(id: &str, status: AttendanceStatus) -> DayRecord {
        DayRecord {
            person_id: id.to_string(),
            status,
            notes: None,
        }
    }

    #[test]
    fn cycle_closes_after_three_steps() {
        for s in AttendanceStatus::ALL {
            assert_eq!(s.next().next().next(), s);
        }
        assert_eq!(AttendanceStatus::Absent.next(), AttendanceStatus::Present);
        assert_eq!(AttendanceStatus::Present.next(), AttendanceStatus::Leave);
        assert_eq!(AttendanceStatus::Leave.next(), AttendanceStatus::Absent);
    }

    #[test]
    fn status_parse_is_case_insensitive() {
        assert_eq!("Present".parse::<AttendanceStatus>(), Ok(AttendanceStatus::Present));
        assert_eq!(" LEAVE ".parse::<AttendanceStatus>(), Ok(AttendanceStatus::Leave));
        let e = "late".parse::<AttendanceStatus>().unwrap_err();
        assert_eq!(e, UnknownStatus("late".to_string()));
        assert_eq!(e.to_string(), "unknown attendance status: late");
    }

    #[test]
    fn merge_yields_one_entry_per_entity_in_order() {
        let ids = ["s3", "s1", "s2"];
        let records = vec![
            rec("s1", AttendanceStatus::Present),
            rec("ghost", AttendanceStatus::Present),
        ];
        let merged = merge_statuses(&ids, &records, AttendanceStatus::Absent);
        assert_eq!(merged.len(), ids.len());
        let got: Vec<(&str, AttendanceStatus)> = merged
            .iter()
            .map(|e| (e.person_id.as_str(), e.status))
            .collect();
        assert_eq!(
            got,
            vec![
                ("s3", AttendanceStatus::Absent),
                ("s1", AttendanceStatus::Present),
                ("s2", AttendanceStatus::Absent),
            ]
        );
    }

    #[test]
    fn duplicate_records_last_one_wins() {
        let ids = ["s1"];
        let records = vec![
            rec("s1", AttendanceStatus::Present),
            rec("s1", AttendanceStatus::Leave),
        ];
        let merged = merge_statuses(&ids, &records, AttendanceStatus::Absent);
        assert_eq!(merged[0].status, AttendanceStatus::Leave);
    }

    #[test]
    fn resolve_day_prefers_recorded_then_previous_then_default() {
        let ids = ["a", "b"];
        let today = vec![rec("a", AttendanceStatus::Leave)];
        let yesterday = vec![rec("b", AttendanceStatus::Present)];

        let s = resolve_day(&ids, &today, &yesterday, true, AttendanceStatus::Absent);
        assert_eq!(s.source, SheetSource::Recorded);
        assert_eq!(s.entries[0].status, AttendanceStatus::Leave);
        assert_eq!(s.entries[1].status, AttendanceStatus::Absent);

        let s = resolve_day(&ids, &[], &yesterday, true, AttendanceStatus::Absent);
        assert_eq!(s.source, SheetSource::PreviousDay);
        assert_eq!(s.entries[1].status, AttendanceStatus::Present);

        let s = resolve_day(&ids, &[], &yesterday, false, AttendanceStatus::Absent);
        assert_eq!(s.source, SheetSource::Default);
        assert!(s
            .entries
            .iter()
            .all(|e| e.status == AttendanceStatus::Absent));
    }

    #[test]
    fn roll_up_counts_and_percentages() {
        use AttendanceStatus::*;
        let r = roll_up([Present, Present, Absent, Leave, Present, Present]);
        assert_eq!((r.present, r.absent, r.leave, r.total), (4, 1, 1, 6));
        assert_eq!(r.present_pct, 66.67);
        assert_eq!(r.absent_pct, 16.67);
        assert_eq!(r.leave_pct, 16.67);
        assert_eq!(r.attendance_rate(), 66.67);

        let empty = roll_up(std::iter::empty());
        assert_eq!(empty.total, 0);
        assert_eq!(empty.present_pct, 0.0);
    }

    #[test]
    fn merged_roll_ups_match_a_single_pass() {
        use AttendanceStatus::*;
        let mut a = roll_up([Present, Absent]);
        let b = roll_up([Leave, Present, Present]);
        a.merge(&b);
        assert_eq!(a, roll_up([Present, Absent, Leave, Present, Present]));
    }

    #[test]
    fn shift_day_crosses_month_and_year_boundaries() {
        let d = parse_date("2024-01-31").unwrap();
        assert_eq!(format_date(shift_day(d, 1)), "2024-02-01");
        let d = parse_date("2024-03-01").unwrap();
        assert_eq!(format_date(shift_day(d, -1)), "2024-02-29");
        let d = parse_date("2023-12-31").unwrap();
        assert_eq!(format_date(shift_day(d, 1)), "2024-01-01");
        assert_eq!(shift_day(shift_day(d, 1), -1), d);
    }

    #[test]
    fn parse_date_rejects_garbage() {
        assert!(parse_date("2024-02-30").is_none());
        assert!(parse_date("31/01/2024").is_none());
        assert!(parse_date(" 2024-02-01 ").is_some());
    }
}
