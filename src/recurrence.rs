//! Recurrence rules, consumed when a recurring task is completed.

use chrono::{DateTime, Duration, Months, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecurrenceUnit {
    Days,
    Weeks,
    Months,
    Years,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recurrence {
    pub interval: u32,
    pub unit: RecurrenceUnit,
}

impl Recurrence {
    pub fn new(interval: u32, unit: RecurrenceUnit) -> Self {
        Recurrence { interval, unit }
    }

    pub fn is_valid(&self) -> bool {
        self.interval > 0
    }

    /// The due date of the next occurrence when completed at `from`.
    ///
    /// Days and weeks are fixed-length adds. Months and years are calendar
    /// adds: Jan 31 + 1 month lands on the last day of February.
    /// Returns None if the result falls outside chrono's range.
    pub fn next_after(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let n = self.interval;
        match self.unit {
            RecurrenceUnit::Days => from.checked_add_signed(Duration::days(n as i64)),
            RecurrenceUnit::Weeks => from.checked_add_signed(Duration::weeks(n as i64)),
            RecurrenceUnit::Months => from.checked_add_months(Months::new(n)),
            RecurrenceUnit::Years => from.checked_add_months(Months::new(n.checked_mul(12)?)),
        }
    }
}
