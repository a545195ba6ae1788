use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Local, Utc};

/// Header row shared by the report file and the query endpoint.
pub const CSV_HEADER: &str = "localTime,refTime,TPS,TxnCount,BlockCount";

/// Block-time label layout, e.g. "02 Jan 2006 15:04:05".
const LOCAL_TIME_FORMAT: &str = "%d %b %Y %H:%M:%S";

/// One emitted throughput sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpsRecord {
    /// Block-time boundary in the local time zone.
    pub local_time: String,
    /// Elapsed time since aggregation start as DD:HH:MM:SS.
    pub ref_time: String,
    pub tps: u32,
    /// Cumulative transactions before the triggering observation.
    pub transactions: u64,
    /// Cumulative blocks before the triggering observation.
    pub blocks: u64,
    /// Block-time boundary the record is labelled with.
    pub timestamp: SystemTime,
}

impl TpsRecord {
    /// Renders the record as one CSV row, newline terminated.
    pub fn csv_row(&self) -> String {
        format!(
            "{},{},{},{},{}\n",
            self.local_time, self.ref_time, self.tps, self.transactions, self.blocks
        )
    }
}

impl fmt::Display for TpsRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TPSRecord: ltime:{} rtime:{} tps:{} txns:{} blks:{}",
            self.local_time, self.ref_time, self.tps, self.transactions, self.blocks
        )
    }
}

/// Formats a block-time boundary in the local time zone. `None` when the
/// time is outside the calendar range.
pub fn format_local_time(t: SystemTime) -> Option<String> {
    let dt = utc_datetime(t)?.with_timezone(&Local);
    Some(dt.format(LOCAL_TIME_FORMAT).to_string())
}

fn utc_datetime(t: SystemTime) -> Option<DateTime<Utc>> {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => DateTime::from_timestamp(i64::try_from(d.as_secs()).ok()?, d.subsec_nanos()),
        Err(e) => {
            let d = e.duration();
            let secs = -i64::try_from(d.as_secs()).ok()?;
            match d.subsec_nanos() {
                0 => DateTime::from_timestamp(secs, 0),
                nanos => DateTime::from_timestamp(secs - 1, 1_000_000_000 - nanos),
            }
        }
    }
}

/// Formats elapsed seconds as days:hours:minutes:seconds. Days keep
/// counting past 365 instead of wrapping.
pub fn format_ref_time(elapsed_secs: u64) -> String {
    let days = elapsed_secs / 86_400;
    let hours = (elapsed_secs % 86_400) / 3_600;
    let minutes = (elapsed_secs % 3_600) / 60;
    let seconds = elapsed_secs % 60;
    format!("{days:02}:{hours:02}:{minutes:02}:{seconds:02}")
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, UNIX_EPOCH};

    use super::*;

    #[test]
    fn test_format_ref_time() {
        assert_eq!(format_ref_time(0), "00:00:00:00");
        assert_eq!(format_ref_time(1), "00:00:00:01");
        assert_eq!(format_ref_time(61), "00:00:01:01");
        assert_eq!(format_ref_time(3_661), "00:01:01:01");
        assert_eq!(format_ref_time(90_061), "01:01:01:01");
        assert_eq!(format_ref_time(864_000), "10:00:00:00");
        assert_eq!(format_ref_time(400 * 86_400), "400:00:00:00");
    }

    #[test]
    fn test_csv_row_field_order() {
        let record = TpsRecord {
            local_time: "01 Jan 2024 00:00:01".to_string(),
            ref_time: "00:00:00:01".to_string(),
            tps: 12,
            transactions: 340,
            blocks: 5,
            timestamp: UNIX_EPOCH,
        };
        assert_eq!(
            record.csv_row(),
            "01 Jan 2024 00:00:01,00:00:00:01,12,340,5\n"
        );
        assert_eq!(CSV_HEADER.split(',').count(), 5);
    }

    #[test]
    fn test_format_local_time_shape() {
        let t = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let s = format_local_time(t).expect("representable time");
        // "DD Mon YYYY HH:MM:SS" regardless of zone.
        assert_eq!(s.len(), 20);
        assert_eq!(s.split(' ').count(), 4);
        assert!(s.contains("2023"));
    }

    #[test]
    fn test_format_local_time_out_of_calendar_range() {
        // Nanosecond timestamps read as seconds land far past year 262143.
        let t = UNIX_EPOCH + Duration::from_secs(1_700_000_000_000_000_000);
        assert_eq!(format_local_time(t), None);

        let before = UNIX_EPOCH - Duration::from_millis(1_500);
        assert!(format_local_time(before).is_some());
    }
}
