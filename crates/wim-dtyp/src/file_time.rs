//! Timestamps in the representation WIM metadata stores: unsigned
//! 100-nanosecond ticks since 1601-01-01T00:00:00Z, the FILETIME layout
//! of [MS-DTYP] 2.3.3.
//!
//! WIM inodes carry three of these per file (creation, last write, last
//! access); a zero value means the archive did not record the timestamp.
//! Extraction backends want the value split into Unix-epoch seconds and
//! nanoseconds, so the conversions here are built around that split.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use binrw::prelude::*;
use time::OffsetDateTime;

#[derive(BinRead, BinWrite, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct FileTime {
    ticks: u64,
}

impl FileTime {
    /// One tick is 100 ns.
    pub const TICKS_PER_SECOND: u64 = 10_000_000;
    const NANOS_PER_TICK: u32 = 100;
    /// Seconds from 1601-01-01 to 1970-01-01: 134774 days, 89 of them
    /// leap days.
    const UNIX_EPOCH_DELTA_SECS: i64 = 11_644_473_600;

    /// The raw tick count as stored in the archive.
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Whether the archive recorded a value at all. Zero means "not
    /// stored"; extraction leaves such timestamps untouched.
    pub fn is_set(&self) -> bool {
        self.ticks != 0
    }

    /// Splits into whole seconds and leftover nanoseconds relative to the
    /// Unix epoch; seconds are negative for values before 1970.
    pub fn unix_parts(&self) -> (i64, u32) {
        let secs = (self.ticks / Self::TICKS_PER_SECOND) as i64 - Self::UNIX_EPOCH_DELTA_SECS;
        let nanos = (self.ticks % Self::TICKS_PER_SECOND) as u32 * Self::NANOS_PER_TICK;
        (secs, nanos)
    }

    /// Builds a tick count from Unix-epoch seconds and nanoseconds.
    /// Instants before 1601 are not representable and clamp to zero
    /// (which doubles as "not stored").
    pub fn from_unix_parts(secs: i64, nanos: u32) -> Self {
        let Some(since_1601) = secs
            .checked_add(Self::UNIX_EPOCH_DELTA_SECS)
            .filter(|s| *s >= 0)
        else {
            return Self { ticks: 0 };
        };
        Self {
            ticks: since_1601 as u64 * Self::TICKS_PER_SECOND
                + (nanos / Self::NANOS_PER_TICK) as u64,
        }
    }

    /// Calendar form, for display. `None` when the tick count lies
    /// outside the calendar range the `time` crate models.
    pub fn date_time(&self) -> Option<OffsetDateTime> {
        let (secs, nanos) = self.unix_parts();
        OffsetDateTime::from_unix_timestamp_nanos(secs as i128 * 1_000_000_000 + nanos as i128)
            .ok()
    }
}

impl fmt::Display for FileTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.date_time() {
            Some(dt) => fmt::Display::fmt(&dt, f),
            None => write!(f, "{} ticks", self.ticks),
        }
    }
}

impl fmt::Debug for FileTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileTime({self})")
    }
}

impl From<u64> for FileTime {
    fn from(ticks: u64) -> Self {
        Self { ticks }
    }
}

impl From<FileTime> for u64 {
    fn from(time: FileTime) -> u64 {
        time.ticks
    }
}

impl From<SystemTime> for FileTime {
    fn from(time: SystemTime) -> Self {
        match time.duration_since(UNIX_EPOCH) {
            Ok(after) => Self::from_unix_parts(after.as_secs() as i64, after.subsec_nanos()),
            Err(earlier) => {
                let before = earlier.duration();
                if before.subsec_nanos() == 0 {
                    Self::from_unix_parts(-(before.as_secs() as i64), 0)
                } else {
                    Self::from_unix_parts(
                        -(before.as_secs() as i64) - 1,
                        1_000_000_000 - before.subsec_nanos(),
                    )
                }
            }
        }
    }
}

impl From<FileTime> for SystemTime {
    fn from(time: FileTime) -> SystemTime {
        let (secs, nanos) = time.unix_parts();
        if secs >= 0 {
            UNIX_EPOCH + Duration::new(secs as u64, nanos)
        } else {
            UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs()) + Duration::from_nanos(nanos as u64)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    /// 1970-01-01 expressed in ticks since 1601.
    const UNIX_EPOCH_TICKS: u64 =
        FileTime::UNIX_EPOCH_DELTA_SECS as u64 * FileTime::TICKS_PER_SECOND;
    /// 2020-01-01T00:00:00.25Z: Unix second 1577836800 plus 250 ms.
    const Y2020_TICKS: u64 = 132_223_104_002_500_000;

    #[test]
    fn test_unix_epoch_round_trip() {
        let time = FileTime::from(UNIX_EPOCH_TICKS);
        assert_eq!(time.unix_parts(), (0, 0));
        assert_eq!(SystemTime::from(time), UNIX_EPOCH);
        assert_eq!(time.date_time(), Some(datetime!(1970-01-01 00:00:00 UTC)));
        assert_eq!(FileTime::from(UNIX_EPOCH), time);
    }

    #[test]
    fn test_fractional_seconds_keep_tick_precision() {
        let time = FileTime::from(Y2020_TICKS);
        assert_eq!(time.unix_parts(), (1_577_836_800, 250_000_000));
        assert_eq!(
            time.date_time(),
            Some(datetime!(2020-01-01 00:00:00.25 UTC))
        );
        assert_eq!(FileTime::from(SystemTime::from(time)), time);
    }

    #[test]
    fn test_values_before_unix_epoch() {
        // One day after the FILETIME epoch.
        let time = FileTime::from(86_400 * FileTime::TICKS_PER_SECOND);
        let (secs, nanos) = time.unix_parts();
        assert_eq!(secs, 86_400 - FileTime::UNIX_EPOCH_DELTA_SECS);
        assert_eq!(nanos, 0);
        assert_eq!(time.date_time(), Some(datetime!(1601-01-02 00:00:00 UTC)));
        assert_eq!(FileTime::from(SystemTime::from(time)), time);
    }

    #[test]
    fn test_pre_1601_clamps_to_unset() {
        let time = FileTime::from_unix_parts(-FileTime::UNIX_EPOCH_DELTA_SECS - 1, 0);
        assert!(!time.is_set());
        assert!(!FileTime::default().is_set());
        assert!(FileTime::from(1u64).is_set());
    }

    #[test]
    fn test_sub_tick_nanoseconds_truncate() {
        let time = FileTime::from_unix_parts(0, 199);
        assert_eq!(time.ticks(), UNIX_EPOCH_TICKS + 1);
        assert_eq!(u64::from(time), UNIX_EPOCH_TICKS + 1);
    }
}
