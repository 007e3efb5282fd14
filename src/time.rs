//! CP56Time2a / CP24Time2a / CP16Time2a binary time tags
//!
//! CP56Time2a is the 7-octet wall-clock tag carried by timestamped
//! information objects and the clock synchronization command:
//!
//! ```text
//! octet 0..1  milliseconds of minute (0..59999), little-endian
//! octet 2     minute (0..59) | IV << 7
//! octet 3     hour (0..23) | SU << 7
//! octet 4     day of month (1..31) | day of week << 5
//! octet 5     month (1..12)
//! octet 6     year (0..99), 70..99 = 19xx, 0..69 = 20xx
//! ```
//!
//! CP24Time2a is the truncated 3-octet form (milliseconds + minute + IV).

use bytes::{BufMut, BytesMut};
use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::codec::Reader;
use crate::common::AsduDecodeError;

/// 7-octet binary time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Cp56Time2a {
    /// Milliseconds of the minute (0..59999)
    pub millisecond: u16,
    /// Minute (0..59)
    pub minute: u8,
    /// Invalid flag
    pub invalid: bool,
    /// Hour (0..23)
    pub hour: u8,
    /// Summer time flag
    pub summer_time: bool,
    /// Day of month (1..31)
    pub day_of_month: u8,
    /// Day of week (1 = Monday .. 7 = Sunday, 0 = not used)
    pub day_of_week: u8,
    /// Month (1..12)
    pub month: u8,
    /// Two-digit year (70..99 = 19xx, 0..69 = 20xx)
    pub year: u8,
}

/// Encoded size of [`Cp56Time2a`]
pub const CP56_SIZE: usize = 7;
/// Encoded size of [`Cp24Time2a`]
pub const CP24_SIZE: usize = 3;

impl Cp56Time2a {
    /// Build from a UTC wall-clock instant. The day-of-week field is left
    /// unused (0); set it explicitly when the remote end requires it.
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self {
            millisecond: (dt.second() * 1000) as u16 + dt.timestamp_subsec_millis() as u16,
            minute: dt.minute() as u8,
            invalid: false,
            hour: dt.hour() as u8,
            summer_time: false,
            day_of_month: dt.day() as u8,
            day_of_week: 0,
            month: dt.month() as u8,
            year: (dt.year() % 100) as u8,
        }
    }

    /// Current UTC time
    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }

    /// Interpret the tag as a UTC instant. Returns `None` when the fields do
    /// not form a valid calendar date.
    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        let year = if self.year >= 70 {
            1900 + self.year as i32
        } else {
            2000 + self.year as i32
        };
        let seconds = self.millisecond / 1000;
        let millis = self.millisecond % 1000;
        Utc.with_ymd_and_hms(
            year,
            self.month as u32,
            self.day_of_month as u32,
            self.hour as u32,
            self.minute as u32,
            seconds as u32,
        )
        .single()
        .map(|dt| dt + chrono::Duration::milliseconds(millis as i64))
    }

    pub(crate) fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16_le(self.millisecond);
        buf.put_u8((self.minute & 0x3F) | if self.invalid { 0x80 } else { 0 });
        buf.put_u8((self.hour & 0x1F) | if self.summer_time { 0x80 } else { 0 });
        buf.put_u8((self.day_of_month & 0x1F) | ((self.day_of_week & 0x07) << 5));
        buf.put_u8(self.month & 0x0F);
        buf.put_u8(self.year & 0x7F);
    }

    pub(crate) fn decode(r: &mut Reader<'_>) -> Result<Self, AsduDecodeError> {
        let millisecond = r.read_u16_le()?;
        let minute_octet = r.read_u8()?;
        let hour_octet = r.read_u8()?;
        let day_octet = r.read_u8()?;
        let month = r.read_u8()? & 0x0F;
        let year = r.read_u8()? & 0x7F;
        Ok(Self {
            millisecond,
            minute: minute_octet & 0x3F,
            invalid: (minute_octet & 0x80) != 0,
            hour: hour_octet & 0x1F,
            summer_time: (hour_octet & 0x80) != 0,
            day_of_month: day_octet & 0x1F,
            day_of_week: (day_octet >> 5) & 0x07,
            month,
            year,
        })
    }
}

/// 3-octet truncated binary time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Cp24Time2a {
    /// Milliseconds of the minute (0..59999)
    pub millisecond: u16,
    /// Minute (0..59)
    pub minute: u8,
    /// Invalid flag
    pub invalid: bool,
}

impl Cp24Time2a {
    /// Truncate a UTC instant to milliseconds + minute
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self {
            millisecond: (dt.second() * 1000) as u16 + dt.timestamp_subsec_millis() as u16,
            minute: dt.minute() as u8,
            invalid: false,
        }
    }

    /// Current UTC time, truncated
    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }

    pub(crate) fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16_le(self.millisecond);
        buf.put_u8((self.minute & 0x3F) | if self.invalid { 0x80 } else { 0 });
    }

    pub(crate) fn decode(r: &mut Reader<'_>) -> Result<Self, AsduDecodeError> {
        let millisecond = r.read_u16_le()?;
        let minute_octet = r.read_u8()?;
        Ok(Self {
            millisecond,
            minute: minute_octet & 0x3F,
            invalid: (minute_octet & 0x80) != 0,
        })
    }
}

/// 2-octet millisecond duration (delay acquisition)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Cp16Time2a {
    /// Milliseconds (0..59999)
    pub millisecond: u16,
}

impl Cp16Time2a {
    pub fn new(millisecond: u16) -> Self {
        Self { millisecond }
    }

    pub(crate) fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16_le(self.millisecond);
    }

    pub(crate) fn decode(r: &mut Reader<'_>) -> Result<Self, AsduDecodeError> {
        Ok(Self {
            millisecond: r.read_u16_le()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn cp56_epoch_2024_vector() {
        // 2024-01-01T00:00:00.000Z
        let dt = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let time = Cp56Time2a::from_datetime(dt);
        let mut buf = BytesMut::new();
        time.encode(&mut buf);
        assert_eq!(&buf[..], &[0x00, 0x00, 0x00, 0x00, 0x01, 0x01, 0x18]);

        let mut r = Reader::new(&buf);
        let decoded = Cp56Time2a::decode(&mut r).unwrap();
        assert_eq!(decoded, time);
        assert_eq!(decoded.to_datetime().unwrap(), dt);
    }

    #[test]
    fn cp56_carries_flags_and_dow() {
        let time = Cp56Time2a {
            millisecond: 59_999,
            minute: 59,
            invalid: true,
            hour: 23,
            summer_time: true,
            day_of_month: 31,
            day_of_week: 7,
            month: 12,
            year: 99,
        };
        let mut buf = BytesMut::new();
        time.encode(&mut buf);
        assert_eq!(buf.len(), CP56_SIZE);
        let mut r = Reader::new(&buf);
        assert_eq!(Cp56Time2a::decode(&mut r).unwrap(), time);
    }

    #[test]
    fn cp56_year_window() {
        let t1999 = Cp56Time2a {
            day_of_month: 1,
            month: 1,
            year: 99,
            ..Default::default()
        };
        assert_eq!(t1999.to_datetime().unwrap().year(), 1999);

        let t2069 = Cp56Time2a {
            day_of_month: 1,
            month: 1,
            year: 69,
            ..Default::default()
        };
        assert_eq!(t2069.to_datetime().unwrap().year(), 2069);
    }

    #[test]
    fn cp56_invalid_calendar_is_none() {
        let bad = Cp56Time2a {
            day_of_month: 31,
            month: 2,
            year: 24,
            ..Default::default()
        };
        assert_eq!(bad.to_datetime(), None);
    }

    #[test]
    fn cp24_round_trip() {
        let time = Cp24Time2a {
            millisecond: 1_500,
            minute: 42,
            invalid: false,
        };
        let mut buf = BytesMut::new();
        time.encode(&mut buf);
        assert_eq!(buf.len(), CP24_SIZE);
        let mut r = Reader::new(&buf);
        assert_eq!(Cp24Time2a::decode(&mut r).unwrap(), time);
    }

    #[test]
    fn cp24_truncated_fails() {
        let data = [0x00, 0x01];
        let mut r = Reader::new(&data);
        assert_eq!(
            Cp24Time2a::decode(&mut r),
            Err(AsduDecodeError::TruncatedObject)
        );
    }
}
