/// Things that impl this can tell you the current time.
pub trait TimeSource {
    /// Returns the current time
    fn get_timestamp(&self) -> Timestamp;
}

/// Represents an instant in time, in the local time zone.
///
/// FAT stores times with a two second resolution and no zone; exFAT adds a
/// 10 ms increment byte and a zone byte, which this engine writes as zero.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Timestamp {
    /// Add 1970 to this file to get the calendar year
    pub year_since_1970: u8,
    /// Add one to this value to get the calendar month
    pub zero_indexed_month: u8,
    /// Add one to this value to get the calendar day
    pub zero_indexed_day: u8,
    /// The number of hours past midnight
    pub hours: u8,
    /// The number of minutes past the hour
    pub minutes: u8,
    /// The number of seconds past the minute
    pub seconds: u8,
}

impl Timestamp {
    /// Create a `Timestamp` from the 16-bit FAT date and time fields.
    pub fn from_fat(date: u16, time: u16) -> Timestamp {
        let year = 1980 + (date >> 9);
        let month = ((date >> 5) & 0x000F) as u8;
        let day = (date & 0x001F) as u8;
        let hours = ((time >> 11) & 0x001F) as u8;
        let minutes = ((time >> 5) & 0x0003F) as u8;
        let seconds = ((time << 1) & 0x0003F) as u8;
        Timestamp {
            year_since_1970: (year - 1970) as u8,
            zero_indexed_month: month.saturating_sub(1),
            zero_indexed_day: day.saturating_sub(1),
            hours,
            minutes,
            seconds,
        }
    }

    /// Create a `Timestamp` from the packed 32-bit form, date in the upper
    /// half and time in the lower half.
    pub fn from_fat_packed(packed: u32) -> Timestamp {
        Timestamp::from_fat((packed >> 16) as u16, packed as u16)
    }

    /// The 16-bit FAT date field. Years before 1980 clamp to 1980.
    pub fn fat_date(&self) -> u16 {
        let year = u16::from(self.year_since_1970).saturating_sub(10).min(127);
        (year << 9)
            | (u16::from(self.zero_indexed_month + 1) << 5)
            | u16::from(self.zero_indexed_day + 1)
    }

    /// The 16-bit FAT time field.
    pub fn fat_time(&self) -> u16 {
        (u16::from(self.hours) << 11)
            | (u16::from(self.minutes) << 5)
            | u16::from(self.seconds / 2)
    }

    /// Date and time packed into one word, the way FAT and exFAT lay them
    /// out side by side.
    pub fn to_fat_packed(&self) -> u32 {
        (u32::from(self.fat_date()) << 16) | u32::from(self.fat_time())
    }

    /// Serialize a `Timestamp` to FAT format: time then date, little endian.
    pub fn serialize_to_fat(self) -> [u8; 4] {
        let mut data = [0u8; 4];
        data[..2].copy_from_slice(&self.fat_time().to_le_bytes());
        data[2..].copy_from_slice(&self.fat_date().to_le_bytes());
        data
    }

    /// Create a `Timestamp` from year/month/day/hour/minute/second.
    ///
    /// Values should be given as you'd write then (i.e. 1980, 01, 01, 13, 30,
    /// 05) - i.e. the year is not 1970-based and the month is not zero based.
    pub fn from_calendar(
        year: u16,
        month: u8,
        day: u8,
        hours: u8,
        minutes: u8,
        seconds: u8,
    ) -> Result<Timestamp, &'static str> {
        Ok(Timestamp {
            year_since_1970: if (1980..=2107).contains(&year) {
                (year - 1970) as u8
            } else {
                return Err("Bad year");
            },
            zero_indexed_month: if (1..=12).contains(&month) {
                month - 1
            } else {
                return Err("Bad month");
            },
            zero_indexed_day: if (1..=31).contains(&day) {
                day - 1
            } else {
                return Err("Bad day");
            },
            hours: if hours <= 23 {
                hours
            } else {
                return Err("Bad hours");
            },
            minutes: if minutes <= 59 {
                minutes
            } else {
                return Err("Bad minutes");
            },
            seconds: if seconds <= 59 {
                seconds
            } else {
                return Err("Bad seconds");
            },
        })
    }
}

impl core::fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "Timestamp({})", self)
    }
}

impl core::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(
            f,
            "{}-{:02}-{:02} {:02}:{:02}:{:02}",
            u16::from(self.year_since_1970) + 1970,
            self.zero_indexed_month + 1,
            self.zero_indexed_day + 1,
            self.hours,
            self.minutes,
            self.seconds
        )
    }
}

// ****************************************************************************
//
// Unit Tests
//
// ****************************************************************************

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fat_fields_round_trip() {
        let ts = Timestamp::from_calendar(2023, 11, 30, 23, 59, 58).unwrap();
        let back = Timestamp::from_fat(ts.fat_date(), ts.fat_time());
        assert_eq!(ts, back);
        assert_eq!(Timestamp::from_fat_packed(ts.to_fat_packed()), ts);
    }

    #[test]
    fn known_encoding() {
        // 2018-06-30 12:34:56
        let ts = Timestamp::from_calendar(2018, 6, 30, 12, 34, 56).unwrap();
        assert_eq!(ts.fat_date(), (38 << 9) | (6 << 5) | 30);
        assert_eq!(ts.fat_time(), (12 << 11) | (34 << 5) | 28);
        assert_eq!(ts.serialize_to_fat(), hex!("5C 64 DE 4C"));
        assert_eq!(format!("{}", ts), "2018-06-30 12:34:56");
    }

    #[test]
    fn rejects_out_of_range() {
        assert!(Timestamp::from_calendar(1979, 1, 1, 0, 0, 0).is_err());
        assert!(Timestamp::from_calendar(2000, 13, 1, 0, 0, 0).is_err());
        assert!(Timestamp::from_calendar(2000, 1, 1, 24, 0, 0).is_err());
    }
}
