// This file is part of Kestrel NVR, a security camera network video recorder.
// Copyright (C) 2024 The Kestrel NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Time and durations in Kestrel NVR's internal 90 kHz format.

use crate::{bail_t, format_err_t, Error};
use std::fmt;
use std::ops;
use std::str::FromStr;

pub const TIME_UNITS_PER_SEC: i64 = 90_000;

/// A time specified as 90,000ths of a second since 1970-01-01 00:00:00 UTC,
/// excluding leap seconds.
#[derive(Clone, Copy, Debug, Default, Eq, Ord, PartialEq, PartialOrd)]
pub struct Time(pub i64);

/// Reads `n` ASCII digits from `b` at `pos`, returning the value and the
/// position one past the last digit.
fn digits(b: &[u8], pos: usize, n: usize) -> Result<(i64, usize), Error> {
    if b.len() < pos + n {
        bail_t!(InvalidArgument, "truncated number");
    }
    let mut v = 0i64;
    for &c in &b[pos..pos + n] {
        if !c.is_ascii_digit() {
            bail_t!(InvalidArgument, "expected digit, got {:?}", char::from(c));
        }
        v = v * 10 + i64::from(c - b'0');
    }
    Ok((v, pos + n))
}

fn expect(b: &[u8], pos: usize, c: u8) -> Result<usize, Error> {
    if b.get(pos) != Some(&c) {
        bail_t!(InvalidArgument, "expected {:?} at offset {}", char::from(c), pos);
    }
    Ok(pos + 1)
}

impl Time {
    pub fn new(tm: time::Timespec) -> Self {
        Time(tm.sec * TIME_UNITS_PER_SEC + i64::from(tm.nsec) * TIME_UNITS_PER_SEC / 1_000_000_000)
    }

    /// Parses a time as either 90,000ths of a second since epoch or a
    /// RFC 3339-like string.
    ///
    /// The latter is a string such as `2006-01-02T15:04:05`, followed by an
    /// optional 90,000ths of a second such as `:00001`, followed by an
    /// optional time zone offset such as `Z` or `-07:00`. A missing fraction
    /// is assumed to be 0. A missing time zone offset implies the local time
    /// zone.
    pub fn parse(s: &str) -> Result<Self, Error> {
        // First try parsing as 90,000ths of a second since epoch.
        if let Ok(i) = i64::from_str(s) {
            return Ok(Time(i));
        }

        let wrap = |()| format_err_t!(InvalidArgument, "unparseable time {:?}", s);
        let b = s.as_bytes();
        let (year, pos) = digits(b, 0, 4).map_err(|_| wrap(()))?;
        let pos = expect(b, pos, b'-').map_err(|_| wrap(()))?;
        let (mon, pos) = digits(b, pos, 2).map_err(|_| wrap(()))?;
        let pos = expect(b, pos, b'-').map_err(|_| wrap(()))?;
        let (mday, pos) = digits(b, pos, 2).map_err(|_| wrap(()))?;
        let pos = expect(b, pos, b'T').map_err(|_| wrap(()))?;
        let (hour, pos) = digits(b, pos, 2).map_err(|_| wrap(()))?;
        let pos = expect(b, pos, b':').map_err(|_| wrap(()))?;
        let (min, pos) = digits(b, pos, 2).map_err(|_| wrap(()))?;
        let pos = expect(b, pos, b':').map_err(|_| wrap(()))?;
        let (sec, mut pos) = digits(b, pos, 2).map_err(|_| wrap(()))?;

        // Optional `:fffff` fraction in 90,000ths of a second.
        let mut fraction = 0;
        if b.get(pos) == Some(&b':') {
            let (f, p) = digits(b, pos + 1, 5).map_err(|_| wrap(()))?;
            fraction = f;
            pos = p;
        }

        // Optional zone: `Z` or `[+-]hh:mm`.
        let mut zone = None;
        match b.get(pos) {
            None => {}
            Some(&b'Z') => {
                zone = Some(0);
                pos += 1;
            }
            Some(&(c @ b'+')) | Some(&(c @ b'-')) => {
                let (hh, p) = digits(b, pos + 1, 2).map_err(|_| wrap(()))?;
                let p = expect(b, p, b':').map_err(|_| wrap(()))?;
                let (mm, p) = digits(b, p, 2).map_err(|_| wrap(()))?;
                let off = hh * 3600 + mm * 60;
                zone = Some(if c == b'-' { -off } else { off });
                pos = p;
            }
            Some(_) => return Err(wrap(())),
        }
        if pos != b.len() {
            return Err(wrap(()));
        }
        if mon < 1 || mon > 12 {
            bail_t!(InvalidArgument, "time {:?} has month {}", s, mon);
        }
        if year < 1900 {
            bail_t!(InvalidArgument, "time {:?} has year before 1900", s);
        }

        let mut tm = time::Tm {
            tm_sec: sec as i32,
            tm_min: min as i32,
            tm_hour: hour as i32,
            tm_mday: mday as i32,
            tm_mon: (mon - 1) as i32,
            tm_year: (year - 1900) as i32,
            tm_wday: 0,
            tm_yday: 0,
            tm_isdst: -1,
            tm_utcoff: 0,
            tm_nsec: 0,
        };

        // The time crate doesn't use tm_utcoff properly; it calls timegm() if
        // tm_utcoff == 0, mktime() otherwise. If a zone was specified, use
        // the timegm path with a manual offset. Otherwise use the tm_utcoff
        // path so mktime applies the local zone.
        let sec = if let Some(off) = zone {
            tm.to_timespec().sec - off
        } else {
            tm.tm_utcoff = 1;
            tm.to_timespec().sec
        };
        Ok(Time(sec * TIME_UNITS_PER_SEC + fraction))
    }

    pub fn unix_seconds(self) -> i64 {
        self.0 / TIME_UNITS_PER_SEC
    }
}

impl ops::Sub for Time {
    type Output = Duration;
    fn sub(self, rhs: Time) -> Duration {
        Duration(self.0 - rhs.0)
    }
}

impl ops::AddAssign<Duration> for Time {
    fn add_assign(&mut self, rhs: Duration) {
        self.0 += rhs.0
    }
}

impl ops::Add<Duration> for Time {
    type Output = Time;
    fn add(self, rhs: Duration) -> Time {
        Time(self.0 + rhs.0)
    }
}

impl ops::Sub<Duration> for Time {
    type Output = Time;
    fn sub(self, rhs: Duration) -> Time {
        Time(self.0 - rhs.0)
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let tm = time::at(time::Timespec {
            sec: self.0 / TIME_UNITS_PER_SEC,
            nsec: 0,
        });
        let zone_minutes = tm.tm_utcoff.abs() / 60;
        write!(
            f,
            "{}:{:05}{}{:02}:{:02}",
            tm.strftime("%FT%T").map_err(|_| fmt::Error)?,
            self.0 % TIME_UNITS_PER_SEC,
            if tm.tm_utcoff > 0 { '+' } else { '-' },
            zone_minutes / 60,
            zone_minutes % 60
        )
    }
}

/// A duration specified in 1/90,000ths of a second.
/// Durations are typically non-negative, but a calendar day's net duration
/// may be negative while applying a modification.
#[derive(Clone, Copy, Debug, Default, Eq, Ord, PartialEq, PartialOrd)]
pub struct Duration(pub i64);

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut seconds = self.0 / TIME_UNITS_PER_SEC;
        const MINUTE_IN_SECONDS: i64 = 60;
        const HOUR_IN_SECONDS: i64 = 60 * MINUTE_IN_SECONDS;
        const DAY_IN_SECONDS: i64 = 24 * HOUR_IN_SECONDS;
        let days = seconds / DAY_IN_SECONDS;
        seconds %= DAY_IN_SECONDS;
        let hours = seconds / HOUR_IN_SECONDS;
        seconds %= HOUR_IN_SECONDS;
        let minutes = seconds / MINUTE_IN_SECONDS;
        seconds %= MINUTE_IN_SECONDS;
        let mut have_written = if days > 0 {
            write!(f, "{} day{}", days, if days == 1 { "" } else { "s" })?;
            true
        } else {
            false
        };
        if hours > 0 {
            write!(
                f,
                "{}{} hour{}",
                if have_written { " " } else { "" },
                hours,
                if hours == 1 { "" } else { "s" }
            )?;
            have_written = true;
        }
        if minutes > 0 {
            write!(
                f,
                "{}{} minute{}",
                if have_written { " " } else { "" },
                minutes,
                if minutes == 1 { "" } else { "s" }
            )?;
            have_written = true;
        }
        if seconds > 0 || !have_written {
            write!(
                f,
                "{}{} second{}",
                if have_written { " " } else { "" },
                seconds,
                if seconds == 1 { "" } else { "s" }
            )?;
        }
        Ok(())
    }
}

impl ops::Add for Duration {
    type Output = Duration;
    fn add(self, rhs: Duration) -> Duration {
        Duration(self.0 + rhs.0)
    }
}

impl ops::AddAssign for Duration {
    fn add_assign(&mut self, rhs: Duration) {
        self.0 += rhs.0
    }
}

impl ops::SubAssign for Duration {
    fn sub_assign(&mut self, rhs: Duration) {
        self.0 -= rhs.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Once;

    static INIT: Once = Once::new();

    fn init() {
        INIT.call_once(|| {
            std::env::set_var("TZ", "America/Los_Angeles");
            time::tzset();
        });
    }

    #[test]
    fn test_parse_time() {
        init();
        let tests = &[
            ("2006-01-02T15:04:05-07:00", 102261550050000),
            ("2006-01-02T15:04:05:00001-07:00", 102261550050001),
            ("2006-01-02T15:04:05-08:00", 102261874050000),
            ("2006-01-02T15:04:05", 102261874050000), // implied -08:00
            ("2006-01-02T15:04:05:00001", 102261874050001), // implied -08:00
            ("2006-01-02T15:04:05-00:00", 102259282050000),
            ("2006-01-02T15:04:05Z", 102259282050000),
            ("102261550050000", 102261550050000),
        ];
        for test in tests {
            assert_eq!(test.1, Time::parse(test.0).unwrap().0, "parsing {}", test.0);
        }
    }

    #[test]
    fn test_parse_time_errors() {
        init();
        for s in &[
            "2006-01-02T15:04:05x",
            "2006-00-02T15:04:05",
            "1776-01-02T15:04:05",
            "2006-01-02",
            "",
        ] {
            Time::parse(s).unwrap_err();
        }
    }

    #[test]
    fn test_format_time() {
        init();
        assert_eq!("2006-01-02T15:04:05:00000-08:00", format!("{}", Time(102261874050000)));
    }

    #[test]
    fn test_display_duration() {
        let tests = &[
            // (output, seconds)
            ("0 seconds", 0),
            ("1 second", 1),
            ("1 minute", 60),
            ("1 minute 1 second", 61),
            ("2 minutes", 120),
            ("1 hour", 3600),
            ("1 hour 1 minute", 3660),
            ("2 hours", 7200),
            ("1 day", 86400),
            ("1 day 1 hour", 86400 + 3600),
            ("2 days", 2 * 86400),
        ];
        for test in tests {
            assert_eq!(test.0, format!("{}", Duration(test.1 * TIME_UNITS_PER_SEC)));
        }
    }
}
