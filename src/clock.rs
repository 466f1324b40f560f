// Copyright 2025 Christian Mazakas
// Distributed under the Boost Software License, Version 1.0. (See accompanying
// file LICENSE.txt or copy at http://www.boost.org/LICENSE_1_0.txt)

use std::ops::{Add, AddAssign, Sub, SubAssign};
use std::time::Duration;

use nix::time::{clock_gettime, ClockId};

const NANOS_PER_SECOND: i64 = 1_000_000_000;

/// A point on `CLOCK_MONOTONIC`, stored as whole seconds plus a nanosecond
/// remainder.
///
/// The representation is always normalized: `nanoseconds` lies strictly
/// within `(-1e9, 1e9)` and never disagrees in sign with `seconds` unless
/// one of the two is zero. Normalization makes the derived lexicographic
/// ordering coincide with chronological ordering.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimePoint {
    seconds: i64,
    nanoseconds: i64,
}

impl TimePoint {
    #[must_use]
    pub fn from_seconds_and_nanoseconds(seconds: i64, nanoseconds: i64) -> TimePoint {
        let mut tp = TimePoint {
            seconds,
            nanoseconds,
        };
        tp.normalize();
        tp
    }

    #[must_use]
    pub fn seconds_part(&self) -> i64 {
        self.seconds
    }

    #[must_use]
    pub fn nanoseconds_part(&self) -> i64 {
        self.nanoseconds
    }

    fn normalize(&mut self) {
        let extra_seconds = self.nanoseconds / NANOS_PER_SECOND;
        self.seconds += extra_seconds;
        self.nanoseconds -= extra_seconds * NANOS_PER_SECOND;

        if self.seconds < 0 && self.nanoseconds > 0 {
            self.seconds += 1;
            self.nanoseconds -= NANOS_PER_SECOND;
        } else if self.seconds > 0 && self.nanoseconds < 0 {
            self.seconds -= 1;
            self.nanoseconds += NANOS_PER_SECOND;
        }
    }
}

impl AddAssign<Duration> for TimePoint {
    fn add_assign(&mut self, d: Duration) {
        self.seconds += d.as_secs() as i64;
        self.nanoseconds += i64::from(d.subsec_nanos());
        self.normalize();
    }
}

impl SubAssign<Duration> for TimePoint {
    fn sub_assign(&mut self, d: Duration) {
        self.seconds -= d.as_secs() as i64;
        self.nanoseconds -= i64::from(d.subsec_nanos());
        self.normalize();
    }
}

impl Add<Duration> for TimePoint {
    type Output = TimePoint;

    fn add(mut self, d: Duration) -> TimePoint {
        self += d;
        self
    }
}

impl Sub<Duration> for TimePoint {
    type Output = TimePoint;

    fn sub(mut self, d: Duration) -> TimePoint {
        self -= d;
        self
    }
}

/// The steady clock every timer deadline is measured against.
pub struct MonotonicClock;

impl MonotonicClock {
    #[must_use]
    pub fn now() -> TimePoint {
        let ts = clock_gettime(ClockId::CLOCK_MONOTONIC).unwrap();
        TimePoint::from_seconds_and_nanoseconds(ts.tv_sec(), ts.tv_nsec())
    }
}
