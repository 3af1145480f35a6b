/*
 *  Copyright (C) 2025 Michael Bachmann
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU Affero General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU Affero General Public License for more details.
 *
 *  You should have received a copy of the GNU Affero General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Wallclock helpers, including the NTP 32.32 fixed point representation
//! RTCP sender reports use to publish their clock.

use std::time::{Duration, SystemTime};

pub const NANOS_PER_SEC: u64 = 1_000_000_000;
pub const NANOS_PER_MILLI: u64 = 1_000_000;
pub const MICROS_PER_SEC: u64 = 1_000_000;
pub const MILLIS_PER_SEC: u64 = 1_000;

/// Seconds between the NTP epoch (1900-01-01) and the Unix epoch (1970-01-01).
pub const NTP_UNIX_EPOCH_OFFSET: u64 = 2_208_988_800;

pub fn ntp_from_system_time(time: SystemTime) -> u64 {
    let since_epoch = time
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default();
    let seconds = (since_epoch.as_secs() + NTP_UNIX_EPOCH_OFFSET) & 0xffff_ffff;
    let fraction = (u64::from(since_epoch.subsec_nanos()) << 32) / NANOS_PER_SEC;
    (seconds << 32) | fraction
}

pub fn system_time_from_ntp(ntp: u64) -> SystemTime {
    let seconds = (ntp >> 32).saturating_sub(NTP_UNIX_EPOCH_OFFSET);
    let nanos = ((ntp & 0xffff_ffff) * NANOS_PER_SEC) >> 32;
    SystemTime::UNIX_EPOCH + Duration::new(seconds, nanos as u32)
}

/// Seconds since the Unix epoch as a float, for clock arithmetic that has to
/// tolerate transiently negative differences.
pub fn unix_seconds(time: SystemTime) -> f64 {
    time.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ntp_conversion_round_trips() {
        let time = SystemTime::UNIX_EPOCH + Duration::new(1_700_000_000, 250_000_000);
        let ntp = ntp_from_system_time(time);
        let back = system_time_from_ntp(ntp);
        let diff = back
            .duration_since(time)
            .or_else(|_| time.duration_since(back))
            .expect("comparable times");
        assert!(diff < Duration::from_micros(1));
    }

    #[test]
    fn ntp_fraction_is_in_range() {
        let time = SystemTime::UNIX_EPOCH + Duration::new(100, 999_999_999);
        let ntp = ntp_from_system_time(time);
        assert_eq!(ntp >> 32, 100 + NTP_UNIX_EPOCH_OFFSET);
        assert!((ntp & 0xffff_ffff) < u64::from(u32::MAX));
    }
}
