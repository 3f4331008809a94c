// Copyright 2025 CEMAXECUTER LLC

//! Tick/nanosecond conversion at arbitrary sample rates.
//!
//! The arithmetic splits the tick count into whole seconds and a
//! fractional remainder so the round trip is exact for tick counts in the
//! lower 56 bits even at rates that are not integers (e.g. 100 MHz / 3).

/// Convert a tick count at `rate` ticks per second into nanoseconds.
pub fn ticks_to_time_ns(ticks: i64, rate: f64) -> i64 {
    let rate_int = rate as i64;
    let full = ticks / rate_int;
    let err = ticks - full * rate_int;
    let part = full as f64 * (rate - rate_int as f64);
    let frac_ns = ((err as f64 - part) * 1e9 / rate).round() as i64;
    full * 1_000_000_000 + frac_ns
}

/// Convert nanoseconds into a tick count at `rate` ticks per second.
pub fn time_ns_to_ticks(time_ns: i64, rate: f64) -> i64 {
    let rate_int = rate as i64;
    let full = time_ns / 1_000_000_000;
    let err = time_ns - full * 1_000_000_000;
    let part = full as f64 * (rate - rate_int as f64);
    let frac_ticks = (part + err as f64 * rate / 1e9).round() as i64;
    full * rate_int + frac_ticks
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATES: [f64; 4] = [1e9, 52e6, 61.44e6, 100e6 / 3.0];

    #[test]
    fn test_tick_roundtrip_exact() {
        // Exact round trip across the rate grid for ticks in the lower
        // 56 bits, positive and negative.
        for &rate in &RATES {
            let mut ticks: i64 = 1;
            while ticks < (1i64 << 55) {
                for t in [ticks, -ticks, ticks + 1, ticks - 1] {
                    let ns = ticks_to_time_ns(t, rate);
                    assert_eq!(
                        time_ns_to_ticks(ns, rate),
                        t,
                        "roundtrip failed for ticks={} rate={}",
                        t,
                        rate
                    );
                }
                ticks *= 3;
            }
        }
    }

    #[test]
    fn test_ns_roundtrip_bounded() {
        // ns -> ticks -> ns lands within one tick period.
        for &rate in &RATES {
            let period_ns = 1e9 / rate;
            let mut ns: i64 = 1;
            while ns < (1i64 << 61) {
                for n in [ns, -ns] {
                    let back = ticks_to_time_ns(time_ns_to_ticks(n, rate), rate);
                    let err = (n - back).abs() as f64;
                    assert!(
                        err < period_ns + 1.0,
                        "ns={} rate={} err={}",
                        n,
                        rate,
                        err
                    );
                }
                ns *= 5;
            }
        }
    }

    #[test]
    fn test_whole_seconds() {
        assert_eq!(ticks_to_time_ns(52_000_000, 52e6), 1_000_000_000);
        assert_eq!(time_ns_to_ticks(1_000_000_000, 52e6), 52_000_000);
        assert_eq!(ticks_to_time_ns(0, 61.44e6), 0);
        assert_eq!(time_ns_to_ticks(0, 61.44e6), 0);
    }

    #[test]
    fn test_single_tick() {
        // One tick at 1 GHz is exactly one nanosecond.
        assert_eq!(ticks_to_time_ns(1, 1e9), 1);
        // One tick at 52 MHz is 19.23ns, rounded half away from zero.
        assert_eq!(ticks_to_time_ns(1, 52e6), 19);
        assert_eq!(ticks_to_time_ns(-1, 52e6), -19);
    }
}
