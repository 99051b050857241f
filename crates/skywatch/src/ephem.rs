//! Solar ephemeris driving the day/night cycle.
//!
//! The arbiter does not need arc-second astrometry, only the times at which
//! the sun crosses the configured day and night horizons. The low-precision
//! solar position here (mean elements, good to a few tenths of a degree)
//! feeds a crossing search that builds the period timeline:
//!
//! ```text
//! sunset-evening_secs  Evening begins
//! sun below day_deg    Dusk begins
//! sun below night_deg  Night begins
//! sun above night_deg  Dawn begins
//! sun above day_deg    Morning begins
//! sunrise+morning_secs Day begins
//! ```

use chrono::{DateTime, Duration, Utc};

use skyconf::{HorizonConfig, SiteConfig};
use skyproto::state::Period;

/// The arbiter's view of where the cycle stands and what comes next.
#[derive(Debug, Clone, PartialEq)]
pub struct NextEvent {
    pub current: Period,
    pub next: Period,
    pub at: DateTime<Utc>,
}

/// Apparent solar altitude in degrees at a site and instant.
///
/// Low-precision formula from the Astronomical Almanac's "approximate solar
/// coordinates"; ignores refraction.
pub fn solar_altitude(site: &SiteConfig, t: DateTime<Utc>) -> f64 {
    let n = julian_day(t) - 2_451_545.0;

    // Mean longitude and anomaly, degrees.
    let l = norm_deg(280.460 + 0.985_647_4 * n);
    let g = norm_deg(357.528 + 0.985_600_3 * n).to_radians();

    // Ecliptic longitude, obliquity.
    let lambda = (l + 1.915 * g.sin() + 0.020 * (2.0 * g).sin()).to_radians();
    let epsilon = (23.439 - 0.000_000_4 * n).to_radians();

    let decl = (epsilon.sin() * lambda.sin()).asin();
    let ra = (epsilon.cos() * lambda.sin()).atan2(lambda.cos());

    // Greenwich mean sidereal time, hours → local hour angle, radians.
    let gmst = 18.697_374_558 + 24.065_709_824_419_08 * n;
    let lha = (gmst.rem_euclid(24.0) * 15.0 + site.longitude).to_radians() - ra;

    let lat = site.latitude.to_radians();
    (lat.sin() * decl.sin() + lat.cos() * decl.cos() * lha.cos())
        .asin()
        .to_degrees()
}

fn julian_day(t: DateTime<Utc>) -> f64 {
    t.timestamp() as f64 / 86_400.0 + 2_440_587.5
}

fn norm_deg(d: f64) -> f64 {
    d.rem_euclid(360.0)
}

/// One horizon crossing.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Crossing {
    at: DateTime<Utc>,
    horizon: f64,
    rising: bool,
}

/// Find horizon crossings in [from, to] by coarse scan plus bisection.
fn crossings(
    site: &SiteConfig,
    horizon: f64,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Vec<Crossing> {
    let step = Duration::minutes(10);
    let mut found = Vec::new();
    let mut t = from;
    let mut prev_alt = solar_altitude(site, t);
    while t < to {
        let t_next = t + step;
        let alt = solar_altitude(site, t_next);
        if (prev_alt < horizon) != (alt < horizon) {
            let at = bisect(site, horizon, t, t_next);
            found.push(Crossing { at, horizon, rising: alt > prev_alt });
        }
        prev_alt = alt;
        t = t_next;
    }
    found
}

fn bisect(site: &SiteConfig, horizon: f64, mut lo: DateTime<Utc>, mut hi: DateTime<Utc>) -> DateTime<Utc> {
    let below_lo = solar_altitude(site, lo) < horizon;
    while (hi - lo).num_seconds() > 1 {
        let mid = lo + (hi - lo) / 2;
        if (solar_altitude(site, mid) < horizon) == below_lo {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    hi
}

/// Compute the current period and the next transition.
///
/// Scans a ±36 h window around `now`, so it works at any latitude where the
/// sun actually crosses both horizons daily; polar sites will pin to the
/// period in effect at the window edge.
pub fn next_event(site: &SiteConfig, horizons: &HorizonConfig, now: DateTime<Utc>) -> NextEvent {
    let from = now - Duration::hours(36);
    let to = now + Duration::hours(36);

    // Period start boundaries derived from the crossings.
    let mut boundaries: Vec<(DateTime<Utc>, Period)> = Vec::new();
    for c in crossings(site, horizons.day_deg, from, to) {
        if c.rising {
            boundaries.push((c.at, Period::Morning));
            boundaries.push((c.at + Duration::seconds(horizons.morning_secs), Period::Day));
        } else {
            boundaries.push((c.at - Duration::seconds(horizons.evening_secs), Period::Evening));
            boundaries.push((c.at, Period::Dusk));
        }
    }
    for c in crossings(site, horizons.night_deg, from, to) {
        if c.rising {
            boundaries.push((c.at, Period::Dawn));
        } else {
            boundaries.push((c.at, Period::Night));
        }
    }
    boundaries.sort_by_key(|(t, _)| *t);

    let current = boundaries
        .iter()
        .rev()
        .find(|(t, _)| *t <= now)
        .map(|(_, p)| *p)
        .unwrap_or(Period::Day);
    let (at, next) = boundaries
        .iter()
        .find(|(t, _)| *t > now)
        .map(|(t, p)| (*t, *p))
        .unwrap_or((to, current.next()));

    NextEvent { current, next, at }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn greenwich() -> SiteConfig {
        SiteConfig { longitude: 0.0, latitude: 51.48 }
    }

    #[test]
    fn sun_up_at_noon_down_at_midnight() {
        let site = greenwich();
        let noon = Utc.with_ymd_and_hms(2024, 6, 21, 12, 0, 0).unwrap();
        let midnight = Utc.with_ymd_and_hms(2024, 6, 21, 0, 0, 0).unwrap();
        assert!(solar_altitude(&site, noon) > 50.0);
        assert!(solar_altitude(&site, midnight) < -10.0);
    }

    #[test]
    fn equinox_noon_altitude_matches_latitude() {
        // At equinox the sun culminates near 90° - latitude.
        let site = greenwich();
        let noon = Utc.with_ymd_and_hms(2024, 3, 20, 12, 0, 0).unwrap();
        let alt = solar_altitude(&site, noon);
        assert!((alt - (90.0 - site.latitude)).abs() < 2.0, "altitude {alt}");
    }

    #[test]
    fn noon_is_day_midnight_is_night() {
        let site = greenwich();
        let horizons = HorizonConfig::default();
        let noon = Utc.with_ymd_and_hms(2024, 3, 20, 12, 0, 0).unwrap();
        let midnight = Utc.with_ymd_and_hms(2024, 3, 21, 0, 0, 0).unwrap();
        assert_eq!(next_event(&site, &horizons, noon).current, Period::Day);
        assert_eq!(next_event(&site, &horizons, midnight).current, Period::Night);
    }

    #[test]
    fn periods_advance_in_cycle_order() {
        let site = greenwich();
        let horizons = HorizonConfig::default();
        let mut t = Utc.with_ymd_and_hms(2024, 3, 20, 12, 0, 0).unwrap();
        let mut ev = next_event(&site, &horizons, t);

        // Walk one full cycle boundary by boundary.
        for _ in 0..6 {
            let expected_next = ev.current.next();
            assert_eq!(ev.next, expected_next, "after {:?}", ev.current);
            t = ev.at + Duration::seconds(1);
            ev = next_event(&site, &horizons, t);
            assert_eq!(ev.current, expected_next);
        }
    }

    #[test]
    fn evening_leads_dusk_by_configured_time() {
        let site = greenwich();
        let horizons = HorizonConfig { evening_secs: 3600, ..Default::default() };
        let noon = Utc.with_ymd_and_hms(2024, 3, 20, 12, 0, 0).unwrap();

        let ev = next_event(&site, &horizons, noon);
        assert_eq!(ev.next, Period::Evening);
        let at_evening = next_event(&site, &horizons, ev.at + Duration::seconds(1));
        assert_eq!(at_evening.current, Period::Evening);
        assert_eq!(at_evening.next, Period::Dusk);
        let lead = at_evening.at - ev.at;
        assert!((lead.num_seconds() - 3600).abs() <= 2, "lead {lead}");
    }
}
