use serde::{Deserialize, Serialize};

use super::types::{Energy, Price, Timestamp};

/// A single quarter-hour forecast bucket: PV yield, load, and spot price.
#[cfg_attr(feature = "swagger", derive(utoipa::ToSchema))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForecastPoint {
    pub ts: Timestamp,
    pub pv: Energy,
    pub load: Energy,
    pub spot_price: Price,
}

/// VAT, distribution surcharges, and buy/sell asymmetry supplied by configuration
/// (§4.2/§6: the concrete coefficients are not derived, only supplied).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TariffParameters {
    pub vat_rate: f64,
    pub distribution_surcharge_buy: Price,
    pub distribution_surcharge_sell: Price,
    /// Fraction of the buy price paid for exported energy (export is usually
    /// worth less than import).
    pub sell_asymmetry: f64,
}

impl TariffParameters {
    /// Converts a raw spot price (CZK/kWh) into the buy/sell tariff pair
    /// used by the simulation engine's cost formula.
    pub fn apply(&self, spot: Price) -> (Price, Price) {
        let buy = Price::czk_per_kwh(
            spot.as_czk_per_kwh() * (1.0 + self.vat_rate) + self.distribution_surcharge_buy.as_czk_per_kwh(),
        );
        let sell_raw = spot.as_czk_per_kwh() * self.sell_asymmetry - self.distribution_surcharge_sell.as_czk_per_kwh();
        (buy, Price::czk_per_kwh(sell_raw.max(0.0)))
    }
}

/// Linear (trapezoidal) interpolation of a raw hourly/instantaneous series
/// onto the quarter-hour grid between `ts` and `ts + 15m`.
pub fn interpolate_quarter_hour(series: &[(Timestamp, f64)], ts: Timestamp) -> Option<f64> {
    if series.is_empty() {
        return None;
    }
    let window_end = ts.add_minutes(15);

    let mut prev: Option<&(Timestamp, f64)> = None;
    let mut next: Option<&(Timestamp, f64)> = None;
    for point in series {
        if point.0.is_before(&ts) || point.0 == ts {
            prev = Some(point);
        }
        if (point.0.is_after(&ts) || point.0 == ts) && next.is_none() {
            next = Some(point);
        }
    }

    match (prev, next) {
        (Some(p), Some(n)) if p.0 != n.0 => {
            let t0 = p.0.inner().timestamp() as f64;
            let t1 = n.0.inner().timestamp() as f64;
            let tm = window_end.inner().timestamp() as f64;
            let weight = ((tm - t0) / (t1 - t0)).clamp(0.0, 1.0);
            Some(p.1 + weight * (n.1 - p.1))
        }
        (Some(p), _) => Some(p.1),
        (None, Some(n)) => Some(n.1),
        (None, None) => None,
    }
}

/// Replicates an hourly price series across its four quarter-hour children.
pub fn resample_hourly_price(hourly: &[(Timestamp, Price)], ts: Timestamp) -> Option<Price> {
    let hour_start = ts.floor_to_interval();
    hourly
        .iter()
        .find(|(h, _)| h.inner().date_naive() == hour_start.inner().date_naive() && h.inner().hour() == hour_start.inner().hour())
        .map(|(_, p)| *p)
}

use chrono::Timelike;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;

    fn ts(s: &str) -> Timestamp {
        Timestamp(DateTime::parse_from_rfc3339(s).unwrap())
    }

    #[test]
    fn tariff_applies_vat_and_surcharge() {
        let tariff = TariffParameters {
            vat_rate: 0.21,
            distribution_surcharge_buy: Price::czk_per_kwh(1.2),
            distribution_surcharge_sell: Price::czk_per_kwh(0.1),
            sell_asymmetry: 0.4,
        };
        let (buy, sell) = tariff.apply(Price::czk_per_kwh(2.0));
        assert!((buy.as_czk_per_kwh() - (2.0 * 1.21 + 1.2)).abs() < 1e-9);
        assert!((sell.as_czk_per_kwh() - (2.0 * 0.4 - 0.1)).abs() < 1e-9);
    }

    #[test]
    fn tariff_sell_never_negative() {
        let tariff = TariffParameters {
            vat_rate: 0.0,
            distribution_surcharge_buy: Price::czk_per_kwh(0.0),
            distribution_surcharge_sell: Price::czk_per_kwh(5.0),
            sell_asymmetry: 0.4,
        };
        let (_, sell) = tariff.apply(Price::czk_per_kwh(1.0));
        assert_eq!(sell.as_czk_per_kwh(), 0.0);
    }

    #[test]
    fn interpolates_between_hourly_points() {
        let series = vec![
            (ts("2026-01-01T10:00:00+01:00"), 1.0),
            (ts("2026-01-01T11:00:00+01:00"), 2.0),
        ];
        let v = interpolate_quarter_hour(&series, ts("2026-01-01T10:30:00+01:00")).unwrap();
        assert!((v - 1.75).abs() < 1e-9);
    }

    #[test]
    fn resample_replicates_hourly_price_to_quarter_hours() {
        let hourly = vec![
            (ts("2026-01-01T10:00:00+01:00"), Price::czk_per_kwh(3.0)),
            (ts("2026-01-01T11:00:00+01:00"), Price::czk_per_kwh(4.0)),
        ];
        let p0 = resample_hourly_price(&hourly, ts("2026-01-01T10:00:00+01:00")).unwrap();
        let p1 = resample_hourly_price(&hourly, ts("2026-01-01T10:45:00+01:00")).unwrap();
        assert_eq!(p0.as_czk_per_kwh(), 3.0);
        assert_eq!(p1.as_czk_per_kwh(), 3.0);
    }
}
