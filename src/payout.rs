use std::fmt;

use serde::Serialize;

/// Duration floor: jobs shorter than half an hour are billed as half an
/// hour so the derived hourly rate stays meaningful.
const MIN_BILLABLE_MINUTES: i64 = 30;
const BP_DENOMINATOR: i64 = 10_000;

/// Rejected payout inputs. Always a caller bug, never retryable.
#[derive(Debug, PartialEq, Eq)]
pub struct InvalidInput(pub String);

impl fmt::Display for InvalidInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid payout input: {}", self.0)
    }
}

impl std::error::Error for InvalidInput {}

/// Earnings breakdown for one job. All money in currency minor units.
///
/// `net_payout_minor + platform_fee_minor == gross_price_minor` holds
/// exactly: the net is derived by subtraction, never rounded on its own.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PayoutBreakdown {
    pub gross_price_minor: i64,
    pub duration_minutes: i64,
    pub hours: f64,
    pub hourly_rate_minor: i64,
    pub platform_fee_minor: i64,
    pub net_payout_minor: i64,
    pub fee_rate_bp: i64,
}

/// Integer division rounding half-to-even on the exact remainder.
/// Operands are validated positive before we get here.
fn div_round_half_even(num: i128, den: i128) -> i64 {
    let q = num / den;
    let r = num % den;
    let rounded = match (2 * r).cmp(&den) {
        std::cmp::Ordering::Less => q,
        std::cmp::Ordering::Greater => q + 1,
        std::cmp::Ordering::Equal => {
            if q % 2 == 0 {
                q
            } else {
                q + 1
            }
        }
    };
    rounded as i64
}

fn check_rate(fee_rate_bp: i64) -> Result<(), InvalidInput> {
    if !(0..BP_DENOMINATOR).contains(&fee_rate_bp) {
        return Err(InvalidInput(format!(
            "fee rate must be in [0, 100%) basis points, got {}",
            fee_rate_bp
        )));
    }
    Ok(())
}

/// Derive a provider's earnings breakdown from gross price and duration.
///
/// Pure and total for positive inputs; rounding is half-to-even at the
/// currency's minor unit.
pub fn compute_payout(
    gross_price_minor: i64,
    duration_minutes: i64,
    fee_rate_bp: i64,
) -> Result<PayoutBreakdown, InvalidInput> {
    if gross_price_minor <= 0 {
        return Err(InvalidInput(format!(
            "gross price must be positive, got {}",
            gross_price_minor
        )));
    }
    if duration_minutes <= 0 {
        return Err(InvalidInput(format!(
            "duration must be positive, got {} minutes",
            duration_minutes
        )));
    }
    check_rate(fee_rate_bp)?;

    let billable_minutes = duration_minutes.max(MIN_BILLABLE_MINUTES);
    let hourly_rate_minor =
        div_round_half_even(gross_price_minor as i128 * 60, billable_minutes as i128);
    let platform_fee_minor = div_round_half_even(
        gross_price_minor as i128 * fee_rate_bp as i128,
        BP_DENOMINATOR as i128,
    );

    Ok(PayoutBreakdown {
        gross_price_minor,
        duration_minutes,
        hours: billable_minutes as f64 / 60.0,
        hourly_rate_minor,
        platform_fee_minor,
        net_payout_minor: gross_price_minor - platform_fee_minor,
        fee_rate_bp,
    })
}

/// Convert a policy fee fraction (0.20 = 20%) to basis points, the
/// engine's internal rate representation.
pub fn fee_rate_bp_from_fraction(rate: f64) -> i64 {
    (rate * BP_DENOMINATOR as f64).round() as i64
}

/// Inverse direction: the gross price a provider must charge to take home
/// `net_payout_minor` after the platform fee. Round-trips with
/// `compute_payout` within one minor unit for fee rates up to 50%.
pub fn gross_from_net(net_payout_minor: i64, fee_rate_bp: i64) -> Result<i64, InvalidInput> {
    if net_payout_minor <= 0 {
        return Err(InvalidInput(format!(
            "net payout must be positive, got {}",
            net_payout_minor
        )));
    }
    check_rate(fee_rate_bp)?;

    Ok(div_round_half_even(
        net_payout_minor as i128 * BP_DENOMINATOR as i128,
        (BP_DENOMINATOR - fee_rate_bp) as i128,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ninety_minute_job_at_20_percent() {
        // 100.00 gross, 90 minutes, 20% fee.
        let b = compute_payout(10_000, 90, 2_000).unwrap();
        assert_eq!(b.hours, 1.5);
        assert_eq!(b.hourly_rate_minor, 6_667); // 66.67
        assert_eq!(b.platform_fee_minor, 2_000); // 20.00
        assert_eq!(b.net_payout_minor, 8_000); // 80.00
    }

    #[test]
    fn very_short_jobs_are_billed_at_the_half_hour_floor() {
        let b = compute_payout(5_000, 10, 2_000).unwrap();
        assert_eq!(b.hours, 0.5);
        assert_eq!(b.hourly_rate_minor, 10_000);
    }

    #[test]
    fn fee_plus_net_always_equals_gross() {
        for gross in [1, 99, 3_333, 10_000, 987_654_321] {
            for minutes in [1, 30, 60, 90, 480] {
                for bp in [0, 250, 2_000, 3_500] {
                    let b = compute_payout(gross, minutes, bp).unwrap();
                    assert_eq!(b.platform_fee_minor + b.net_payout_minor, gross);
                }
            }
        }
    }

    #[test]
    fn gross_and_net_round_trip_within_one_minor_unit() {
        for gross in [100, 999, 3_333, 10_000, 123_457, 98_765_432] {
            for bp in [250, 1_500, 2_000, 3_500, 5_000] {
                let b = compute_payout(gross, 60, bp).unwrap();
                let back = gross_from_net(b.net_payout_minor, bp).unwrap();
                assert!(
                    (back - gross).abs() <= 1,
                    "gross {} at {}bp came back as {}",
                    gross,
                    bp,
                    back
                );
            }
        }
    }

    #[test]
    fn inverse_direction_matches_hand_computation() {
        // Provider wants 80.00 take-home at 20% fee -> charge 100.00.
        assert_eq!(gross_from_net(8_000, 2_000).unwrap(), 10_000);
    }

    #[test]
    fn rounding_is_half_to_even() {
        // 25 * 50bp / 10000 = 0.125 -> rounds to 0 (even), not 1.
        assert_eq!(compute_payout(25, 60, 50).unwrap().platform_fee_minor, 0);
        // 75 * 50bp / 10000 = 0.375 -> nearest is 0.
        assert_eq!(compute_payout(75, 60, 50).unwrap().platform_fee_minor, 0);
        // 300 * 50bp / 10000 = 1.5 -> rounds to 2 (even).
        assert_eq!(compute_payout(300, 60, 50).unwrap().platform_fee_minor, 2);
        // 100 * 50bp / 10000 = 0.5 -> rounds to 0 (even).
        assert_eq!(compute_payout(100, 60, 50).unwrap().platform_fee_minor, 0);
    }

    #[test]
    fn fee_fraction_converts_to_basis_points() {
        assert_eq!(fee_rate_bp_from_fraction(0.20), 2_000);
        assert_eq!(fee_rate_bp_from_fraction(0.025), 250);
        assert_eq!(fee_rate_bp_from_fraction(0.0), 0);
    }

    #[test]
    fn non_positive_inputs_are_rejected() {
        assert!(compute_payout(0, 60, 2_000).is_err());
        assert!(compute_payout(-5, 60, 2_000).is_err());
        assert!(compute_payout(10_000, 0, 2_000).is_err());
        assert!(compute_payout(10_000, -15, 2_000).is_err());
        assert!(gross_from_net(0, 2_000).is_err());
    }

    #[test]
    fn full_fee_rate_is_rejected() {
        assert!(compute_payout(10_000, 60, 10_000).is_err());
        assert!(gross_from_net(8_000, 10_000).is_err());
        assert!(compute_payout(10_000, 60, -1).is_err());
    }
}
