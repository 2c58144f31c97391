#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BillingOutcome {
    pub amount: f64,
    pub is_overtime: bool,
}

/// Billing strategy, selected by configuration. Exactly one policy is active
/// per deployment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BillingPolicy {
    /// One-time flat fee; the overtime fee replaces the base fee.
    Flat { base_fee: f64, overtime_fee: f64 },
    /// Accrues per hour, with a higher rate for minutes past the threshold.
    Hourly {
        rate_per_hour: f64,
        overtime_rate_per_hour: f64,
    },
}

impl BillingPolicy {
    /// Charge for a completed cycle. `threshold_minutes` is the slot's
    /// allowed duration; elapsed time is clamped to zero so clock skew can
    /// never produce a negative charge.
    pub fn calculate(&self, elapsed_minutes: i64, threshold_minutes: i64) -> BillingOutcome {
        let elapsed = elapsed_minutes.max(0);
        let threshold = threshold_minutes.max(0);
        let is_overtime = elapsed > threshold;

        let amount = match *self {
            Self::Flat {
                base_fee,
                overtime_fee,
            } => {
                if is_overtime {
                    overtime_fee
                } else {
                    base_fee
                }
            }
            Self::Hourly {
                rate_per_hour,
                overtime_rate_per_hour,
            } => {
                if is_overtime {
                    hours(threshold) * rate_per_hour
                        + hours(elapsed - threshold) * overtime_rate_per_hour
                } else {
                    hours(elapsed) * rate_per_hour
                }
            }
        };

        BillingOutcome {
            amount: round_to_cents(amount),
            is_overtime,
        }
    }
}

fn hours(minutes: i64) -> f64 {
    minutes as f64 / 60.0
}

/// Round half-up on the cent boundary.
pub fn round_to_cents(amount: f64) -> f64 {
    (amount * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::{BillingOutcome, BillingPolicy, round_to_cents};

    fn flat() -> BillingPolicy {
        BillingPolicy::Flat {
            base_fee: 25.0,
            overtime_fee: 100.0,
        }
    }

    fn hourly() -> BillingPolicy {
        BillingPolicy::Hourly {
            rate_per_hour: 25.0,
            overtime_rate_per_hour: 50.0,
        }
    }

    #[test]
    fn flat_fee_below_and_at_threshold() {
        assert_eq!(
            flat().calculate(60, 120),
            BillingOutcome {
                amount: 25.0,
                is_overtime: false,
            }
        );
        assert_eq!(
            flat().calculate(120, 120),
            BillingOutcome {
                amount: 25.0,
                is_overtime: false,
            }
        );
    }

    #[test]
    fn flat_fee_replaces_base_past_threshold() {
        assert_eq!(
            flat().calculate(121, 120),
            BillingOutcome {
                amount: 100.0,
                is_overtime: true,
            }
        );
        // Flat fees do not scale with additional time.
        assert_eq!(flat().calculate(600, 120).amount, 100.0);
    }

    #[test]
    fn hourly_accrues_below_threshold() {
        assert_eq!(
            hourly().calculate(60, 120),
            BillingOutcome {
                amount: 25.0,
                is_overtime: false,
            }
        );
        assert_eq!(hourly().calculate(30, 120).amount, 12.5);
    }

    #[test]
    fn hourly_splits_regular_and_overtime_rates() {
        // 120 regular minutes at 25/hr plus 60 overtime minutes at 50/hr.
        assert_eq!(
            hourly().calculate(180, 120),
            BillingOutcome {
                amount: 100.0,
                is_overtime: true,
            }
        );
    }

    #[test]
    fn negative_elapsed_is_clamped_to_zero() {
        assert_eq!(
            hourly().calculate(-15, 120),
            BillingOutcome {
                amount: 0.0,
                is_overtime: false,
            }
        );
        assert_eq!(flat().calculate(-1, 120).amount, 25.0);
    }

    #[test]
    fn amounts_round_half_up_on_the_cent() {
        // 1 minute at 25/hr = 0.41666... -> 0.42.
        assert_eq!(hourly().calculate(1, 120).amount, 0.42);
        assert_eq!(round_to_cents(0.125), 0.13);
        assert_eq!(round_to_cents(0.124), 0.12);
    }
}
