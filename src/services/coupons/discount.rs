//! Discount arithmetic. Amounts are VND, which has no minor unit, so every
//! result is rounded to a whole number (half away from zero).

use rust_decimal::{Decimal, RoundingStrategy};

use crate::entities::coupon::{self, DiscountType};

/// Round to whole currency units.
pub fn round_vnd(amount: Decimal) -> Decimal {
    amount
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .normalize()
}

/// Discount granted by `coupon` on an order worth `order_value`.
///
/// The result is never negative and never exceeds `order_value`.
pub fn compute_discount(coupon: &coupon::Model, order_value: Decimal) -> Decimal {
    calculate(
        coupon.discount_type,
        coupon.discount_value,
        coupon.max_discount,
        order_value,
    )
}

pub fn calculate(
    discount_type: DiscountType,
    discount_value: Decimal,
    max_discount: Option<Decimal>,
    order_value: Decimal,
) -> Decimal {
    if order_value <= Decimal::ZERO || discount_value <= Decimal::ZERO {
        return Decimal::ZERO;
    }

    let amount = match discount_type {
        DiscountType::Fixed => discount_value,
        DiscountType::Percentage => {
            let raw = order_value * discount_value / Decimal::ONE_HUNDRED;
            match max_discount {
                Some(cap) => raw.min(cap.max(Decimal::ZERO)),
                None => raw,
            }
        }
    };

    // round before clamping so a half unit can't push past the order value
    round_vnd(amount)
        .min(order_value.floor())
        .max(Decimal::ZERO)
        .normalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn fixed_discount_is_capped_at_order_value() {
        assert_eq!(
            calculate(DiscountType::Fixed, dec!(50000), None, dec!(30000)),
            dec!(30000)
        );
    }

    #[test]
    fn percentage_discount_respects_max_discount() {
        assert_eq!(
            calculate(
                DiscountType::Percentage,
                dec!(20),
                Some(dec!(100000)),
                dec!(1000000)
            ),
            dec!(100000)
        );
    }

    #[test]
    fn percentage_without_cap() {
        assert_eq!(
            calculate(DiscountType::Percentage, dec!(15), None, dec!(199000)),
            dec!(29850)
        );
    }

    #[test]
    fn half_units_round_away_from_zero() {
        // 12.5% of 100004 = 12500.5
        assert_eq!(
            calculate(DiscountType::Percentage, dec!(12.5), None, dec!(100004)),
            dec!(12501)
        );
        // 12.5% of 100003 = 12500.375
        assert_eq!(
            calculate(DiscountType::Percentage, dec!(12.5), None, dec!(100003)),
            dec!(12500)
        );
    }

    #[test]
    fn empty_order_gets_nothing() {
        assert_eq!(
            calculate(DiscountType::Fixed, dec!(50000), None, Decimal::ZERO),
            Decimal::ZERO
        );
    }

    #[test]
    fn fractional_order_value_caps_at_whole_units() {
        assert_eq!(
            calculate(DiscountType::Fixed, dec!(50000), None, dec!(30000.5)),
            dec!(30000)
        );
        assert_eq!(
            calculate(DiscountType::Percentage, dec!(100), None, dec!(99999.6)),
            dec!(99999)
        );
    }

    #[test]
    fn full_percentage_never_exceeds_order() {
        assert_eq!(
            calculate(DiscountType::Percentage, dec!(100), None, dec!(250000)),
            dec!(250000)
        );
    }
}
