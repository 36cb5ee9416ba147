use chrono::{DateTime, Utc};
use rand::Rng;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::config::{OrderConfig, ReferenceStrategy};
use crate::errors::CheckoutError;
use crate::services::cart::CartLine;

/// Rounds a monetary amount to cents. Totals are carried exact everywhere
/// else; this is applied only at the gateway and persistence boundaries.
pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// A priced, tax-inclusive order payload frozen at checkout initiation.
///
/// Immutable once a payment session has been requested against it; any retry
/// goes through [`OrderDraftBuilder::build`] again and mints a fresh
/// `reference_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderDraft {
    pub reference_id: String,
    pub lines: Vec<CartLine>,
    pub subtotal: Decimal,
    pub tax_rate: Decimal,
    pub total_with_tax: Decimal,
    pub created_at: DateTime<Utc>,
}

impl OrderDraft {
    /// The order total rounded to cents, as charged and persisted.
    pub fn rounded_total(&self) -> Decimal {
        round_money(self.total_with_tax)
    }

    /// Loyalty points earned by this order: floor of the charged total.
    pub fn earned_points(&self) -> i64 {
        self.rounded_total().floor().to_i64().unwrap_or(0)
    }
}

/// Builds immutable order drafts from cart contents.
#[derive(Debug, Clone)]
pub struct OrderDraftBuilder {
    prefix: String,
    strategy: ReferenceStrategy,
    tax_rate: Decimal,
}

impl OrderDraftBuilder {
    pub fn from_config(config: &OrderConfig) -> Self {
        Self {
            prefix: config.reference_prefix.clone(),
            strategy: config.reference_strategy,
            tax_rate: Decimal::from_f64_retain(config.tax_rate)
                .unwrap_or_default()
                .round_dp(6),
        }
    }

    pub fn tax_rate(&self) -> Decimal {
        self.tax_rate
    }

    /// Prices the cart and mints a unique reference id.
    ///
    /// `subtotal` and `total_with_tax` stay exact; rounding happens at the
    /// persistence/gateway boundary to avoid compounding rounding error.
    #[instrument(skip(self, lines), fields(line_count = lines.len()))]
    pub fn build(&self, lines: &[CartLine]) -> Result<OrderDraft, CheckoutError> {
        if lines.is_empty() {
            return Err(CheckoutError::EmptyCart);
        }

        let subtotal: Decimal = lines.iter().map(CartLine::line_total).sum();
        let total_with_tax = subtotal * (Decimal::ONE + self.tax_rate);
        let reference_id = self.mint_reference(total_with_tax);

        Ok(OrderDraft {
            reference_id,
            lines: lines.to_vec(),
            subtotal,
            tax_rate: self.tax_rate,
            total_with_tax,
            created_at: Utc::now(),
        })
    }

    fn mint_reference(&self, total_with_tax: Decimal) -> String {
        match self.strategy {
            ReferenceStrategy::DateRandom => date_random_reference(&self.prefix),
            ReferenceStrategy::TimestampAmount => format!(
                "{}-{}-{}",
                self.prefix,
                Utc::now().timestamp_millis(),
                round_money(total_with_tax)
            ),
        }
    }
}

/// `{PREFIX}-{YYYYMMDD}-{4-digit-random}`, also used for human-facing order
/// numbers at persistence time.
pub fn date_random_reference(prefix: &str) -> String {
    let date_part = Utc::now().format("%Y%m%d");
    let random_part: u32 = rand::thread_rng().gen_range(1000..10000);
    format!("{}-{}-{}", prefix, date_part, random_part)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::collections::BTreeSet;
    use uuid::Uuid;

    fn line(price: Decimal, quantity: u32) -> CartLine {
        CartLine {
            product_id: Uuid::new_v4(),
            name: "Reuben".to_string(),
            unit_price: price,
            quantity,
            selected_extra_ids: BTreeSet::new(),
        }
    }

    fn builder(strategy: ReferenceStrategy) -> OrderDraftBuilder {
        OrderDraftBuilder::from_config(&OrderConfig {
            reference_prefix: "FD".to_string(),
            reference_strategy: strategy,
            ..OrderConfig::default()
        })
    }

    #[test]
    fn empty_cart_is_refused() {
        let err = builder(ReferenceStrategy::DateRandom).build(&[]).unwrap_err();
        assert!(matches!(err, CheckoutError::EmptyCart));
    }

    #[test]
    fn totals_apply_six_percent_tax() {
        let draft = builder(ReferenceStrategy::DateRandom)
            .build(&[line(dec!(10.00), 2)])
            .unwrap();

        assert_eq!(draft.subtotal, dec!(20.00));
        assert_eq!(draft.rounded_total(), dec!(21.20));
        assert_eq!(draft.earned_points(), 21);
    }

    #[test]
    fn rounding_happens_once_at_the_boundary() {
        // Three lines whose per-line tax would each round; the draft total
        // must come from the exact sum, rounded once.
        let lines = vec![line(dec!(0.33), 1), line(dec!(0.33), 1), line(dec!(0.33), 1)];
        let draft = builder(ReferenceStrategy::DateRandom).build(&lines).unwrap();

        assert_eq!(draft.subtotal, dec!(0.99));
        // 0.99 * 1.06 = 1.0494 -> 1.05 once rounded
        assert_eq!(draft.rounded_total(), dec!(1.05));
    }

    #[test]
    fn date_random_reference_shape() {
        let draft = builder(ReferenceStrategy::DateRandom)
            .build(&[line(dec!(5.00), 1)])
            .unwrap();

        let parts: Vec<&str> = draft.reference_id.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "FD");
        assert_eq!(parts[1].len(), 8);
        assert!(parts[1].chars().all(|c| c.is_ascii_digit()));
        let random: u32 = parts[2].parse().expect("random part should be numeric");
        assert!((1000..10000).contains(&random));
    }

    #[test]
    fn timestamp_amount_reference_carries_the_charged_total() {
        let draft = builder(ReferenceStrategy::TimestampAmount)
            .build(&[line(dec!(10.00), 2)])
            .unwrap();

        assert!(draft.reference_id.starts_with("FD-"));
        assert!(draft.reference_id.ends_with("-21.20"));
    }

    #[test]
    fn retry_mints_a_fresh_reference() {
        let builder = builder(ReferenceStrategy::TimestampAmount);
        let lines = vec![line(dec!(10.00), 1)];
        let first = builder.build(&lines).unwrap();
        // Millisecond timestamps can collide across two immediate builds, so
        // compare against a build with a different amount.
        let second = builder.build(&[line(dec!(11.00), 1)]).unwrap();
        assert_ne!(first.reference_id, second.reference_id);
    }

    #[test]
    fn points_floor_the_total() {
        let draft = builder(ReferenceStrategy::DateRandom)
            .build(&[line(dec!(9.99), 1)])
            .unwrap();
        // 9.99 * 1.06 = 10.5894 -> 10.59 charged, 10 points
        assert_eq!(draft.rounded_total(), dec!(10.59));
        assert_eq!(draft.earned_points(), 10);
    }
}
