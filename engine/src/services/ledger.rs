//! Double-book derived balances.
//!
//! Every ledger entry (debt or payment) carries a derived *matched
//! balance*: the sum of the split amounts pointing at it. The unmatched
//! balance and the fully-matched flag follow from it. Batch code must use
//! [`with_remote_accounts`] (or the store's annotated queries, which do the
//! same in SQL) so a whole collection is annotated in one pass; the
//! per-record [`matched_balance_of`] query exists for records fetched
//! outside that path and logs a performance warning every time it runs.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::{ConnectionTrait, DbBackend, Statement};

use shared::money::{Currency, Money};

use crate::entities::{debt, payment, split};

/// Explicit binding between one side of the double book and its split
/// relation, supplied at type-definition time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DoubleBookBinding {
    pub table: &'static str,
    pub split_table: &'static str,
    pub split_fk_column: &'static str,
    pub split_amount_column: &'static str,
}

pub const DEBT_BINDING: DoubleBookBinding = DoubleBookBinding {
    table: "internal_debts",
    split_table: "payment_splits",
    split_fk_column: "debt_id",
    split_amount_column: "amount",
};

pub const PAYMENT_BINDING: DoubleBookBinding = DoubleBookBinding {
    table: "internal_payments",
    split_table: "payment_splits",
    split_fk_column: "payment_id",
    split_amount_column: "amount",
};

/// One half of a double-entry ledger.
pub trait DoubleBookRecord {
    fn record_id(&self) -> i32;
    fn record_timestamp(&self) -> DateTime<Utc>;
    fn record_total(&self) -> Decimal;
}

impl DoubleBookRecord for debt::Model {
    fn record_id(&self) -> i32 {
        self.id
    }

    fn record_timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    fn record_total(&self) -> Decimal {
        self.total_amount
    }
}

impl DoubleBookRecord for payment::Model {
    fn record_id(&self) -> i32 {
        self.id
    }

    fn record_timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    fn record_total(&self) -> Decimal {
        self.total_amount
    }
}

/// A ledger entry annotated with the sum of its splits.
#[derive(Debug, Clone)]
pub struct Accounted<T> {
    pub record: T,
    matched_balance: Money,
}

impl<T: DoubleBookRecord> Accounted<T> {
    pub fn new(record: T, matched_balance: Money) -> Self {
        Self {
            record,
            matched_balance,
        }
    }

    /// A record that has never been matched, e.g. one not yet persisted.
    pub fn unmatched(record: T, currency: Currency) -> Self {
        Self::new(record, Money::zero(currency))
    }

    pub fn matched_balance(&self) -> Money {
        self.matched_balance
    }

    pub fn total_amount(&self) -> Money {
        Money::new(self.record.record_total(), self.matched_balance.currency())
    }

    pub fn unmatched_balance(&self) -> Money {
        self.total_amount() - self.matched_balance
    }

    pub fn fully_matched(&self) -> bool {
        self.total_amount() <= self.matched_balance
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.record.record_timestamp()
    }
}

/// A debt annotated with the portion already paid off.
pub type OutstandingDebt = Accounted<debt::Model>;

impl Accounted<debt::Model> {
    pub fn amount_paid(&self) -> Money {
        self.matched_balance()
    }

    pub fn balance(&self) -> Money {
        self.unmatched_balance()
    }

    pub fn paid(&self) -> bool {
        self.fully_matched()
    }
}

/// A payment annotated with the credit already used up.
pub type CreditedPayment = Accounted<payment::Model>;

impl Accounted<payment::Model> {
    pub fn credit_used(&self) -> Money {
        self.matched_balance()
    }

    pub fn credit_remaining(&self) -> Money {
        self.unmatched_balance()
    }

    pub fn fully_used(&self) -> bool {
        self.fully_matched()
    }
}

/// Annotate a whole collection with matched balances in a single pass over
/// the split set. `split_fk` selects the foreign key pointing at `records`
/// (debt id or payment id).
pub fn with_remote_accounts<T, F>(
    records: Vec<T>,
    splits: &[split::Model],
    split_fk: F,
    currency: Currency,
) -> Vec<Accounted<T>>
where
    T: DoubleBookRecord,
    F: Fn(&split::Model) -> i32,
{
    let mut matched: HashMap<i32, Decimal> = HashMap::new();
    for split in splits {
        *matched.entry(split_fk(split)).or_default() += split.amount;
    }
    records
        .into_iter()
        .map(|record| {
            let sum = matched
                .get(&record.record_id())
                .copied()
                .unwrap_or(Decimal::ZERO);
            Accounted::new(record, Money::new(sum, currency))
        })
        .collect()
}

/// Per-record fallback for a record fetched outside an annotated query.
pub async fn matched_balance_of<C: ConnectionTrait>(
    db: &C,
    binding: &DoubleBookBinding,
    record_id: i32,
    currency: Currency,
) -> anyhow::Result<Money> {
    tracing::warn!(
        record_id,
        table = binding.table,
        "PERFORMANCE WARNING: per-record matched balance computation; \
         annotate the whole query instead"
    );
    let sql = format!(
        "SELECT COALESCE(SUM({amount}), 0) AS matched FROM {split_table} WHERE {fk} = $1",
        amount = binding.split_amount_column,
        split_table = binding.split_table,
        fk = binding.split_fk_column,
    );
    let row = db
        .query_one(Statement::from_sql_and_values(
            DbBackend::Postgres,
            sql,
            vec![record_id.into()],
        ))
        .await?;
    let matched: Decimal = match row {
        Some(row) => row.try_get("", "matched")?,
        None => Decimal::ZERO,
    };
    Ok(Money::new(matched, currency))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn eur() -> Currency {
        Currency::from_code("EUR").unwrap()
    }

    fn debt(id: i32, total: Decimal) -> debt::Model {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        debt::Model {
            id,
            member_id: 1,
            timestamp: ts,
            processed: ts,
            total_amount: total,
            comment: None,
            filter_slug: None,
            category: None,
        }
    }

    fn split(id: i32, debt_id: i32, amount: Decimal) -> split::Model {
        split::Model {
            id,
            payment_id: 9,
            debt_id,
            amount,
        }
    }

    #[test]
    fn annotates_collection_in_one_pass() {
        let debts = vec![debt(1, dec!(30)), debt(2, dec!(50)), debt(3, dec!(10))];
        let splits = vec![
            split(1, 1, dec!(10)),
            split(2, 1, dec!(20)),
            split(3, 2, dec!(15)),
        ];
        let annotated = with_remote_accounts(debts, &splits, |s| s.debt_id, eur());

        assert_eq!(annotated[0].matched_balance().amount(), dec!(30));
        assert!(annotated[0].paid());
        assert_eq!(annotated[1].balance().amount(), dec!(35));
        assert!(!annotated[1].paid());
        assert_eq!(annotated[2].balance().amount(), dec!(10));
        assert_eq!(annotated[2].amount_paid().amount(), dec!(0));
    }

    #[test]
    fn unmatched_record_has_full_balance() {
        let fresh = Accounted::unmatched(debt(7, dec!(12.50)), eur());
        assert_eq!(fresh.balance().amount(), dec!(12.50));
        assert!(!fresh.paid());
    }

    #[test]
    fn bindings_point_at_the_split_relation() {
        assert_eq!(DEBT_BINDING.split_table, PAYMENT_BINDING.split_table);
        assert_ne!(DEBT_BINDING.split_fk_column, PAYMENT_BINDING.split_fk_column);
    }
}
