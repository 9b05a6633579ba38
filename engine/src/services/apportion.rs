//! Credit apportionment: turning a member's payments into splits against
//! their outstanding debts.
//!
//! Payments and debts must be supplied oldest-first. The engine never
//! applies a payment to a debt dated after it, never over-applies either
//! side, and partitions every input into exactly one of the
//! fully-used/fully-paid or remaining buckets of the result.

use chrono::{DateTime, Utc};

use shared::money::Money;

use crate::services::ledger::OutstandingDebt;

/// A source of credit: an annotated stored payment or a fresh draft.
pub trait CreditSource {
    fn timestamp(&self) -> DateTime<Utc>;
    fn credit_remaining(&self) -> Money;
}

/// A debt that credit can be applied to.
pub trait DebtSink {
    fn timestamp(&self) -> DateTime<Utc>;
    fn balance(&self) -> Money;
}

impl DebtSink for OutstandingDebt {
    fn timestamp(&self) -> DateTime<Utc> {
        // resolves to the inherent accessor on Accounted
        OutstandingDebt::timestamp(self)
    }

    fn balance(&self) -> Money {
        OutstandingDebt::balance(self)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ApportionmentOptions {
    /// Pair payments with a debt of exactly matching balance before the
    /// greedy pass.
    pub prioritise_exact_amount_match: bool,
    /// Stop after the exact-match pass.
    pub exact_amount_match_only: bool,
}

impl Default for ApportionmentOptions {
    fn default() -> Self {
        Self {
            prioritise_exact_amount_match: true,
            exact_amount_match_only: false,
        }
    }
}

/// Where every input ended up.
#[derive(Debug)]
pub struct ApportionmentResult<P, D> {
    pub fully_used_payments: Vec<P>,
    pub fully_paid_debts: Vec<D>,
    pub remaining_payments: Vec<P>,
    pub remaining_debts: Vec<D>,
}

impl<P, D> Default for ApportionmentResult<P, D> {
    fn default() -> Self {
        Self {
            fully_used_payments: Vec::new(),
            fully_paid_debts: Vec::new(),
            remaining_payments: Vec::new(),
            remaining_debts: Vec::new(),
        }
    }
}

/// Generate payment→debt splits for one member.
///
/// `payments` and `debts` must be ordered by ascending timestamp. The
/// factory receives the payment, the debt and the split amount for every
/// emitted split; splits are emitted in a deterministic order (exact
/// matches in payment order, then the greedy chronological pairing).
pub fn make_payment_splits<P, D, S, F>(
    payments: Vec<P>,
    debts: Vec<D>,
    options: ApportionmentOptions,
    mut split_factory: F,
) -> (Vec<S>, ApportionmentResult<P, D>)
where
    P: CreditSource,
    D: DebtSink,
    F: FnMut(&P, &D, Money) -> S,
{
    let mut splits = Vec::new();
    let mut results = ApportionmentResult::default();

    let (payments, debts) =
        if options.prioritise_exact_amount_match || options.exact_amount_match_only {
            let mut debt_list = debts;
            let mut payments_todo = Vec::new();
            for payment in payments {
                let amount = payment.credit_remaining();
                // attempt to find a debt matching the exact payment amount,
                // no older than the payment itself
                let exact = debt_list
                    .iter()
                    .position(|d| d.balance() == amount && d.timestamp() <= payment.timestamp());
                match exact {
                    Some(index) => {
                        // O(n) removal, like the candidate scan itself;
                        // bulk imports per member are small
                        let debt = debt_list.remove(index);
                        splits.push(split_factory(&payment, &debt, amount));
                        results.fully_used_payments.push(payment);
                        results.fully_paid_debts.push(debt);
                    }
                    None => payments_todo.push(payment),
                }
            }
            (payments_todo, debt_list)
        } else {
            (payments, debts)
        };

    let mut payments_iter = payments.into_iter();
    let mut debts_iter = debts.into_iter();

    if options.exact_amount_match_only {
        results.remaining_payments.extend(payments_iter);
        results.remaining_debts.extend(debts_iter);
        return (splits, results);
    }

    // The generic pass is simple: use payments to pay off debts until we
    // run out of debts, or of money to pay them. Ordering both sides from
    // old to new enforces the no-retroactive-payment invariant.
    let mut payment: Option<P> = None;
    let mut debt: Option<D> = None;
    let mut credit_remaining: Option<Money> = None;
    let mut debt_remaining: Option<Money> = None;

    'pairing: loop {
        // look for some unpaid debt
        while debt_remaining.map_or(true, |m| m.is_zero()) {
            if let Some(paid) = debt.take() {
                results.fully_paid_debts.push(paid);
            }
            match debts_iter.next() {
                Some(next_debt) => {
                    debt_remaining = Some(next_debt.balance());
                    debt = Some(next_debt);
                }
                None => {
                    // all debts fully paid back; record the payment in hand
                    if let Some(current) = payment.take() {
                        match credit_remaining {
                            Some(m) if !m.is_zero() => results.remaining_payments.push(current),
                            _ => results.fully_used_payments.push(current),
                        }
                    }
                    break 'pairing;
                }
            }
        }

        // keep trying payments until we find one that is recent enough to
        // cover the current debt
        loop {
            let advance = match (&payment, credit_remaining, &debt) {
                (None, _, _) | (_, None, _) => true,
                (Some(_), Some(credit), _) if credit.is_zero() => true,
                (Some(p), Some(_), Some(d)) => p.timestamp() < d.timestamp(),
                // the debt search above only falls through with a debt in hand
                (Some(_), Some(_), None) => unreachable!("payment scan without a debt in hand"),
            };
            if !advance {
                break;
            }
            if let Some(used) = payment.take() {
                match credit_remaining {
                    Some(m) if !m.is_zero() => results.remaining_payments.push(used),
                    _ => results.fully_used_payments.push(used),
                }
            }
            match payments_iter.next() {
                Some(next_payment) => {
                    credit_remaining = Some(next_payment.credit_remaining());
                    payment = Some(next_payment);
                }
                None => {
                    // no money left; record the debt in hand
                    if let Some(unpaid) = debt.take() {
                        results.remaining_debts.push(unpaid);
                    }
                    break 'pairing;
                }
            }
        }

        // pay off as much of the current debt as the current balance allows
        let (Some(current_payment), Some(current_debt)) = (&payment, &debt) else {
            break;
        };
        let (Some(credit), Some(owed)) = (credit_remaining, debt_remaining) else {
            break;
        };
        let amount = owed.min(credit);
        credit_remaining = Some(credit - amount);
        debt_remaining = Some(owed - amount);
        splits.push(split_factory(current_payment, current_debt, amount));
    }

    // inputs the pairing never reached keep their full balance
    results.remaining_payments.extend(payments_iter);
    results.remaining_debts.extend(debts_iter);

    (splits, results)
}
