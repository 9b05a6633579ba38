//! Batch preparation pipelines.
//!
//! A pipeline turns parsed rows into not-yet-persisted ledger entries plus
//! proposed splits, accumulating every problem on the way instead of
//! raising. The stages run in a fixed order: resolve parties (one bulk
//! query per lookup-key shape), validate rows, validate the whole batch
//! (duplicate stripping, transfers only), then apportion each member's
//! credit over their outstanding debts and flag overpayments.
//!
//! The two concrete pipelines compose the same capabilities differently:
//! [`TransferImportPipeline`] resolves by structured reference and strips
//! duplicates; [`MemberPaymentPipeline`] resolves by email or full name.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};

use shared::money::{Currency, Money};
use shared::nature::PaymentNature;
use shared::report::{BatchReport, ErrorList};

use crate::config::ImportConfig;
use crate::entities::payment;
use crate::services::apportion::{make_payment_splits, ApportionmentOptions, CreditSource};
use crate::services::csv_import::TransactionInfo;
use crate::services::dupcheck::{strip_duplicates, DupCollision, DupSignature};
use crate::services::resolver::{PartyResolver, ResolvedParties};
use crate::services::store::ReconciliationStore;

/// A not-yet-persisted payment produced from a validated row.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentDraft {
    pub member_id: i32,
    pub nature: PaymentNature,
    pub timestamp: DateTime<Utc>,
    pub total_amount: Money,
}

impl PaymentDraft {
    pub fn dupcheck_signature(&self) -> DupSignature {
        DupSignature {
            date: self.timestamp.date_naive(),
            amount: self.total_amount.amount(),
            nature: self.nature.code(),
            member_id: self.member_id,
        }
    }

    pub fn active_model(&self, processed: DateTime<Utc>) -> payment::ActiveModel {
        use sea_orm::Set;
        payment::ActiveModel {
            member_id: Set(self.member_id),
            timestamp: Set(self.timestamp),
            processed: Set(processed),
            total_amount: Set(self.total_amount.amount()),
            nature: Set(self.nature.code()),
            ..Default::default()
        }
    }
}

/// A validated row bound to its draft ledger entry.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedEntry {
    pub line_no: u32,
    pub draft: PaymentDraft,
}

impl CreditSource for PreparedEntry {
    fn timestamp(&self) -> DateTime<Utc> {
        self.draft.timestamp
    }

    fn credit_remaining(&self) -> Money {
        // a draft has no splits yet; its whole amount is open credit
        self.draft.total_amount
    }
}

/// A proposed reconciliation between one new payment (identified by its
/// source line until it is persisted) and one stored debt.
#[derive(Debug, Clone, PartialEq)]
pub struct ProposedSplit {
    pub payment_line: u32,
    pub debt_id: i32,
    pub amount: Money,
}

/// Everything a batch run produced, ready for atomic persistence.
#[derive(Debug)]
pub struct PreparedImport {
    pub entries: Vec<PreparedEntry>,
    pub splits: Vec<ProposedSplit>,
    pub errors: ErrorList,
}

impl PreparedImport {
    pub fn report(&self) -> BatchReport {
        self.errors.clone().into_report()
    }
}

/// Per-row validation shared by the pipelines. Rows whose lookup key was
/// never resolved are dropped without a new error; the resolver already
/// reported or logged them.
fn draft_for_row(
    info: &TransactionInfo,
    parties: &ResolvedParties,
    errors: &mut ErrorList,
) -> Option<PreparedEntry> {
    if !info.amount.is_positive() {
        errors.error_at_line(info.line_no, "Amount should be strictly greater than zero.");
        return None;
    }
    let record = parties.by_lookup(&info.account_lookup_str)?;
    Some(PreparedEntry {
        line_no: info.line_no,
        draft: PaymentDraft {
            member_id: record.id,
            nature: info.nature,
            timestamp: info.timestamp,
            total_amount: info.amount,
        },
    })
}

/// Apportion each member's credit over their outstanding debts, reporting
/// overpayments against every contributing line. Returns the surviving
/// entries (all of them, partitioned back out of the apportionment) and
/// the proposed splits.
async fn apportion_batch(
    store: &dyn ReconciliationStore,
    parties: &ResolvedParties,
    currency: Currency,
    entries: Vec<PreparedEntry>,
    payment_kind: &str,
    errors: &mut ErrorList,
) -> anyhow::Result<(Vec<PreparedEntry>, Vec<ProposedSplit>)> {
    // bucket per member, first-appearance order
    let mut order: Vec<i32> = Vec::new();
    let mut buckets: HashMap<i32, Vec<PreparedEntry>> = HashMap::new();
    for entry in entries {
        let member_id = entry.draft.member_id;
        if !buckets.contains_key(&member_id) {
            order.push(member_id);
        }
        buckets.entry(member_id).or_default().push(entry);
    }

    let mut debts = store.unpaid_debts_for_members(&order, currency).await?;

    let mut survivors = Vec::new();
    let mut proposed = Vec::new();
    for member_id in order {
        let mut bucket = buckets.remove(&member_id).unwrap_or_default();
        bucket.sort_by_key(|entry| entry.draft.timestamp);
        let lines: Vec<u32> = bucket.iter().map(|entry| entry.line_no).collect();
        let total_credit = bucket
            .iter()
            .fold(Money::zero(currency), |acc, entry| {
                acc + entry.draft.total_amount
            });

        let member_debts = debts.remove(&member_id).unwrap_or_default();
        let (splits, result) = make_payment_splits(
            bucket,
            member_debts,
            ApportionmentOptions::default(),
            |entry, debt, amount| ProposedSplit {
                payment_line: entry.line_no,
                debt_id: debt.record.id,
                amount,
            },
        );

        let total_used = splits
            .iter()
            .fold(Money::zero(currency), |acc, split| acc + split.amount);
        if total_used < total_credit {
            errors.error_at_lines(
                lines,
                format!(
                    "Not all {} of {} can be fully utilised. \
                     Received {}, but only {} can be applied to outstanding debts.",
                    payment_kind,
                    parties.display_name(member_id),
                    total_credit,
                    total_used,
                ),
            );
        }

        proposed.extend(splits);
        survivors.extend(result.fully_used_payments);
        survivors.extend(result.remaining_payments);
    }
    survivors.sort_by_key(|entry| entry.line_no);
    Ok((survivors, proposed))
}

/// Bank-transfer batches: resolve by structured reference, strip
/// duplicates against the payment history, then apportion.
pub struct TransferImportPipeline<'a> {
    store: &'a dyn ReconciliationStore,
    config: &'a ImportConfig,
}

impl<'a> TransferImportPipeline<'a> {
    pub fn new(store: &'a dyn ReconciliationStore, config: &'a ImportConfig) -> Self {
        Self { store, config }
    }

    pub async fn run(&self, transactions: Vec<TransactionInfo>) -> anyhow::Result<PreparedImport> {
        let currency = self.config.currency()?;
        let mut errors = ErrorList::new();

        let mut resolver = PartyResolver::for_transfers(self.config.ogm_internal_debt_prefix);
        resolver.append_all(&transactions);
        let parties = resolver.execute(self.store, &mut errors).await?;

        let mut valid = Vec::new();
        for info in &transactions {
            if let Some(entry) = draft_for_row(info, &parties, &mut errors) {
                valid.push(entry);
            }
        }

        let valid = self
            .strip_history_duplicates(valid, &parties, currency, &mut errors)
            .await?;

        let (entries, splits) = apportion_batch(
            self.store,
            &parties,
            currency,
            valid,
            "bank transfer payments",
            &mut errors,
        )
        .await?;

        Ok(PreparedImport {
            entries,
            splits,
            errors,
        })
    }

    async fn strip_history_duplicates(
        &self,
        valid: Vec<PreparedEntry>,
        parties: &ResolvedParties,
        currency: Currency,
        errors: &mut ErrorList,
    ) -> anyhow::Result<Vec<PreparedEntry>> {
        let dates: Vec<NaiveDate> = valid
            .iter()
            .map(|entry| entry.draft.timestamp.date_naive())
            .collect();
        let (Some(&lo), Some(&hi)) = (dates.iter().min(), dates.iter().max()) else {
            return Ok(valid);
        };
        let historical = self.store.dupcheck_buckets(lo, hi).await?;
        Ok(strip_duplicates(
            valid,
            &historical,
            errors,
            |entry| entry.draft.dupcheck_signature(),
            |entry| entry.line_no,
            |sig, collision| dup_message(parties, currency, sig, collision),
        ))
    }
}

fn dup_message(
    parties: &ResolvedParties,
    currency: Currency,
    sig: &DupSignature,
    collision: DupCollision,
) -> String {
    let who = parties.display_name(sig.member_id);
    let amount = Money::new(sig.amount, currency);
    if collision.occ_in_hist == 1 && collision.occ_in_import == 1 {
        format!(
            "A bank transfer payment by {} for amount {} on date {} \
             already appears in the payment history. \
             Resolution: likely duplicate, skipped processing.",
            who, amount, sig.date,
        )
    } else {
        format!(
            "A bank transfer payment by {} for amount {} on date {} \
             appears {} time(s) in history, and {} time(s) in the current \
             batch of data. Resolution: {} ruled as duplicate(s).",
            who,
            amount,
            sig.date,
            collision.occ_in_hist,
            collision.occ_in_import,
            collision.dupcount,
        )
    }
}

/// Member-keyed batches (e.g. cash rounds): resolve by email or full
/// name, then apportion. No duplicate check; these feeds carry no
/// bank-side identity.
pub struct MemberPaymentPipeline<'a> {
    store: &'a dyn ReconciliationStore,
    config: &'a ImportConfig,
}

impl<'a> MemberPaymentPipeline<'a> {
    pub fn new(store: &'a dyn ReconciliationStore, config: &'a ImportConfig) -> Self {
        Self { store, config }
    }

    pub async fn run(&self, transactions: Vec<TransactionInfo>) -> anyhow::Result<PreparedImport> {
        let currency = self.config.currency()?;
        let mut errors = ErrorList::new();

        let mut resolver = PartyResolver::for_member_lookup();
        resolver.append_all(&transactions);
        let parties = resolver.execute(self.store, &mut errors).await?;

        let mut valid = Vec::new();
        for info in &transactions {
            if let Some(entry) = draft_for_row(info, &parties, &mut errors) {
                valid.push(entry);
            }
        }

        let (entries, splits) =
            apportion_batch(self.store, &parties, currency, valid, "payments", &mut errors)
                .await?;

        Ok(PreparedImport {
            entries,
            splits,
            errors,
        })
    }
}
