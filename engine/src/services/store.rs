//! The authoritative-store contract used by the import pipeline, and its
//! SeaORM implementation.
//!
//! The pipeline only ever talks to [`ReconciliationStore`]; every method is
//! a bulk operation so a batch costs a fixed number of queries. The tests
//! drive the pipeline with the in-memory store from [`testing`].

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use rust_decimal::Decimal;
use sea_orm::sea_query::{Expr, Func};
use sea_orm::{
    ColumnTrait, DatabaseConnection, DbBackend, EntityTrait, FromQueryResult, QueryFilter,
    Statement,
};

use shared::money::{Currency, Money};
use shared::ogm;

use crate::entities::{debt, member, payment};
use crate::services::dupcheck::DupSignature;
use crate::services::ledger::{self, Accounted, OutstandingDebt};

#[derive(Debug, Default)]
pub struct TrackingNoLookup {
    pub members: Vec<member::Model>,
    /// References that resolved to nothing, including record-id hits whose
    /// canonical reference differs from the incoming one.
    pub unseen: Vec<String>,
}

#[derive(Debug, Default)]
pub struct EmailLookup {
    pub members: Vec<member::Model>,
    pub unseen: Vec<String>,
}

#[derive(Debug, Default)]
pub struct FullNameLookup {
    pub members: Vec<member::Model>,
    pub unseen: Vec<String>,
    /// Case-folded names matching more than one member.
    pub duplicates: Vec<String>,
}

/// Bulk lookups and annotated reads the pipeline needs from the
/// authoritative store. Writes go through the import service, which owns
/// the transactional boundary.
#[async_trait]
pub trait ReconciliationStore: Send + Sync {
    /// Resolve canonical payment tracking numbers of one payment class.
    async fn by_payment_tracking_nos(
        &self,
        prefix_digit: u8,
        ogms: &[String],
    ) -> anyhow::Result<TrackingNoLookup>;

    /// Exact email lookup.
    async fn by_emails(&self, emails: &[String]) -> anyhow::Result<EmailLookup>;

    /// Case-folded full-name lookup; `names` must already be folded.
    async fn by_full_names(&self, names: &[String]) -> anyhow::Result<FullNameLookup>;

    /// Outstanding debts per member, oldest first, annotated with their
    /// matched balances in a single query.
    async fn unpaid_debts_for_members(
        &self,
        member_ids: &[i32],
        currency: Currency,
    ) -> anyhow::Result<HashMap<i32, Vec<OutstandingDebt>>>;

    /// Historical duplicate-check buckets for payments whose local date
    /// falls in the inclusive range.
    async fn dupcheck_buckets(
        &self,
        lo: NaiveDate,
        hi: NaiveDate,
    ) -> anyhow::Result<HashMap<DupSignature, u32>>;

    /// Unpaid balance tally per filter slug, optionally restricted to a
    /// slug set.
    async fn balances_by_filter_slug(
        &self,
        slugs: Option<&[String]>,
        skip_zeroes: bool,
        currency: Currency,
    ) -> anyhow::Result<HashMap<Option<String>, Money>>;
}

/// Resolve references against a member set: extract the nine-digit record
/// id, then require the member's full canonical reference to equal the
/// incoming one (the id digits alone may collide with an unrelated
/// member).
pub fn resolve_tracking_nos(
    prefix_digit: u8,
    ogms: &[String],
    members_by_id: &HashMap<i32, member::Model>,
) -> TrackingNoLookup {
    let mut members = Vec::new();
    let mut unseen = Vec::new();
    let mut seen_ids = HashSet::new();
    for raw in ogms {
        let resolved = ogm::parse(raw).ok().and_then(|parsed| {
            let member = members_by_id.get(&(parsed.record_id() as i32))?;
            (member.payment_tracking_no(prefix_digit) == *raw).then_some(member)
        });
        match resolved {
            Some(member) => {
                if seen_ids.insert(member.id) {
                    members.push(member.clone());
                }
            }
            None => unseen.push(raw.clone()),
        }
    }
    TrackingNoLookup { members, unseen }
}

/// The signature a stored payment contributes to the duplicate check.
pub fn payment_signature(record: &payment::Model) -> DupSignature {
    DupSignature {
        date: record.timestamp.date_naive(),
        amount: record.total_amount,
        nature: record.nature,
        member_id: record.member_id,
    }
}

fn day_start(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}

#[derive(FromQueryResult)]
struct DebtWithBalance {
    id: i32,
    member_id: i32,
    timestamp: DateTime<Utc>,
    processed: DateTime<Utc>,
    total_amount: Decimal,
    comment: Option<String>,
    filter_slug: Option<String>,
    category: Option<String>,
    matched_balance: Decimal,
}

impl DebtWithBalance {
    fn into_outstanding(self, currency: Currency) -> OutstandingDebt {
        let matched = Money::new(self.matched_balance, currency);
        Accounted::new(
            debt::Model {
                id: self.id,
                member_id: self.member_id,
                timestamp: self.timestamp,
                processed: self.processed,
                total_amount: self.total_amount,
                comment: self.comment,
                filter_slug: self.filter_slug,
                category: self.category,
            },
            matched,
        )
    }
}

#[derive(FromQueryResult)]
struct SlugBalance {
    filter_slug: Option<String>,
    total_balance: Decimal,
}

/// SeaORM-backed store.
pub struct SeaStore<'a> {
    db: &'a DatabaseConnection,
}

impl<'a> SeaStore<'a> {
    pub fn new(db: &'a DatabaseConnection) -> Self {
        Self { db }
    }

    /// Single-record balance read; prefer the annotated bulk queries.
    pub async fn debt_matched_balance(
        &self,
        debt_id: i32,
        currency: Currency,
    ) -> anyhow::Result<Money> {
        ledger::matched_balance_of(self.db, &ledger::DEBT_BINDING, debt_id, currency).await
    }

    /// The canonical spelling for a debt category, reusing an existing
    /// spelling when one matches case-insensitively.
    pub async fn category_for(&self, name: &str) -> anyhow::Result<Option<String>> {
        if name.trim().is_empty() {
            return Ok(None);
        }
        #[derive(FromQueryResult)]
        struct CategoryRow {
            category: String,
        }
        let rows = CategoryRow::find_by_statement(Statement::from_string(
            DbBackend::Postgres,
            "SELECT DISTINCT d.category FROM internal_debts d WHERE d.category IS NOT NULL",
        ))
        .all(self.db)
        .await?;
        let known: Vec<String> = rows.into_iter().map(|row| row.category).collect();
        Ok(normalize_category(&known, name))
    }
}

#[async_trait]
impl ReconciliationStore for SeaStore<'_> {
    async fn by_payment_tracking_nos(
        &self,
        prefix_digit: u8,
        ogms: &[String],
    ) -> anyhow::Result<TrackingNoLookup> {
        let ids: Vec<i32> = ogms
            .iter()
            .filter_map(|raw| ogm::parse(raw).ok())
            .map(|parsed| parsed.record_id() as i32)
            .collect();
        let found = if ids.is_empty() {
            Vec::new()
        } else {
            member::Entity::find()
                .filter(member::Column::Id.is_in(ids))
                .all(self.db)
                .await?
        };
        let by_id: HashMap<i32, member::Model> =
            found.into_iter().map(|m| (m.id, m)).collect();
        Ok(resolve_tracking_nos(prefix_digit, ogms, &by_id))
    }

    async fn by_emails(&self, emails: &[String]) -> anyhow::Result<EmailLookup> {
        if emails.is_empty() {
            return Ok(EmailLookup::default());
        }
        let members = member::Entity::find()
            .filter(member::Column::Email.is_in(emails.to_vec()))
            .all(self.db)
            .await?;
        let seen: HashSet<&str> = members.iter().map(|m| m.email.as_str()).collect();
        let unseen = emails
            .iter()
            .filter(|email| !seen.contains(email.as_str()))
            .cloned()
            .collect();
        Ok(EmailLookup { members, unseen })
    }

    async fn by_full_names(&self, names: &[String]) -> anyhow::Result<FullNameLookup> {
        if names.is_empty() {
            return Ok(FullNameLookup::default());
        }
        let members = member::Entity::find()
            .filter(
                Expr::expr(Func::lower(Expr::col((
                    member::Entity,
                    member::Column::Name,
                ))))
                .is_in(names.to_vec()),
            )
            .all(self.db)
            .await?;
        Ok(classify_name_matches(names, members))
    }

    async fn unpaid_debts_for_members(
        &self,
        member_ids: &[i32],
        currency: Currency,
    ) -> anyhow::Result<HashMap<i32, Vec<OutstandingDebt>>> {
        let mut buckets: HashMap<i32, Vec<OutstandingDebt>> = HashMap::new();
        if member_ids.is_empty() {
            return Ok(buckets);
        }
        let id_list = member_ids
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT d.id, d.member_id, d.\"timestamp\", d.processed, d.total_amount, \
                    d.comment, d.filter_slug, d.category, \
                    COALESCE((SELECT SUM(s.amount) FROM payment_splits s \
                              WHERE s.debt_id = d.id), 0) AS matched_balance \
             FROM internal_debts d \
             WHERE d.member_id IN ({id_list}) \
               AND d.total_amount > COALESCE((SELECT SUM(s.amount) FROM payment_splits s \
                                              WHERE s.debt_id = d.id), 0) \
             ORDER BY d.\"timestamp\" ASC",
        );
        let rows = DebtWithBalance::find_by_statement(Statement::from_string(
            DbBackend::Postgres,
            sql,
        ))
        .all(self.db)
        .await?;
        for row in rows {
            let outstanding = row.into_outstanding(currency);
            buckets
                .entry(outstanding.record.member_id)
                .or_default()
                .push(outstanding);
        }
        Ok(buckets)
    }

    async fn dupcheck_buckets(
        &self,
        lo: NaiveDate,
        hi: NaiveDate,
    ) -> anyhow::Result<HashMap<DupSignature, u32>> {
        let upper = hi.succ_opt().unwrap_or(hi);
        let records = payment::Entity::find()
            .filter(payment::Column::Timestamp.gte(day_start(lo)))
            .filter(payment::Column::Timestamp.lt(day_start(upper)))
            .all(self.db)
            .await?;
        let mut buckets: HashMap<DupSignature, u32> = HashMap::new();
        for record in &records {
            *buckets.entry(payment_signature(record)).or_default() += 1;
        }
        Ok(buckets)
    }

    async fn balances_by_filter_slug(
        &self,
        slugs: Option<&[String]>,
        skip_zeroes: bool,
        currency: Currency,
    ) -> anyhow::Result<HashMap<Option<String>, Money>> {
        let mut sql = String::from(
            "SELECT d.filter_slug, \
                    SUM(d.total_amount - COALESCE((SELECT SUM(s.amount) FROM payment_splits s \
                                                   WHERE s.debt_id = d.id), 0)) AS total_balance \
             FROM internal_debts d \
             WHERE d.total_amount > COALESCE((SELECT SUM(s.amount) FROM payment_splits s \
                                              WHERE s.debt_id = d.id), 0)",
        );
        let mut values: Vec<sea_orm::Value> = Vec::new();
        if let Some(slugs) = slugs {
            if slugs.is_empty() {
                return Ok(HashMap::new());
            }
            let placeholders = (1..=slugs.len())
                .map(|i| format!("${}", i))
                .collect::<Vec<_>>()
                .join(", ");
            sql.push_str(&format!(" AND d.filter_slug IN ({})", placeholders));
            values.extend(slugs.iter().cloned().map(Into::into));
        }
        sql.push_str(" GROUP BY d.filter_slug");
        let rows = SlugBalance::find_by_statement(Statement::from_sql_and_values(
            DbBackend::Postgres,
            sql,
            values,
        ))
        .all(self.db)
        .await?;
        let mut tally = HashMap::new();
        for row in rows {
            if skip_zeroes && row.total_balance.is_zero() {
                continue;
            }
            tally.insert(row.filter_slug, Money::new(row.total_balance, currency));
        }
        Ok(tally)
    }
}

/// Case-insensitive category normalization: reuse the stored spelling of
/// an existing category rather than introducing a near-duplicate.
pub fn normalize_category(known: &[String], name: &str) -> Option<String> {
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    known
        .iter()
        .find(|existing| existing.eq_ignore_ascii_case(name))
        .cloned()
        .or_else(|| Some(name.to_string()))
}

/// Sort name matches into resolved / unseen / ambiguous, by folded name.
pub fn classify_name_matches(
    folded_names: &[String],
    members: Vec<member::Model>,
) -> FullNameLookup {
    let mut counts: HashMap<String, u32> = HashMap::new();
    for member in &members {
        *counts.entry(member.name.to_lowercase()).or_default() += 1;
    }
    let mut unseen = Vec::new();
    let mut duplicates = Vec::new();
    for name in folded_names {
        match counts.get(name).copied().unwrap_or(0) {
            0 => unseen.push(name.clone()),
            1 => {}
            _ => duplicates.push(name.clone()),
        }
    }
    FullNameLookup {
        members,
        unseen,
        duplicates,
    }
}

/// In-memory store used by the pipeline tests.
#[cfg(test)]
pub mod testing {
    use super::*;
    use crate::entities::split;
    use crate::services::ledger::with_remote_accounts;

    #[derive(Debug, Default)]
    pub struct MemStore {
        pub members: Vec<member::Model>,
        pub debts: Vec<debt::Model>,
        pub payments: Vec<payment::Model>,
        pub splits: Vec<split::Model>,
    }

    #[async_trait]
    impl ReconciliationStore for MemStore {
        async fn by_payment_tracking_nos(
            &self,
            prefix_digit: u8,
            ogms: &[String],
        ) -> anyhow::Result<TrackingNoLookup> {
            let by_id: HashMap<i32, member::Model> = self
                .members
                .iter()
                .map(|m| (m.id, m.clone()))
                .collect();
            Ok(resolve_tracking_nos(prefix_digit, ogms, &by_id))
        }

        async fn by_emails(&self, emails: &[String]) -> anyhow::Result<EmailLookup> {
            let members: Vec<member::Model> = self
                .members
                .iter()
                .filter(|m| emails.iter().any(|email| *email == m.email))
                .cloned()
                .collect();
            let seen: HashSet<&str> = members.iter().map(|m| m.email.as_str()).collect();
            let unseen = emails
                .iter()
                .filter(|email| !seen.contains(email.as_str()))
                .cloned()
                .collect();
            Ok(EmailLookup { members, unseen })
        }

        async fn by_full_names(&self, names: &[String]) -> anyhow::Result<FullNameLookup> {
            let members: Vec<member::Model> = self
                .members
                .iter()
                .filter(|m| names.iter().any(|name| *name == m.name.to_lowercase()))
                .cloned()
                .collect();
            Ok(classify_name_matches(names, members))
        }

        async fn unpaid_debts_for_members(
            &self,
            member_ids: &[i32],
            currency: Currency,
        ) -> anyhow::Result<HashMap<i32, Vec<OutstandingDebt>>> {
            let records: Vec<debt::Model> = self
                .debts
                .iter()
                .filter(|d| member_ids.contains(&d.member_id))
                .cloned()
                .collect();
            let mut annotated =
                with_remote_accounts(records, &self.splits, |s| s.debt_id, currency);
            annotated.retain(|d| !d.paid());
            annotated.sort_by_key(|d| d.timestamp());
            let mut buckets: HashMap<i32, Vec<OutstandingDebt>> = HashMap::new();
            for outstanding in annotated {
                buckets
                    .entry(outstanding.record.member_id)
                    .or_default()
                    .push(outstanding);
            }
            Ok(buckets)
        }

        async fn dupcheck_buckets(
            &self,
            lo: NaiveDate,
            hi: NaiveDate,
        ) -> anyhow::Result<HashMap<DupSignature, u32>> {
            let mut buckets: HashMap<DupSignature, u32> = HashMap::new();
            for record in &self.payments {
                let date = record.timestamp.date_naive();
                if date >= lo && date <= hi {
                    *buckets.entry(payment_signature(record)).or_default() += 1;
                }
            }
            Ok(buckets)
        }

        async fn balances_by_filter_slug(
            &self,
            slugs: Option<&[String]>,
            skip_zeroes: bool,
            currency: Currency,
        ) -> anyhow::Result<HashMap<Option<String>, Money>> {
            let annotated = with_remote_accounts(
                self.debts.clone(),
                &self.splits,
                |s| s.debt_id,
                currency,
            );
            let mut tally: HashMap<Option<String>, Money> = HashMap::new();
            for outstanding in annotated.into_iter().filter(|d| !d.paid()) {
                if let Some(wanted) = slugs {
                    let keep = outstanding
                        .record
                        .filter_slug
                        .as_ref()
                        .map(|slug| wanted.contains(slug))
                        .unwrap_or(false);
                    if !keep {
                        continue;
                    }
                }
                let entry = tally
                    .entry(outstanding.record.filter_slug.clone())
                    .or_insert_with(|| Money::zero(currency));
                *entry += outstanding.balance();
            }
            if skip_zeroes {
                tally.retain(|_, balance| !balance.is_zero());
            }
            Ok(tally)
        }
    }
}
