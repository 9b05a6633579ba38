//! Batch import orchestration: decode, parse, prepare, persist.
//!
//! Persistence is all-or-nothing: payments, splits and the batch record
//! are written inside one database transaction, so a storage failure
//! leaves no trace of the batch.

use std::collections::HashMap;

use anyhow::{anyhow, Result};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, DatabaseConnection, DatabaseTransaction, EntityTrait, Set, TransactionTrait,
};
use uuid::Uuid;

use shared::report::BatchReport;

use crate::config::ImportConfig;
use crate::entities::{import_batch, payment, split, ImportBatchStatus};
use crate::services::csv_import::{decode_to_string, BankCsvParser, MemberCsvParser};
use crate::services::preparator::{MemberPaymentPipeline, PreparedImport, TransferImportPipeline};
use crate::services::store::SeaStore;

pub struct BankImportService;

#[derive(Debug, Clone)]
pub struct ImportSummary {
    pub batch: import_batch::Model,
    pub payments_created: usize,
    pub splits_created: usize,
    pub total_credit: Decimal,
    pub total_applied: Decimal,
    pub report: BatchReport,
}

impl BankImportService {
    /// Import a bank statement export: rows are routed by structured
    /// reference, deduplicated against history, and apportioned.
    pub async fn import_statement(
        db: &DatabaseConnection,
        config: &ImportConfig,
        file_name: &str,
        file_content: &[u8],
    ) -> Result<ImportSummary> {
        let content = decode_to_string(file_content);
        let parser = BankCsvParser::new(config)?;
        let output = parser.parse(&content);
        let row_count = output.transactions.len();

        let store = SeaStore::new(db);
        let pipeline = TransferImportPipeline::new(&store, config);
        let mut prepared = pipeline.run(output.transactions).await?;
        prepared.errors.absorb_older(output.errors);

        Self::commit(db, file_name, &prepared, row_count).await
    }

    /// Import a member-keyed payment export (email or full-name lookup).
    pub async fn import_member_payments(
        db: &DatabaseConnection,
        config: &ImportConfig,
        file_name: &str,
        file_content: &[u8],
    ) -> Result<ImportSummary> {
        let content = decode_to_string(file_content);
        let parser = MemberCsvParser::new(config)?;
        let output = parser.parse(&content);
        let row_count = output.transactions.len();

        let store = SeaStore::new(db);
        let pipeline = MemberPaymentPipeline::new(&store, config);
        let mut prepared = pipeline.run(output.transactions).await?;
        prepared.errors.absorb_older(output.errors);

        Self::commit(db, file_name, &prepared, row_count).await
    }

    async fn commit(
        db: &DatabaseConnection,
        file_name: &str,
        prepared: &PreparedImport,
        row_count: usize,
    ) -> Result<ImportSummary> {
        let txn = db.begin().await?;
        let summary = Self::persist_batch(&txn, file_name, prepared, row_count).await?;
        txn.commit().await?;

        tracing::info!(
            file_name,
            payments = summary.payments_created,
            splits = summary.splits_created,
            errors = summary.report.errors.len(),
            "batch import committed"
        );
        Ok(summary)
    }

    async fn persist_batch(
        txn: &DatabaseTransaction,
        file_name: &str,
        prepared: &PreparedImport,
        row_count: usize,
    ) -> Result<ImportSummary> {
        let now = Utc::now();

        let mut payment_ids_by_line: HashMap<u32, i32> = HashMap::new();
        let mut total_credit = Decimal::ZERO;
        for entry in &prepared.entries {
            let inserted = payment::Entity::insert(entry.draft.active_model(now))
                .exec_with_returning(txn)
                .await?;
            payment_ids_by_line.insert(entry.line_no, inserted.id);
            total_credit += inserted.total_amount;
        }

        let mut split_models = Vec::with_capacity(prepared.splits.len());
        let mut total_applied = Decimal::ZERO;
        for proposed in &prepared.splits {
            let payment_id = payment_ids_by_line
                .get(&proposed.payment_line)
                .copied()
                .ok_or_else(|| {
                    anyhow!(
                        "split references line {} with no persisted payment",
                        proposed.payment_line
                    )
                })?;
            total_applied += proposed.amount.amount();
            split_models.push(split::ActiveModel {
                payment_id: Set(payment_id),
                debt_id: Set(proposed.debt_id),
                amount: Set(proposed.amount.amount()),
                ..Default::default()
            });
        }
        let splits_created = split_models.len();
        if !split_models.is_empty() {
            split::Entity::insert_many(split_models).exec(txn).await?;
        }

        let status = if prepared.errors.is_empty() {
            ImportBatchStatus::Completed
        } else {
            ImportBatchStatus::CompletedWithErrors
        };
        let batch = import_batch::ActiveModel {
            batch_uuid: Set(Uuid::new_v4()),
            file_name: Set(file_name.to_string()),
            imported_at: Set(now),
            transactions_count: Set(row_count as i32),
            created_payments: Set(prepared.entries.len() as i32),
            created_splits: Set(splits_created as i32),
            total_credit: Set(total_credit),
            total_applied: Set(total_applied),
            error_count: Set(prepared.errors.len() as i32),
            status: Set(status.as_str().to_string()),
            ..Default::default()
        }
        .insert(txn)
        .await?;

        Ok(ImportSummary {
            batch,
            payments_created: prepared.entries.len(),
            splits_created,
            total_credit,
            total_applied,
            report: prepared.errors.clone().into_report(),
        })
    }
}
