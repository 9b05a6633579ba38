use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Bookkeeping record written once per committed batch import.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "import_batches")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub batch_uuid: Uuid,
    pub file_name: String,
    pub imported_at: DateTimeUtc,
    pub transactions_count: i32,
    pub created_payments: i32,
    pub created_splits: i32,
    pub total_credit: Decimal,
    pub total_applied: Decimal,
    pub error_count: i32,
    pub status: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub enum ImportBatchStatus {
    Completed,
    CompletedWithErrors,
}

impl ImportBatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportBatchStatus::Completed => "completed",
            ImportBatchStatus::CompletedWithErrors => "completed_with_errors",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "completed" => Some(Self::Completed),
            "completed_with_errors" => Some(Self::CompletedWithErrors),
            _ => None,
        }
    }
}

impl ActiveModelBehavior for ActiveModel {}
