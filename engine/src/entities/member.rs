use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use shared::ogm;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "members")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub name: String,
    #[sea_orm(unique)]
    pub email: String,
    pub is_active: bool,
    pub created_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::debt::Entity")]
    Debts,
    #[sea_orm(has_many = "super::payment::Entity")]
    Payments,
}

impl Related<super::debt::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Debts.def()
    }
}

impl Related<super::payment::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Payments.def()
    }
}

impl Model {
    /// Canonical structured reference routing transfers of the given
    /// payment class to this member. Derived, never stored; unique per
    /// member because the record id is the primary key.
    pub fn payment_tracking_no(&self, prefix_digit: u8) -> String {
        ogm::encode(prefix_digit, self.id as u32)
    }
}

impl ActiveModelBehavior for ActiveModel {}
