pub mod debt;
pub mod import_batch;
pub mod member;
pub mod payment;
pub mod split;

// Re-export for easier access
pub use debt::{ActiveModel as DebtActiveModel, Entity as Debt, Model as DebtModel};
pub use import_batch::{
    ActiveModel as ImportBatchActiveModel, Entity as ImportBatch, ImportBatchStatus,
    Model as ImportBatchModel,
};
pub use member::{ActiveModel as MemberActiveModel, Entity as Member, Model as MemberModel};
pub use payment::{ActiveModel as PaymentActiveModel, Entity as Payment, Model as PaymentModel};
pub use split::{ActiveModel as SplitActiveModel, Entity as Split, Model as SplitModel};
