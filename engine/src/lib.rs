//! kasboek engine: bulk import and reconciliation of member payments.
//!
//! The pipeline ingests bank-transfer CSV exports, resolves the paying
//! member from the structured reference (OGM) or from a lookup string,
//! filters duplicates against the payment history, and apportions the
//! incoming credit over the member's outstanding debts as explicit
//! payment splits. Everything is accumulated per batch and persisted
//! atomically; HTTP surfaces and exports live elsewhere.

pub mod config;
pub mod db;
pub mod entities;
pub mod services;
