//! Two-phase transaction-party resolution.
//!
//! Phase A walks the parsed rows; each index builder claims the rows whose
//! lookup key it recognises (a row is claimed by at most one builder).
//! Phase B issues one bulk query per builder against the authoritative
//! store and binds the results. Lookup keys that match nothing are
//! reported per line — except structured references, which may simply
//! belong to an unrelated payment and are only logged.

use std::collections::HashMap;

use async_trait::async_trait;

use shared::ogm;
use shared::report::ErrorList;

use crate::entities::member;
use crate::services::csv_import::TransactionInfo;
use crate::services::store::ReconciliationStore;

/// Members resolved during preparation, indexed by the lookup key that
/// claimed them and by id.
#[derive(Debug, Default)]
pub struct ResolvedParties {
    by_key: HashMap<String, member::Model>,
    by_id: HashMap<i32, member::Model>,
}

impl ResolvedParties {
    pub fn insert(&mut self, key: String, record: member::Model) {
        self.by_id.insert(record.id, record.clone());
        self.by_key.insert(key, record);
    }

    /// Look a member up by the row's lookup string; name keys are stored
    /// case-folded, so fall back to the folded form.
    pub fn by_lookup(&self, lookup: &str) -> Option<&member::Model> {
        self.by_key
            .get(lookup)
            .or_else(|| self.by_key.get(&lookup.to_lowercase()))
    }

    pub fn by_id(&self, id: i32) -> Option<&member::Model> {
        self.by_id.get(&id)
    }

    pub fn display_name(&self, id: i32) -> String {
        self.by_id
            .get(&id)
            .map(|m| m.name.clone())
            .unwrap_or_else(|| format!("member #{}", id))
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

/// One lookup-key shape (structured reference, email, full name).
#[async_trait]
pub trait TransactionPartyIndexBuilder: Send {
    /// Claim the row if this builder recognises its lookup key.
    fn append(&mut self, lookup: &str, line_no: u32) -> bool;

    /// Run the bulk query for all claimed keys and bind the results.
    async fn execute_query(
        &mut self,
        store: &dyn ReconciliationStore,
        parties: &mut ResolvedParties,
        errors: &mut ErrorList,
    ) -> anyhow::Result<()>;
}

struct OgmIndexBuilder {
    prefix_digit: u8,
    keys: Vec<String>,
    line_index: HashMap<String, Vec<u32>>,
}

impl OgmIndexBuilder {
    fn new(prefix_digit: u8) -> Self {
        Self {
            prefix_digit,
            keys: Vec::new(),
            line_index: HashMap::new(),
        }
    }
}

#[async_trait]
impl TransactionPartyIndexBuilder for OgmIndexBuilder {
    fn append(&mut self, lookup: &str, line_no: u32) -> bool {
        match ogm::parse(lookup) {
            Ok(parsed) if parsed.prefix_digit() == self.prefix_digit => {
                let key = parsed.canonical();
                if !self.line_index.contains_key(&key) {
                    self.keys.push(key.clone());
                }
                self.line_index.entry(key).or_default().push(line_no);
                true
            }
            Ok(parsed) => {
                // a valid reference of another payment class is not ours
                tracing::debug!(
                    reference = %parsed.canonical(),
                    line_no,
                    "skipping transfer with foreign payment-class prefix"
                );
                false
            }
            Err(_) => false,
        }
    }

    async fn execute_query(
        &mut self,
        store: &dyn ReconciliationStore,
        parties: &mut ResolvedParties,
        _errors: &mut ErrorList,
    ) -> anyhow::Result<()> {
        if self.keys.is_empty() {
            return Ok(());
        }
        let lookup = store
            .by_payment_tracking_nos(self.prefix_digit, &self.keys)
            .await?;
        if !lookup.unseen.is_empty() {
            // A reference that validates but matches no member most likely
            // belongs to a payment we don't track; not worth a user-visible
            // error.
            tracing::info!(
                "OGMs not corresponding to member records: {}",
                lookup.unseen.join(", ")
            );
        }
        for record in lookup.members {
            let key = record.payment_tracking_no(self.prefix_digit);
            parties.insert(key, record);
        }
        Ok(())
    }
}

struct EmailIndexBuilder {
    keys: Vec<String>,
    line_index: HashMap<String, Vec<u32>>,
}

impl EmailIndexBuilder {
    fn new() -> Self {
        Self {
            keys: Vec::new(),
            line_index: HashMap::new(),
        }
    }
}

#[async_trait]
impl TransactionPartyIndexBuilder for EmailIndexBuilder {
    fn append(&mut self, lookup: &str, line_no: u32) -> bool {
        if !lookup.contains('@') {
            return false;
        }
        if !self.line_index.contains_key(lookup) {
            self.keys.push(lookup.to_string());
        }
        self.line_index
            .entry(lookup.to_string())
            .or_default()
            .push(line_no);
        true
    }

    async fn execute_query(
        &mut self,
        store: &dyn ReconciliationStore,
        parties: &mut ResolvedParties,
        errors: &mut ErrorList,
    ) -> anyhow::Result<()> {
        if self.keys.is_empty() {
            return Ok(());
        }
        let lookup = store.by_emails(&self.keys).await?;
        for email in &lookup.unseen {
            let lines = self.line_index.get(email).cloned().unwrap_or_default();
            errors.error_at_lines(
                lines,
                format!("{} does not designate a registered member.", email),
            );
        }
        for record in lookup.members {
            parties.insert(record.email.clone(), record);
        }
        Ok(())
    }
}

struct NameIndexBuilder {
    keys: Vec<String>,
    line_index: HashMap<String, Vec<u32>>,
    display: HashMap<String, String>,
}

impl NameIndexBuilder {
    fn new() -> Self {
        Self {
            keys: Vec::new(),
            line_index: HashMap::new(),
            display: HashMap::new(),
        }
    }
}

#[async_trait]
impl TransactionPartyIndexBuilder for NameIndexBuilder {
    fn append(&mut self, lookup: &str, line_no: u32) -> bool {
        let key = lookup.to_lowercase();
        if !self.line_index.contains_key(&key) {
            self.keys.push(key.clone());
            self.display.insert(key.clone(), lookup.to_string());
        }
        self.line_index.entry(key).or_default().push(line_no);
        true
    }

    async fn execute_query(
        &mut self,
        store: &dyn ReconciliationStore,
        parties: &mut ResolvedParties,
        errors: &mut ErrorList,
    ) -> anyhow::Result<()> {
        if self.keys.is_empty() {
            return Ok(());
        }
        let lookup = store.by_full_names(&self.keys).await?;
        for name in &lookup.unseen {
            let lines = self.line_index.get(name).cloned().unwrap_or_default();
            let shown = self.display.get(name).unwrap_or(name);
            errors.error_at_lines(
                lines,
                format!("{} does not designate a registered member.", shown),
            );
        }
        for name in &lookup.duplicates {
            let lines = self.line_index.get(name).cloned().unwrap_or_default();
            let shown = self.display.get(name).unwrap_or(name);
            errors.error_at_lines(
                lines,
                format!(
                    "{} designates multiple registered members. Skipped processing.",
                    shown
                ),
            );
        }
        for record in lookup.members {
            let folded = record.name.to_lowercase();
            if lookup.duplicates.contains(&folded) {
                continue;
            }
            parties.insert(folded, record);
        }
        Ok(())
    }
}

/// Drives the index builders over a batch.
pub struct PartyResolver {
    builders: Vec<Box<dyn TransactionPartyIndexBuilder>>,
}

impl PartyResolver {
    /// Resolver for bank-transfer batches: structured references only.
    pub fn for_transfers(prefix_digit: u8) -> Self {
        Self {
            builders: vec![Box::new(OgmIndexBuilder::new(prefix_digit))],
        }
    }

    /// Resolver for member-keyed batches: emails, then full names.
    pub fn for_member_lookup() -> Self {
        Self {
            builders: vec![
                Box::new(EmailIndexBuilder::new()),
                Box::new(NameIndexBuilder::new()),
            ],
        }
    }

    /// Phase A: every row is offered to the builders in order until one
    /// claims it.
    pub fn append_all(&mut self, transactions: &[TransactionInfo]) {
        for info in transactions {
            let claimed = self
                .builders
                .iter_mut()
                .any(|builder| builder.append(&info.account_lookup_str, info.line_no));
            if !claimed {
                tracing::debug!(
                    line_no = info.line_no,
                    lookup = %info.account_lookup_str,
                    "row not claimed by any party index"
                );
            }
        }
    }

    /// Phase B: one bulk query per builder.
    pub async fn execute(
        &mut self,
        store: &dyn ReconciliationStore,
        errors: &mut ErrorList,
    ) -> anyhow::Result<ResolvedParties> {
        let mut parties = ResolvedParties::default();
        for builder in &mut self.builders {
            builder.execute_query(store, &mut parties, errors).await?;
        }
        Ok(parties)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    use shared::money::{Currency, Money};
    use shared::nature::PaymentNature;

    use crate::services::store::testing::MemStore;

    fn member(id: i32, name: &str, email: &str) -> member::Model {
        member::Model {
            id,
            name: name.to_string(),
            email: email.to_string(),
            is_active: true,
            created_at: Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    fn info(line_no: u32, lookup: &str) -> TransactionInfo {
        TransactionInfo {
            line_no,
            amount: Money::new(dec!(10), Currency::from_code("EUR").unwrap()),
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap(),
            account_lookup_str: lookup.to_string(),
            nature: PaymentNature::Transfer,
        }
    }

    #[tokio::test]
    async fn transfer_resolver_binds_by_reference() {
        let alice = member(7, "Alice", "alice@example.com");
        let store = MemStore {
            members: vec![alice.clone()],
            ..MemStore::default()
        };
        let tracking_no = alice.payment_tracking_no(1);
        let rows = vec![
            info(2, &tracking_no),
            info(3, &shared::ogm::encode(1, 999)), // unknown member, advisory only
            info(4, &shared::ogm::encode(2, 7)),   // foreign prefix, unclaimed
        ];
        let mut resolver = PartyResolver::for_transfers(1);
        resolver.append_all(&rows);
        let mut errors = ErrorList::new();
        let parties = resolver.execute(&store, &mut errors).await.unwrap();

        assert!(errors.is_empty());
        assert_eq!(parties.by_lookup(&tracking_no).unwrap().id, 7);
        assert!(parties.by_lookup(&shared::ogm::encode(1, 999)).is_none());
        assert!(parties.by_lookup(&shared::ogm::encode(2, 7)).is_none());
    }

    #[tokio::test]
    async fn member_resolver_reports_unknown_and_ambiguous_keys() {
        let store = MemStore {
            members: vec![
                member(1, "John Doe", "john@example.com"),
                member(2, "John Doe", "john.b@example.com"),
                member(3, "Jane Roe", "jane@example.com"),
            ],
            ..MemStore::default()
        };
        let rows = vec![
            info(2, "jane@example.com"),
            info(3, "ghost@example.com"),
            info(4, "John Doe"),
            info(5, "JOHN DOE"),
            info(6, "Missing Person"),
        ];
        let mut resolver = PartyResolver::for_member_lookup();
        resolver.append_all(&rows);
        let mut errors = ErrorList::new();
        let parties = resolver.execute(&store, &mut errors).await.unwrap();

        assert_eq!(parties.by_lookup("jane@example.com").unwrap().id, 3);
        // case-folded name lookups share one key
        assert!(parties.by_lookup("John Doe").is_none());

        let messages: Vec<_> = errors
            .entries()
            .iter()
            .map(|e| (e.lines.clone(), e.message.clone()))
            .collect();
        assert!(messages.contains(&(
            vec![3],
            "ghost@example.com does not designate a registered member.".to_string()
        )));
        assert!(messages.contains(&(
            vec![4, 5],
            "John Doe designates multiple registered members. Skipped processing.".to_string()
        )));
        assert!(messages.contains(&(
            vec![6],
            "Missing Person does not designate a registered member.".to_string()
        )));
    }

    #[tokio::test]
    async fn resolved_names_are_found_via_folded_lookup() {
        let store = MemStore {
            members: vec![member(3, "Jane Roe", "jane@example.com")],
            ..MemStore::default()
        };
        let rows = vec![info(2, "jane roe")];
        let mut resolver = PartyResolver::for_member_lookup();
        resolver.append_all(&rows);
        let mut errors = ErrorList::new();
        let parties = resolver.execute(&store, &mut errors).await.unwrap();
        assert!(errors.is_empty());
        assert_eq!(parties.by_lookup("jane roe").unwrap().id, 3);
        assert_eq!(parties.by_lookup("Jane Roe").unwrap().id, 3);
    }
}
