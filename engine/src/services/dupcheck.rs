//! Signature-based duplicate detection for bulk imports.
//!
//! Banks report at day resolution, so an exact timestamp cannot tell two
//! imports of the same transfer apart. Instead each payment gets a
//! signature of its local date, amount, nature and member; a batch is
//! checked against the historical signature counts in its date range and
//! against itself.

use std::collections::HashMap;

use chrono::NaiveDate;
use rust_decimal::Decimal;

use shared::report::ErrorList;

/// Day-resolution identity of a payment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DupSignature {
    pub date: NaiveDate,
    pub amount: Decimal,
    pub nature: i16,
    pub member_id: i32,
}

/// How a duplicate bucket collided with history.
#[derive(Debug, Clone, Copy)]
pub struct DupCollision {
    pub occ_in_hist: u32,
    pub occ_in_import: u32,
    pub dupcount: u32,
}

/// Drop probable duplicates from a batch.
///
/// Entries are grouped by signature in first-occurrence order. For every
/// signature that also occurs in history, an error is reported at all the
/// bucket's lines via `message`, and the first `min(hist, import)` entries
/// of the bucket (file order) are dropped. Buckets unknown to history pass
/// through unchanged.
pub fn strip_duplicates<T>(
    batch: Vec<T>,
    historical: &HashMap<DupSignature, u32>,
    errors: &mut ErrorList,
    signature: impl Fn(&T) -> DupSignature,
    line_no: impl Fn(&T) -> u32,
    message: impl Fn(&DupSignature, DupCollision) -> String,
) -> Vec<T> {
    let mut bucket_index: HashMap<DupSignature, usize> = HashMap::new();
    let mut buckets: Vec<(DupSignature, Vec<T>)> = Vec::new();
    for entry in batch {
        let sig = signature(&entry);
        match bucket_index.get(&sig) {
            Some(&index) => buckets[index].1.push(entry),
            None => {
                bucket_index.insert(sig.clone(), buckets.len());
                buckets.push((sig, vec![entry]));
            }
        }
    }

    let mut survivors = Vec::new();
    for (sig, entries) in buckets {
        let occ_in_hist = historical.get(&sig).copied().unwrap_or(0);
        if occ_in_hist == 0 {
            survivors.extend(entries);
            continue;
        }
        let occ_in_import = entries.len() as u32;
        let dupcount = occ_in_hist.min(occ_in_import);
        let collision = DupCollision {
            occ_in_hist,
            occ_in_import,
            dupcount,
        };
        errors.error_at_lines(
            entries.iter().map(&line_no).collect(),
            message(&sig, collision),
        );
        // the first dupcount entries are ruled duplicates; the rest are
        // imported as usual
        survivors.extend(entries.into_iter().skip(dupcount as usize));
    }
    survivors
}
