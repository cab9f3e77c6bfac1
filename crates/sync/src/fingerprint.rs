//! Content fingerprints for change detection.
//!
//! The hashed tuple is `id|callId|beneficiaryId|amount|awardDate` built from
//! parsed values: amounts with two decimals (missing amounts count as zero)
//! and dates as `YYYY-MM-DD`. `100`, `100.0` and `"100.00"` on the wire all
//! produce the same fingerprint.

use std::collections::BTreeMap;

use regsync_core::AwardRecord;
use sha2::{Digest, Sha256};

/// `id -> fingerprint`, ordered by id.
pub type Fingerprints = BTreeMap<String, String>;

pub fn fingerprint(award: &AwardRecord) -> String {
    let amount = format!("{:.2}", award.amount.unwrap_or(0.0));
    let date = award
        .award_date
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_default();
    let parts: [&str; 5] = [
        &award.id,
        award.call_id.as_deref().unwrap_or(""),
        award.beneficiary_id.as_deref().unwrap_or(""),
        &amount,
        &date,
    ];
    let digest = Sha256::digest(parts.join("|").as_bytes());
    format!("{digest:x}")
}

pub fn fingerprints<'a>(awards: impl IntoIterator<Item = &'a AwardRecord>) -> Fingerprints {
    awards
        .into_iter()
        .map(|a| (a.id.clone(), fingerprint(a)))
        .collect()
}
