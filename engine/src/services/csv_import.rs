//! CSV ingestion of payment feeds.
//!
//! Two flavours share one row pipeline: member-keyed exports (a lookup
//! column holding an email address or full name) and bank statements
//! (a free-text details column carrying the structured reference).
//! Rows that fail validation are reported per line and dropped; a missing
//! required column aborts the whole batch with a single error at line 0.

use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use rust_decimal::Decimal;
use thiserror::Error;

use shared::money::{Currency, Money};
use shared::nature::PaymentNature;
use shared::ogm;
use shared::report::ErrorList;

use crate::config::ImportConfig;

/// Matches the grouped display form or the bare twelve-digit form.
const OGM_SEARCH_PATTERN: &str = r"\+{3}\d{3}/\d{4}/\d{5}\+{3}|\b\d{12}\b";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RowError {
    #[error("Invalid amount {0}")]
    InvalidAmount(String),

    #[error("Payment amount {0} is negative.")]
    NegativeAmount(String),

    #[error("Invalid date {0}, please use dd/mm/YYYY.")]
    InvalidDate(String),

    #[error("Illegal OGM string {0}.")]
    IllegalOgm(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Missing column: {0}. No data processed.")]
pub struct MissingColumn(pub String);

/// A parsed row awaiting preparation.
#[derive(Debug, Clone)]
pub struct TransactionInfo {
    /// 1-based source line, counting the header row.
    pub line_no: u32,
    pub amount: Money,
    pub timestamp: DateTime<Utc>,
    /// Key handed to the party resolver: the lookup column verbatim, or
    /// the canonical structured reference for bank rows.
    pub account_lookup_str: String,
    pub nature: PaymentNature,
}

#[derive(Debug)]
pub struct CsvParseOutput {
    pub transactions: Vec<TransactionInfo>,
    pub errors: ErrorList,
}

/// Decode an uploaded file. Bank exports are usually UTF-8 these days but
/// older tooling still produces WINDOWS-1252.
pub fn decode_to_string(content: &[u8]) -> String {
    if let Ok(text) = std::str::from_utf8(content) {
        text.trim_start_matches('\u{feff}').replace('\r', "")
    } else {
        let (cow, _, _) = encoding_rs::WINDOWS_1252.decode(content);
        cow.into_owned().replace('\r', "")
    }
}

fn find_column(headers: &csv::StringRecord, name: &str) -> Option<usize> {
    headers.iter().position(|h| h.trim() == name)
}

fn parse_amount(
    raw: &str,
    currency: Currency,
    line_no: u32,
    errors: &mut ErrorList,
) -> Option<Money> {
    let normalized = raw.trim().replace(',', ".");
    match Decimal::from_str(&normalized) {
        Ok(value) => {
            let amount = Money::new(value, currency);
            if amount.is_negative() {
                errors.error_at_line(line_no, RowError::NegativeAmount(normalized).to_string());
                None
            } else {
                Some(amount)
            }
        }
        Err(_) => {
            errors.error_at_line(line_no, RowError::InvalidAmount(normalized).to_string());
            None
        }
    }
}

fn parse_timestamp(
    raw: Option<&str>,
    line_no: u32,
    errors: &mut ErrorList,
) -> Option<DateTime<Utc>> {
    let raw = match raw.map(str::trim).filter(|s| !s.is_empty()) {
        Some(raw) => raw,
        // date column absent or empty: fall back to the processing time
        None => return Some(Utc::now()),
    };
    match NaiveDate::parse_from_str(raw, "%d/%m/%Y") {
        Ok(date) => Some(start_of_day(date)),
        Err(_) => {
            errors.error_at_line(line_no, RowError::InvalidDate(raw.to_string()).to_string());
            None
        }
    }
}

fn start_of_day(date: NaiveDate) -> DateTime<Utc> {
    date.and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc())
        .unwrap_or_else(Utc::now)
}

fn run_parser(
    config: &ImportConfig,
    currency: Currency,
    content: &str,
    lookup_column: &str,
    mut extract: impl FnMut(u32, &str, &mut ErrorList) -> Option<(String, PaymentNature)>,
) -> CsvParseOutput {
    let mut errors = ErrorList::new();
    let mut transactions = Vec::new();

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(config.delimiter as u8)
        .flexible(true)
        .from_reader(content.as_bytes());

    let headers = match reader.headers() {
        Ok(headers) => headers.clone(),
        Err(err) => {
            errors.error_at_line(0, format!("Unreadable input: {}. No data processed.", err));
            return CsvParseOutput {
                transactions,
                errors,
            };
        }
    };

    let amount_idx = match find_column(&headers, &config.amount_column_name) {
        Some(idx) => idx,
        None => {
            errors.error_at_line(0, MissingColumn(config.amount_column_name.clone()).to_string());
            return CsvParseOutput {
                transactions,
                errors,
            };
        }
    };
    let lookup_idx = match find_column(&headers, lookup_column) {
        Some(idx) => idx,
        None => {
            errors.error_at_line(0, MissingColumn(lookup_column.to_string()).to_string());
            return CsvParseOutput {
                transactions,
                errors,
            };
        }
    };
    // the date column is optional; rows without one get the current time
    let date_idx = find_column(&headers, &config.date_column_name);

    for (index, record) in reader.records().enumerate() {
        // +1 to offset zero-indexing, and +1 to skip the header
        let line_no = index as u32 + 2;
        let record = match record {
            Ok(record) => record,
            Err(err) => {
                errors.error_at_line(line_no, format!("Unreadable row: {}", err));
                continue;
            }
        };

        let amount = parse_amount(
            record.get(amount_idx).unwrap_or(""),
            currency,
            line_no,
            &mut errors,
        );
        let timestamp = parse_timestamp(
            date_idx.and_then(|idx| record.get(idx)),
            line_no,
            &mut errors,
        );
        let (amount, timestamp) = match (amount, timestamp) {
            (Some(amount), Some(timestamp)) => (amount, timestamp),
            _ => continue,
        };

        let raw_lookup = record.get(lookup_idx).unwrap_or("").trim();
        let Some((account_lookup_str, nature)) = extract(line_no, raw_lookup, &mut errors) else {
            continue;
        };

        transactions.push(TransactionInfo {
            line_no,
            amount,
            timestamp,
            account_lookup_str,
            nature,
        });
    }

    CsvParseOutput {
        transactions,
        errors,
    }
}

/// Parser for member-keyed payment exports; the lookup column carries an
/// email address or a full name.
pub struct MemberCsvParser<'a> {
    config: &'a ImportConfig,
    currency: Currency,
}

impl<'a> MemberCsvParser<'a> {
    pub fn new(config: &'a ImportConfig) -> anyhow::Result<Self> {
        Ok(Self {
            config,
            currency: config.currency()?,
        })
    }

    pub fn parse(&self, content: &str) -> CsvParseOutput {
        run_parser(
            self.config,
            self.currency,
            content,
            &self.config.member_column_name,
            |_, lookup, _| Some((lookup.to_string(), PaymentNature::Cash)),
        )
    }
}

/// Parser for bank statement exports; the structured reference is fished
/// out of the free-text details column.
pub struct BankCsvParser<'a> {
    config: &'a ImportConfig,
    currency: Currency,
    ogm_pattern: Regex,
}

impl<'a> BankCsvParser<'a> {
    pub fn new(config: &'a ImportConfig) -> anyhow::Result<Self> {
        Ok(Self {
            config,
            currency: config.currency()?,
            ogm_pattern: Regex::new(OGM_SEARCH_PATTERN).unwrap(),
        })
    }

    pub fn parse(&self, content: &str) -> CsvParseOutput {
        run_parser(
            self.config,
            self.currency,
            content,
            &self.config.details_column_name,
            |line_no, details, errors| {
                // rows without any reference are not ours; skip silently
                let hit = self.ogm_pattern.find(details)?;
                match ogm::parse(hit.as_str()) {
                    Ok(parsed) => Some((parsed.canonical(), PaymentNature::Transfer)),
                    Err(_) => {
                        errors.error_at_line(
                            line_no,
                            RowError::IllegalOgm(hit.as_str().to_string()).to_string(),
                        );
                        None
                    }
                }
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn config() -> ImportConfig {
        ImportConfig::default()
    }

    fn member_csv(rows: &str) -> String {
        format!("Bedrag;Uitvoeringsdatum;Lid\n{}", rows)
    }

    #[test]
    fn parses_rows_with_one_based_line_numbers() {
        let cfg = config();
        let parser = MemberCsvParser::new(&cfg).unwrap();
        let output = parser.parse(&member_csv(
            "25,50;01/03/2024;alice@example.com\n10.00;02/03/2024;Bob Smith",
        ));
        assert!(output.errors.is_empty());
        assert_eq!(output.transactions.len(), 2);
        assert_eq!(output.transactions[0].line_no, 2);
        assert_eq!(output.transactions[0].amount.amount(), dec!(25.50));
        assert_eq!(
            output.transactions[0].account_lookup_str,
            "alice@example.com"
        );
        assert_eq!(output.transactions[1].line_no, 3);
        assert_eq!(output.transactions[1].account_lookup_str, "Bob Smith");
        assert_eq!(
            output.transactions[1].timestamp,
            start_of_day(NaiveDate::from_ymd_opt(2024, 3, 2).unwrap())
        );
    }

    #[test]
    fn missing_amount_column_aborts_with_line_zero_error() {
        let cfg = config();
        let parser = MemberCsvParser::new(&cfg).unwrap();
        let output = parser.parse("Datum;Lid\n01/03/2024;alice@example.com");
        assert!(output.transactions.is_empty());
        assert_eq!(output.errors.len(), 1);
        assert_eq!(output.errors.entries()[0].lines, vec![0]);
        assert_eq!(
            output.errors.entries()[0].message,
            "Missing column: Bedrag. No data processed."
        );
    }

    #[test]
    fn bad_rows_are_reported_and_dropped() {
        let cfg = config();
        let parser = MemberCsvParser::new(&cfg).unwrap();
        let output = parser.parse(&member_csv(
            "abc;01/03/2024;alice@example.com\n-5;01/03/2024;alice@example.com\n10;2024-03-01;alice@example.com\n10;01/03/2024;alice@example.com",
        ));
        assert_eq!(output.transactions.len(), 1);
        assert_eq!(output.transactions[0].line_no, 5);
        let messages: Vec<_> = output
            .errors
            .entries()
            .iter()
            .map(|e| e.message.as_str())
            .collect();
        // most recently reported first
        assert_eq!(
            messages,
            vec![
                "Invalid date 2024-03-01, please use dd/mm/YYYY.",
                "Payment amount -5 is negative.",
                "Invalid amount abc",
            ]
        );
    }

    #[test]
    fn missing_date_defaults_to_now() {
        let cfg = config();
        let parser = MemberCsvParser::new(&cfg).unwrap();
        let before = Utc::now();
        let output = parser.parse("Bedrag;Lid\n10;alice@example.com");
        assert_eq!(output.transactions.len(), 1);
        assert!(output.transactions[0].timestamp >= before);
    }

    #[test]
    fn bank_rows_extract_canonical_ogm() {
        let cfg = config();
        let parser = BankCsvParser::new(&cfg).unwrap();
        let reference = ogm::parse(&ogm::encode(1, 42)).unwrap();
        let content = format!(
            "Bedrag;Uitvoeringsdatum;Details\n30;01/03/2024;Overschrijving {}  mededeling",
            reference.display_form()
        );
        let output = parser.parse(&content);
        assert!(output.errors.is_empty());
        assert_eq!(output.transactions.len(), 1);
        assert_eq!(
            output.transactions[0].account_lookup_str,
            reference.canonical()
        );
        assert_eq!(output.transactions[0].nature, PaymentNature::Transfer);
    }

    #[test]
    fn bank_rows_without_reference_are_skipped_silently() {
        let cfg = config();
        let parser = BankCsvParser::new(&cfg).unwrap();
        let output = parser.parse("Bedrag;Uitvoeringsdatum;Details\n30;01/03/2024;Gift, no ref");
        assert!(output.transactions.is_empty());
        assert!(output.errors.is_empty());
    }

    #[test]
    fn corrupted_reference_is_a_row_error() {
        let cfg = config();
        let parser = BankCsvParser::new(&cfg).unwrap();
        let mut digits = ogm::encode(1, 42);
        // break the checksum
        let last = digits.pop().unwrap();
        digits.push(if last == '0' { '1' } else { '0' });
        let content = format!("Bedrag;Uitvoeringsdatum;Details\n30;01/03/2024;ref {}", digits);
        let output = parser.parse(&content);
        assert!(output.transactions.is_empty());
        assert_eq!(output.errors.len(), 1);
        assert!(output.errors.entries()[0]
            .message
            .starts_with("Illegal OGM string"));
    }

    #[test]
    fn windows_1252_content_is_decoded() {
        let bytes = b"Bedrag;Lid\n10;Ren\xe9 Magritte";
        let content = decode_to_string(bytes);
        assert!(content.contains("René Magritte"));
    }
}
