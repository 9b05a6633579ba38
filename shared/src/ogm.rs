//! Structured payment reference (OGM) codec.
//!
//! An OGM is twelve decimal digits: one prefix digit tagging the payment
//! class, a nine-digit record identifier, and two check digits computed as
//! the leading ten digits modulo 97, with a remainder of zero rendered
//! as 97. The canonical wire form is the bare digit string; the
//! human-readable form groups the digits as `+++NNN/NNNN/NNNNN+++` and is
//! accepted on input as well.

use std::fmt;

use thiserror::Error;

const BODY_DIGITS: u32 = 10;
const RECORD_MODULUS: u64 = 1_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum OgmError {
    #[error("structured reference contains non-numeric characters")]
    NonNumeric,

    #[error("structured reference must be twelve digits, got {0}")]
    WrongLength(usize),

    #[error("structured reference check digits do not match")]
    BadChecksum,
}

/// A syntactically valid structured reference.
///
/// `prefix` is the ten-digit body (prefix digit plus record id); `modulus`
/// the verified two-digit checksum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParsedOgm {
    prefix: u64,
    modulus: u8,
}

impl ParsedOgm {
    pub fn prefix(&self) -> u64 {
        self.prefix
    }

    pub fn modulus(&self) -> u8 {
        self.modulus
    }

    /// The leading digit, tagging the payment class.
    pub fn prefix_digit(&self) -> u8 {
        (self.prefix / RECORD_MODULUS) as u8
    }

    /// The nine-digit application-assigned record identifier.
    pub fn record_id(&self) -> u32 {
        (self.prefix % RECORD_MODULUS) as u32
    }

    /// Canonical zero-padded twelve-digit rendering.
    pub fn canonical(&self) -> String {
        format!("{:010}{:02}", self.prefix, self.modulus)
    }

    /// Human-readable `+++NNN/NNNN/NNNNN+++` rendering.
    pub fn display_form(&self) -> String {
        let digits = self.canonical();
        format!("+++{}/{}/{}+++", &digits[..3], &digits[3..7], &digits[7..])
    }
}

impl fmt::Display for ParsedOgm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

fn checksum(body: u64) -> u8 {
    match (body % 97) as u8 {
        0 => 97,
        rem => rem,
    }
}

/// Build the canonical reference for a record of the given payment class.
///
/// `record_id` must fit in nine digits.
pub fn encode(prefix_digit: u8, record_id: u32) -> String {
    debug_assert!(prefix_digit <= 9);
    debug_assert!((record_id as u64) < RECORD_MODULUS);
    let body = prefix_digit as u64 * RECORD_MODULUS + record_id as u64;
    format!("{:010}{:02}", body, checksum(body))
}

/// Parse a structured reference in canonical or display form.
///
/// Whitespace and the `+`/`/` display separators are ignored wherever they
/// appear; everything else must be exactly twelve decimal digits with a
/// valid checksum.
pub fn parse(text: &str) -> Result<ParsedOgm, OgmError> {
    let mut digits = String::with_capacity(BODY_DIGITS as usize + 2);
    for c in text.chars() {
        match c {
            '+' | '/' => continue,
            c if c.is_whitespace() => continue,
            c if c.is_ascii_digit() => digits.push(c),
            _ => return Err(OgmError::NonNumeric),
        }
    }
    if digits.len() != BODY_DIGITS as usize + 2 {
        return Err(OgmError::WrongLength(digits.len()));
    }
    // the length and digit checks make these parses infallible
    let body: u64 = digits[..BODY_DIGITS as usize]
        .parse()
        .map_err(|_| OgmError::NonNumeric)?;
    let check: u8 = digits[BODY_DIGITS as usize..]
        .parse()
        .map_err(|_| OgmError::NonNumeric)?;
    if check != checksum(body) {
        return Err(OgmError::BadChecksum);
    }
    Ok(ParsedOgm {
        prefix: body,
        modulus: check,
    })
}

/// The payment-class digit of a reference, without full validation of the
/// record id.
pub fn prefix_digit_of(text: &str) -> Result<u8, OgmError> {
    parse(text).map(|ogm| ogm.prefix_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_pads_and_checksums() {
        let ogm = encode(2, 123_456);
        assert_eq!(ogm.len(), 12);
        assert!(ogm.starts_with("2000123456"));
        let parsed = parse(&ogm).unwrap();
        assert_eq!(parsed.prefix(), 2_000_123_456);
        assert_eq!(parsed.prefix_digit(), 2);
        assert_eq!(parsed.record_id(), 123_456);
        assert_eq!(parsed.canonical(), ogm);
    }

    #[test]
    fn round_trip_over_prefixes_and_ids() {
        for prefix in 1..=9u8 {
            for id in [0u32, 1, 97, 4242, 999_999_999] {
                let ogm = encode(prefix, id);
                let parsed = parse(&ogm).unwrap();
                assert_eq!(parsed.prefix_digit(), prefix);
                assert_eq!(parsed.record_id(), id);
            }
        }
    }

    #[test]
    fn zero_remainder_renders_as_97() {
        // 1000000063 % 97 == 0
        let body = 1_000_000_063u64;
        assert_eq!(body % 97, 0);
        let ogm = encode(1, 63);
        assert!(ogm.ends_with("97"));
        assert!(parse(&ogm).is_ok());
        // the naive zero rendering must not verify
        let zeroed = format!("{:010}00", body);
        assert_eq!(parse(&zeroed), Err(OgmError::BadChecksum));
    }

    #[test]
    fn display_form_round_trips() {
        let parsed = parse(&encode(2, 123_456)).unwrap();
        let display = parsed.display_form();
        assert!(display.starts_with("+++200/0123/456"));
        assert!(display.ends_with("+++"));
        assert_eq!(parse(&display).unwrap(), parsed);
    }

    #[test]
    fn separators_are_ignored_wherever_they_appear() {
        let parsed = parse(&encode(2, 123_456)).unwrap();
        let digits = parsed.canonical();
        let scrambled = format!("+++{}/{}/{}+++", &digits[..4], &digits[4..7], &digits[7..]);
        assert_eq!(parse(&scrambled).unwrap(), parsed);
        assert_eq!(parse(&format!("  {}  ", digits)).unwrap(), parsed);
    }

    #[test]
    fn error_kinds() {
        assert_eq!(parse("12345678901x"), Err(OgmError::NonNumeric));
        assert_eq!(parse("123456"), Err(OgmError::WrongLength(6)));
        assert_eq!(parse("1234567890123"), Err(OgmError::WrongLength(13)));
        let mut ogm = encode(3, 777).into_bytes();
        ogm[11] = if ogm[11] == b'9' { b'0' } else { ogm[11] + 1 };
        assert_eq!(
            parse(std::str::from_utf8(&ogm).unwrap()),
            Err(OgmError::BadChecksum)
        );
    }

    #[test]
    fn any_single_digit_mutation_is_detected() {
        // 97 is prime and the per-digit deltas are below it, so no single
        // digit change can be absorbed by the modulus.
        let ogm = encode(5, 987_654_321);
        for pos in 0..ogm.len() {
            for digit in b'0'..=b'9' {
                let mut mutated = ogm.clone().into_bytes();
                if mutated[pos] == digit {
                    continue;
                }
                mutated[pos] = digit;
                let mutated = String::from_utf8(mutated).unwrap();
                assert!(
                    parse(&mutated).is_err(),
                    "mutation {} at {} slipped through",
                    mutated,
                    pos
                );
            }
        }
    }

    #[test]
    fn prefix_digit_shortcut() {
        assert_eq!(prefix_digit_of(&encode(7, 1)).unwrap(), 7);
        assert!(prefix_digit_of("garbage").is_err());
    }
}
