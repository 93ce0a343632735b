//! Line classifier / cleaner (spec.md §4.1).
//!
//! Strips printer escape sequences, splits mashed header+cashier packets, and
//! tags a cleaned line with one of a closed set of line kinds. Pure and
//! thread-safe: no interior mutability, safe to call concurrently from any
//! task without synchronization.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::model::{Amount, ClassifiedLine, LineType};

// ---------------------------------------------------------------------------
// Cleaning
// ---------------------------------------------------------------------------

const ESC: u8 = 0x1B;

/// Apply the cleaning rules of spec.md §4.1 in order: strip `ESC c0` / `ESC !
/// NUL`, strip CSI sequences, strip any remaining two-byte ESC sequence, drop
/// non-printable bytes (keeping CR/LF), then drop a surviving leading `c0`.
pub fn clean(raw: &[u8]) -> String {
    let mut buf = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        let b = raw[i];
        if b != ESC {
            buf.push(b);
            i += 1;
            continue;
        }

        // ESC c0
        if raw.get(i + 1) == Some(&b'c') && raw.get(i + 2) == Some(&0x30) {
            i += 3;
            continue;
        }
        // ESC ! NUL
        if raw.get(i + 1) == Some(&b'!') && raw.get(i + 2) == Some(&0x00) {
            i += 3;
            continue;
        }
        // CSI: ESC [ params* intermediate/final
        if raw.get(i + 1) == Some(&b'[') {
            let mut j = i + 2;
            while let Some(&c) = raw.get(j) {
                if matches!(c, 0x30..=0x39 | b';' | b'?') {
                    j += 1;
                    continue;
                }
                break;
            }
            if let Some(&c) = raw.get(j) {
                if matches!(c, 0x20..=0x2F | 0x40..=0x7E) {
                    i = j + 1;
                    continue;
                }
            }
            // Malformed CSI — fall through to generic two-byte strip below.
        }
        // Any remaining two-byte ESC-introduced sequence.
        if raw.get(i + 1).is_some() {
            i += 2;
            continue;
        }
        // Trailing lone ESC with nothing after it.
        i += 1;
    }

    let mut text: Vec<u8> = buf
        .into_iter()
        .filter(|&b| matches!(b, 0x20..=0x7E | b'\r' | b'\n'))
        .collect();

    // Defensive: drop a leading literal "c0" that survived step 1 at line start.
    if text.starts_with(b"c0") {
        text.drain(0..2);
    }

    String::from_utf8_lossy(&text).into_owned()
}

// ---------------------------------------------------------------------------
// Mashed-packet split
// ---------------------------------------------------------------------------

static TIMESTAMP_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\d{2}/\d{2}/\d{2} \d{2}:\d{2}:\d{2} \d{3}").unwrap());

/// Split a physical read that concatenates the end-of-receipt header with the
/// immediately following cashier line (spec.md §4.1 "Mashed-packet split").
///
/// Given a cleaned line `s`: if it contains both ` ST#` and ` CSH:`, split at
/// the timestamp immediately preceding `CSH:`. Otherwise, if it contains two
/// timestamp matches, split at the second. Otherwise return a single line.
pub fn split_mashed(s: &str) -> Vec<String> {
    if s.contains(" ST#") && s.contains(" CSH:") {
        if let Some(csh_idx) = s.find(" CSH:") {
            let prefix = &s[..csh_idx];
            if let Some(m) = TIMESTAMP_RE.find_iter(prefix).last() {
                let split_at = m.start();
                return vec![
                    s[..split_at].trim_end().to_string(),
                    s[split_at..].trim_start().to_string(),
                ];
            }
        }
    }

    let matches: Vec<_> = TIMESTAMP_RE.find_iter(s).collect();
    if matches.len() >= 2 {
        let split_at = matches[1].start();
        return vec![
            s[..split_at].trim_end().to_string(),
            s[split_at..].trim_start().to_string(),
        ];
    }

    vec![s.to_string()]
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

static END_HEADER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\bST#(\S+)\s+DR#(\S+)\s+TRAN#(\d+)").unwrap());
static CASHIER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bCSH:\s*([A-Z0-9 .'-]+)").unwrap());
static TOTAL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^TOTAL\s+(-?\d+(?:\.\d{1,2})?)$").unwrap());
static CASH_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^CASH\s+(-?\d+(?:\.\d{1,2})?)$").unwrap());
static DEBIT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^DEBIT\s+(-?\d+(?:\.\d{1,2})?)$").unwrap());
static CREDIT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^CREDIT\s+(-?\d+(?:\.\d{1,2})?)$").unwrap());
static PREAUTH_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^PREAUTH\s+(-?\d+(?:\.\d{1,2})?)$").unwrap());
static AGE_VERIFICATION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"DOB Verification:\s*(BYPASS|APPROVED|DENIED)(?:\s+Trans#(\d+))?").unwrap()
});
static ITEM_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(.+?)\s+(-?\d+(?:\.\d+)?)\s+(-?\d+(?:\.\d{1,2})?)$").unwrap());

fn parse_amount(raw: &str) -> Option<Amount> {
    raw.parse().ok()
}

/// Classify a cleaned line (post-`clean`, post-`split_mashed`) into exactly
/// one [`LineType`], first-match-wins per spec.md §4.1.
pub fn classify(cleaned: &str) -> ClassifiedLine {
    let trimmed = cleaned.trim();

    if let Some(caps) = END_HEADER_RE.captures(trimmed) {
        return ClassifiedLine {
            line_type: LineType::EndHeader,
            text: cleaned.to_string(),
            description: None,
            qty: None,
            amount: None,
            store_id: Some(caps[1].to_string()),
            drawer_id: Some(caps[2].to_string()),
            transaction_number: Some(caps[3].to_string()),
            cashier: None,
        };
    }

    if let Some(caps) = CASHIER_RE.captures(trimmed) {
        return ClassifiedLine {
            line_type: LineType::Cashier,
            text: cleaned.to_string(),
            description: None,
            qty: None,
            amount: None,
            store_id: None,
            drawer_id: None,
            transaction_number: None,
            cashier: Some(caps[1].trim().to_string()),
        };
    }

    for (re, line_type) in [
        (&*TOTAL_RE, LineType::Total),
        (&*CASH_RE, LineType::Cash),
        (&*DEBIT_RE, LineType::Debit),
        (&*CREDIT_RE, LineType::Credit),
        (&*PREAUTH_RE, LineType::Preauth),
    ] {
        if let Some(caps) = re.captures(trimmed) {
            return ClassifiedLine {
                line_type,
                text: cleaned.to_string(),
                description: None,
                qty: None,
                amount: parse_amount(&caps[1]),
                store_id: None,
                drawer_id: None,
                transaction_number: None,
                cashier: None,
            };
        }
    }

    if let Some(caps) = AGE_VERIFICATION_RE.captures(trimmed) {
        return ClassifiedLine {
            line_type: LineType::AgeVerification,
            text: cleaned.to_string(),
            description: Some(caps[1].to_string()),
            qty: None,
            amount: None,
            store_id: None,
            drawer_id: None,
            transaction_number: caps.get(2).map(|m| m.as_str().to_string()),
            cashier: None,
        };
    }

    if let Some(caps) = ITEM_RE.captures(trimmed) {
        if let (Some(qty), Some(amount)) = (caps[2].parse::<f64>().ok(), parse_amount(&caps[3])) {
            return ClassifiedLine {
                line_type: LineType::Item,
                text: cleaned.to_string(),
                description: Some(caps[1].trim().to_string()),
                qty: Some(qty),
                amount: Some(amount),
                store_id: None,
                drawer_id: None,
                transaction_number: None,
                cashier: None,
            };
        }
    }

    if trimmed.starts_with("ALARM") {
        return blank(cleaned, LineType::Ignore);
    }

    if trimmed.is_empty() {
        return blank(cleaned, LineType::Empty);
    }

    blank(cleaned, LineType::Unknown)
}

fn blank(text: &str, line_type: LineType) -> ClassifiedLine {
    ClassifiedLine {
        line_type,
        text: text.to_string(),
        description: None,
        qty: None,
        amount: None,
        store_id: None,
        drawer_id: None,
        transaction_number: None,
        cashier: None,
    }
}

/// Clean, split, and classify one raw physical line, returning one
/// [`ClassifiedLine`] per logical line it contained.
pub fn process(raw: &[u8]) -> Vec<ClassifiedLine> {
    let cleaned = clean(raw);
    split_mashed(&cleaned).into_iter().map(|s| classify(&s)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_strips_csi_sequences() {
        let raw = b"\x1b[1;2mTOTAL       5.78\x1b[0m";
        assert_eq!(clean(raw), "TOTAL       5.78");
    }

    #[test]
    fn clean_strips_esc_c0_and_esc_bang_nul() {
        let mut raw = vec![ESC, b'c', 0x30];
        raw.extend_from_slice(b"HELLO");
        raw.extend_from_slice(&[ESC, b'!', 0x00]);
        assert_eq!(clean(&raw), "HELLO");
    }

    #[test]
    fn clean_drops_non_printable_bytes_keeping_cr_lf() {
        let raw = b"A\x01B\r\nC";
        assert_eq!(clean(raw), "AB\r\nC");
    }

    #[test]
    fn clean_drops_leading_literal_c0_prefix() {
        assert_eq!(clean(b"c0TOTAL 1.00"), "TOTAL 1.00");
    }

    #[test]
    fn classify_total_cash_debit_credit_preauth() {
        assert_eq!(classify("TOTAL       5.78").line_type, LineType::Total);
        assert_eq!(classify("CASH        6.00").line_type, LineType::Cash);
        assert_eq!(classify("DEBIT      12.34").line_type, LineType::Debit);
        assert_eq!(classify("CREDIT      9.99").line_type, LineType::Credit);
        assert_eq!(classify("PREAUTH    20.00").line_type, LineType::Preauth);
    }

    #[test]
    fn classify_item_with_description_qty_amount() {
        let line = classify("Monster Blue Hawaiia   1        3.49");
        assert_eq!(line.line_type, LineType::Item);
        assert_eq!(line.description.as_deref(), Some("Monster Blue Hawaiia"));
        assert_eq!(line.qty, Some(1.0));
        assert_eq!(line.amount.unwrap().as_f64(), 3.49);
    }

    #[test]
    fn classify_refund_item_is_negative() {
        let line = classify("REFUND -1 -1.00");
        assert_eq!(line.line_type, LineType::Item);
        assert_eq!(line.qty, Some(-1.0));
        assert_eq!(line.amount.unwrap().as_f64(), -1.00);
        assert!(line.parsed_successfully());
    }

    #[test]
    fn classify_end_header_extracts_store_drawer_txn() {
        let line = classify("ST#1 DR#1 TRAN#1028401");
        assert_eq!(line.line_type, LineType::EndHeader);
        assert_eq!(line.store_id.as_deref(), Some("1"));
        assert_eq!(line.drawer_id.as_deref(), Some("1"));
        assert_eq!(line.transaction_number.as_deref(), Some("1028401"));
    }

    #[test]
    fn classify_cashier_extracts_name() {
        let line = classify("CSH: CORPORATE         07/23/25 10:15:15");
        assert_eq!(line.line_type, LineType::Cashier);
        assert_eq!(line.cashier.as_deref(), Some("CORPORATE"));
    }

    #[test]
    fn classify_age_verification_with_trans_number() {
        let line = classify("DOB Verification: APPROVED Trans#4821");
        assert_eq!(line.line_type, LineType::AgeVerification);
        assert_eq!(line.description.as_deref(), Some("APPROVED"));
        assert_eq!(line.transaction_number.as_deref(), Some("4821"));
    }

    #[test]
    fn classify_ignore_alarm_and_empty() {
        assert_eq!(classify("ALARM door open").line_type, LineType::Ignore);
        assert_eq!(classify("").line_type, LineType::Empty);
    }

    #[test]
    fn classify_unknown_when_nothing_matches() {
        assert_eq!(classify("????").line_type, LineType::Unknown);
    }

    #[test]
    fn split_mashed_header_and_cashier() {
        let s = " ST#1 DR#1 TRAN#1028401 07/23/25 10:15:15 001 CSH: CORPORATE";
        let parts = split_mashed(s);
        assert_eq!(parts.len(), 2);
        assert!(parts[0].contains("TRAN#1028401"));
        assert!(parts[1].starts_with("07/23/25"));
        assert!(parts[1].contains("CSH:"));
    }

    #[test]
    fn split_mashed_two_timestamps_splits_at_second() {
        let s = "07/23/25 10:15:15 001 something 07/23/25 10:16:00 002 CSH: JANE";
        let parts = split_mashed(s);
        assert_eq!(parts.len(), 2);
        assert!(parts[1].starts_with("07/23/25 10:16:00"));
    }

    #[test]
    fn split_mashed_single_line_passthrough() {
        assert_eq!(split_mashed("TOTAL 5.78"), vec!["TOTAL 5.78".to_string()]);
    }

    #[test]
    fn process_end_to_end_scenario_c_mashed_packet() {
        let raw = b" ST#1 DR#1 TRAN#1028401 07/23/25 10:15:15 001 CSH: CORPORATE";
        let lines = process(raw);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].line_type, LineType::EndHeader);
        assert_eq!(lines[1].line_type, LineType::Cashier);
    }
}
