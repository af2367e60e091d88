//! Output parser
//!
//! Pulls `Name : value` lines out of free-form command output. Parsing is
//! total: missing fields are skipped and nothing here returns an error.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use crate::event::Event;

/// One parsed name/value pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreferenceRecord {
    pub pref_name: String,
    pub pref_val: String,
}

/// A report field and its compiled line pattern
type FieldPattern = (&'static str, Regex);

fn field_pattern(field: &str) -> Option<Regex> {
    Regex::new(&format!(r"{}\s*:\s(.+)\n", regex::escape(field))).ok()
}

fn compile<'a>(fields: &[&'a str]) -> Vec<(&'a str, Regex)> {
    fields
        .iter()
        .filter_map(|field| field_pattern(field).map(|re| (*field, re)))
        .collect()
}

/// Patterns for the fields `event` reports, compiled once per event
fn event_patterns(event: Event) -> &'static [FieldPattern] {
    static PREFERENCE: OnceLock<Vec<FieldPattern>> = OnceLock::new();
    static STATUS: OnceLock<Vec<FieldPattern>> = OnceLock::new();

    match event {
        Event::GetPreference => PREFERENCE.get_or_init(|| compile(&event.report_fields())).as_slice(),
        Event::GetComputerStatus => STATUS.get_or_init(|| compile(&event.report_fields())).as_slice(),
        _ => &[],
    }
}

/// Parse `raw` for the fields `event` reports
pub fn parse(raw: &str, event: Event) -> Vec<PreferenceRecord> {
    extract_all(raw, event_patterns(event))
}

/// Parse `raw` for `fields`, keeping field order and skipping absent ones
pub fn parse_fields(raw: &str, fields: &[&str]) -> Vec<PreferenceRecord> {
    extract_all(raw, &compile(fields))
}

fn extract_all(raw: &str, patterns: &[(&str, Regex)]) -> Vec<PreferenceRecord> {
    patterns
        .iter()
        .filter_map(|(field, re)| {
            let captured = re.captures(raw)?.get(1)?.as_str();
            Some(PreferenceRecord {
                pref_name: field.to_string(),
                pref_val: normalize(captured),
            })
        })
        .collect()
}

/// Strip braces and whitespace; decimal digit strings become `0x` hex
pub fn normalize(captured: &str) -> String {
    let value: String = captured.chars().filter(|c| *c != '{' && *c != '}').collect();
    let value = value.trim();

    if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()) {
        decimal_to_hex(value)
    } else {
        value.to_string()
    }
}

/// Arbitrary-precision decimal to lowercase `0x` hex
fn decimal_to_hex(digits: &str) -> String {
    // Base 2^32 limbs, least significant first
    let mut limbs: Vec<u32> = vec![0];
    for digit in digits.bytes().map(|b| u64::from(b - b'0')) {
        let mut carry = digit;
        for limb in limbs.iter_mut() {
            let acc = u64::from(*limb) * 10 + carry;
            *limb = acc as u32;
            carry = acc >> 32;
        }
        if carry > 0 {
            limbs.push(carry as u32);
        }
    }

    let mut hex = String::from("0x");
    let mut limbs = limbs.iter().rev();
    if let Some(top) = limbs.next() {
        hex.push_str(&format!("{:x}", top));
    }
    for limb in limbs {
        hex.push_str(&format!("{:08x}", limb));
    }
    hex
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATUS_OUTPUT: &str = "\r\nAMEngineVersion                  : 1.1.18100.5\r\nAntivirusEnabled                 : True\r\nAntivirusSignatureAge            : 0\r\nAntivirusSignatureLastUpdated    : 4/25/2021 3:42:11 PM\r\nAntivirusSignatureVersion        : 1.335.1419.0\r\n";

    #[test]
    fn test_status_fields_in_report_order() {
        let records = parse(STATUS_OUTPUT, Event::GetComputerStatus);
        let names: Vec<&str> = records.iter().map(|r| r.pref_name.as_str()).collect();
        assert_eq!(
            names,
            vec!["AntivirusSignatureLastUpdated", "AntivirusSignatureVersion", "AntivirusEnabled"]
        );
        assert_eq!(records[0].pref_val, "4/25/2021 3:42:11 PM");
        assert_eq!(records[1].pref_val, "1.335.1419.0");
        assert_eq!(records[2].pref_val, "True");
    }

    #[test]
    fn test_digits_become_hex() {
        let records = parse("ScanParameters : 1\n", Event::GetPreference);
        assert_eq!(
            records,
            vec![PreferenceRecord {
                pref_name: "ScanParameters".to_string(),
                pref_val: "0x1".to_string(),
            }]
        );
        assert_eq!(normalize("255"), "0xff");
        assert_eq!(normalize(" 0 "), "0x0");
    }

    #[test]
    fn test_braces_stripped_and_non_digits_pass_through() {
        assert_eq!(normalize("{C:\\Temp, D:\\Data}"), "C:\\Temp, D:\\Data");
        assert_eq!(normalize("{0, 1}"), "0, 1");
        assert_eq!(normalize("{42}"), "0x2a");
        assert_eq!(normalize("-5"), "-5");
        assert_eq!(normalize("1.5"), "1.5");
    }

    #[test]
    fn test_arbitrary_precision() {
        assert_eq!(normalize("18446744073709551616"), "0x10000000000000000");
        assert_eq!(normalize("340282366920938463463374607431768211455"), "0xffffffffffffffffffffffffffffffff");
        assert_eq!(normalize("4294967296"), "0x100000000");
    }

    #[test]
    fn test_missing_fields_are_omitted() {
        assert!(parse("", Event::GetComputerStatus).is_empty());
        assert!(parse("nothing useful here", Event::GetPreference).is_empty());
        // A field needs a trailing newline to match
        assert!(parse("AntivirusEnabled : True", Event::GetComputerStatus).is_empty());
    }

    #[test]
    fn test_first_match_wins() {
        let records = parse_fields("UILockdown : False\nUILockdown : True\n", &["UILockdown"]);
        assert_eq!(records[0].pref_val, "False");
    }

    #[test]
    fn test_patterns_compiled_once_per_event() {
        let first = event_patterns(Event::GetPreference);
        let again = event_patterns(Event::GetPreference);
        assert_eq!(first.len(), Event::GetPreference.report_fields().len());
        assert!(std::ptr::eq(first, again));
        assert_eq!(event_patterns(Event::GetComputerStatus).len(), 3);
        assert!(event_patterns(Event::StartScan).is_empty());
    }

    #[test]
    fn test_events_without_report_fields() {
        assert!(parse(STATUS_OUTPUT, Event::SetPreference).is_empty());
    }
}
