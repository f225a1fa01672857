//! Deterministic address strategies.
//!
//! Each strategy takes raw text and returns a validated address or nothing.
//! `default_strategies()` returns them in priority order: subject before body.

use std::ops::Range;
use std::sync::LazyLock;

use regex::Regex;

use crate::pipeline::types::{split_name, ParsedRecipient};

/// Two-letter US states (plus DC).
const US_STATES: &[&str] = &[
    "AL", "AK", "AZ", "AR", "CA", "CO", "CT", "DE", "DC", "FL", "GA", "HI", "ID", "IL", "IN",
    "IA", "KS", "KY", "LA", "ME", "MD", "MA", "MI", "MN", "MS", "MO", "MT", "NE", "NV", "NH",
    "NJ", "NM", "NY", "NC", "ND", "OH", "OK", "OR", "PA", "RI", "SC", "SD", "TN", "TX", "UT",
    "VT", "VA", "WA", "WV", "WI", "WY",
];

/// Canadian provinces and territories.
const CA_PROVINCES: &[&str] = &[
    "AB", "BC", "MB", "NB", "NL", "NS", "NT", "NU", "ON", "PE", "QC", "SK", "YT",
];

/// Whether `code` is an allowed state/province abbreviation.
pub fn is_valid_region(code: &str) -> bool {
    let code = code.trim().to_ascii_uppercase();
    US_STATES.contains(&code.as_str()) || CA_PROVINCES.contains(&code.as_str())
}

pub fn is_canadian_province(code: &str) -> bool {
    CA_PROVINCES.contains(&code.trim().to_ascii_uppercase().as_str())
}

/// Map a written country to its ISO code. Only US and Canada are recognized.
pub fn normalize_country(raw: &str) -> Option<&'static str> {
    let cleaned = raw.trim().replace('.', "").to_ascii_uppercase();
    match cleaned.as_str() {
        "US" | "USA" | "UNITED STATES" | "UNITED STATES OF AMERICA" => Some("US"),
        "CA" | "CAN" | "CANADA" => Some("CA"),
        _ => None,
    }
}

/// Country for an address with no explicit country.
pub fn infer_country(region: &str, default_country: &str) -> String {
    if is_canadian_province(region) {
        "CA".to_string()
    } else {
        default_country.to_string()
    }
}

static HEADER_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(?:send\s+to|recipient|address|to)\s*:\s*").expect("valid regex")
});

static SUBJECT_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:send\s+to|recipient|address|to)\s*:\s*(.+)$").expect("valid regex")
});

const POSTAL: &str = r"\d{5}(?:-\d{4})?|[A-Za-z]\d[A-Za-z][ -]?\d[A-Za-z]\d";

static REGION_POSTAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"^([A-Za-z]{{2}})\.?\s+({POSTAL})$")).expect("valid regex")
});

static CITY_REGION_POSTAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"^(.+?),?\s+([A-Za-z]{{2}})\.?,?\s+({POSTAL})$")).expect("valid regex")
});

static POSTAL_ONLY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!(r"^(?:{POSTAL})$")).expect("valid regex"));

static REGION_ONLY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z]{2}\.?$").expect("valid regex"));

static STREET_START: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(?:\d|p\.?\s*o\.?\s*box\b)").expect("valid regex"));

/// Whether a line starts with a `To:`/`Recipient:`/`Send to:`/`Address:` header.
pub fn is_header_line(line: &str) -> bool {
    HEADER_PREFIX.is_match(line)
}

/// Remove a leading address header, if any.
pub fn strip_header(line: &str) -> &str {
    match HEADER_PREFIX.find(line) {
        Some(m) => &line[m.end()..],
        None => line,
    }
}

/// A header with nothing after it, e.g. `To:` on its own line.
fn is_bare_header(line: &str) -> bool {
    is_header_line(line) && strip_header(line).trim().is_empty()
}

fn looks_like_street(line: &str) -> bool {
    STREET_START.is_match(line.trim())
}

/// Uppercase, and space Canadian postal codes as `A1A 1A1`.
fn normalize_postal(raw: &str) -> String {
    let compact: String = raw
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .collect::<String>()
        .to_ascii_uppercase();
    if compact.len() == 6 && compact.starts_with(|c: char| c.is_ascii_alphabetic()) {
        format!("{} {}", &compact[..3], &compact[3..])
    } else {
        raw.trim().to_ascii_uppercase()
    }
}

/// Address parts before country resolution and validation.
struct Candidate<'a> {
    name: &'a str,
    line1: &'a str,
    line2: Option<&'a str>,
    city: &'a str,
    region: &'a str,
    postal: &'a str,
    country: Option<&'static str>,
}

impl Candidate<'_> {
    fn finish(self, default_country: &str) -> Option<ParsedRecipient> {
        let (first_name, last_name) = split_name(strip_header(self.name));
        let region = self.region.trim().trim_end_matches('.').to_ascii_uppercase();
        let country_code = match self.country {
            Some(code) => code.to_string(),
            None => infer_country(&region, default_country),
        };
        let recipient = ParsedRecipient {
            first_name,
            last_name,
            address_line1: self.line1.trim().to_string(),
            address_line2: self
                .line2
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            city: self.city.trim().to_string(),
            region,
            postal_code: normalize_postal(self.postal),
            country_code,
        };
        recipient.validate().ok().map(|_| recipient)
    }
}

/// Which part of the message a strategy reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Subject,
    Body,
}

/// An accepted address and the line range of the input it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct AddressMatch {
    pub recipient: ParsedRecipient,
    pub lines: Range<usize>,
}

/// A pure address parser.
pub trait AddressStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn target(&self) -> Target;
    fn parse(&self, text: &str, default_country: &str) -> Option<AddressMatch>;
}

/// The built-in strategies in priority order.
pub fn default_strategies() -> Vec<Box<dyn AddressStrategy>> {
    vec![
        Box::new(SubjectLine),
        Box::new(BodyCommaLine),
        Box::new(BodyBlock),
    ]
}

// ── Comma-separated single line ─────────────────────────────────────

/// Parse `Name, Line1[, Line2], City, ST POSTAL[, Country]`.
///
/// Interpretations are tried in order: trailing token as country, then
/// no country (inferred). For each, the region and postal code may share a
/// token, sit in separate tokens, or share a token with the city.
pub fn parse_comma_line(line: &str, default_country: &str) -> Option<ParsedRecipient> {
    let tokens: Vec<&str> = line
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect();
    if tokens.len() < 3 {
        return None;
    }

    let mut interpretations: Vec<(&[&str], Option<&'static str>)> = Vec::with_capacity(2);
    if let Some((last, rest)) = tokens.split_last()
        && let Some(code) = normalize_country(last)
    {
        interpretations.push((rest, Some(code)));
    }
    interpretations.push((tokens.as_slice(), None));

    interpretations
        .into_iter()
        .find_map(|(tokens, country)| comma_fields(tokens, country, default_country))
}

fn comma_fields(
    tokens: &[&str],
    country: Option<&'static str>,
    default_country: &str,
) -> Option<ParsedRecipient> {
    let (last, rest) = tokens.split_last()?;

    // "City, ST 12345"
    if let Some(caps) = REGION_POSTAL.captures(last)
        && let Some((city, rest)) = rest.split_last()
        && let Some(found) = street_fields(
            rest,
            city,
            caps.get(1)?.as_str(),
            caps.get(2)?.as_str(),
            country,
            default_country,
        )
    {
        return Some(found);
    }

    // "City, ST, 12345"
    if POSTAL_ONLY.is_match(last)
        && let Some((region, rest)) = rest.split_last()
        && REGION_ONLY.is_match(region)
        && let Some((city, rest)) = rest.split_last()
        && let Some(found) = street_fields(rest, city, region, last, country, default_country)
    {
        return Some(found);
    }

    // "City ST 12345"
    if let Some(caps) = CITY_REGION_POSTAL.captures(last) {
        return street_fields(
            rest,
            caps.get(1)?.as_str(),
            caps.get(2)?.as_str(),
            caps.get(3)?.as_str(),
            country,
            default_country,
        );
    }

    None
}

/// `tokens` is `[name, line1]` or `[name, line1, line2]`.
fn street_fields(
    tokens: &[&str],
    city: &str,
    region: &str,
    postal: &str,
    country: Option<&'static str>,
    default_country: &str,
) -> Option<ParsedRecipient> {
    let (name, line1, line2) = match tokens {
        [name, line1] => (*name, *line1, None),
        [name, line1, line2] => (*name, *line1, Some(*line2)),
        _ => return None,
    };
    Candidate {
        name,
        line1,
        line2,
        city,
        region,
        postal,
        country,
    }
    .finish(default_country)
}

/// The whole subject, after any address header or leading label.
pub struct SubjectLine;

impl AddressStrategy for SubjectLine {
    fn name(&self) -> &'static str {
        "subject-line"
    }

    fn target(&self) -> Target {
        Target::Subject
    }

    fn parse(&self, text: &str, default_country: &str) -> Option<AddressMatch> {
        let candidate = match SUBJECT_HEADER.captures(text) {
            Some(caps) => caps.get(1)?.as_str(),
            None => text.rsplit_once(':').map_or(text, |(_, after)| after),
        };
        parse_comma_line(candidate, default_country).map(|recipient| AddressMatch {
            recipient,
            lines: 0..1,
        })
    }
}

/// Any single body line holding a full comma-separated address.
pub struct BodyCommaLine;

impl AddressStrategy for BodyCommaLine {
    fn name(&self) -> &'static str {
        "body-line"
    }

    fn target(&self) -> Target {
        Target::Body
    }

    fn parse(&self, text: &str, default_country: &str) -> Option<AddressMatch> {
        text.lines().enumerate().find_map(|(idx, line)| {
            parse_comma_line(strip_header(line), default_country).map(|recipient| AddressMatch {
                recipient,
                lines: idx..idx + 1,
            })
        })
    }
}

// ── Multi-line block ────────────────────────────────────────────────

/// A postal block: name, street, optional second line, `City, ST POSTAL`,
/// optional country line.
pub struct BodyBlock;

impl AddressStrategy for BodyBlock {
    fn name(&self) -> &'static str {
        "body-block"
    }

    fn target(&self) -> Target {
        Target::Body
    }

    fn parse(&self, text: &str, default_country: &str) -> Option<AddressMatch> {
        let lines: Vec<&str> = text.lines().map(str::trim).collect();
        (0..lines.len()).find_map(|idx| block_at(&lines, idx, default_country))
    }
}

fn block_at(lines: &[&str], idx: usize, default_country: &str) -> Option<AddressMatch> {
    let caps = CITY_REGION_POSTAL.captures(lines[idx])?;
    let (city, region, postal) = (
        caps.get(1)?.as_str().trim_end_matches(','),
        caps.get(2)?.as_str(),
        caps.get(3)?.as_str(),
    );

    // Up to three non-blank lines directly above; a bare header ends the block.
    let mut start = idx;
    while start > 0 && idx - start < 3 {
        let above = lines[start - 1];
        if above.is_empty() || is_bare_header(above) {
            break;
        }
        start -= 1;
    }
    let above = &lines[start..idx];

    let country_line = lines.get(idx + 1).and_then(|l| normalize_country(l));
    let mut end = idx + 1;
    if country_line.is_some() {
        end += 1;
    }

    // Two lines (name, street) first, then three (name, street, line 2).
    let interpretations: [(usize, bool); 2] = [(2, false), (3, true)];
    for (take, has_line2) in interpretations {
        if above.len() < take {
            continue;
        }
        let parts = &above[above.len() - take..];
        if !looks_like_street(parts[1]) || looks_like_street(parts[0]) {
            continue;
        }
        let candidate = Candidate {
            name: parts[0],
            line1: parts[1],
            line2: has_line2.then(|| parts[2]),
            city,
            region,
            postal,
            country: country_line,
        };
        if let Some(recipient) = candidate.finish(default_country) {
            let mut first = idx - take;
            if first > 0 && is_bare_header(lines[first - 1]) {
                first -= 1;
            }
            return Some(AddressMatch {
                recipient,
                lines: first..end,
            });
        }
    }
    None
}
