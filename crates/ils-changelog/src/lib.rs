//! Tolerant parsing of changelog lines into structured incident drafts.
//!
//! The upstream changelog is human-maintained: entry shapes drift, fields go
//! missing, separators vary. Entry boundaries are therefore a predicate over
//! line content (a leading date-like token), not a fixed line count, and a
//! malformed entry degrades to a record with partial fields and its raw text
//! preserved rather than an error.

use std::collections::HashSet;

use chrono::NaiveDate;
use ils_core::{derive_identity_key, normalize_key_fragment, IncidentRecord, Loss};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const CRATE_NAME: &str = "ils-changelog";

/// One added changelog line, tagged with its ordinal position in the diff so
/// entry grouping follows file order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddedLine {
    pub index: usize,
    pub text: String,
}

impl AddedLine {
    pub fn new(index: usize, text: impl Into<String>) -> Self {
        Self {
            index,
            text: text.into(),
        }
    }
}

/// Parser output before the identity key and source commit are attached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentDraft {
    pub date: Option<NaiveDate>,
    pub title: Option<String>,
    pub attack_type: Option<String>,
    pub loss: Option<Loss>,
    pub contract: Option<String>,
    pub links: Vec<String>,
    pub raw_text: String,
}

impl IncidentDraft {
    /// Finalize the draft into a database record observed at `source_commit`.
    pub fn into_record(self, source_commit: &str) -> IncidentRecord {
        let identity_key = derive_identity_key(self.date, self.title.as_deref(), &self.raw_text);
        IncidentRecord {
            identity_key,
            date: self.date,
            title: self.title,
            attack_type: self.attack_type,
            loss: self.loss,
            contract: self.contract,
            links: self.links,
            raw_text: self.raw_text,
            source_commit: source_commit.to_string(),
        }
    }
}

pub struct ChangelogParser {
    marker: Regex,
    separator: Regex,
    md_link: Regex,
    url: Regex,
    loss: Regex,
    contract: Regex,
}

impl Default for ChangelogParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangelogParser {
    pub fn new() -> Self {
        Self {
            // Leading bullets/heading marks, then a date-like token.
            marker: Regex::new(r"^[\s>#*-]*(?P<date>\d{8}|\d{4}[-./]\d{2}[-./]\d{2})\b")
                .expect("valid marker pattern"),
            separator: Regex::new(r"\s+[-–—]\s+|\s*\|\s*|:\s+|,\s+")
                .expect("valid separator pattern"),
            md_link: Regex::new(r"\[([^\]]+)\]\(([^)]+)\)").expect("valid md link pattern"),
            url: Regex::new(r#"https?://[^\s<>()\[\]"']+"#).expect("valid url pattern"),
            loss: Regex::new(
                r"(?i)(?:total\s+)?lo(?:ss|st)\s*[:\-]\s*~?\s*\$?\s*([0-9][0-9,.]*)\s*([kmb]?)\b\s*([A-Za-z$]{0,6})",
            )
            .expect("valid loss pattern"),
            contract: Regex::new(r"(src/[^\s]+\.sol)").expect("valid contract pattern"),
        }
    }

    /// Structural marker predicate: does this line open a new entry?
    pub fn is_entry_marker(&self, line: &str) -> bool {
        self.marker.is_match(line)
    }

    /// Scan added lines in order and group them into incident drafts. Never
    /// fails: a block the extraction rules cannot decompose still yields a
    /// draft with its raw text and whatever fields did parse.
    pub fn parse(&self, lines: &[AddedLine]) -> Vec<IncidentDraft> {
        let mut drafts = Vec::new();
        let mut block: Vec<&AddedLine> = Vec::new();
        let mut seen_marker = false;

        for line in lines {
            if self.is_entry_marker(&line.text) {
                if let Some(draft) = self.block_to_draft(&block, seen_marker) {
                    drafts.push(draft);
                }
                block = vec![line];
                seen_marker = true;
            } else {
                block.push(line);
            }
        }
        if let Some(draft) = self.block_to_draft(&block, seen_marker) {
            drafts.push(draft);
        }
        drafts
    }

    /// Turn one accumulated block into a draft. A block that never saw a
    /// marker (lines preceding the first entry) is kept only when it still
    /// looks like an incident — it carries a link, a loss figure, or a PoC
    /// path. Plain prose and section headers around the entries are not
    /// entries and are dropped.
    fn block_to_draft(&self, block: &[&AddedLine], has_marker: bool) -> Option<IncidentDraft> {
        if block.is_empty() {
            return None;
        }
        let content: Vec<&str> = block
            .iter()
            .map(|l| l.text.as_str())
            .filter(|t| !is_decoration(t))
            .collect();
        if content.is_empty() {
            debug!(lines = block.len(), "dropping decoration-only block");
            return None;
        }

        let loss = block.iter().find_map(|l| self.parse_loss(&l.text));
        let contract = block.iter().find_map(|l| {
            self.contract
                .captures(&l.text)
                .map(|c| c.get(1).expect("contract capture").as_str().to_string())
        });
        let links = self.collect_links(block);
        if !has_marker && links.is_empty() && loss.is_none() && contract.is_none() {
            debug!(lines = block.len(), "dropping undated block with no incident fields");
            return None;
        }

        let raw_text = block
            .iter()
            .map(|l| l.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_string();

        let (date, remainder) = if has_marker {
            match self.marker.captures(&block[0].text) {
                Some(caps) => {
                    let token = caps.name("date").expect("marker capture").as_str();
                    let rest = &block[0].text[caps.get(0).expect("marker match").end()..];
                    (parse_date_token(token), rest.to_string())
                }
                None => (None, content[0].to_string()),
            }
        } else {
            // Skip section headers when picking the line the title comes from.
            let line = content
                .iter()
                .copied()
                .find(|t| !t.trim_start().starts_with('#'))
                .unwrap_or(content[0]);
            (None, line.to_string())
        };

        let (title, attack_type) = self.split_title_and_kind(&remainder);

        Some(IncidentDraft {
            date,
            title,
            attack_type,
            loss,
            contract,
            links,
            raw_text,
        })
    }

    /// Split the post-date remainder of a header line into project title and
    /// raw attack label, tolerating dash/colon/pipe/comma separators and
    /// markdown link syntax.
    fn split_title_and_kind(&self, remainder: &str) -> (Option<String>, Option<String>) {
        let unwrapped = self.md_link.replace_all(remainder, "$1");
        let stripped = self.url.replace_all(&unwrapped, "");
        let head = stripped
            .trim_start_matches(|c: char| {
                c.is_whitespace() || matches!(c, ',' | ';' | ':' | '-' | '–' | '—' | '*')
            })
            .trim_end();

        let (title_part, kind_part) = match self.separator.find(head) {
            Some(m) => (&head[..m.start()], &head[m.end()..]),
            None => (head, ""),
        };

        let title = title_part
            .trim_matches(|c: char| c.is_whitespace() || matches!(c, '*' | '#' | '`'))
            .trim_end_matches(|c: char| matches!(c, ',' | ';' | ':' | '-'))
            .trim_end();
        let title = if title.is_empty() {
            None
        } else {
            Some(title.to_string())
        };

        let kind = kind_part
            .split(['|', '#'])
            .next()
            .unwrap_or_default()
            .trim();
        (title, normalize_attack_type(kind))
    }

    /// Parse "Lost: 285.7K USD"-style amounts, tolerant of `~`, `$`, comma
    /// grouping and K/M/B magnitude suffixes.
    fn parse_loss(&self, line: &str) -> Option<Loss> {
        let caps = self.loss.captures(line)?;
        let number = caps.get(1).expect("loss amount capture").as_str().replace(',', "");
        let base: f64 = number.parse().ok()?;
        let multiplier = match caps
            .get(2)
            .map(|m| m.as_str().to_ascii_uppercase())
            .as_deref()
        {
            Some("K") => 1_000.0,
            Some("M") => 1_000_000.0,
            Some("B") => 1_000_000_000.0,
            _ => 1.0,
        };
        let currency = normalize_currency(caps.get(3).map(|m| m.as_str()).unwrap_or_default());
        Some(Loss {
            amount: base * multiplier,
            currency,
        })
    }

    /// All URLs across the block, within-entry duplicates removed, first-seen
    /// order preserved.
    fn collect_links(&self, block: &[&AddedLine]) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut links = Vec::new();
        for line in block {
            for m in self.url.find_iter(&line.text) {
                let url = m
                    .as_str()
                    .trim_end_matches(['.', ',', ';'])
                    .to_string();
                if seen.insert(url.clone()) {
                    links.push(url);
                }
            }
        }
        links
    }
}

/// Accept `YYYYMMDD` plus `-`/`.`/`/`-separated forms. An implausible token
/// (month 13 and friends) simply yields no date.
fn parse_date_token(token: &str) -> Option<NaiveDate> {
    if token.len() == 8 && token.chars().all(|c| c.is_ascii_digit()) {
        return NaiveDate::parse_from_str(token, "%Y%m%d").ok();
    }
    let dashed: String = token
        .chars()
        .map(|c| if matches!(c, '.' | '/') { '-' } else { c })
        .collect();
    NaiveDate::parse_from_str(&dashed, "%Y-%m-%d").ok()
}

fn is_decoration(line: &str) -> bool {
    line.trim().chars().all(|c| {
        matches!(c, '#' | '*' | '-' | '=' | '>' | '_' | '`') || c.is_whitespace()
    })
}

fn normalize_currency(token: &str) -> String {
    let upper = token
        .to_ascii_uppercase()
        .replace("US$", "USD")
        .replace('$', "USD");
    let trimmed = upper.trim();
    if trimmed.is_empty() || matches!(trimmed, "USDUSD" | "US") {
        "USD".to_string()
    } else {
        trimmed.to_string()
    }
}

struct AttackRule {
    label: &'static str,
    needles: &'static [&'static str],
}

/// Substring rules over the normalized label, first match wins. Specific
/// categories come before the generic catch-alls.
const ATTACK_RULES: &[AttackRule] = &[
    AttackRule {
        label: "Access Control",
        needles: &[
            "access control",
            "unauthorized",
            "unprotected",
            "privilege",
            "ownership",
            "permission",
        ],
    },
    AttackRule {
        label: "Flash Loan Attack",
        needles: &["flash loan", "flashloan", "flash swap", "loan attack"],
    },
    AttackRule {
        label: "Reentrancy Attack",
        needles: &["reentrancy", "re entrancy", "reentrant"],
    },
    AttackRule {
        label: "Price Manipulation",
        needles: &[
            "price manipulation",
            "oracle manipulation",
            "price oracle",
            "oracle attack",
            "price feed",
            "pool imbalance",
            "manipulation",
        ],
    },
    AttackRule {
        label: "Logic Flaw",
        needles: &[
            "business logic",
            "logic flaw",
            "logic error",
            "bad logic",
            "incorrect logic",
            "improper logic",
            "calculation",
        ],
    },
    AttackRule {
        label: "Overflow",
        needles: &["overflow", "underflow"],
    },
    AttackRule {
        label: "Precision Loss",
        needles: &["precision loss", "loss of precision", "rounding", "precision"],
    },
    AttackRule {
        label: "Storage Collision",
        needles: &["storage collision"],
    },
    AttackRule {
        label: "Sandwich Attack",
        needles: &["sandwich"],
    },
    AttackRule {
        label: "Front-running Attack",
        needles: &["front run", "frontrun", "mev"],
    },
    AttackRule {
        label: "Inflation Attack",
        needles: &["inflation attack"],
    },
    AttackRule {
        label: "Self-Liquidation",
        needles: &["self liquidation"],
    },
    AttackRule {
        label: "Governance Attack",
        needles: &["governance", "dao attack", "voting", "malicious proposal"],
    },
    AttackRule {
        label: "Bridge Attack",
        needles: &["bridge", "cross chain"],
    },
    AttackRule {
        label: "Private Key Compromised",
        needles: &["private key", "key compromised", "key leak"],
    },
    AttackRule {
        label: "Deflationary Token Incompatible",
        needles: &["deflationary token"],
    },
    AttackRule {
        label: "Token Incompatible",
        needles: &["token incompatible", "incompatible token"],
    },
    AttackRule {
        label: "Weak RNG",
        needles: &["weak rng", "bad randomness", "weak random", "predicting random"],
    },
    AttackRule {
        label: "Slippage Protection",
        needles: &["slippage"],
    },
    AttackRule {
        label: "Arbitrary Calldata",
        needles: &["arbitrary calldata", "arbitrary call"],
    },
    AttackRule {
        label: "Signature Verification",
        needles: &["signature", "verification"],
    },
    AttackRule {
        label: "Incorrect Validation",
        needles: &["validation"],
    },
    AttackRule {
        label: "Social Engineering",
        needles: &[
            "phishing",
            "social",
            "scam",
            "fraud",
            "impersonation",
            "rugpull",
            "rug pull",
        ],
    },
    AttackRule {
        label: "Protocol Design",
        needles: &["design", "architecture", "specification"],
    },
    AttackRule {
        label: "Implementation Bug",
        needles: &["bug", "coding error", "incorrect", "wrong", "error"],
    },
];

/// Map a free-form attack label onto the canonical category set. Labels no
/// rule recognizes pass through title-cased so nothing upstream is invented.
pub fn normalize_attack_type(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let mut normalized = normalize_key_fragment(trimmed);
    for prefix in ["attack ", "exploit ", "hack "] {
        if let Some(rest) = normalized.strip_prefix(prefix) {
            normalized = rest.to_string();
            break;
        }
    }
    if normalized.is_empty() {
        return None;
    }
    for rule in ATTACK_RULES {
        if rule.needles.iter().any(|needle| normalized.contains(needle)) {
            return Some(rule.label.to_string());
        }
    }
    Some(title_case(&normalized))
}

fn title_case(normalized: &str) -> String {
    normalized
        .split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(texts: &[&str]) -> Vec<AddedLine> {
        texts
            .iter()
            .enumerate()
            .map(|(i, t)| AddedLine::new(i, *t))
            .collect()
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn marker_predicate_accepts_date_shapes() {
        let parser = ChangelogParser::new();
        assert!(parser.is_entry_marker("20240105 ProjectX - Reentrancy"));
        assert!(parser.is_entry_marker("2024-01-05, ProjectX"));
        assert!(parser.is_entry_marker("- 2024.01.05 ProjectX"));
        assert!(parser.is_entry_marker("### 20240105 ProjectX"));
        assert!(!parser.is_entry_marker("Lost: 285.7K USD"));
        assert!(!parser.is_entry_marker("ProjectX - Reentrancy"));
    }

    #[test]
    fn well_formed_entry_is_fully_extracted() {
        // Scenario: one clean comma-separated entry.
        let parser = ChangelogParser::new();
        let drafts = parser.parse(&lines(&["2024-01-05, ProjectX, https://example.com/poc"]));
        assert_eq!(drafts.len(), 1);
        let draft = &drafts[0];
        assert_eq!(draft.date, Some(date(2024, 1, 5)));
        assert_eq!(draft.title.as_deref(), Some("ProjectX"));
        assert_eq!(draft.links, vec!["https://example.com/poc".to_string()]);
        assert!(!draft.raw_text.is_empty());

        let record = draft.clone().into_record("abcdef1");
        assert_eq!(record.identity_key, "2024-01-05:projectx");
        assert_eq!(record.source_commit, "abcdef1");
    }

    #[test]
    fn multi_line_entry_groups_until_next_marker() {
        let parser = ChangelogParser::new();
        let drafts = parser.parse(&lines(&[
            "20240105 GammaVault - Reentrancy",
            "Lost: 285.7K USD",
            "[GammaVault_exp.sol](src/test/2024-01/GammaVault_exp.sol)",
            "https://example.com/writeup",
            "20240109 Beta Finance - Price Manipulation",
            "Total Lost : ~1.7M US$",
        ]));
        assert_eq!(drafts.len(), 2);

        let first = &drafts[0];
        assert_eq!(first.date, Some(date(2024, 1, 5)));
        assert_eq!(first.title.as_deref(), Some("GammaVault"));
        assert_eq!(first.attack_type.as_deref(), Some("Reentrancy Attack"));
        assert_eq!(
            first.loss,
            Some(Loss {
                amount: 285_700.0,
                currency: "USD".into()
            })
        );
        assert_eq!(
            first.contract.as_deref(),
            Some("src/test/2024-01/GammaVault_exp.sol")
        );
        assert_eq!(first.links, vec!["https://example.com/writeup".to_string()]);
        assert_eq!(first.raw_text.lines().count(), 4);

        let second = &drafts[1];
        assert_eq!(second.title.as_deref(), Some("Beta Finance"));
        assert_eq!(second.attack_type.as_deref(), Some("Price Manipulation"));
        assert_eq!(
            second.loss,
            Some(Loss {
                amount: 1_700_000.0,
                currency: "USD".into()
            })
        );
    }

    #[test]
    fn entry_without_date_still_becomes_a_draft() {
        // Scenario: malformed entry, date missing entirely.
        let parser = ChangelogParser::new();
        let drafts = parser.parse(&lines(&["ProjectX, https://example.com/poc"]));
        assert_eq!(drafts.len(), 1);
        let draft = &drafts[0];
        assert_eq!(draft.date, None);
        assert_eq!(draft.title.as_deref(), Some("ProjectX"));
        assert_eq!(draft.links, vec!["https://example.com/poc".to_string()]);
        assert!(!draft.raw_text.is_empty());

        let record = draft.clone().into_record("abcdef1");
        assert!(record.identity_key.starts_with("raw:"));
    }

    #[test]
    fn decoration_only_lines_produce_nothing() {
        let parser = ChangelogParser::new();
        assert!(parser.parse(&lines(&["---", "", "### ", "====="])).is_empty());
    }

    #[test]
    fn undated_prose_without_incident_fields_is_dropped() {
        let parser = ChangelogParser::new();
        let drafts = parser.parse(&lines(&["# Incident List", "", "maintained by hand"]));
        assert!(drafts.is_empty());
    }

    #[test]
    fn preamble_noise_before_marker_does_not_leak_into_entry() {
        let parser = ChangelogParser::new();
        let drafts = parser.parse(&lines(&[
            "---",
            "20240105 GammaVault - Reentrancy",
            "Lost: 10K USD",
        ]));
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].title.as_deref(), Some("GammaVault"));
    }

    #[test]
    fn invalid_date_token_degrades_to_none() {
        let parser = ChangelogParser::new();
        let drafts = parser.parse(&lines(&["20241399 BrokenDate - Reentrancy"]));
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].date, None);
        assert_eq!(drafts[0].title.as_deref(), Some("BrokenDate"));
    }

    #[test]
    fn links_are_deduped_in_first_seen_order() {
        let parser = ChangelogParser::new();
        let drafts = parser.parse(&lines(&[
            "20240105 ProjectX - Reentrancy",
            "https://a.example/poc and https://b.example/writeup",
            "see https://a.example/poc.",
        ]));
        assert_eq!(
            drafts[0].links,
            vec![
                "https://a.example/poc".to_string(),
                "https://b.example/writeup".to_string()
            ]
        );
    }

    #[test]
    fn loss_parsing_handles_format_variants() {
        let parser = ChangelogParser::new();
        let cases = [
            ("Lost: 285.7K USD", 285_700.0, "USD"),
            ("Total Lost : ~1.7M US$", 1_700_000.0, "USD"),
            ("Lost - $6.8k", 6_800.0, "USD"),
            ("### Lost: 15,261.68 BUSD", 15_261.68, "BUSD"),
            ("Total Lost: 4.1M VUSD", 4_100_000.0, "VUSD"),
        ];
        for (line, amount, currency) in cases {
            let loss = parser.parse_loss(line).unwrap_or_else(|| panic!("no loss in {line:?}"));
            assert!(
                (loss.amount - amount).abs() < 1e-6,
                "{line:?} parsed {got}",
                got = loss.amount
            );
            assert_eq!(loss.currency, currency, "{line:?}");
        }
        assert_eq!(parser.parse_loss("no figures here"), None);
    }

    #[test]
    fn attack_labels_normalize_onto_canonical_categories() {
        let cases = [
            ("Reentrancy", "Reentrancy Attack"),
            ("read-only reentrancy", "Reentrancy Attack"),
            ("Flashloan price attack", "Flash Loan Attack"),
            ("Oracle Manipulation", "Price Manipulation"),
            ("Bussiness logic flaw", "Logic Flaw"),
            ("integer overflow", "Overflow"),
            ("exploit: private key leak", "Private Key Compromised"),
            ("Rugpull", "Social Engineering"),
        ];
        for (raw, expected) in cases {
            assert_eq!(
                normalize_attack_type(raw).as_deref(),
                Some(expected),
                "{raw:?}"
            );
        }
        // Unrecognized labels pass through title-cased.
        assert_eq!(
            normalize_attack_type("vault share dilution").as_deref(),
            Some("Vault Share Dilution")
        );
        assert_eq!(normalize_attack_type("   "), None);
    }
}
