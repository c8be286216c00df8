//! Column classifier for structure sheets.
//!
//! Header templates such as `"{code} - Scaled"` or `"{subindex}: {code}"` are
//! compiled into anchored, case-insensitive regexes. Dashes and runs of
//! whitespace are normalized on both sides, so `"READINESS – SCALED"` matches
//! `"{code} - Scaled"`. A header that matches nothing is not an error; it is
//! simply not a data column.

use std::collections::BTreeMap;

use regex::Regex;
use survey::IndicatorType;

use crate::config::{HeaderPatterns, StructureObservations, DEFAULT_PATTERNS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PatternFamily {
    IndexScaled,
    SubindexScaled,
    SubindexRank,
    SubindexValue,
    ComponentScaled,
    ComponentValue,
}

/// What a matched column carries for its indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnRole {
    Scaled,
    Rank,
    Value,
}

impl PatternFamily {
    /// Precedence for [`Classifier::classify_any`]: families whose templates
    /// carry more literal structure are tried first.
    pub const PRECEDENCE: [PatternFamily; 6] = [
        PatternFamily::IndexScaled,
        PatternFamily::ComponentScaled,
        PatternFamily::ComponentValue,
        PatternFamily::SubindexScaled,
        PatternFamily::SubindexRank,
        PatternFamily::SubindexValue,
    ];

    pub fn template(self, patterns: &HeaderPatterns) -> &str {
        match self {
            Self::IndexScaled => &patterns.index_scaled,
            Self::SubindexScaled => &patterns.subindex_scaled,
            Self::SubindexRank => &patterns.subindex_rank,
            Self::SubindexValue => &patterns.subindex_value,
            Self::ComponentScaled => &patterns.component_scaled,
            Self::ComponentValue => &patterns.component_value,
        }
    }

    pub fn level(self) -> IndicatorType {
        match self {
            Self::IndexScaled => IndicatorType::Index,
            Self::SubindexScaled | Self::SubindexRank | Self::SubindexValue => IndicatorType::Subindex,
            Self::ComponentScaled | Self::ComponentValue => IndicatorType::Component,
        }
    }

    pub fn role(self) -> ColumnRole {
        match self {
            Self::IndexScaled | Self::SubindexScaled | Self::ComponentScaled => ColumnRole::Scaled,
            Self::SubindexRank => ColumnRole::Rank,
            Self::SubindexValue | Self::ComponentValue => ColumnRole::Value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMatch {
    pub family: PatternFamily,
    /// Short name of the indicator, absent when the template has no `{code}`.
    pub code: Option<String>,
    /// Short name of the owning subindex, for component headers.
    pub subindex: Option<String>,
}

fn normalize_header(raw: &str) -> String {
    let dashed: String = raw
        .chars()
        .map(|c| match c {
            '\u{2010}'..='\u{2015}' | '\u{2212}' => '-',
            c => c,
        })
        .collect();
    dashed.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Whether a template has text of its own besides placeholders. A bare
/// `{code}` would claim every header in the sheet.
pub fn has_literal_text(template: &str) -> bool {
    template
        .replace("{code}", "")
        .replace("{subindex}", "")
        .chars()
        .any(|c| !c.is_whitespace())
}

/// Turns a header template into an anchored, case-insensitive regex.
fn compile_template(template: &str) -> Result<Regex, regex::Error> {
    let normalized = normalize_header(template);
    let mut pattern = String::from("(?i)^");
    let mut rest = normalized.as_str();
    while !rest.is_empty() {
        if let Some(after) = rest.strip_prefix("{code}") {
            pattern.push_str(r"(?P<code>.+?)");
            rest = after;
        } else if let Some(after) = rest.strip_prefix("{subindex}") {
            pattern.push_str(r"(?P<subindex>.+?)");
            rest = after;
        } else {
            let mut chars = rest.chars();
            let c = chars.next().unwrap_or_default();
            if c == ' ' {
                pattern.push_str(r"\s*");
            } else {
                pattern.push_str(&regex::escape(c.encode_utf8(&mut [0; 4])));
            }
            rest = chars.as_str();
        }
    }
    pattern.push('$');
    Regex::new(&pattern)
}

/// Compiled templates for one survey edition.
#[derive(Debug, Clone)]
pub struct Classifier {
    patterns: BTreeMap<PatternFamily, Regex>,
}

impl Classifier {
    pub fn compile(patterns: &HeaderPatterns) -> Result<Self, regex::Error> {
        let mut compiled = BTreeMap::new();
        for family in PatternFamily::PRECEDENCE {
            compiled.insert(family, compile_template(family.template(patterns))?);
        }
        Ok(Self { patterns: compiled })
    }

    pub fn classify(&self, header: &str, family: PatternFamily) -> Option<ColumnMatch> {
        let header = normalize_header(header);
        if header.is_empty() {
            return None;
        }
        let captures = self.patterns.get(&family)?.captures(&header)?;
        let group = |name: &str| {
            captures
                .name(name)
                .map(|m| m.as_str().trim().to_string())
                .filter(|s| !s.is_empty())
        };
        let code = group("code");
        let subindex = group("subindex");
        if family.level() != IndicatorType::Index && code.is_none() {
            return None;
        }
        if family.level() == IndicatorType::Component && subindex.is_none() {
            return None;
        }
        Some(ColumnMatch { family, code, subindex })
    }

    /// First family, in precedence order, that matches the header.
    pub fn classify_any(&self, header: &str) -> Option<ColumnMatch> {
        PatternFamily::PRECEDENCE
            .into_iter()
            .find_map(|family| self.classify(header, family))
    }
}

/// One classifier per configured year plus the default.
#[derive(Debug, Clone)]
pub struct ClassifierSet {
    by_key: BTreeMap<String, Classifier>,
}

impl ClassifierSet {
    pub fn from_config(config: &StructureObservations) -> Result<Self, regex::Error> {
        let mut by_key = BTreeMap::new();
        for (key, patterns) in &config.patterns {
            by_key.insert(key.clone(), Classifier::compile(patterns)?);
        }
        Ok(Self { by_key })
    }

    /// The year's own templates, else the default ones. Sheets without a
    /// year in their name use the default.
    pub fn for_year(&self, year: Option<i32>) -> Option<&Classifier> {
        year.and_then(|y| self.by_key.get(&y.to_string()))
            .or_else(|| self.by_key.get(DEFAULT_PATTERNS))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn patterns() -> HeaderPatterns {
        HeaderPatterns {
            index_scaled: "ODB - Scaled".into(),
            subindex_scaled: "{code} - Scaled".into(),
            subindex_rank: "{code} Rank".into(),
            subindex_value: "{code} Score".into(),
            component_scaled: "{subindex}: {code} - Scaled".into(),
            component_value: "{subindex}: {code} Score".into(),
        }
    }

    fn edition_2013() -> HeaderPatterns {
        HeaderPatterns {
            index_scaled: "Index (scaled)".into(),
            subindex_scaled: "{code} (scaled)".into(),
            subindex_rank: "{code} ranking".into(),
            subindex_value: "{code} (raw)".into(),
            component_scaled: "{subindex} / {code} (scaled)".into(),
            component_value: "{subindex} / {code} (raw)".into(),
        }
    }

    fn matched(classifier: &Classifier, header: &str, family: PatternFamily) -> (Option<String>, Option<String>) {
        let m = classifier
            .classify(header, family)
            .unwrap_or_else(|| panic!("{header} should match {family:?}"));
        (m.code, m.subindex)
    }

    #[test]
    fn test_each_family_extracts_codes() {
        let c = Classifier::compile(&patterns()).unwrap();
        assert_eq!(matched(&c, "ODB - Scaled", PatternFamily::IndexScaled), (None, None));
        assert_eq!(
            matched(&c, "READINESS – SCALED", PatternFamily::SubindexScaled),
            (Some("READINESS".into()), None)
        );
        assert_eq!(
            matched(&c, "Readiness Rank", PatternFamily::SubindexRank),
            (Some("Readiness".into()), None)
        );
        assert_eq!(
            matched(&c, "Impact  score", PatternFamily::SubindexValue),
            (Some("Impact".into()), None)
        );
        assert_eq!(
            matched(&c, "Readiness: Gov. Policies - Scaled", PatternFamily::ComponentScaled),
            (Some("Gov. Policies".into()), Some("Readiness".into()))
        );
        assert_eq!(
            matched(&c, "Impact: Policies Score", PatternFamily::ComponentValue),
            (Some("Policies".into()), Some("Impact".into()))
        );
    }

    #[test]
    fn test_other_edition_wording() {
        let c = Classifier::compile(&edition_2013()).unwrap();
        assert_eq!(
            matched(&c, "Readiness (Scaled)", PatternFamily::SubindexScaled),
            (Some("Readiness".into()), None)
        );
        assert_eq!(
            matched(&c, "Readiness / Entrepreneurs (raw)", PatternFamily::ComponentValue),
            (Some("Entrepreneurs".into()), Some("Readiness".into()))
        );
        assert!(c.classify("READINESS - Scaled", PatternFamily::SubindexScaled).is_none());
    }

    #[test]
    fn test_notes_matches_no_family() {
        for c in [
            Classifier::compile(&patterns()).unwrap(),
            Classifier::compile(&edition_2013()).unwrap(),
        ] {
            for family in PatternFamily::PRECEDENCE {
                assert!(c.classify("Notes", family).is_none(), "{family:?}");
            }
            assert!(c.classify_any("Notes").is_none());
            assert!(c.classify_any("").is_none());
        }
    }

    #[test]
    fn test_classify_any_prefers_component_over_subindex() {
        let c = Classifier::compile(&patterns()).unwrap();
        let m = c.classify_any("Readiness: Entrepreneurs - Scaled").unwrap();
        assert_eq!(m.family, PatternFamily::ComponentScaled);
        let m = c.classify_any("Readiness - Scaled").unwrap();
        assert_eq!(m.family, PatternFamily::SubindexScaled);
        assert_eq!(m.family.role(), ColumnRole::Scaled);
        assert_eq!(c.classify_any("Readiness Rank").unwrap().family.role(), ColumnRole::Rank);
    }

    #[test]
    fn test_literal_text_detection() {
        assert!(has_literal_text("{code} Score"));
        assert!(has_literal_text("{subindex}: {code}"));
        assert!(has_literal_text("ODB-Scaled"));
        assert!(!has_literal_text("{code}"));
        assert!(!has_literal_text(" {subindex} {code} "));
    }

    #[test]
    fn test_template_literals_are_escaped() {
        let c = Classifier::compile(&edition_2013()).unwrap();
        assert!(c.classify("Index xscaledx", PatternFamily::IndexScaled).is_none());
        assert!(c.classify("index (scaled)", PatternFamily::IndexScaled).is_some());
    }
}
