//! Indicator model and the four-level type taxonomy.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SurveyError;

/// Level of an indicator in the hierarchy, root to leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IndicatorType {
    Index,
    Subindex,
    Component,
    Primary,
    Secondary,
}

/// Parent-link table: which code column a child row uses to point at a parent
/// of the given type. Leaves have no children and therefore no link column.
const LINK_COLUMNS: &[(IndicatorType, &str)] = &[
    (IndicatorType::Index, "index_code"),
    (IndicatorType::Subindex, "subindex_code"),
    (IndicatorType::Component, "component_code"),
];

impl IndicatorType {
    pub const ALL: [IndicatorType; 5] = [
        IndicatorType::Index,
        IndicatorType::Subindex,
        IndicatorType::Component,
        IndicatorType::Primary,
        IndicatorType::Secondary,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Index => "INDEX",
            Self::Subindex => "SUBINDEX",
            Self::Component => "COMPONENT",
            Self::Primary => "PRIMARY",
            Self::Secondary => "SECONDARY",
        }
    }

    /// 0 for the INDEX, 3 for primary/secondary indicators.
    pub fn depth(self) -> u8 {
        match self {
            Self::Index => 0,
            Self::Subindex => 1,
            Self::Component => 2,
            Self::Primary | Self::Secondary => 3,
        }
    }

    pub fn parent_type(self) -> Option<IndicatorType> {
        match self {
            Self::Index => None,
            Self::Subindex => Some(Self::Index),
            Self::Component => Some(Self::Subindex),
            Self::Primary | Self::Secondary => Some(Self::Component),
        }
    }

    pub fn child_types(self) -> &'static [IndicatorType] {
        match self {
            Self::Index => &[Self::Subindex],
            Self::Subindex => &[Self::Component],
            Self::Component => &[Self::Primary, Self::Secondary],
            Self::Primary | Self::Secondary => &[],
        }
    }

    /// Column that children of an indicator of this type fill with its code.
    pub fn link_column(self) -> Option<&'static str> {
        LINK_COLUMNS
            .iter()
            .find(|(kind, _)| *kind == self)
            .map(|(_, column)| *column)
    }

    pub fn is_leaf(self) -> bool {
        self.child_types().is_empty()
    }
}

impl fmt::Display for IndicatorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IndicatorType {
    type Err = SurveyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "INDEX" => Ok(Self::Index),
            "SUBINDEX" | "SUB-INDEX" | "SUB INDEX" => Ok(Self::Subindex),
            "COMPONENT" => Ok(Self::Component),
            "PRIMARY" => Ok(Self::Primary),
            "SECONDARY" => Ok(Self::Secondary),
            other => Err(SurveyError::InvalidIndicatorType(other.to_string())),
        }
    }
}

/// Normalizes a code or short name to upper-snake form: upper-cased, spaces
/// and hyphens to `_`, other punctuation dropped, runs of `_` collapsed.
pub fn normalize_code(raw: &str) -> String {
    let mut code = String::with_capacity(raw.len());
    for c in raw.trim().chars() {
        let mapped = match c {
            ' ' | '-' | '\u{2013}' | '\u{2014}' | '_' => Some('_'),
            c if c.is_alphanumeric() => Some(c),
            _ => None,
        };
        match mapped {
            Some('_') if code.is_empty() || code.ends_with('_') => {}
            Some(c) => code.extend(c.to_uppercase()),
            None => {}
        }
    }
    while code.ends_with('_') {
        code.pop();
    }
    code
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Indicator {
    pub code: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub short_name: Option<String>,
    /// `None` only for orphans synthesized from data columns.
    #[serde(rename = "type")]
    pub kind: Option<IndicatorType>,
    pub index_code: Option<String>,
    pub subindex_code: Option<String>,
    pub component_code: Option<String>,
    pub description: Option<String>,
    pub units: Option<String>,
    pub provider_name: Option<String>,
    pub provider_url: Option<String>,
    pub source_name: Option<String>,
    pub source_url: Option<String>,
    pub source_data: Option<String>,
    pub license: Option<String>,
    pub range: Option<String>,
    pub format_notes: Option<String>,
    pub tags: Option<String>,
    pub weight: Option<f64>,
}

impl Indicator {
    pub fn new(code: &str, name: impl Into<String>, kind: IndicatorType) -> Self {
        Self {
            code: normalize_code(code),
            name: name.into(),
            kind: Some(kind),
            ..Default::default()
        }
    }

    /// Placeholder for a code referenced by data but absent from the hierarchy.
    pub fn orphan(code: &str) -> Self {
        let code = normalize_code(code);
        Self {
            name: code.clone(),
            code,
            ..Default::default()
        }
    }

    pub fn with_parents(
        mut self,
        index: Option<&str>,
        subindex: Option<&str>,
        component: Option<&str>,
    ) -> Self {
        self.index_code = index.map(normalize_code);
        self.subindex_code = subindex.map(normalize_code);
        self.component_code = component.map(normalize_code);
        self
    }

    pub fn is_orphan(&self) -> bool {
        self.kind.is_none()
    }

    /// Code this indicator stores in the link column of a `parent_kind` ancestor.
    pub fn link(&self, parent_kind: IndicatorType) -> Option<&str> {
        match parent_kind {
            IndicatorType::Index => self.index_code.as_deref(),
            IndicatorType::Subindex => self.subindex_code.as_deref(),
            IndicatorType::Component => self.component_code.as_deref(),
            IndicatorType::Primary | IndicatorType::Secondary => None,
        }
    }

    /// Code of the direct parent, following the parent-link table.
    pub fn parent_code(&self) -> Option<&str> {
        self.kind
            .and_then(IndicatorType::parent_type)
            .and_then(|parent| self.link(parent))
    }

    /// Name used to match spreadsheet headers: the short name when present.
    pub fn header_name(&self) -> &str {
        self.short_name.as_deref().unwrap_or(&self.name)
    }
}
