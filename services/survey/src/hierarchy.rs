//! In-memory indicator hierarchy and its query engine.
//!
//! The tree is loaded once (from the structure workbook during a parse run, or
//! from the database in the API) and answers every lookup and traversal the
//! resolver and the query surface need. Lookups fail with a typed error rather
//! than returning an empty result, so "no such indicator" is never confused
//! with "no children".

use std::collections::{BTreeMap, HashSet};

use serde::Serialize;

use crate::error::{Result, SurveyError};
use crate::indicator::{normalize_code, Indicator, IndicatorType};

/// An indicator with its children populated, depth first.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndicatorNode {
    #[serde(flatten)]
    pub indicator: Indicator,
    pub children: Vec<IndicatorNode>,
}

impl IndicatorNode {
    /// Pre-order walk: the node first, then each child subtree in order.
    pub fn flatten(&self) -> Vec<&Indicator> {
        let mut out = vec![&self.indicator];
        for child in &self.children {
            out.extend(child.flatten());
        }
        out
    }
}

#[derive(Debug, Clone, Default)]
pub struct IndicatorTree {
    by_code: BTreeMap<String, Indicator>,
}

impl IndicatorTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_code.is_empty()
    }

    /// Every stored indicator (orphans included), ordered by code.
    pub fn iter(&self) -> impl Iterator<Item = &Indicator> {
        self.by_code.values()
    }

    pub fn insert(&mut self, indicator: Indicator) -> Result<()> {
        let key = normalize_code(&indicator.code);
        if self.by_code.contains_key(&key) {
            return Err(SurveyError::DuplicateIndicator { code: key });
        }
        self.by_code.insert(key, indicator);
        Ok(())
    }

    /// Finds an indicator by code, case-insensitively.
    ///
    /// With a `kind`, the match must also have that type; when no code matches
    /// the indicators of that type are searched by normalized short name, so a
    /// subindex and a component sharing a display name can both be reached.
    pub fn find_by_code(&self, code: &str, kind: Option<IndicatorType>) -> Result<&Indicator> {
        let key = normalize_code(code);
        match (self.by_code.get(&key), kind) {
            (Some(found), None) => return Ok(found),
            (Some(found), Some(kind)) if found.kind == Some(kind) => return Ok(found),
            _ => {}
        }
        if let Some(kind) = kind {
            if let Some(found) = self
                .of_type(kind)
                .find(|i| normalize_code(i.header_name()) == key)
            {
                return Ok(found);
            }
        }
        Err(SurveyError::indicator_not_found(key))
    }

    /// Finds a component by its owning subindex and its short name, which is
    /// only unique within one subindex.
    pub fn find_component(&self, subindex: &str, short_name: &str) -> Result<&Indicator> {
        let subindex = self.find_by_code(subindex, Some(IndicatorType::Subindex))?;
        let wanted = normalize_code(short_name);
        self.find_children(subindex)
            .into_iter()
            .find(|c| c.code == wanted || normalize_code(c.header_name()) == wanted)
            .ok_or_else(|| SurveyError::indicator_not_found(format!("{}/{}", subindex.code, wanted)))
    }

    /// The single INDEX of the deployment.
    pub fn index(&self) -> Result<&Indicator> {
        self.of_type(IndicatorType::Index)
            .next()
            .ok_or_else(|| SurveyError::indicator_not_found(IndicatorType::Index.as_str()))
    }

    /// Direct children: subindices of the INDEX, components of a subindex,
    /// primary and secondary indicators of a component, nothing for leaves
    /// and orphans.
    pub fn find_children(&self, parent: &Indicator) -> Vec<&Indicator> {
        let Some(kind) = parent.kind else {
            return Vec::new();
        };
        let children = kind.child_types();
        self.by_code
            .values()
            .filter(|i| i.kind.is_some_and(|k| children.contains(&k)))
            .filter(|i| i.link(kind) == Some(parent.code.as_str()))
            .collect()
    }

    pub fn find_children_recursive(&self, parent: &Indicator) -> Vec<IndicatorNode> {
        self.find_children(parent)
            .into_iter()
            .map(|child| IndicatorNode {
                indicator: child.clone(),
                children: self.find_children_recursive(child),
            })
            .collect()
    }

    /// The whole tree rooted at the INDEX.
    pub fn tree(&self) -> Result<IndicatorNode> {
        let index = self.index()?;
        Ok(IndicatorNode {
            indicator: index.clone(),
            children: self.find_children_recursive(index),
        })
    }

    /// Stored indicators the tree rooted at the INDEX never reaches: orphans
    /// and typed indicators whose parent chain is broken.
    pub fn detached(&self) -> Result<Vec<&Indicator>> {
        let root = self.tree()?;
        let reached: HashSet<&str> = root.flatten().into_iter().map(|i| i.code.as_str()).collect();
        Ok(self
            .by_code
            .values()
            .filter(|i| !reached.contains(i.code.as_str()))
            .collect())
    }

    /// All indicators of `kind`, optionally restricted to descendants of
    /// `parent` through the parent's link column.
    pub fn find_by_level(
        &self,
        kind: IndicatorType,
        parent: Option<&Indicator>,
    ) -> Vec<&Indicator> {
        let link = match parent {
            None => None,
            Some(p) => match p.kind {
                Some(parent_kind) if !parent_kind.is_leaf() => Some((parent_kind, p.code.as_str())),
                _ => return Vec::new(),
            },
        };
        self.of_type(kind)
            .filter(|i| match link {
                None => true,
                Some((parent_kind, code)) => i.link(parent_kind) == Some(code),
            })
            .collect()
    }

    /// The indicator plus its descendants no deeper than `max_depth`.
    pub fn descendants_to_depth(&self, code: &str, max_depth: u8) -> Result<Vec<&Indicator>> {
        let root = self.find_by_code(code, None)?;
        let mut out = vec![root];
        let mut frontier = vec![root];
        while let Some(node) = frontier.pop() {
            for child in self.find_children(node) {
                if child.kind.is_some_and(|k| k.depth() <= max_depth) {
                    out.push(child);
                    frontier.push(child);
                }
            }
        }
        Ok(out)
    }

    /// Checks the hierarchy invariants: exactly one INDEX, no parent fields on
    /// it, and every other typed indicator's parent resolves to an indicator of
    /// the expected parent type.
    pub fn validate(&self) -> Result<()> {
        let indexes: Vec<_> = self.of_type(IndicatorType::Index).collect();
        if indexes.len() != 1 {
            return Err(SurveyError::BrokenHierarchy(format!(
                "expected exactly one INDEX, found {}",
                indexes.len()
            )));
        }
        let index = indexes[0];
        if index.index_code.is_some() || index.subindex_code.is_some() || index.component_code.is_some() {
            return Err(SurveyError::BrokenHierarchy(format!(
                "INDEX {} has parent codes",
                index.code
            )));
        }
        for indicator in self.by_code.values() {
            let Some(kind) = indicator.kind else { continue };
            let Some(parent_kind) = kind.parent_type() else { continue };
            let parent_code = indicator.parent_code().ok_or_else(|| {
                SurveyError::BrokenHierarchy(format!("{} {} has no parent", kind, indicator.code))
            })?;
            match self.by_code.get(parent_code) {
                Some(parent) if parent.kind == Some(parent_kind) => {}
                _ => {
                    return Err(SurveyError::BrokenHierarchy(format!(
                        "{} {} points at missing {} {}",
                        kind, indicator.code, parent_kind, parent_code
                    )))
                }
            }
        }
        Ok(())
    }

    fn of_type(&self, kind: IndicatorType) -> impl Iterator<Item = &Indicator> {
        self.by_code.values().filter(move |i| i.kind == Some(kind))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// ODB -> {READINESS, IMPACT}; READINESS -> {GOV_POLICIES, ENTREPRENEURS};
    /// IMPACT -> {POLITICAL_IMPACT}; leaves under each component. Both
    /// subindices own a component whose short name is "Policies".
    pub(crate) fn sample_tree() -> IndicatorTree {
        let mut tree = IndicatorTree::new();
        let odb = Some("ODB");
        tree.insert(Indicator::new("ODB", "Open Data Barometer", IndicatorType::Index))
            .unwrap();
        for sub in ["READINESS", "IMPACT"] {
            tree.insert(
                Indicator::new(sub, sub, IndicatorType::Subindex).with_parents(odb, None, None),
            )
            .unwrap();
        }
        let mut gov = Indicator::new("GOV_POLICIES", "Government policies", IndicatorType::Component)
            .with_parents(odb, Some("READINESS"), None);
        gov.short_name = Some("Policies".into());
        tree.insert(gov).unwrap();
        tree.insert(
            Indicator::new("ENTREPRENEURS", "Entrepreneurs", IndicatorType::Component)
                .with_parents(odb, Some("READINESS"), None),
        )
        .unwrap();
        let mut political = Indicator::new("POLITICAL_IMPACT", "Political impact", IndicatorType::Component)
            .with_parents(odb, Some("IMPACT"), None);
        political.short_name = Some("Policies".into());
        tree.insert(political).unwrap();
        tree.insert(
            Indicator::new("GOV_POL", "Government policy score", IndicatorType::Primary)
                .with_parents(odb, Some("READINESS"), Some("GOV_POLICIES")),
        )
        .unwrap();
        tree.insert(
            Indicator::new("WEF_GOV", "WEF government", IndicatorType::Secondary)
                .with_parents(odb, Some("READINESS"), Some("GOV_POLICIES")),
        )
        .unwrap();
        tree.insert(
            Indicator::new("ENT_TRAIN", "Training", IndicatorType::Primary)
                .with_parents(odb, Some("READINESS"), Some("ENTREPRENEURS")),
        )
        .unwrap();
        tree.insert(
            Indicator::new("IMPACT_POL", "Accountability", IndicatorType::Primary)
                .with_parents(odb, Some("IMPACT"), Some("POLITICAL_IMPACT")),
        )
        .unwrap();
        tree
    }

    fn codes(indicators: &[&Indicator]) -> Vec<String> {
        indicators.iter().map(|i| i.code.clone()).collect()
    }

    #[test]
    fn test_insert_rejects_duplicate_code_case_insensitively() {
        let mut tree = sample_tree();
        let err = tree
            .insert(Indicator::new("gov_pol", "Again", IndicatorType::Primary))
            .unwrap_err();
        assert!(matches!(err, SurveyError::DuplicateIndicator { ref code } if code == "GOV_POL"));
    }

    #[test]
    fn test_find_by_code() {
        let tree = sample_tree();
        assert_eq!(tree.find_by_code("gov_pol", None).unwrap().code, "GOV_POL");
        assert_eq!(
            tree.find_by_code("Readiness", Some(IndicatorType::Subindex)).unwrap().code,
            "READINESS"
        );
        assert!(matches!(
            tree.find_by_code("READINESS", Some(IndicatorType::Component)),
            Err(SurveyError::IndicatorNotFound { .. })
        ));
        assert!(matches!(
            tree.find_by_code("ZZZ999", None),
            Err(SurveyError::IndicatorNotFound { .. })
        ));
    }

    #[test]
    fn test_find_by_code_falls_back_to_short_name_within_type() {
        let mut tree = sample_tree();
        let mut sub = Indicator::new("ODB_IMPLEMENTATION", "Implementation", IndicatorType::Subindex)
            .with_parents(Some("ODB"), None, None);
        sub.short_name = Some("Implementation".into());
        tree.insert(sub).unwrap();
        let mut comp = Indicator::new("IMPL_COMP", "Implementation", IndicatorType::Component)
            .with_parents(Some("ODB"), Some("ODB_IMPLEMENTATION"), None);
        comp.short_name = Some("Implementation".into());
        tree.insert(comp).unwrap();

        assert_eq!(
            tree.find_by_code("implementation", Some(IndicatorType::Subindex)).unwrap().code,
            "ODB_IMPLEMENTATION"
        );
        assert_eq!(
            tree.find_by_code("implementation", Some(IndicatorType::Component)).unwrap().code,
            "IMPL_COMP"
        );
    }

    #[test]
    fn test_find_component_disambiguates_by_subindex() {
        let tree = sample_tree();
        assert_eq!(tree.find_component("Readiness", "Policies").unwrap().code, "GOV_POLICIES");
        assert_eq!(tree.find_component("IMPACT", "policies").unwrap().code, "POLITICAL_IMPACT");
        assert!(tree.find_component("IMPACT", "Entrepreneurs").is_err());
        assert!(tree.find_component("NOPE", "Policies").is_err());
    }

    #[test]
    fn test_find_children_per_level() {
        let tree = sample_tree();
        let index = tree.index().unwrap();
        assert_eq!(codes(&tree.find_children(index)), vec!["IMPACT", "READINESS"]);

        let readiness = tree.find_by_code("READINESS", None).unwrap();
        assert_eq!(codes(&tree.find_children(readiness)), vec!["ENTREPRENEURS", "GOV_POLICIES"]);

        let gov = tree.find_by_code("GOV_POLICIES", None).unwrap();
        assert_eq!(codes(&tree.find_children(gov)), vec!["GOV_POL", "WEF_GOV"]);

        let leaf = tree.find_by_code("GOV_POL", None).unwrap();
        assert!(tree.find_children(leaf).is_empty());
    }

    #[test]
    fn test_children_point_back_at_parent_on_every_level() {
        let tree = sample_tree();
        for indicator in tree.iter() {
            for child in tree.find_children(indicator) {
                assert_eq!(child.parent_code(), Some(indicator.code.as_str()));
            }
        }
        tree.validate().unwrap();
    }

    #[test]
    fn test_orphans_are_invisible_to_traversal() {
        let mut tree = sample_tree();
        let mut orphan = Indicator::orphan("ZZZ999");
        orphan.component_code = Some("GOV_POLICIES".into());
        tree.insert(orphan).unwrap();

        let gov = tree.find_by_code("GOV_POLICIES", None).unwrap();
        assert_eq!(codes(&tree.find_children(gov)), vec!["GOV_POL", "WEF_GOV"]);
        assert!(tree.find_by_code("zzz999", None).unwrap().is_orphan());
        let all: Vec<_> = tree.tree().unwrap().flatten().into_iter().map(|i| i.code.clone()).collect();
        assert!(!all.contains(&"ZZZ999".to_string()));
    }

    #[test]
    fn test_detached_lists_what_the_tree_misses() {
        let mut tree = sample_tree();
        assert!(tree.detached().unwrap().is_empty());

        tree.insert(Indicator::orphan("DATASET_ASSESSMENT")).unwrap();
        tree.insert(
            Indicator::new("LOST", "Lost", IndicatorType::Primary).with_parents(
                Some("ODB"),
                Some("READINESS"),
                Some("NO_SUCH_COMPONENT"),
            ),
        )
        .unwrap();
        assert_eq!(codes(&tree.detached().unwrap()), vec!["DATASET_ASSESSMENT", "LOST"]);
    }

    #[test]
    fn test_recursive_children_cover_whole_tree() {
        let tree = sample_tree();
        let root = tree.tree().unwrap();
        assert_eq!(root.indicator.code, "ODB");
        assert_eq!(root.children.len(), 2);
        assert_eq!(root.flatten().len(), tree.len());
    }

    #[test]
    fn test_find_by_level() {
        let tree = sample_tree();
        assert_eq!(tree.find_by_level(IndicatorType::Component, None).len(), 3);

        let readiness = tree.find_by_code("READINESS", None).unwrap();
        assert_eq!(
            codes(&tree.find_by_level(IndicatorType::Primary, Some(readiness))),
            vec!["ENT_TRAIN", "GOV_POL"]
        );

        let index = tree.index().unwrap();
        assert_eq!(tree.find_by_level(IndicatorType::Subindex, Some(index)).len(), 2);

        let leaf = tree.find_by_code("GOV_POL", None).unwrap();
        assert!(tree.find_by_level(IndicatorType::Primary, Some(leaf)).is_empty());
    }

    #[test]
    fn test_descendants_to_depth() {
        let tree = sample_tree();
        let to_components = tree.descendants_to_depth("ODB", IndicatorType::Component.depth()).unwrap();
        assert_eq!(to_components.len(), 6);
        let everything = tree.descendants_to_depth("ODB", IndicatorType::Primary.depth()).unwrap();
        assert_eq!(everything.len(), tree.len());
        let single = tree.descendants_to_depth("GOV_POL", 3).unwrap();
        assert_eq!(codes(&single), vec!["GOV_POL"]);
    }

    #[test]
    fn test_validate_detects_broken_parent() {
        let mut tree = sample_tree();
        tree.insert(
            Indicator::new("LOST", "Lost", IndicatorType::Primary)
                .with_parents(Some("ODB"), Some("READINESS"), Some("MISSING")),
        )
        .unwrap();
        assert!(matches!(tree.validate(), Err(SurveyError::BrokenHierarchy(_))));

        let mut two = sample_tree();
        two.insert(Indicator::new("ODB2", "Second", IndicatorType::Index)).unwrap();
        assert!(two.validate().is_err());
    }
}
