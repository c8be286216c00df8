//! Observations and the cross-year rank-change pass.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SurveyError};

/// The sheet family an observation was resolved from; each family is flushed
/// in its own transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SheetFamily {
    Raw,
    Structure,
    Dataset,
}

impl SheetFamily {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Structure => "structure",
            Self::Dataset => "dataset",
        }
    }
}

impl fmt::Display for SheetFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, sqlx::FromRow)]
pub struct Observation {
    pub indicator_code: String,
    pub area_code: String,
    /// Set only for dataset breakdown observations.
    pub dataset_indicator_code: Option<String>,
    pub year: i32,
    pub value: Option<f64>,
    /// Ranking key on structure sheets.
    pub scaled: Option<f64>,
    pub rank: Option<i32>,
    pub rank_change: Option<i32>,
}

impl Observation {
    pub fn new(indicator_code: &str, area_code: &str, year: i32, value: Option<f64>) -> Self {
        Self {
            indicator_code: indicator_code.to_string(),
            area_code: area_code.to_string(),
            year,
            value,
            ..Default::default()
        }
    }

    pub fn key(&self) -> ObservationKey {
        ObservationKey {
            indicator_code: self.indicator_code.clone(),
            area_code: self.area_code.clone(),
            year: self.year,
            dataset_indicator_code: self.dataset_indicator_code.clone(),
        }
    }

    pub fn is_dataset(&self) -> bool {
        self.dataset_indicator_code.is_some()
    }
}

/// Unique key of an observation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObservationKey {
    pub indicator_code: String,
    pub area_code: String,
    pub year: i32,
    pub dataset_indicator_code: Option<String>,
}

impl fmt::Display for ObservationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.indicator_code, self.area_code, self.year)?;
        if let Some(dataset) = &self.dataset_indicator_code {
            write!(f, "/{}", dataset)?;
        }
        Ok(())
    }
}

/// Observations of one sheet family, unique by key, first one wins.
#[derive(Debug, Default)]
pub struct ObservationBatch {
    seen: HashSet<ObservationKey>,
    observations: Vec<Observation>,
}

impl ObservationBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends the observation unless its key is already present.
    pub fn push(&mut self, observation: Observation) -> Result<()> {
        let key = observation.key();
        if !self.seen.insert(key.clone()) {
            return Err(SurveyError::DuplicateObservation { key });
        }
        self.observations.push(observation);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    pub fn as_slice(&self) -> &[Observation] {
        &self.observations
    }

    pub fn into_vec(self) -> Vec<Observation> {
        self.observations
    }
}

/// Fills `rank_change = previous.rank - current.rank` for every ranked,
/// non-dataset observation, where `previous` is the observation of the same
/// (indicator, area) in the latest earlier year. Positive means the area
/// climbed. Returns how many observations got a change.
pub fn compute_rank_changes(observations: &mut [Observation]) -> usize {
    let mut ranks: HashMap<(String, String), BTreeMap<i32, Option<i32>>> = HashMap::new();
    for o in observations.iter().filter(|o| !o.is_dataset()) {
        ranks
            .entry((o.indicator_code.clone(), o.area_code.clone()))
            .or_default()
            .insert(o.year, o.rank);
    }

    let mut updated = 0;
    for o in observations.iter_mut() {
        if o.is_dataset() {
            o.rank_change = None;
            continue;
        }
        let previous = ranks
            .get(&(o.indicator_code.clone(), o.area_code.clone()))
            .and_then(|years| years.range(..o.year).next_back())
            .and_then(|(_, rank)| *rank);
        o.rank_change = match (previous, o.rank) {
            (Some(prev), Some(current)) => Some(prev - current),
            _ => None,
        };
        if o.rank_change.is_some() {
            updated += 1;
        }
    }
    updated
}
