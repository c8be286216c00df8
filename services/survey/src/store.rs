//! Observation store seam: the Postgres repository in production, an
//! in-memory map for tests and dry runs.

use std::collections::BTreeMap;

use crate::error::{Result, SurveyError};
use crate::observation::{compute_rank_changes, Observation, ObservationKey, SheetFamily};

/// Outcome of flushing one sheet family.
#[derive(Debug)]
pub struct FlushReport {
    pub family: SheetFamily,
    pub inserted: usize,
    /// One `ObservationPersistence` per observation the store refused.
    pub rejected: Vec<SurveyError>,
}

impl FlushReport {
    pub fn new(family: SheetFamily) -> Self {
        Self {
            family,
            inserted: 0,
            rejected: Vec::new(),
        }
    }
}

#[allow(async_fn_in_trait)]
pub trait ObservationStore {
    /// Persists one sheet family atomically. Key conflicts with rows already
    /// stored are reported in the returned report; any other failure leaves
    /// the store untouched.
    async fn flush(&mut self, family: SheetFamily, observations: Vec<Observation>) -> Result<FlushReport>;

    /// Recomputes `rank_change` over everything stored. Returns how many
    /// observations ended up with a change.
    async fn update_rank_changes(&mut self) -> Result<u64>;

    async fn count(&self) -> Result<u64>;
}

#[derive(Debug, Default)]
pub struct MemoryObservationStore {
    rows: BTreeMap<ObservationKey, Observation>,
}

impl MemoryObservationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &ObservationKey) -> Option<&Observation> {
        self.rows.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Observation> {
        self.rows.values()
    }
}

impl ObservationStore for MemoryObservationStore {
    async fn flush(&mut self, family: SheetFamily, observations: Vec<Observation>) -> Result<FlushReport> {
        let mut report = FlushReport::new(family);
        for observation in observations {
            let key = observation.key();
            if self.rows.contains_key(&key) {
                report.rejected.push(SurveyError::ObservationPersistence { key });
                continue;
            }
            self.rows.insert(key, observation);
            report.inserted += 1;
        }
        Ok(report)
    }

    async fn update_rank_changes(&mut self) -> Result<u64> {
        let mut all: Vec<Observation> = self.rows.values().cloned().collect();
        let updated = compute_rank_changes(&mut all);
        for observation in all {
            self.rows.insert(observation.key(), observation);
        }
        Ok(updated as u64)
    }

    async fn count(&self) -> Result<u64> {
        Ok(self.rows.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(area: &str, year: i32, rank: i32) -> Observation {
        let mut o = Observation::new("GOV_POL", area, year, Some(0.5));
        o.rank = Some(rank);
        o
    }

    #[tokio::test]
    async fn test_flush_rejects_stored_keys() {
        let mut store = MemoryObservationStore::new();
        let first = store
            .flush(SheetFamily::Raw, vec![obs("FRA", 2015, 1), obs("ESP", 2015, 2)])
            .await
            .unwrap();
        assert_eq!(first.inserted, 2);
        assert!(first.rejected.is_empty());

        let second = store
            .flush(SheetFamily::Raw, vec![obs("FRA", 2015, 9)])
            .await
            .unwrap();
        assert_eq!(second.inserted, 0);
        assert!(matches!(
            second.rejected[0],
            SurveyError::ObservationPersistence { ref key } if key.area_code == "FRA"
        ));
        assert_eq!(store.count().await.unwrap(), 2);
        assert_eq!(store.get(&obs("FRA", 2015, 0).key()).unwrap().rank, Some(1));
    }

    #[tokio::test]
    async fn test_rank_changes_over_stored_years() {
        let mut store = MemoryObservationStore::new();
        store
            .flush(SheetFamily::Raw, vec![obs("FRA", 2014, 4), obs("FRA", 2015, 1)])
            .await
            .unwrap();
        assert_eq!(store.update_rank_changes().await.unwrap(), 1);
        let changes: Vec<_> = store.iter().map(|o| o.rank_change).collect();
        assert_eq!(changes, vec![None, Some(3)]);
    }
}
