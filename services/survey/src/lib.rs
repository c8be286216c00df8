//! Survey data model and query engine shared by the parser, the enricher and
//! the API.
//!
//! - `indicator`, `hierarchy`: the four-level indicator taxonomy and its
//!   in-memory traversal
//! - `area`: countries and regions
//! - `observation`, `ranking`: observations, ranking and rank changes
//! - `query`, `stats`: the read surface used by the API
//! - `store`, `db`: persistence

pub mod area;
pub mod db;
pub mod error;
pub mod hierarchy;
pub mod indicator;
pub mod observation;
pub mod query;
pub mod ranking;
pub mod stats;
pub mod store;

pub use area::{Area, AreaIndex};
pub use error::{Result, SurveyError};
pub use hierarchy::{IndicatorNode, IndicatorTree};
pub use indicator::{normalize_code, Indicator, IndicatorType};
pub use observation::{Observation, ObservationBatch, ObservationKey, SheetFamily};
pub use ranking::{RankKey, RankingPolicy};
pub use store::{FlushReport, MemoryObservationStore, ObservationStore};
