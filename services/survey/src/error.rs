//! Error taxonomy shared by the parser, the enricher and the API.
//!
//! Lookup misses (`IndicatorNotFound`, `AreaNotFound`) are expected during a
//! parse run and are handled by the caller; only database failures are fatal.

use thiserror::Error;

use crate::observation::ObservationKey;

#[derive(Error, Debug)]
pub enum SurveyError {
    #[error("No indicator with code {code}")]
    IndicatorNotFound { code: String },

    #[error("No area with code {code}")]
    AreaNotFound { code: String },

    #[error("Indicator {code} already exists")]
    DuplicateIndicator { code: String },

    #[error("Duplicate observation {key}")]
    DuplicateObservation { key: ObservationKey },

    #[error("Observation {key} violates the unique constraint")]
    ObservationPersistence { key: ObservationKey },

    #[error("Invalid year filter '{0}'")]
    InvalidYearFilter(String),

    #[error("Invalid indicator type '{0}'")]
    InvalidIndicatorType(String),

    #[error("Invalid tree level '{0}'")]
    InvalidTreeLevel(String),

    #[error("Broken indicator hierarchy: {0}")]
    BrokenHierarchy(String),

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl SurveyError {
    pub fn indicator_not_found(code: impl Into<String>) -> Self {
        Self::IndicatorNotFound { code: code.into() }
    }

    pub fn area_not_found(code: impl Into<String>) -> Self {
        Self::AreaNotFound { code: code.into() }
    }

    /// True for lookup misses the API reports as 404.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::IndicatorNotFound { .. } | Self::AreaNotFound { .. }
        )
    }

    /// True for malformed client input the API reports as 400.
    pub fn is_bad_request(&self) -> bool {
        matches!(
            self,
            Self::InvalidYearFilter(_) | Self::InvalidIndicatorType(_) | Self::InvalidTreeLevel(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SurveyError>;
