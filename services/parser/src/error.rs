//! Sheet-level failures and companion-column warnings.

use thiserror::Error;

/// A structural problem that aborts one sheet, never the whole run.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SheetError {
    #[error("Sheet '{sheet}' has no INDEX column matching the configured pattern")]
    MissingIndexColumn { sheet: String },

    #[error("Sheet '{sheet}' has no year in its name and no year column")]
    MissingYear { sheet: String },

    #[error("No header patterns configured for sheet '{sheet}'")]
    MissingPatterns { sheet: String },

    #[error("Sheet '{sheet}' references an INDEX column but the hierarchy has no INDEX")]
    MissingIndexIndicator { sheet: String },
}

/// A structure sheet group lacking one of its companion columns. Logged, the
/// group is still resolved with what is available.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CompanionColumn {
    #[error("Sheet '{sheet}': no rank column for {indicator}")]
    MissingRankColumn { sheet: String, indicator: String },

    #[error("Sheet '{sheet}': no value column for {indicator}")]
    MissingValueColumn { sheet: String, indicator: String },
}
