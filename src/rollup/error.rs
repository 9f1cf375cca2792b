use thiserror::Error;

/// Errors raised by the rollup core.
///
/// Configuration variants surface once at setup and prevent the engine from
/// being installed. Timestamp variants are per-event and only skip the event
/// for the affected series.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RollupError {
    #[error("series name is required")]
    MissingSeriesName,

    #[error("series {series}: at least one resolution is required")]
    NoResolutions { series: String },

    #[error("unknown resolution: {label} (expected minute, hour, day or month)")]
    UnknownResolution { label: String },

    #[error("series {series}: key spec must not be empty")]
    EmptyKeySpec { series: String },

    #[error("series {series}: invalid key field {field} (must be 1, true or a derivation)")]
    InvalidKeyField { series: String, field: String },

    #[error("series {series}: invalid channel {channel}: {reason}")]
    InvalidChannel {
        series: String,
        channel: String,
        reason: &'static str,
    },

    #[error("series {series} is registered more than once")]
    DuplicateSeries { series: String },

    #[error("unknown series: {series}")]
    UnknownSeries { series: String },

    #[error("series {series}: event has no timestamp in field {field}")]
    MissingTimestamp { series: String, field: String },

    #[error("series {series}: event field {field} is not a timestamp")]
    InvalidTimestamp { series: String, field: String },

    #[error("conflicting operations on field {path}")]
    ConflictingFieldOp { path: String },
}

impl RollupError {
    /// Returns true for errors that only affect a single event.
    pub fn is_per_event(&self) -> bool {
        matches!(
            self,
            Self::MissingTimestamp { .. } | Self::InvalidTimestamp { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_per_event_classification() {
        let missing = RollupError::MissingTimestamp {
            series: "pageviews".to_string(),
            field: "occurredAt".to_string(),
        };
        assert!(missing.is_per_event());

        let cfg = RollupError::NoResolutions {
            series: "pageviews".to_string(),
        };
        assert!(!cfg.is_per_event());
    }

    #[test]
    fn test_error_messages_name_the_series() {
        let err = RollupError::InvalidKeyField {
            series: "pageviews".to_string(),
            field: "url".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("pageviews"));
        assert!(msg.contains("url"));
    }
}
