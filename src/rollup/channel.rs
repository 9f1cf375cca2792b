use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Accumulation applied to a channel's value on every contributing event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Adds the value to `sum` and one to the channel `count`.
    Sum,
    Min,
    Max,
}

/// Statistic derived from a channel's accumulators at read time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Calculation {
    Average,
    Range,
    RangeMin,
    RangeMax,
}

impl Calculation {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Average => "average",
            Self::Range => "range",
            Self::RangeMin => "range_min",
            Self::RangeMax => "range_max",
        }
    }
}

/// A named numeric metric extracted from one event field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSpec {
    /// Dotted path into the event.
    pub source: String,
    pub operations: BTreeSet<Operation>,
    pub calculations: BTreeSet<Calculation>,
}

impl ChannelSpec {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            operations: BTreeSet::new(),
            calculations: BTreeSet::new(),
        }
    }

    pub fn with_operations(mut self, operations: impl IntoIterator<Item = Operation>) -> Self {
        self.operations.extend(operations);
        self
    }

    pub fn with_calculations(mut self, calculations: impl IntoIterator<Item = Calculation>) -> Self {
        self.calculations.extend(calculations);
        self
    }

    pub fn accumulates(&self, operation: Operation) -> bool {
        self.operations.contains(&operation)
    }

    pub fn calculates(&self, calculation: Calculation) -> bool {
        self.calculations.contains(&calculation)
    }

    /// Returns why this spec cannot work, if it cannot.
    pub(crate) fn problem(&self) -> Option<&'static str> {
        if self.source.is_empty() {
            return Some("source path must not be empty");
        }
        if self.operations.is_empty() {
            return Some("at least one operation is required");
        }
        if self.calculates(Calculation::Average) && !self.accumulates(Operation::Sum) {
            return Some("average requires the sum operation");
        }
        if self.calculates(Calculation::Range)
            && !(self.accumulates(Operation::Min) && self.accumulates(Operation::Max))
        {
            return Some("range requires the min and max operations");
        }
        if self.calculates(Calculation::RangeMin)
            && !(self.calculates(Calculation::Average) && self.accumulates(Operation::Min))
        {
            return Some("range_min requires average and the min operation");
        }
        if self.calculates(Calculation::RangeMax)
            && !(self.calculates(Calculation::Average) && self.accumulates(Operation::Max))
        {
            return Some("range_max requires average and the max operation");
        }
        None
    }
}
