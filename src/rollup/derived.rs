//! Derived channel statistics, computed on every read.

use std::collections::BTreeMap;

use super::channel::{Calculation, ChannelSpec};
use super::record::{ChannelStats, RollupRecord};

/// Adds the requested derived statistics to every record in place.
///
/// A statistic whose raw inputs are missing from a record is left unset.
pub fn decorate(records: &mut [RollupRecord], channels: &BTreeMap<String, ChannelSpec>) {
    for record in records.iter_mut() {
        for (name, spec) in channels {
            if spec.calculations.is_empty() {
                continue;
            }
            if let Some(stats) = record.channels.get_mut(name) {
                derive(stats, spec);
            }
        }
    }
}

fn derive(stats: &mut ChannelStats, spec: &ChannelSpec) {
    // Clear previous derivations so a record can be decorated repeatedly.
    stats.average = None;
    stats.range = None;
    stats.range_min = None;
    stats.range_max = None;

    if spec.calculates(Calculation::Average) {
        stats.average = match (stats.sum, stats.count) {
            (Some(sum), Some(count)) if count > 0 => Some(sum / count as f64),
            _ => None,
        };
    }

    if spec.calculates(Calculation::Range) {
        stats.range = stats.min.zip(stats.max).map(|(min, max)| max - min);
    }

    if spec.calculates(Calculation::RangeMin) {
        stats.range_min = stats.average.zip(stats.min).map(|(avg, min)| avg - min);
    }

    if spec.calculates(Calculation::RangeMax) {
        stats.range_max = stats.average.zip(stats.max).map(|(avg, max)| max - avg);
    }
}
