use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use super::channel::ChannelSpec;
use super::error::RollupError;
use super::key::KeySpec;
use super::resolution::Resolution;

/// Setup-time description of one rollup series.
#[derive(Debug, Clone)]
pub struct SeriesDefinition {
    pub name: String,
    /// Event source this series is attached to.
    pub source: String,
    /// Resolutions maintained, in configured order without duplicates.
    pub resolutions: Vec<Resolution>,
    pub key: KeySpec,
    /// Dotted path of the event timestamp; `created_at` when unset.
    pub date_field: Option<String>,
    pub channels: BTreeMap<String, ChannelSpec>,
}

impl SeriesDefinition {
    /// Creates a series attached to the source of the same name.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            source: name.clone(),
            name,
            resolutions: Vec::new(),
            key: KeySpec::new(),
            date_field: None,
            channels: BTreeMap::new(),
        }
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn resolutions(mut self, resolutions: impl IntoIterator<Item = Resolution>) -> Self {
        for resolution in resolutions {
            if !self.resolutions.contains(&resolution) {
                self.resolutions.push(resolution);
            }
        }
        self
    }

    pub fn key(mut self, key: KeySpec) -> Self {
        self.key = key;
        self
    }

    pub fn date_field(mut self, field: impl Into<String>) -> Self {
        self.date_field = Some(field.into());
        self
    }

    pub fn channel(mut self, name: impl Into<String>, spec: ChannelSpec) -> Self {
        self.channels.insert(name.into(), spec);
        self
    }

    /// Checks every required field. Failures are fatal at setup.
    pub fn validate(&self) -> Result<(), RollupError> {
        if self.name.trim().is_empty() {
            return Err(RollupError::MissingSeriesName);
        }
        if self.resolutions.is_empty() {
            return Err(RollupError::NoResolutions {
                series: self.name.clone(),
            });
        }
        if self.key.is_empty() {
            return Err(RollupError::EmptyKeySpec {
                series: self.name.clone(),
            });
        }

        for (name, spec) in &self.channels {
            let reason = if name.is_empty() {
                Some("channel name must not be empty")
            } else if name.contains('.') {
                Some("channel name must not contain '.'")
            } else {
                spec.problem()
            };
            if let Some(reason) = reason {
                return Err(RollupError::InvalidChannel {
                    series: self.name.clone(),
                    channel: name.clone(),
                    reason,
                });
            }
        }

        Ok(())
    }
}

/// Every configured series, looked up by name or by event source.
#[derive(Debug, Default)]
pub struct SeriesRegistry {
    by_name: HashMap<String, Arc<SeriesDefinition>>,
    by_source: HashMap<String, Vec<Arc<SeriesDefinition>>>,
}

impl SeriesRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a registry, stopping at the first invalid definition.
    pub fn from_definitions(
        definitions: impl IntoIterator<Item = SeriesDefinition>,
    ) -> Result<Self, RollupError> {
        let mut registry = Self::new();
        for definition in definitions {
            registry.register(definition)?;
        }
        Ok(registry)
    }

    /// Validates and adds a series.
    pub fn register(&mut self, definition: SeriesDefinition) -> Result<(), RollupError> {
        definition.validate()?;
        if self.by_name.contains_key(&definition.name) {
            return Err(RollupError::DuplicateSeries {
                series: definition.name,
            });
        }

        let definition = Arc::new(definition);
        self.by_source
            .entry(definition.source.clone())
            .or_default()
            .push(Arc::clone(&definition));
        self.by_name.insert(definition.name.clone(), definition);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&Arc<SeriesDefinition>, RollupError> {
        self.by_name
            .get(name)
            .ok_or_else(|| RollupError::UnknownSeries {
                series: name.to_string(),
            })
    }

    /// Series attached to an event source, in registration order.
    pub fn for_source(&self, source: &str) -> &[Arc<SeriesDefinition>] {
        self.by_source.get(source).map_or(&[], Vec::as_slice)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.by_name.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rollup::channel::{Calculation, Operation};

    fn pageviews() -> SeriesDefinition {
        SeriesDefinition::new("pageviews")
            .source("pageview")
            .resolutions([Resolution::Hour, Resolution::Day, Resolution::Hour])
            .key(KeySpec::new().literal("url"))
            .channel(
                "duration",
                ChannelSpec::new("loadMs").with_operations([Operation::Sum]),
            )
    }

    #[test]
    fn test_resolutions_deduplicated_in_order() {
        assert_eq!(
            pageviews().resolutions,
            vec![Resolution::Hour, Resolution::Day]
        );
    }

    #[test]
    fn test_validate_required_fields() {
        assert_eq!(
            SeriesDefinition::new("").validate(),
            Err(RollupError::MissingSeriesName)
        );
        assert!(matches!(
            SeriesDefinition::new("s").validate(),
            Err(RollupError::NoResolutions { .. })
        ));
        assert!(matches!(
            SeriesDefinition::new("s")
                .resolutions([Resolution::Day])
                .validate(),
            Err(RollupError::EmptyKeySpec { .. })
        ));
        assert!(pageviews().validate().is_ok());
    }

    #[test]
    fn test_validate_channels() {
        let dotted = pageviews().channel(
            "a.b",
            ChannelSpec::new("x").with_operations([Operation::Sum]),
        );
        assert!(matches!(
            dotted.validate(),
            Err(RollupError::InvalidChannel { channel, .. }) if channel == "a.b"
        ));

        let bad_calc = pageviews().channel(
            "size",
            ChannelSpec::new("bytes")
                .with_operations([Operation::Min])
                .with_calculations([Calculation::Range]),
        );
        assert!(matches!(
            bad_calc.validate(),
            Err(RollupError::InvalidChannel { reason, .. })
                if reason == "range requires the min and max operations"
        ));
    }

    #[test]
    fn test_registry_lookup_by_name_and_source() {
        let mut registry = SeriesRegistry::new();
        registry.register(pageviews()).expect("register");
        registry
            .register(
                SeriesDefinition::new("pageviews_by_host")
                    .source("pageview")
                    .resolutions([Resolution::Minute])
                    .key(KeySpec::new().literal("host")),
            )
            .expect("register");

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get("pageviews").expect("get").source, "pageview");
        assert_eq!(registry.for_source("pageview").len(), 2);
        assert!(registry.for_source("signup").is_empty());
        assert!(matches!(
            registry.get("missing"),
            Err(RollupError::UnknownSeries { .. })
        ));
    }

    #[test]
    fn test_registry_rejects_duplicates() {
        let err = SeriesRegistry::from_definitions([pageviews(), pageviews()]).unwrap_err();
        assert_eq!(
            err,
            RollupError::DuplicateSeries {
                series: "pageviews".to_string()
            }
        );
    }
}
