//! Logical to physical city resolution.

use std::collections::BTreeMap;

/// Maps a logical city name (as callers write it) to the physical city
/// names stored on pool records.
pub trait CityResolver: Send + Sync {
    fn resolve(&self, logical: &str) -> Vec<String>;
}

/// Fixed mapping loaded at startup. Unknown names resolve to themselves.
#[derive(Debug, Clone, Default)]
pub struct StaticCityResolver {
    cities: BTreeMap<String, Vec<String>>,
}

impl StaticCityResolver {
    pub fn new(cities: BTreeMap<String, Vec<String>>) -> Self {
        Self { cities }
    }

    /// Parse a `{"logical": ["physical", ...]}` document. Blank input yields
    /// an empty mapping.
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(Self::new(serde_json::from_str(raw)?))
    }

    pub fn len(&self) -> usize {
        self.cities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cities.is_empty()
    }
}

impl CityResolver for StaticCityResolver {
    fn resolve(&self, logical: &str) -> Vec<String> {
        match self.cities.get(logical) {
            Some(physical) if !physical.is_empty() => physical.clone(),
            _ => vec![logical.to_string()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolves_mapped_and_unknown_names() {
        let resolver =
            StaticCityResolver::from_json(r#"{"south": ["shenzhen", "guangzhou"]}"#).unwrap();

        assert_eq!(resolver.resolve("south"), vec!["shenzhen", "guangzhou"]);
        assert_eq!(resolver.resolve("beijing"), vec!["beijing"]);
    }

    #[test]
    fn test_blank_mapping() {
        let resolver = StaticCityResolver::from_json("  ").unwrap();
        assert!(resolver.is_empty());
        assert!(StaticCityResolver::from_json("[1]").is_err());
    }
}
