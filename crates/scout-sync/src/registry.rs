use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use scout_adapters::{source_for_slug, ListingSource, SourceSettings, BUILTIN_SOURCES};
use scout_storage::HttpFetcher;
use serde::Deserialize;
use tracing::info;

use crate::config::ScoutConfig;

/// Contents of `sources.yaml`.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceEntry {
    pub slug: String,
    pub display_name: String,
    pub base_url: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub listing_url: Option<String>,
    #[serde(default)]
    pub page_limit: Option<usize>,
}

fn enabled_by_default() -> bool {
    true
}

impl SourceRegistry {
    /// The three retailers the bundled parsers understand.
    pub fn builtin() -> Self {
        Self {
            sources: BUILTIN_SOURCES
                .iter()
                .map(|(slug, display_name, base_url)| SourceEntry {
                    slug: slug.to_string(),
                    display_name: display_name.to_string(),
                    base_url: base_url.to_string(),
                    enabled: true,
                    listing_url: None,
                    page_limit: None,
                })
                .collect(),
        }
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing source registry")
    }

    /// Read the registry file, falling back to the built-in list when it
    /// does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!(path = %path.display(), "no source registry file; using built-in sources");
            return Ok(Self::builtin());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceEntry> {
        self.sources.iter().filter(|s| s.enabled)
    }

    pub fn settings_for(&self, entry: &SourceEntry, config: &ScoutConfig) -> SourceSettings {
        let defaults = SourceSettings::builtin(&entry.slug);
        let page_limit = entry.page_limit.unwrap_or_else(|| match entry.slug.as_str() {
            "metagames" => config.metagames_page_limit,
            _ => defaults.as_ref().map_or(15, |d| d.page_limit),
        });
        SourceSettings {
            slug: entry.slug.clone(),
            display_name: entry.display_name.clone(),
            base_url: entry.base_url.clone(),
            listing_url: entry.listing_url.clone(),
            page_limit,
            page_delay: config.page_delay,
        }
    }

    /// Instantiate every enabled source. An enabled slug without a parser is
    /// a configuration error.
    pub fn build_sources(
        &self,
        config: &ScoutConfig,
        http: Arc<HttpFetcher>,
    ) -> Result<Vec<Arc<dyn ListingSource>>> {
        self.enabled()
            .map(|entry| {
                let settings = self.settings_for(entry, config);
                source_for_slug(settings, http.clone())
                    .map(Arc::from)
                    .with_context(|| format!("no listing source registered for {}", entry.slug))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
sources:
  - slug: metagames
    display_name: Metagames
    base_url: https://www.metagames.hu
  - slug: tcgbolt
    display_name: TCGBolt
    base_url: https://tcgbolt.hu
    enabled: false
    page_limit: 3
"#;

    #[test]
    fn yaml_registry_parses_with_defaults() {
        let registry = SourceRegistry::from_yaml(YAML).unwrap();
        assert_eq!(registry.sources.len(), 2);
        assert!(registry.sources[0].enabled);
        let enabled: Vec<_> = registry.enabled().map(|s| s.slug.as_str()).collect();
        assert_eq!(enabled, vec!["metagames"]);
    }

    #[test]
    fn settings_take_page_limits_from_entry_or_config() {
        let registry = SourceRegistry::from_yaml(YAML).unwrap();
        let config = ScoutConfig::from_lookup(|k| {
            (k == "METAGAMES_PAGE_LIMIT").then(|| "7".to_string())
        });
        assert_eq!(registry.settings_for(&registry.sources[0], &config).page_limit, 7);
        assert_eq!(registry.settings_for(&registry.sources[1], &config).page_limit, 3);
    }

    #[test]
    fn missing_file_falls_back_to_builtin() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SourceRegistry::load(&dir.path().join("sources.yaml")).unwrap();
        assert_eq!(registry.sources.len(), 3);
    }

    #[test]
    fn unknown_enabled_slug_is_rejected() {
        let registry = SourceRegistry::from_yaml(
            "sources:\n  - slug: acme\n    display_name: Acme\n    base_url: https://acme.test\n",
        )
        .unwrap();
        let config = ScoutConfig::from_lookup(|_| None);
        let http = Arc::new(HttpFetcher::new(Default::default()).unwrap());
        let err = registry.build_sources(&config, http).err().unwrap();
        assert!(err.to_string().contains("acme"));
    }
}
