//! Schema catalog
//!
//! The catalog is the table of named schema versions (profiles). It is data:
//! the built-in one is `config/schemas.yaml` compiled into the binary, and a
//! different one can be loaded from disk without touching code.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, SchemaError};
use crate::schema::CollectionDefinition;
use crate::validation::DocumentValidator;

const BUILTIN_CATALOG: &str = include_str!("../config/schemas.yaml");

/// One schema version: a named set of collection definitions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaProfile {
    /// Profile name, unique within the catalog
    pub name: String,
    /// What this version was used for
    #[serde(default)]
    pub description: Option<String>,
    /// Collections provisioned by this version
    pub collections: Vec<CollectionDefinition>,
}

/// All known schema versions of one database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaCatalog {
    /// Target database
    pub database: String,
    /// Schema versions, in file order
    pub profiles: Vec<SchemaProfile>,
    /// Profiles applied when the caller selects none
    #[serde(default)]
    pub default_profiles: Vec<String>,
}

impl SchemaCatalog {
    /// The catalog shipped with the crate
    pub fn builtin() -> Result<Self> {
        Self::from_yaml_str(BUILTIN_CATALOG)
    }

    /// Load a catalog from a YAML file
    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let catalog = Self::from_yaml_str(&raw)?;
        debug!(path = %path.display(), profiles = catalog.profiles.len(), "Loaded schema catalog");
        Ok(catalog)
    }

    /// Parse and check a catalog
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let catalog: Self = serde_yaml::from_str(raw)?;
        catalog.validate()?;
        Ok(catalog)
    }

    /// Check names, required fields and indexes of every profile
    pub fn validate(&self) -> Result<()> {
        if self.database.trim().is_empty() {
            return Err(SchemaError::InvalidDefinition(
                "catalog database name cannot be empty".to_string(),
            ));
        }

        let mut seen_profiles = HashSet::new();
        for profile in &self.profiles {
            if profile.name.trim().is_empty() {
                return Err(SchemaError::InvalidDefinition(
                    "profile name cannot be empty".to_string(),
                ));
            }
            if !seen_profiles.insert(profile.name.as_str()) {
                return Err(SchemaError::InvalidDefinition(format!(
                    "duplicate profile: {}",
                    profile.name
                )));
            }

            let mut seen_collections = HashSet::new();
            for collection in &profile.collections {
                validate_definition(collection)?;
                if !seen_collections.insert(collection.name.as_str()) {
                    return Err(SchemaError::InvalidDefinition(format!(
                        "profile {} defines collection {} twice",
                        profile.name, collection.name
                    )));
                }
            }
        }

        for name in &self.default_profiles {
            self.profile(name)?;
        }

        Ok(())
    }

    /// Look up a profile by name
    pub fn profile(&self, name: &str) -> Result<&SchemaProfile> {
        self.profiles
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| SchemaError::UnknownProfile(name.to_string()))
    }

    /// Resolve profile names; an empty selection means the default profiles
    pub fn select<S: AsRef<str>>(&self, names: &[S]) -> Result<Vec<&SchemaProfile>> {
        if names.is_empty() {
            return self.default_profiles.iter().map(|n| self.profile(n)).collect();
        }
        names.iter().map(|n| self.profile(n.as_ref())).collect()
    }

    /// Merge the collections of several profiles into one provisioning plan.
    ///
    /// Identical definitions of the same collection collapse into one entry.
    /// Diverging definitions are refused: which version is authoritative is
    /// the caller's decision.
    pub fn plan(profiles: &[&SchemaProfile]) -> Result<Vec<CollectionDefinition>> {
        let mut planned: Vec<(CollectionDefinition, &str)> = Vec::new();

        for profile in profiles {
            for definition in &profile.collections {
                let existing = planned
                    .iter()
                    .find(|(d, _)| d.name == definition.name)
                    .map(|(d, owner)| (d == definition, *owner));

                match existing {
                    Some((true, _)) => {}
                    Some((false, owner)) => {
                        return Err(SchemaError::AmbiguousDefinition {
                            collection: definition.name.clone(),
                            profiles: vec![owner.to_string(), profile.name.clone()],
                        });
                    }
                    None => planned.push((definition.clone(), profile.name.as_str())),
                }
            }
        }

        Ok(planned.into_iter().map(|(d, _)| d).collect())
    }
}

fn validate_definition(definition: &CollectionDefinition) -> Result<()> {
    DocumentValidator::validate_collection_name(&definition.name)?;
    DocumentValidator::validate_schema(&definition.name, &definition.validator)?;

    for index in &definition.indexes {
        DocumentValidator::validate_field_name(&index.field)?;
        if !index.unique {
            return Err(SchemaError::InvalidDefinition(format!(
                "{}: index on '{}' must be unique",
                definition.name, index.field
            )));
        }
        if !definition.validator.properties.contains_key(&index.field) {
            return Err(SchemaError::InvalidDefinition(format!(
                "{}: indexed field '{}' is not declared in properties",
                definition.name, index.field
            )));
        }
    }

    Ok(())
}
