//! Migration modes: named sets of enabled phases.
//!
//! Built-in modes are fixed. Custom modes are stored as a JSON array in the
//! portal data directory and managed with `add`, `update` and `delete`, each
//! of which reads a small YAML definition file:
//!
//! ```yaml
//! name: full_and_incremental
//! phases: [full_migration, incremental_migration]
//! ```

use super::error::{ConfigResult, ConfigurationError};
use crate::state_machine::MigrationPhase;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info};

pub const CUSTOM_MODE_FILE_NAME: &str = "migration-modes.json";
pub const MODE_TEMPLATE_FILE_NAME: &str = "mode-template.yaml";
const MODE_NAME_MAX_LENGTH: usize = 50;

const MODE_TEMPLATE: &str = "\
# Custom migration mode definition
#
# name: letters, numbers, underscores and hyphens, at most 50 characters
# phases: any of full_migration, full_data_check, incremental_migration,
#         incremental_data_check, reverse_migration
#         incremental_data_check requires incremental_migration
name: my_mode
phases:
  - full_migration
  - incremental_migration
";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationMode {
    pub name: String,
    pub phases: Vec<MigrationPhase>,
}

impl MigrationMode {
    pub fn new(name: impl Into<String>, phases: Vec<MigrationPhase>) -> Self {
        Self {
            name: name.into(),
            phases,
        }
    }

    pub fn has_phase(&self, phase: MigrationPhase) -> bool {
        self.phases.contains(&phase)
    }

    pub fn phases(&self) -> &[MigrationPhase] {
        &self.phases
    }

    fn phase_set(&self) -> BTreeSet<MigrationPhase> {
        self.phases.iter().copied().collect()
    }

    /// Modes every installation ships with
    pub fn defaults() -> Vec<MigrationMode> {
        use MigrationPhase::*;
        vec![
            Self::new("plan1", vec![FullMigration, FullDataCheck]),
            Self::new(
                "plan2",
                vec![
                    FullMigration,
                    FullDataCheck,
                    IncrementalMigration,
                    IncrementalDataCheck,
                ],
            ),
            Self::new(
                "plan3",
                vec![
                    FullMigration,
                    FullDataCheck,
                    IncrementalMigration,
                    IncrementalDataCheck,
                    ReverseMigration,
                ],
            ),
            Self::new(FullMigration.phase_name(), vec![FullMigration]),
            Self::new(FullDataCheck.phase_name(), vec![FullDataCheck]),
            Self::new(IncrementalMigration.phase_name(), vec![IncrementalMigration]),
            Self::new(ReverseMigration.phase_name(), vec![ReverseMigration]),
        ]
    }
}

/// Shape of a mode definition file
#[derive(Debug, Deserialize)]
struct ModeDefinition {
    name: Option<String>,
    phases: Option<Vec<String>>,
}

pub struct ModeManager {
    store_path: PathBuf,
}

impl ModeManager {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            store_path: data_dir.as_ref().join(CUSTOM_MODE_FILE_NAME),
        }
    }

    pub fn get(&self, name: &str) -> ConfigResult<MigrationMode> {
        self.list()
            .into_iter()
            .find(|mode| mode.name == name)
            .ok_or_else(|| ConfigurationError::UnknownMode {
                name: name.to_string(),
            })
    }

    /// Custom modes first, then the built-in ones
    pub fn list(&self) -> Vec<MigrationMode> {
        let mut modes = self.load_custom_modes();
        modes.extend(MigrationMode::defaults());
        modes
    }

    pub fn add(&self, definition_path: &Path) -> ConfigResult<MigrationMode> {
        let mode = Self::read_definition(definition_path)?;

        let existing = self.list();
        if existing.iter().any(|m| m.name == mode.name) {
            return Err(ConfigurationError::mode_conflict(format!(
                "migration mode {} already exists, please use a different name",
                mode.name
            )));
        }
        Self::check_unique_phases(&mode, &existing)?;

        let mut custom = self.load_custom_modes();
        custom.push(mode.clone());
        self.save_custom_modes(&custom)?;

        info!(mode = %mode.name, "Migration mode added");
        Ok(mode)
    }

    pub fn update(&self, definition_path: &Path) -> ConfigResult<MigrationMode> {
        let mode = Self::read_definition(definition_path)?;
        Self::ensure_not_default(&mode.name)?;

        let mut custom = self.load_custom_modes();
        if !custom.iter().any(|m| m.name == mode.name) {
            return Err(ConfigurationError::UnknownMode { name: mode.name });
        }

        custom.retain(|m| m.name != mode.name);
        Self::check_unique_phases(&mode, &custom)?;
        Self::check_unique_phases(&mode, &MigrationMode::defaults())?;

        custom.push(mode.clone());
        self.save_custom_modes(&custom)?;

        info!(mode = %mode.name, "Migration mode updated");
        Ok(mode)
    }

    pub fn delete(&self, name: &str) -> ConfigResult<()> {
        Self::ensure_not_default(name)?;

        let mut custom = self.load_custom_modes();
        if !custom.iter().any(|m| m.name == name) {
            return Err(ConfigurationError::UnknownMode {
                name: name.to_string(),
            });
        }
        custom.retain(|m| m.name != name);
        self.save_custom_modes(&custom)?;

        info!(mode = %name, "Migration mode deleted");
        Ok(())
    }

    /// Write a commented definition template into `target_dir`
    pub fn template(&self, target_dir: &Path) -> ConfigResult<PathBuf> {
        let path = target_dir.join(MODE_TEMPLATE_FILE_NAME);
        fs::create_dir_all(target_dir)
            .and_then(|_| fs::write(&path, MODE_TEMPLATE))
            .map_err(|e| ConfigurationError::file_write_error(path.display().to_string(), e))?;
        info!(path = %path.display(), "Mode template exported");
        Ok(path)
    }

    /// Parse a phase list into canonical order, enforcing phase dependencies
    pub fn parse_phases<S: AsRef<str>>(phases: &[S]) -> ConfigResult<Vec<MigrationPhase>> {
        let mut requested = BTreeSet::new();
        for raw in phases {
            let phase = raw
                .as_ref()
                .parse::<MigrationPhase>()
                .map_err(ConfigurationError::invalid_mode)?;
            requested.insert(phase);
        }

        if requested.is_empty() {
            return Err(ConfigurationError::invalid_mode(
                "phase list is empty, please use the correct migration phases",
            ));
        }

        if requested.contains(&MigrationPhase::IncrementalDataCheck)
            && !requested.contains(&MigrationPhase::IncrementalMigration)
        {
            return Err(ConfigurationError::invalid_mode(
                "incremental_data_check requires incremental_migration",
            ));
        }

        Ok(MigrationPhase::ALL
            .iter()
            .copied()
            .filter(|phase| requested.contains(phase))
            .collect())
    }

    fn read_definition(path: &Path) -> ConfigResult<MigrationMode> {
        if !path.is_file() {
            return Err(ConfigurationError::file_read_error(
                path.display().to_string(),
                "file does not exist or is a directory",
            ));
        }
        let contents = fs::read_to_string(path)
            .map_err(|e| ConfigurationError::file_read_error(path.display().to_string(), e))?;
        let definition: ModeDefinition = serde_yaml::from_str(&contents)
            .map_err(|e| ConfigurationError::invalid_yaml(path.display().to_string(), e))?;

        let name = definition.name.unwrap_or_default().trim().to_string();
        let phases = definition.phases.unwrap_or_default();
        if name.is_empty() || phases.is_empty() {
            return Err(ConfigurationError::invalid_mode(
                "name and phases cannot be empty",
            ));
        }
        Self::check_name(&name)?;

        Ok(MigrationMode::new(name, Self::parse_phases(&phases)?))
    }

    fn check_name(name: &str) -> ConfigResult<()> {
        if name.len() > MODE_NAME_MAX_LENGTH {
            return Err(ConfigurationError::invalid_mode(format!(
                "mode name cannot exceed {MODE_NAME_MAX_LENGTH} characters"
            )));
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(ConfigurationError::invalid_mode(format!(
                "invalid mode name {name}, only letters, numbers, underscores and hyphens are allowed"
            )));
        }
        Ok(())
    }

    fn ensure_not_default(name: &str) -> ConfigResult<()> {
        if MigrationMode::defaults().iter().any(|m| m.name == name) {
            return Err(ConfigurationError::mode_conflict(format!(
                "default migration mode {name} cannot be modified or deleted"
            )));
        }
        Ok(())
    }

    fn check_unique_phases(mode: &MigrationMode, others: &[MigrationMode]) -> ConfigResult<()> {
        let phases = mode.phase_set();
        if let Some(existing) = others.iter().find(|other| other.phase_set() == phases) {
            return Err(ConfigurationError::mode_conflict(format!(
                "the same phase list already exists in migration mode {}",
                existing.name
            )));
        }
        Ok(())
    }

    fn load_custom_modes(&self) -> Vec<MigrationMode> {
        let contents = match fs::read_to_string(&self.store_path) {
            Ok(contents) => contents,
            Err(_) => return Vec::new(),
        };
        if contents.trim().is_empty() {
            return Vec::new();
        }

        match serde_json::from_str(&contents) {
            Ok(modes) => modes,
            Err(e) => {
                error!(
                    path = %self.store_path.display(),
                    error = %e,
                    "Failed to parse custom migration modes, all custom modes have been cleared"
                );
                let _ = fs::write(&self.store_path, "");
                Vec::new()
            }
        }
    }

    fn save_custom_modes(&self, modes: &[MigrationMode]) -> ConfigResult<()> {
        let path = self.store_path.display().to_string();
        if let Some(parent) = self.store_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| ConfigurationError::file_write_error(path.clone(), e))?;
        }
        let json = serde_json::to_string_pretty(modes)
            .map_err(|e| ConfigurationError::file_write_error(path.clone(), e))?;
        fs::write(&self.store_path, json).map_err(|e| ConfigurationError::file_write_error(path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_definition(dir: &TempDir, file: &str, contents: &str) -> PathBuf {
        let path = dir.path().join(file);
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_default_modes() {
        let dir = TempDir::new().unwrap();
        let manager = ModeManager::new(dir.path());
        let plan3 = manager.get("plan3").unwrap();
        assert!(plan3.has_phase(MigrationPhase::ReverseMigration));
        assert_eq!(manager.list().len(), 7);
        assert!(matches!(
            manager.get("nope"),
            Err(ConfigurationError::UnknownMode { .. })
        ));
    }

    #[test]
    fn test_add_update_delete_custom_mode() {
        let dir = TempDir::new().unwrap();
        let manager = ModeManager::new(dir.path());
        let def = write_definition(
            &dir,
            "mode.yaml",
            "name: fast\nphases: [incremental_migration, full_migration]\n",
        );

        let added = manager.add(&def).unwrap();
        assert_eq!(
            added.phases,
            vec![MigrationPhase::FullMigration, MigrationPhase::IncrementalMigration]
        );
        assert_eq!(manager.get("fast").unwrap(), added);

        let def = write_definition(
            &dir,
            "mode.yaml",
            "name: fast\nphases: [full_migration, incremental_migration, reverse_migration]\n",
        );
        let updated = manager.update(&def).unwrap();
        assert!(updated.has_phase(MigrationPhase::ReverseMigration));

        manager.delete("fast").unwrap();
        assert!(manager.get("fast").is_err());
    }

    #[test]
    fn test_duplicate_phase_set_rejected() {
        let dir = TempDir::new().unwrap();
        let manager = ModeManager::new(dir.path());
        let def = write_definition(
            &dir,
            "mode.yaml",
            "name: copy_of_plan1\nphases: [full_data_check, full_migration]\n",
        );
        assert!(matches!(
            manager.add(&def),
            Err(ConfigurationError::ModeConflict { .. })
        ));
    }

    #[test]
    fn test_default_modes_are_immutable() {
        let dir = TempDir::new().unwrap();
        let manager = ModeManager::new(dir.path());
        assert!(manager.delete("plan1").is_err());
    }

    #[test]
    fn test_incremental_check_requires_incremental() {
        let err = ModeManager::parse_phases(&["full_migration", "incremental_data_check"]).unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidMode { .. }));
        assert!(ModeManager::parse_phases::<&str>(&[]).is_err());
        assert!(ModeManager::parse_phases(&["bogus"]).is_err());
    }

    #[test]
    fn test_invalid_mode_name() {
        let dir = TempDir::new().unwrap();
        let manager = ModeManager::new(dir.path());
        let def = write_definition(&dir, "mode.yaml", "name: \"bad name!\"\nphases: [reverse_migration, full_migration]\n");
        assert!(manager.add(&def).is_err());
    }

    #[test]
    fn test_corrupt_store_is_cleared() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(CUSTOM_MODE_FILE_NAME), "not json").unwrap();
        let manager = ModeManager::new(dir.path());
        assert_eq!(manager.list().len(), MigrationMode::defaults().len());
    }

    #[test]
    fn test_template_is_a_valid_definition() {
        let dir = TempDir::new().unwrap();
        let manager = ModeManager::new(dir.path());
        let path = manager.template(dir.path()).unwrap();
        let mode = manager.add(&path).unwrap();
        assert_eq!(mode.name, "my_mode");
    }
}
