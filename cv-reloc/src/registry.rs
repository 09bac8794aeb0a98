//! Process-wide table of loaded maps with one current map.

use log::*;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;

use crate::geodesy::GeodeticPosition;
use crate::{
    CapabilityRegistry, GeoPose, Localization, LocalizationFailure, Localize, Localizer,
    LocalizerSettings, Map, MapCalibration, MapConfig, MapError, Query, RegistryError,
};

pub const TRANSFORM_FILE: &str = "transform.json";

/// Where the fixed localizer places every query unless told otherwise.
pub fn default_fixed_position() -> GeodeticPosition {
    GeodeticPosition::new(47.48591791954986, 19.079377689751166, 0.0)
}

#[derive(Debug, Error)]
pub enum LocalizeError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Failed(#[from] LocalizationFailure),
}

/// Answers every query with the same pose.
#[derive(Debug, Clone)]
pub struct FixedLocalizer {
    pub geopose: GeoPose,
}

impl FixedLocalizer {
    pub fn new(geopose: GeoPose) -> Self {
        Self { geopose }
    }
}

impl Default for FixedLocalizer {
    fn default() -> Self {
        Self::new(GeoPose::at(default_fixed_position()))
    }
}

enum MapEntry {
    Reconstruction {
        localizer: Arc<Localizer>,
        directory: PathBuf,
    },
    Fixed(FixedLocalizer),
}

#[derive(Default)]
struct RegistryState {
    maps: HashMap<String, Arc<MapEntry>>,
    current: Option<String>,
}

pub struct MapRegistry {
    capabilities: CapabilityRegistry,
    settings: LocalizerSettings,
    root_rewrite: Option<(PathBuf, PathBuf)>,
    state: RwLock<RegistryState>,
}

impl MapRegistry {
    pub fn new(capabilities: CapabilityRegistry, settings: LocalizerSettings) -> Self {
        Self {
            capabilities,
            settings,
            root_rewrite: None,
            state: RwLock::new(RegistryState::default()),
        }
    }

    /// Rewrites the `from` prefix of paths in every map config to `to` when loading.
    ///
    /// Map builders running in a container record paths under their mount point,
    /// usually `/uploads`, which live under a different root on this machine.
    pub fn with_root_rewrite(mut self, from: impl Into<PathBuf>, to: impl Into<PathBuf>) -> Self {
        self.root_rewrite = Some((from.into(), to.into()));
        self
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Builds a localizer for a map directory without registering it.
    pub fn open(&self, directory: impl AsRef<Path>) -> Result<Localizer, RegistryError> {
        let directory = directory.as_ref();
        let id = directory.display().to_string();
        let wrap = |source: MapError| RegistryError::Load {
            id: id.clone(),
            source,
        };
        let mut config = MapConfig::load_or_default(directory).map_err(wrap)?;
        if let Some((from, to)) = &self.root_rewrite {
            config.rewrite_root(from, to);
        }
        let capabilities = self.capabilities.resolve(&config, &self.settings)?;
        let map = Map::load_from(config.reconstruction_dir(directory), directory).map_err(wrap)?;
        let calibration = read_calibration(directory).map_err(wrap)?;
        Ok(Localizer::new(
            Arc::new(map),
            calibration,
            capabilities,
            self.settings,
        ))
    }

    /// Loads a map and makes it current.
    ///
    /// A map that is already loaded from the same directory only becomes
    /// current. Loading a different directory under a loaded id fails, the id
    /// has to be unloaded first. On failure the registry is left unchanged.
    pub fn load(&self, id: &str, directory: impl AsRef<Path>) -> Result<(), RegistryError> {
        let directory = directory.as_ref();
        let existing = self.read().maps.get(id).cloned();
        if let Some(entry) = existing {
            if let MapEntry::Reconstruction { directory: loaded, .. } = &*entry {
                if !same_directory(loaded, directory) {
                    warn!(
                        "map {} is loaded from {}, refusing to load it from {}",
                        id,
                        loaded.display(),
                        directory.display()
                    );
                    return Err(RegistryError::AlreadyLoaded {
                        id: id.to_string(),
                        loaded: loaded.clone(),
                    });
                }
            }
            info!("map {} is already loaded", id);
            return self.switch(id);
        }
        info!("loading map {} from {}", id, directory.display());
        let localizer = self.open(directory).map_err(|e| match e {
            RegistryError::Load { source, .. } => RegistryError::Load {
                id: id.to_string(),
                source,
            },
            other => other,
        })?;
        self.insert(
            id,
            MapEntry::Reconstruction {
                localizer: Arc::new(localizer),
                directory: directory.to_path_buf(),
            },
        );
        Ok(())
    }

    /// Registers an already built localizer and makes it current.
    pub fn insert_localizer(&self, id: &str, localizer: Localizer, directory: impl Into<PathBuf>) {
        self.insert(
            id,
            MapEntry::Reconstruction {
                localizer: Arc::new(localizer),
                directory: directory.into(),
            },
        );
    }

    /// Registers a map that answers every query with `geopose` and makes it current.
    pub fn register_fixed(&self, id: &str, geopose: GeoPose) {
        self.insert(id, MapEntry::Fixed(FixedLocalizer::new(geopose)));
    }

    fn insert(&self, id: &str, entry: MapEntry) {
        let mut state = self.write();
        state.maps.insert(id.to_string(), Arc::new(entry));
        state.current = Some(id.to_string());
    }

    /// Re-reads `transform.json` of a loaded map. Queries already running keep the old calibration.
    pub fn reload_calibration(&self, id: &str) -> Result<(), RegistryError> {
        let entry = self
            .read()
            .maps
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownMap(id.to_string()))?;
        match &*entry {
            MapEntry::Reconstruction {
                localizer,
                directory,
            } => {
                let calibration = read_calibration(directory).map_err(|source| RegistryError::Load {
                    id: id.to_string(),
                    source,
                })?;
                localizer.set_calibration(calibration);
                info!("reloaded calibration of map {}", id);
                Ok(())
            }
            MapEntry::Fixed(_) => Err(RegistryError::NotReloadable { id: id.to_string() }),
        }
    }

    /// Removes a map. Queries holding it finish normally.
    pub fn unload(&self, id: &str) -> bool {
        let mut state = self.write();
        let removed = state.maps.remove(id).is_some();
        if removed && state.current.as_deref() == Some(id) {
            state.current = None;
        }
        if removed {
            info!("unloaded map {}", id);
        }
        removed
    }

    pub fn switch(&self, id: &str) -> Result<(), RegistryError> {
        let mut state = self.write();
        if !state.maps.contains_key(id) {
            return Err(RegistryError::UnknownMap(id.to_string()));
        }
        state.current = Some(id.to_string());
        Ok(())
    }

    pub fn current_id(&self) -> Option<String> {
        self.read().current.clone()
    }

    pub fn loaded_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.read().maps.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// The localizer of a loaded map, if it is backed by a reconstruction.
    pub fn localizer(&self, id: &str) -> Option<Arc<Localizer>> {
        match self.read().maps.get(id).map(|entry| &**entry) {
            Some(MapEntry::Reconstruction { localizer, .. }) => Some(localizer.clone()),
            _ => None,
        }
    }

    /// Localizes against the current map.
    pub fn localize(&self, query: &Query) -> Result<GeoPose, LocalizeError> {
        let entry = {
            let state = self.read();
            let id = state.current.as_ref().ok_or(RegistryError::NoCurrentMap)?;
            state
                .maps
                .get(id)
                .cloned()
                .ok_or_else(|| RegistryError::UnknownMap(id.clone()))?
        };
        match &*entry {
            MapEntry::Reconstruction { localizer, .. } => localizer
                .localize(query)
                .map(|Localization { geopose, .. }| geopose)
                .map_err(LocalizeError::from),
            MapEntry::Fixed(fixed) => Ok(fixed.geopose),
        }
    }
}

fn same_directory(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

fn read_calibration(directory: &Path) -> Result<Option<MapCalibration>, MapError> {
    let path = directory.join(TRANSFORM_FILE);
    if path.exists() {
        MapCalibration::load(path).map(Some)
    } else {
        warn!(
            "{} has no {}, queries will fail until a calibration is loaded",
            directory.display(),
            TRANSFORM_FILE
        );
        Ok(None)
    }
}

/// Finds map directories laid out as `root/<dataset>/hlocMaps/<map id>`.
///
/// Only datasets carrying a `status.json` are considered.
pub fn discover_maps(root: impl AsRef<Path>) -> Result<BTreeMap<String, PathBuf>, MapError> {
    let root = root.as_ref();
    let mut maps = BTreeMap::new();
    let datasets = std::fs::read_dir(root).map_err(|e| MapError::io(root, e))?;
    for dataset in datasets {
        let dataset = dataset.map_err(|e| MapError::io(root, e))?.path();
        if !dataset.is_dir() || !dataset.join("status.json").is_file() {
            continue;
        }
        let hloc_maps = dataset.join("hlocMaps");
        let entries = match std::fs::read_dir(&hloc_maps) {
            Ok(entries) => entries,
            Err(_) => continue,
        };
        for entry in entries {
            let path = entry.map_err(|e| MapError::io(&hloc_maps, e))?.path();
            if !path.is_dir() {
                continue;
            }
            if let Some(id) = path.file_name().and_then(|n| n.to_str()) {
                if let Some(previous) = maps.insert(id.to_string(), path.clone()) {
                    warn!(
                        "map id {} appears in both {} and {}, using the latter",
                        id,
                        previous.display(),
                        path.display()
                    );
                }
            }
        }
    }
    debug!("discovered {} maps under {}", maps.len(), root.display());
    Ok(maps)
}
