use log::*;
use std::path::Path;
use std::sync::Arc;

use crate::{
    DescriptorContainer, GlobalDescriptors, LocalDescriptorStore, LocalFeatures, MapError,
    MapImage, Reconstruction,
};

pub const LOCAL_FEATURES_FILE: &str = "features.bin";
pub const GLOBAL_FEATURES_FILE: &str = "global_features.bin";

/// A loaded map: the reconstruction and its descriptors. Immutable once built.
pub struct Map {
    reconstruction: Reconstruction,
    local: Box<dyn LocalDescriptorStore>,
    global: Option<GlobalDescriptors>,
}

impl Map {
    pub fn new(
        reconstruction: Reconstruction,
        local: Box<dyn LocalDescriptorStore>,
        global: Option<GlobalDescriptors>,
    ) -> Result<Self, MapError> {
        if reconstruction.num_images() == 0 {
            return Err(MapError::NoImages);
        }
        if let Some(global) = &global {
            if global.len() != reconstruction.num_images() {
                return Err(MapError::Inconsistent(format!(
                    "{} global descriptors for {} images",
                    global.len(),
                    reconstruction.num_images()
                )));
            }
        }
        let unindexed = reconstruction
            .images()
            .filter(|image| !local.contains(&image.name))
            .count();
        if unindexed > 0 {
            warn!(
                "{} of {} map images have no local descriptors",
                unindexed,
                reconstruction.num_images()
            );
        }
        Ok(Self {
            reconstruction,
            local,
            global,
        })
    }

    /// Loads the reconstruction from `reconstruction_dir` and the descriptor
    /// containers from `descriptor_dir`.
    pub fn load_from(
        reconstruction_dir: impl AsRef<Path>,
        descriptor_dir: impl AsRef<Path>,
    ) -> Result<Self, MapError> {
        let reconstruction = Reconstruction::load(reconstruction_dir)?;
        let descriptor_dir = descriptor_dir.as_ref();
        let local = DescriptorContainer::open(descriptor_dir.join(LOCAL_FEATURES_FILE))?;
        let global_path = descriptor_dir.join(GLOBAL_FEATURES_FILE);
        let global = if global_path.exists() {
            let names = reconstruction.images().map(|image| image.name.as_str());
            Some(GlobalDescriptors::load(&global_path, names)?)
        } else {
            info!(
                "no global descriptors at {}, retrieval will consider every image",
                global_path.display()
            );
            None
        };
        Self::new(reconstruction, Box::new(local), global)
    }

    /// Loads a map whose reconstruction and descriptors share one directory.
    pub fn load(directory: impl AsRef<Path>) -> Result<Self, MapError> {
        let directory = directory.as_ref();
        Self::load_from(directory, directory)
    }

    pub fn reconstruction(&self) -> &Reconstruction {
        &self.reconstruction
    }

    pub fn global_descriptors(&self) -> Option<&GlobalDescriptors> {
        self.global.as_ref()
    }

    pub fn local_features(&self, image: &MapImage) -> Result<Arc<LocalFeatures>, MapError> {
        self.local.local_features(&image.name)
    }
}

impl std::fmt::Debug for Map {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Map")
            .field("images", &self.reconstruction.num_images())
            .field("points", &self.reconstruction.num_points())
            .field("local_descriptors", &self.local.len())
            .field("global_descriptors", &self.global.as_ref().map(|g| g.len()))
            .finish()
    }
}
