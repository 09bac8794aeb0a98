//! Storage of per-image local features and the global descriptor matrix.
//!
//! Local features live in a container file that is indexed on open and read
//! lazily, one image at a time. The container starts with the magic
//! `RELOCFT1` and the little-endian offset of a trailing index that maps
//! image names to the byte range of their bincode record.

use cv_core::nalgebra::{DMatrix, DVector, Point2};
use log::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use crate::{CapabilityError, MapError};

const MAGIC: &[u8; 8] = b"RELOCFT1";
const HEADER_LEN: u64 = 16;

/// Keypoints and descriptors extracted from one image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalFeatures {
    /// Keypoints in pixel coordinates with the top-left pixel centered at `(0, 0)`.
    pub keypoints: Vec<[f32; 2]>,
    pub scales: Vec<f32>,
    /// Keypoint detection noise in pixels.
    pub uncertainty: f32,
    descriptor_dim: usize,
    descriptors: Vec<f32>,
}

impl LocalFeatures {
    pub fn new(
        keypoints: Vec<[f32; 2]>,
        scales: Vec<f32>,
        uncertainty: f32,
        descriptor_dim: usize,
        descriptors: Vec<f32>,
    ) -> Result<Self, CapabilityError> {
        let features = Self {
            keypoints,
            scales,
            uncertainty,
            descriptor_dim,
            descriptors,
        };
        features.validate().map_err(CapabilityError::Extraction)?;
        Ok(features)
    }

    /// Builds features from one descriptor row per keypoint.
    pub fn from_rows(
        keypoints: Vec<[f32; 2]>,
        scales: Vec<f32>,
        uncertainty: f32,
        rows: &[Vec<f32>],
    ) -> Result<Self, CapabilityError> {
        let dim = rows.first().map_or(0, Vec::len);
        if let Some(row) = rows.iter().find(|r| r.len() != dim) {
            return Err(CapabilityError::DimensionMismatch {
                expected: dim,
                actual: row.len(),
            });
        }
        Self::new(keypoints, scales, uncertainty, dim, rows.concat())
    }

    fn validate(&self) -> Result<(), String> {
        let n = self.keypoints.len();
        if self.scales.len() != n {
            return Err(format!("{} keypoints but {} scales", n, self.scales.len()));
        }
        if self.descriptors.len() != n * self.descriptor_dim {
            return Err(format!(
                "{} keypoints with dimension {} need {} descriptor values, got {}",
                n,
                self.descriptor_dim,
                n * self.descriptor_dim,
                self.descriptors.len()
            ));
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }

    pub fn descriptor_dim(&self) -> usize {
        self.descriptor_dim
    }

    pub fn descriptor(&self, ix: usize) -> &[f32] {
        &self.descriptors[ix * self.descriptor_dim..(ix + 1) * self.descriptor_dim]
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &[f32]> + '_ {
        (0..self.len()).map(move |ix| self.descriptor(ix))
    }

    /// The keypoint in the COLMAP convention, where the top-left pixel is centered at `(0.5, 0.5)`.
    pub fn colmap_keypoint(&self, ix: usize) -> Point2<f64> {
        let [x, y] = self.keypoints[ix];
        Point2::new(x as f64 + 0.5, y as f64 + 0.5)
    }

    /// Maps keypoints detected on an image resized by `scale` back to the original image.
    pub fn rescale(&mut self, scale: [f32; 2]) {
        for [x, y] in self.keypoints.iter_mut() {
            *x = (*x + 0.5) * scale[0] - 0.5;
            *y = (*y + 0.5) * scale[1] - 0.5;
        }
        let mean = 0.5 * (scale[0] + scale[1]);
        for s in self.scales.iter_mut() {
            *s *= mean;
        }
        self.uncertainty *= mean;
    }
}

/// Read access to the local features of database images by name.
pub trait LocalDescriptorStore: Send + Sync {
    /// Fails with [`MapError::MissingDescriptor`] when the image has no record.
    fn local_features(&self, name: &str) -> Result<Arc<LocalFeatures>, MapError>;

    fn contains(&self, name: &str) -> bool;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Local features held fully in memory.
#[derive(Debug, Default)]
pub struct ResidentDescriptors {
    features: HashMap<String, Arc<LocalFeatures>>,
}

impl ResidentDescriptors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, features: LocalFeatures) {
        self.features.insert(name.into(), Arc::new(features));
    }
}

impl FromIterator<(String, LocalFeatures)> for ResidentDescriptors {
    fn from_iter<I: IntoIterator<Item = (String, LocalFeatures)>>(iter: I) -> Self {
        let mut store = Self::new();
        for (name, features) in iter {
            store.insert(name, features);
        }
        store
    }
}

impl LocalDescriptorStore for ResidentDescriptors {
    fn local_features(&self, name: &str) -> Result<Arc<LocalFeatures>, MapError> {
        self.features
            .get(name)
            .cloned()
            .ok_or_else(|| MapError::MissingDescriptor(name.to_string()))
    }

    fn contains(&self, name: &str) -> bool {
        self.features.contains_key(name)
    }

    fn len(&self) -> usize {
        self.features.len()
    }
}

/// A local feature container on disk, read on demand.
#[derive(Debug)]
pub struct DescriptorContainer {
    path: PathBuf,
    file: Mutex<File>,
    index: BTreeMap<String, (u64, u64)>,
}

impl DescriptorContainer {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, MapError> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path).map_err(|e| MapError::io(&path, e))?;
        let file_len = file
            .metadata()
            .map_err(|e| MapError::io(&path, e))?
            .len();

        let mut header = [0u8; HEADER_LEN as usize];
        file.read_exact(&mut header)
            .map_err(|_| MapError::corrupt(&path, "truncated header"))?;
        if &header[..8] != MAGIC {
            return Err(MapError::corrupt(&path, "bad magic"));
        }
        let mut offset = [0u8; 8];
        offset.copy_from_slice(&header[8..]);
        let index_offset = u64::from_le_bytes(offset);
        if index_offset < HEADER_LEN || index_offset > file_len {
            return Err(MapError::corrupt(&path, "index offset out of range"));
        }

        file.seek(SeekFrom::Start(index_offset))
            .map_err(|e| MapError::io(&path, e))?;
        let index: BTreeMap<String, (u64, u64)> = bincode::deserialize_from(&mut file)
            .map_err(|e| MapError::corrupt(&path, format!("unreadable index: {}", e)))?;
        let outside = |(start, len): (u64, u64)| {
            start < HEADER_LEN || start.saturating_add(len) > index_offset
        };
        if let Some((name, _)) = index.iter().find(|(_, range)| outside(**range)) {
            return Err(MapError::corrupt(
                &path,
                format!("record for {} lies outside the data section", name),
            ));
        }
        debug!(
            "opened descriptor container {} with {} records",
            path.display(),
            index.len()
        );
        Ok(Self {
            path,
            file: Mutex::new(file),
            index,
        })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.index.keys().map(String::as_str)
    }
}

impl LocalDescriptorStore for DescriptorContainer {
    fn local_features(&self, name: &str) -> Result<Arc<LocalFeatures>, MapError> {
        let &(start, len) = self
            .index
            .get(name)
            .ok_or_else(|| MapError::MissingDescriptor(name.to_string()))?;
        let mut buffer = vec![0u8; len as usize];
        {
            let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
            file.seek(SeekFrom::Start(start))
                .and_then(|_| file.read_exact(&mut buffer))
                .map_err(|e| MapError::io(&self.path, e))?;
        }
        let features: LocalFeatures = bincode::deserialize(&buffer)
            .map_err(|e| MapError::corrupt(&self.path, format!("record {}: {}", name, e)))?;
        features
            .validate()
            .map_err(|e| MapError::corrupt(&self.path, format!("record {}: {}", name, e)))?;
        Ok(Arc::new(features))
    }

    fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    fn len(&self) -> usize {
        self.index.len()
    }
}

/// Writes a [`DescriptorContainer`].
pub struct DescriptorContainerWriter<W: Write + Seek> {
    writer: W,
    position: u64,
    index: BTreeMap<String, (u64, u64)>,
}

impl DescriptorContainerWriter<BufWriter<File>> {
    pub fn create(path: impl AsRef<Path>) -> Result<Self, MapError> {
        let path = path.as_ref();
        let file = File::create(path).map_err(|e| MapError::io(path, e))?;
        Self::new(BufWriter::new(file)).map_err(|e| MapError::io(path, e))
    }
}

impl<W: Write + Seek> DescriptorContainerWriter<W> {
    pub fn new(mut writer: W) -> std::io::Result<Self> {
        writer.write_all(MAGIC)?;
        writer.write_all(&0u64.to_le_bytes())?;
        Ok(Self {
            writer,
            position: HEADER_LEN,
            index: BTreeMap::new(),
        })
    }

    pub fn add(&mut self, name: impl Into<String>, features: &LocalFeatures) -> std::io::Result<()> {
        let bytes = bincode::serialize(features)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        self.writer.write_all(&bytes)?;
        self.index
            .insert(name.into(), (self.position, bytes.len() as u64));
        self.position += bytes.len() as u64;
        Ok(())
    }

    /// Writes the index and patches the header, returning the inner writer.
    pub fn finish(mut self) -> std::io::Result<W> {
        let index = bincode::serialize(&self.index)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        self.writer.write_all(&index)?;
        self.writer.seek(SeekFrom::Start(MAGIC.len() as u64))?;
        self.writer.write_all(&self.position.to_le_bytes())?;
        self.writer.seek(SeekFrom::End(0))?;
        self.writer.flush()?;
        Ok(self.writer)
    }
}

/// One global descriptor per database image, rows in map order.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalDescriptors {
    matrix: DMatrix<f32>,
}

impl GlobalDescriptors {
    pub fn from_rows(rows: &[Vec<f32>]) -> Result<Self, CapabilityError> {
        let dim = rows.first().map_or(0, Vec::len);
        if let Some(row) = rows.iter().find(|r| r.len() != dim) {
            return Err(CapabilityError::DimensionMismatch {
                expected: dim,
                actual: row.len(),
            });
        }
        Ok(Self {
            matrix: DMatrix::from_row_slice(rows.len(), dim, &rows.concat()),
        })
    }

    /// Reads the container and orders its rows to follow `image_names`.
    ///
    /// Every image must have a descriptor and all descriptors must share one dimension.
    pub fn load<'a>(
        path: impl AsRef<Path>,
        image_names: impl IntoIterator<Item = &'a str>,
    ) -> Result<Self, MapError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| MapError::io(path, e))?;
        let entries: Vec<(String, Vec<f32>)> =
            bincode::deserialize_from(std::io::BufReader::new(file))
                .map_err(|e| MapError::corrupt(path, e))?;
        let by_name: HashMap<&str, &Vec<f32>> =
            entries.iter().map(|(n, d)| (n.as_str(), d)).collect();
        let rows = image_names
            .into_iter()
            .map(|name| {
                by_name.get(name).map(|d| d.to_vec()).ok_or_else(|| {
                    MapError::corrupt(path, format!("no global descriptor for {}", name))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_rows(&rows).map_err(|e| MapError::corrupt(path, e))
    }

    pub fn write(path: impl AsRef<Path>, entries: &[(String, Vec<f32>)]) -> Result<(), MapError> {
        let path = path.as_ref();
        let file = File::create(path).map_err(|e| MapError::io(path, e))?;
        let mut writer = BufWriter::new(file);
        bincode::serialize_into(&mut writer, entries).map_err(|e| MapError::corrupt(path, e))?;
        writer.flush().map_err(|e| MapError::io(path, e))
    }

    pub fn len(&self) -> usize {
        self.matrix.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.matrix.nrows() == 0
    }

    pub fn dim(&self) -> usize {
        self.matrix.ncols()
    }

    /// The dot product of every database descriptor with the query.
    pub fn similarities(&self, query: &[f32]) -> Result<DVector<f32>, CapabilityError> {
        if query.len() != self.dim() {
            return Err(CapabilityError::DimensionMismatch {
                expected: self.dim(),
                actual: query.len(),
            });
        }
        Ok(&self.matrix * DVector::from_column_slice(query))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn features(n: usize, seed: f32) -> LocalFeatures {
        LocalFeatures::from_rows(
            (0..n).map(|i| [i as f32, seed]).collect(),
            vec![1.0; n],
            1.0,
            &(0..n).map(|i| vec![seed, i as f32, 0.5]).collect::<Vec<_>>(),
        )
        .unwrap()
    }

    #[test]
    fn container_reads_records_lazily() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("features.bin");
        let mut writer = DescriptorContainerWriter::create(&path).unwrap();
        writer.add("a.jpg", &features(3, 1.0)).unwrap();
        writer.add("b.jpg", &features(0, 2.0)).unwrap();
        writer.add("c.jpg", &features(5, 3.0)).unwrap();
        writer.finish().unwrap();

        let container = DescriptorContainer::open(&path).unwrap();
        assert_eq!(container.len(), 3);
        assert_eq!(*container.local_features("c.jpg").unwrap(), features(5, 3.0));
        assert!(container.local_features("b.jpg").unwrap().is_empty());
        assert!(matches!(
            container.local_features("missing.jpg"),
            Err(MapError::MissingDescriptor(name)) if name == "missing.jpg"
        ));
    }

    #[test]
    fn container_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("features.bin");
        std::fs::write(&path, b"not a container at all").unwrap();
        assert!(matches!(
            DescriptorContainer::open(&path),
            Err(MapError::Corrupt { .. })
        ));
    }

    #[test]
    fn rescale_maps_back_to_original_resolution() {
        let mut f = features(2, 0.0);
        f.keypoints = vec![[0.0, 0.0], [9.5, 4.5]];
        f.rescale([2.0, 2.0]);
        assert_eq!(f.keypoints, vec![[0.5, 0.5], [19.5, 9.5]]);
        assert_eq!(f.scales, vec![2.0, 2.0]);
        assert_eq!(f.uncertainty, 2.0);
    }

    #[test]
    fn global_rows_follow_image_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("global_features.bin");
        GlobalDescriptors::write(
            &path,
            &[
                ("b.jpg".to_string(), vec![0.0, 1.0]),
                ("a.jpg".to_string(), vec![1.0, 0.0]),
            ],
        )
        .unwrap();
        let global = GlobalDescriptors::load(&path, ["a.jpg", "b.jpg"]).unwrap();
        let sims = global.similarities(&[0.2, 0.8]).unwrap();
        assert_eq!(sims.as_slice(), &[0.2, 0.8]);
        assert!(global.similarities(&[1.0]).is_err());
        assert!(GlobalDescriptors::load(&path, ["a.jpg", "c.jpg"]).is_err());
    }

    #[test]
    fn ragged_rows_are_rejected() {
        assert!(matches!(
            GlobalDescriptors::from_rows(&[vec![1.0, 0.0], vec![1.0]]),
            Err(CapabilityError::DimensionMismatch { expected: 2, actual: 1 })
        ));
    }
}
