//! Memory-mapped disk backend.
//!
//! Vectors live in fixed-size page files of `vecs_per_file` lowered slots
//! each, addressed by `page = id / vecs_per_file` and
//! `offset = (id mod vecs_per_file) · lower_size(d)`. Pages are created
//! lazily, truncated to their full size up front, and mapped read-write.
//! Alongside the pages the directory holds:
//!
//! - `metadata.json` — dimensions, quantizer name, page geometry, page list
//! - `bases` — the basis set as a flat little-endian f32 stream
//! - `<basis>-<axis>.bmap` — one roaring bitmap per (basis, signed axis)
//! - `presence.bmap` — the set of stored ids
//!
//! The presence bitmap makes `exists` exact even for lowered forms that
//! encode to all-zero bytes; directories written before presence tracking
//! are reopened by rescanning the pages for non-zero slots. All single-file
//! writes go through a temp file and rename.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

use memmap2::MmapMut;
use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::backend::{IndexBackend, ScannableBackend, VectorBackend, VectorGetter};
use crate::quantization::Quantization;
use crate::types::{BackendError, BackendInfo, Basis, ID};

pub const DEFAULT_VECS_PER_FILE: usize = 200_000;

const METADATA_FILE: &str = "metadata.json";
const BASES_FILE: &str = "bases";
const PRESENCE_FILE: &str = "presence.bmap";

#[derive(Debug, Serialize, Deserialize)]
struct DiskMetadata {
    dimensions: usize,
    quantization: String,
    vecs_per_file: usize,
    vec_files: Vec<u64>,
}

#[derive(Debug)]
pub struct DiskBackend<Q: Quantization> {
    dir: PathBuf,
    metadata: DiskMetadata,
    quantization: Q,
    pages: HashMap<u64, MmapMut>,
    presence: RoaringBitmap,
    saved_token: u64,
}

impl<Q: Quantization> DiskBackend<Q> {
    pub fn new(
        directory: impl Into<PathBuf>,
        dimensions: usize,
        quantization: Q,
    ) -> Result<Self, BackendError> {
        Self::with_vecs_per_file(directory, dimensions, quantization, DEFAULT_VECS_PER_FILE)
    }

    pub fn with_vecs_per_file(
        directory: impl Into<PathBuf>,
        dimensions: usize,
        quantization: Q,
        vecs_per_file: usize,
    ) -> Result<Self, BackendError> {
        let mut backend = DiskBackend {
            dir: directory.into(),
            metadata: DiskMetadata {
                dimensions,
                quantization: quantization.name().to_string(),
                vecs_per_file,
                vec_files: Vec::new(),
            },
            quantization,
            pages: HashMap::new(),
            presence: RoaringBitmap::new(),
            saved_token: 0,
        };
        backend.open_files()?;
        Ok(backend)
    }

    fn open_files(&mut self) -> Result<(), BackendError> {
        let metadata_path = self.dir.join(METADATA_FILE);
        if !metadata_path.exists() {
            fs::create_dir_all(&self.dir)?;
            return self.save_metadata();
        }

        let stored: DiskMetadata = serde_json::from_reader(BufReader::new(File::open(
            &metadata_path,
        )?))
        .map_err(std::io::Error::from)?;
        if stored.quantization != self.quantization.name() {
            return Err(BackendError::IncompatibleBackend(
                "the quantization this directory was written with",
            ));
        }
        if stored.dimensions != self.metadata.dimensions {
            return Err(BackendError::DimensionMismatch {
                expected: self.metadata.dimensions,
                actual: stored.dimensions,
            });
        }
        self.metadata = stored;

        let keys = self.metadata.vec_files.clone();
        for key in keys {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(self.page_path(key))?;
            let map = unsafe { MmapMut::map_mut(&file)? };
            self.pages.insert(key, map);
        }
        self.load_presence()
    }

    fn load_presence(&mut self) -> Result<(), BackendError> {
        let path = self.dir.join(PRESENCE_FILE);
        if path.exists() {
            self.presence = RoaringBitmap::deserialize_from(BufReader::new(File::open(path)?))?;
            return Ok(());
        }
        // Directory written before presence tracking: treat a non-zero slot
        // as populated, which is what `exists` used to check directly.
        let size = self.quantization.lower_size(self.metadata.dimensions);
        for (&key, page) in &self.pages {
            for slot in 0..self.metadata.vecs_per_file {
                let bytes = &page[slot * size..(slot + 1) * size];
                if bytes.iter().any(|&b| b != 0) {
                    let id = key * self.metadata.vecs_per_file as u64 + slot as u64;
                    self.presence.insert(id as u32);
                }
            }
        }
        Ok(())
    }

    /// Writes a file through a sibling temp file and an atomic rename.
    fn write_atomic<F>(&self, path: &Path, write: F) -> Result<(), BackendError>
    where
        F: FnOnce(&mut File) -> Result<(), BackendError>,
    {
        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        write(tmp.as_file_mut())?;
        tmp.persist(path).map_err(|e| BackendError::Io(e.error))?;
        Ok(())
    }

    fn save_metadata(&self) -> Result<(), BackendError> {
        self.write_atomic(&self.dir.join(METADATA_FILE), |f| {
            serde_json::to_writer(&mut *f, &self.metadata).map_err(std::io::Error::from)?;
            Ok(())
        })
    }

    fn save_presence(&self) -> Result<(), BackendError> {
        self.write_atomic(&self.dir.join(PRESENCE_FILE), |f| {
            self.presence.serialize_into(&mut *f)?;
            Ok(())
        })
    }

    fn page_path(&self, key: u64) -> PathBuf {
        self.dir.join(format!("{:016x}.vec", key))
    }

    fn bitmap_path(&self, basis: usize, index: i32) -> PathBuf {
        self.dir
            .join(format!("{:04x}-{:08x}.bmap", basis as u16, index as u32))
    }

    fn address(&self, id: ID) -> (u64, usize) {
        let per_file = self.metadata.vecs_per_file as u64;
        let size = self.quantization.lower_size(self.metadata.dimensions);
        (id / per_file, (id % per_file) as usize * size)
    }

    fn create_page(&mut self, key: u64) -> Result<(), BackendError> {
        let size = self.quantization.lower_size(self.metadata.dimensions);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.page_path(key))?;
        file.set_len((size * self.metadata.vecs_per_file) as u64)?;
        let map = unsafe { MmapMut::map_mut(&file)? };
        self.pages.insert(key, map);
        self.metadata.vec_files.push(key);
        self.save_metadata()
    }
}

impl<Q: Quantization> VectorBackend for DiskBackend<Q> {
    fn put_vector(&mut self, id: ID, vector: &[f32]) -> Result<(), BackendError> {
        if vector.len() != self.metadata.dimensions {
            return Err(BackendError::DimensionMismatch {
                expected: self.metadata.dimensions,
                actual: vector.len(),
            });
        }
        let lowered = self.quantization.lower(vector)?;
        let size = self.quantization.lower_size(self.metadata.dimensions);
        let (key, offset) = self.address(id);
        if !self.pages.contains_key(&key) {
            self.create_page(key)?;
        }
        let page = self.pages.get_mut(&key).expect("page was just created");
        self.quantization
            .marshal(&mut page[offset..offset + size], &lowered)?;
        self.presence.insert(id as u32);
        Ok(())
    }

    fn compute_similarity(&self, query: &[f32], id: ID) -> Result<f32, BackendError> {
        let lowered = self.quantization.lower(query)?;
        let target = self.get_vector(id)?;
        Ok(self.quantization.similarity(&target, &lowered))
    }

    fn info(&self) -> BackendInfo {
        BackendInfo {
            has_index_data: self.dir.join(BASES_FILE).exists(),
            dimensions: self.metadata.dimensions,
            quantization: self.quantization.name().to_string(),
        }
    }

    fn exists(&self, id: ID) -> bool {
        self.presence.contains(id as u32)
    }

    fn close(&mut self) -> Result<(), BackendError> {
        for page in self.pages.values() {
            page.flush()?;
        }
        self.save_presence()?;
        self.save_metadata()?;
        self.pages.clear();
        Ok(())
    }

    fn as_scannable(&self) -> Option<&dyn ScannableBackend> {
        Some(self)
    }

    fn as_index_backend(&mut self) -> Option<&mut dyn IndexBackend> {
        Some(self)
    }
}

impl<Q: Quantization> ScannableBackend for DiskBackend<Q> {
    fn for_each_id(
        &self,
        f: &mut dyn FnMut(ID) -> Result<(), BackendError>,
    ) -> Result<(), BackendError> {
        for id in self.presence.iter() {
            f(id as ID)?;
        }
        Ok(())
    }
}

impl<Q: Quantization> VectorGetter<Q::Lowered> for DiskBackend<Q> {
    fn get_vector(&self, id: ID) -> Result<Q::Lowered, BackendError> {
        if !self.presence.contains(id as u32) {
            return Err(BackendError::IdNotFound);
        }
        let size = self.quantization.lower_size(self.metadata.dimensions);
        let (key, offset) = self.address(id);
        let page = self.pages.get(&key).ok_or(BackendError::IdNotFound)?;
        Ok(self.quantization.unmarshal(&page[offset..offset + size])?)
    }
}

impl<Q: Quantization> IndexBackend for DiskBackend<Q> {
    fn save_bases(&mut self, bases: &[Basis], token: u64) -> Result<u64, BackendError> {
        if token == self.saved_token {
            return Ok(token);
        }
        self.write_atomic(&self.dir.join(BASES_FILE), |f| {
            let mut w = BufWriter::new(f);
            for basis in bases {
                for vector in basis {
                    for component in vector {
                        w.write_all(&component.to_le_bytes())?;
                    }
                }
            }
            w.flush()?;
            Ok(())
        })?;
        self.saved_token = token;
        Ok(token)
    }

    fn load_bases(&self) -> Result<Vec<Basis>, BackendError> {
        let dims = self.metadata.dimensions;
        let bytes = fs::read(self.dir.join(BASES_FILE))?;
        let basis_bytes = 4 * dims * dims;
        if basis_bytes == 0 || bytes.len() % basis_bytes != 0 {
            return Err(BackendError::Io(std::io::Error::new(
                ErrorKind::InvalidData,
                format!("bases file holds {} bytes, not a whole number of bases", bytes.len()),
            )));
        }
        let mut bases = Vec::with_capacity(bytes.len() / basis_bytes);
        for basis_chunk in bytes.chunks_exact(basis_bytes) {
            let mut basis = Vec::with_capacity(dims);
            for vector_chunk in basis_chunk.chunks_exact(4 * dims) {
                let mut vector = Vec::with_capacity(dims);
                for component in vector_chunk.chunks_exact(4) {
                    let mut le = [0u8; 4];
                    le.copy_from_slice(component);
                    vector.push(f32::from_le_bytes(le));
                }
                basis.push(vector);
            }
            bases.push(basis);
        }
        Ok(bases)
    }

    fn save_bitmap(
        &mut self,
        basis: usize,
        index: i32,
        bitmap: &RoaringBitmap,
    ) -> Result<(), BackendError> {
        self.write_atomic(&self.bitmap_path(basis, index), |f| {
            bitmap.serialize_into(&mut *f)?;
            Ok(())
        })
    }

    fn load_bitmap(&self, basis: usize, index: i32) -> Result<Option<RoaringBitmap>, BackendError> {
        let path = self.bitmap_path(basis, index);
        if !path.exists() {
            return Ok(None);
        }
        let bitmap = RoaringBitmap::deserialize_from(BufReader::new(File::open(path)?))?;
        Ok(Some(bitmap))
    }

    fn sync(&mut self) -> Result<(), BackendError> {
        for page in self.pages.values() {
            page.flush_async()?;
        }
        self.save_presence()
    }
}
