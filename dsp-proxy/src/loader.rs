//! Loadable library support.
//!
//! A [`LibraryLoader`] places a library image in the host heap and reports
//! where it went as a [`PilInfo`] descriptor; the component then hands the
//! descriptor to the remote core in a `SET_PARAM`.

use std::io;
use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::param::{id, Param};
use crate::shmem::{Heap, Region, SharedMemory};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LibType {
    /// The codec itself.
    Codec,
    /// Glue between the component framework and the codec.
    Wrapper,
}

impl LibType {
    pub fn raw(self) -> u32 {
        match self {
            LibType::Codec => 0,
            LibType::Wrapper => 1,
        }
    }

    pub fn from_raw(raw: u32) -> Result<Self> {
        match raw {
            0 => Ok(LibType::Codec),
            1 => Ok(LibType::Wrapper),
            _ => Err(Error::InvalidArgument("library type")),
        }
    }
}

/// A library to load and, once loaded, where it lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibInfo {
    pub path: PathBuf,
    pub lib_type: LibType,
    /// Zero-initialised data region reserved next to the image.
    pub data_size: usize,
    pub code: Option<Region>,
    pub data: Option<Region>,
}

impl LibInfo {
    pub fn new(path: impl Into<PathBuf>, lib_type: LibType) -> Self {
        LibInfo {
            path: path.into(),
            lib_type,
            data_size: 0,
            code: None,
            data: None,
        }
    }

    pub fn with_data_size(mut self, size: usize) -> Self {
        self.data_size = size;
        self
    }

    pub fn is_loaded(&self) -> bool {
        self.code.is_some()
    }
}

/// Position-independent library descriptor as seen by the remote core.
/// Addresses are shared-memory offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PilInfo {
    pub lib_type: LibType,
    pub code_addr: u32,
    pub code_size: u32,
    pub data_addr: u32,
    pub data_size: u32,
}

impl PilInfo {
    /// `SET_PARAM` body that loads this library.
    pub fn load_params(&self) -> Vec<Param> {
        vec![
            Param::new(id::LIB_LOAD, self.lib_type.raw()),
            Param::new(id::LIB_CODE_ADDR, self.code_addr),
            Param::new(id::LIB_CODE_SIZE, self.code_size),
            Param::new(id::LIB_DATA_ADDR, self.data_addr),
            Param::new(id::LIB_DATA_SIZE, self.data_size),
        ]
    }

    pub fn unload_params(lib_type: LibType) -> Vec<Param> {
        vec![Param::new(id::LIB_UNLOAD, lib_type.raw())]
    }

    /// Inverse of [`load_params`](Self::load_params).
    pub fn from_params(params: &[Param]) -> Result<Self> {
        let field = |want: u32| {
            params
                .iter()
                .find(|p| p.id == want)
                .map(|p| p.value)
                .ok_or(Error::InvalidArgument("incomplete library descriptor"))
        };
        Ok(PilInfo {
            lib_type: LibType::from_raw(field(id::LIB_LOAD)?)?,
            code_addr: field(id::LIB_CODE_ADDR)?,
            code_size: field(id::LIB_CODE_SIZE)?,
            data_addr: field(id::LIB_DATA_ADDR)?,
            data_size: field(id::LIB_DATA_SIZE)?,
        })
    }
}

pub trait LibraryLoader: Send + Sync {
    /// Place `lib` in shared memory and fill in its regions.
    fn load(&self, shm: &SharedMemory, lib: &mut LibInfo) -> Result<PilInfo>;

    /// Release whatever [`load`](Self::load) reserved.
    fn unload(&self, shm: &SharedMemory, lib: &mut LibInfo) -> Result<()>;
}

/// Loads a flat image file verbatim into the host heap.
#[derive(Debug, Default, Clone, Copy)]
pub struct FlatLoader;

impl LibraryLoader for FlatLoader {
    fn load(&self, shm: &SharedMemory, lib: &mut LibInfo) -> Result<PilInfo> {
        if lib.is_loaded() {
            return Err(Error::InvalidState("library already loaded"));
        }
        let image = std::fs::read(&lib.path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => Error::NotFound,
            _ => Error::Transport(e),
        })?;
        if image.is_empty() {
            return Err(Error::InvalidArgument("empty library image"));
        }

        let code = shm.alloc(Heap::Host, image.len())?;
        if let Err(e) = shm.write(code.offset, &image) {
            let _ = shm.free(Heap::Host, code);
            return Err(e);
        }
        let data = if lib.data_size > 0 {
            match shm.alloc(Heap::Host, lib.data_size) {
                Ok(region) => {
                    shm.fill(region.offset, region.len, 0)?;
                    Some(region)
                }
                Err(e) => {
                    let _ = shm.free(Heap::Host, code);
                    return Err(e);
                }
            }
        } else {
            None
        };

        log::debug!(
            "loaded {} ({:?}): {} bytes at {:#x}",
            lib.path.display(),
            lib.lib_type,
            image.len(),
            code.offset
        );
        lib.code = Some(code);
        lib.data = data;
        Ok(PilInfo {
            lib_type: lib.lib_type,
            code_addr: code.offset as u32,
            code_size: image.len() as u32,
            data_addr: data.map_or(0, |r| r.offset as u32),
            data_size: data.map_or(0, |_| lib.data_size as u32),
        })
    }

    fn unload(&self, shm: &SharedMemory, lib: &mut LibInfo) -> Result<()> {
        let code = lib.code.take().ok_or(Error::InvalidState("library not loaded"))?;
        let mut result = shm.free(Heap::Host, code);
        if let Some(data) = lib.data.take() {
            result = crate::error::first_error(result, shm.free(Heap::Host, data));
        }
        result
    }
}
