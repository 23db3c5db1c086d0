use std::{convert::TryFrom, fmt};

use ndarray::{ArrayD, ArrayView2, ArrayViewMut2, Axis, IxDyn};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// The seven named axes of every blob, outermost first.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BlobDim {
    BatchLength,
    BatchWidth,
    ListSize,
    Height,
    Width,
    Depth,
    Channels,
}

impl BlobDim {
    pub const COUNT: usize = 7;

    pub const ALL: [BlobDim; BlobDim::COUNT] = [
        BlobDim::BatchLength,
        BlobDim::BatchWidth,
        BlobDim::ListSize,
        BlobDim::Height,
        BlobDim::Width,
        BlobDim::Depth,
        BlobDim::Channels,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn axis(self) -> Axis {
        Axis(self.index())
    }
}

/// Shape of a blob: one size per [`BlobDim`]. A zero size makes the blob
/// empty.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlobDesc {
    dims: [usize; BlobDim::COUNT],
}

impl Default for BlobDesc {
    fn default() -> Self {
        Self {
            dims: [1; BlobDim::COUNT],
        }
    }
}

impl BlobDesc {
    pub fn new(dims: [usize; BlobDim::COUNT]) -> Self {
        Self { dims }
    }

    /// A descriptor of `channels` channels, all other axes of size one.
    pub fn channels_only(channels: usize) -> Self {
        Self::default().with(BlobDim::Channels, channels)
    }

    #[must_use]
    pub fn with(mut self, dim: BlobDim, size: usize) -> Self {
        self.dims[dim.index()] = size;
        self
    }

    pub fn set_dim(&mut self, dim: BlobDim, size: usize) {
        self.dims[dim.index()] = size;
    }

    pub fn dim(&self, dim: BlobDim) -> usize {
        self.dims[dim.index()]
    }

    pub fn dims(&self) -> &[usize; BlobDim::COUNT] {
        &self.dims
    }

    pub fn batch_length(&self) -> usize {
        self.dim(BlobDim::BatchLength)
    }

    pub fn batch_width(&self) -> usize {
        self.dim(BlobDim::BatchWidth)
    }

    pub fn list_size(&self) -> usize {
        self.dim(BlobDim::ListSize)
    }

    pub fn height(&self) -> usize {
        self.dim(BlobDim::Height)
    }

    pub fn width(&self) -> usize {
        self.dim(BlobDim::Width)
    }

    pub fn depth(&self) -> usize {
        self.dim(BlobDim::Depth)
    }

    pub fn channels(&self) -> usize {
        self.dim(BlobDim::Channels)
    }

    /// BatchLength × BatchWidth × ListSize.
    pub fn object_count(&self) -> usize {
        self.dims[..3].iter().product()
    }

    /// Height × Width × Depth × Channels.
    pub fn object_size(&self) -> usize {
        self.dims[3..].iter().product()
    }

    pub fn blob_size(&self) -> usize {
        self.dims.iter().product()
    }

    /// Whether both descriptors agree on every axis except `except`.
    pub fn has_equal_dims_except(&self, other: &BlobDesc, except: BlobDim) -> bool {
        BlobDim::ALL
            .iter()
            .all(|&dim| dim == except || self.dim(dim) == other.dim(dim))
    }
}

impl fmt::Debug for BlobDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for BlobDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [bl, bw, ls, h, w, d, c] = self.dims;
        write!(
            f,
            "[BL={} BW={} LS={} H={} W={} D={} C={}]",
            bl, bw, ls, h, w, d, c
        )
    }
}

/// A dense seven-axis tensor of `f32` stored in standard (row-major) order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(into = "BlobRecord", try_from = "BlobRecord")]
pub struct Blob {
    desc: BlobDesc,
    data: ArrayD<f32>,
}

impl Blob {
    pub fn zeros(desc: BlobDesc) -> Self {
        Self::full(desc, 0.)
    }

    pub fn full(desc: BlobDesc, value: f32) -> Self {
        Self {
            desc,
            data: ArrayD::from_elem(IxDyn(desc.dims()), value),
        }
    }

    pub fn from_vec(desc: BlobDesc, values: Vec<f32>) -> Result<Self> {
        if values.len() != desc.blob_size() {
            return Err(Error::Configuration(format!(
                "blob {} holds {} values, got {}",
                desc,
                desc.blob_size(),
                values.len()
            )));
        }
        let data = ArrayD::from_shape_vec(IxDyn(desc.dims()), values)?;
        Ok(Self { desc, data })
    }

    /// Wraps a seven-dimensional array.
    pub fn from_array(array: ArrayD<f32>) -> Result<Self> {
        let shape = array.shape();
        if shape.len() != BlobDim::COUNT {
            return Err(Error::Configuration(format!(
                "a blob needs {} axes, the array has {}",
                BlobDim::COUNT,
                shape.len()
            )));
        }
        let mut dims = [1; BlobDim::COUNT];
        dims.copy_from_slice(shape);
        let data = if array.is_standard_layout() {
            array
        } else {
            array.as_standard_layout().into_owned()
        };
        Ok(Self {
            desc: BlobDesc::new(dims),
            data,
        })
    }

    pub fn desc(&self) -> BlobDesc {
        self.desc
    }

    pub fn len(&self) -> usize {
        self.desc.blob_size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn data(&self) -> &ArrayD<f32> {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut ArrayD<f32> {
        &mut self.data
    }

    pub fn to_vec(&self) -> Vec<f32> {
        self.data.iter().copied().collect()
    }

    /// Views the blob as a `object_count × object_size` matrix.
    pub fn as_matrix(&self) -> Result<ArrayView2<'_, f32>> {
        let (rows, cols) = (self.desc.object_count(), self.desc.object_size());
        Ok(self.data.view().into_shape((rows, cols))?)
    }

    pub fn as_matrix_mut(&mut self) -> Result<ArrayViewMut2<'_, f32>> {
        let (rows, cols) = (self.desc.object_count(), self.desc.object_size());
        Ok(self.data.view_mut().into_shape((rows, cols))?)
    }
}

#[derive(Serialize, Deserialize)]
struct BlobRecord {
    desc: BlobDesc,
    data: Vec<f32>,
}

impl From<Blob> for BlobRecord {
    fn from(blob: Blob) -> Self {
        Self {
            desc: blob.desc,
            data: blob.to_vec(),
        }
    }
}

impl TryFrom<BlobRecord> for Blob {
    type Error = Error;

    fn try_from(record: BlobRecord) -> Result<Self> {
        Blob::from_vec(record.desc, record.data)
    }
}
