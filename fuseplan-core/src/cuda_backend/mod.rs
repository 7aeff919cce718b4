//! Binding of the stream and scratch seams to a CUDA context via `cudarc`.
//!
//! Engine enumeration and compilation stay with the caller's engine library;
//! this module only provides what a [`crate::Runner`] needs to execute on a
//! real device.

use std::{any::Any, sync::Arc};

use cudarc::driver::{
    result::memset_d8_async, sys::CUdevice_attribute, CudaContext, CudaSlice, CudaStream,
    DevicePtr as _,
};
use error::{CudaError, WrapErr};
use parking_lot::Mutex;

use crate::{
    backend::{ContextId, DevicePtr, ScratchAllocator, Stream},
    Result,
};

pub(crate) mod error;

/// One CUDA context plus the stable handle identifying it.
#[derive(Clone)]
pub struct CudaDevice {
    context: Arc<CudaContext>,
    id: ContextId,
}

impl CudaDevice {
    pub fn new(ordinal: usize) -> Result<Self> {
        let context =
            CudaContext::new(ordinal).map_err(|cuda| CudaError::Context { cuda, ordinal })?;
        Ok(Self {
            context,
            id: ContextId::fresh(),
        })
    }

    pub fn context_id(&self) -> ContextId {
        self.id
    }

    pub fn compute_capability(&self) -> Result<(u32, u32)> {
        let major = self
            .context
            .attribute(CUdevice_attribute::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR)
            .w()?;
        let minor = self
            .context
            .attribute(CUdevice_attribute::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR)
            .w()?;
        Ok((major as u32, minor as u32))
    }

    pub fn new_stream(&self) -> Result<CudaStreamHandle> {
        Ok(CudaStreamHandle {
            stream: self.context.new_stream().w()?,
            context: self.id,
        })
    }
}

/// A CUDA stream tagged with the context it was created under.
#[derive(Clone)]
pub struct CudaStreamHandle {
    stream: Arc<CudaStream>,
    context: ContextId,
}

impl CudaStreamHandle {
    pub fn stream(&self) -> Arc<CudaStream> {
        self.stream.clone()
    }

    /// Scratch allocations on this stream, freed when the allocator drops.
    pub fn scratch(&self) -> CudaScratch {
        CudaScratch {
            stream: self.stream.clone(),
            buffers: Mutex::new(Vec::new()),
        }
    }
}

impl Stream for CudaStreamHandle {
    fn context(&self) -> ContextId {
        self.context
    }

    fn synchronize(&self) -> Result<()> {
        self.stream.synchronize().w()
    }

    fn memset_zero(&self, ptr: DevicePtr, bytes: u64) -> Result<()> {
        // SAFETY: the caller owns `bytes` bytes at `ptr` on this stream's context.
        unsafe { memset_d8_async(ptr.0, 0, bytes as usize, self.stream.cu_stream()) }.w()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct CudaScratch {
    stream: Arc<CudaStream>,
    buffers: Mutex<Vec<CudaSlice<u8>>>,
}

impl ScratchAllocator for CudaScratch {
    fn allocate(&self, bytes: u64) -> Result<DevicePtr> {
        let slice = self
            .stream
            .alloc_zeros::<u8>(bytes as usize)
            .map_err(|cuda| CudaError::Scratch { cuda, bytes })?;
        let ptr = {
            let (ptr, _sync) = slice.device_ptr(&self.stream);
            DevicePtr(ptr)
        };
        self.buffers.lock().push(slice);
        Ok(ptr)
    }
}
