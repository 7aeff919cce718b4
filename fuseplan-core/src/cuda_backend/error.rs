use cudarc::driver::DriverError;

/// Driver failures surfaced by the CUDA stream and scratch bindings.
#[derive(thiserror::Error, Debug)]
pub enum CudaError {
    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error("{cuda} while creating a context on device {ordinal}")]
    Context { cuda: DriverError, ordinal: usize },

    #[error("{cuda} when allocating {bytes} bytes of scratch")]
    Scratch { cuda: DriverError, bytes: u64 },
}

impl From<CudaError> for crate::Error {
    fn from(val: CudaError) -> Self {
        crate::Error::Cuda(Box::new(val)).bt()
    }
}

/// `.w()` turns a driver result into a crate result.
pub trait WrapErr<O> {
    fn w(self) -> crate::Result<O>;
}

impl<O, E: Into<CudaError>> WrapErr<O> for std::result::Result<O, E> {
    fn w(self) -> crate::Result<O> {
        self.map_err(|e| crate::Error::from(Into::<CudaError>::into(e)))
    }
}
