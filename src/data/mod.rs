//! Sample processing and storage.
pub mod allan;
pub mod pipeline;
pub mod sample_log;

pub use allan::AllanWindow;
pub use pipeline::{
    CoefficientObserver, PolynomialSurface, SampleObserver, SamplePipeline, SampleRecord,
};
pub use sample_log::{SampleLog, SAMPLE_LOG_HEADER};
