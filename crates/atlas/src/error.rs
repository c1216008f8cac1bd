use thiserror::Error;

#[derive(Error, Debug)]
pub enum AtlasError {
    #[error("Image processing error: {0}")]
    ImageProcessing(String),

    #[error("Geometric computation error: {0}")]
    GeometricComputation(String),

    #[error("Region statistics error: {0}")]
    RegionStatistics(String),

    #[error("Volume dimension mismatch: {0}")]
    DimensionMismatch(String),

    #[error("Missing metadata: {0}")]
    MissingMetadata(String),

    #[error("Thread pool error: {0}")]
    ThreadPool(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Geometry blob encode error: {0}")]
    BlobEncode(#[from] bincode::error::EncodeError),

    #[error("Geometry blob decode error: {0}")]
    BlobDecode(#[from] bincode::error::DecodeError),

    #[error("Base64 error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AtlasError>;
