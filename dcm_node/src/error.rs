use dicom_object::{ReadError, WriteError};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Calling AE title {0:?} is not trusted")]
    Untrusted(String),
    #[error("Unable to parse DICOM header: {0}")]
    HeaderParse(#[from] ReadError),
    #[error("Unable to write DICOM data: {0}")]
    DicomWrite(#[from] WriteError),
    #[error("DICOM object has no SOP instance UID")]
    UidMissing,
    #[error("Incomplete file meta information: {0}")]
    MetaBuild(String),
    #[error("Unable to place {path:?}: {source}")]
    PlacementIo {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
    #[error("Association with {0} could not be established")]
    AssociationRefused(String),
    #[error("C-STORE rejected with status 0x{status:04X}")]
    StoreFailed { status: u16 },
    #[error("RT dose dataset bytes are missing or truncated")]
    DoseIntegrity,
    #[error("No configured DICOM node named {0:?}")]
    UnknownNode(String),
    #[error("Filesystem watcher error: {0}")]
    Notify(#[from] notify::Error),
    #[error("Unable to walk directory: {0}")]
    WalkDir(#[from] walkdir::Error),
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
