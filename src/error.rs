use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetcfgError {
    #[error("unable to get {path} from IMDS after {attempts} attempts")]
    MetadataUnavailable { path: String, attempts: u32 },

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("unable to register in {path:?} before the deadline")]
    RegistrationFailed { path: PathBuf },
}
