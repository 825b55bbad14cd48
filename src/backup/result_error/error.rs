use crate::backup::manifest::RecordStatus;
use crate::backup::result_error::{WithDebugObjectAndFnName, WithMsg};
use itertools::Itertools;
use std::fmt::Debug;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    LiblzmaStream(#[from] liblzma::stream::Error),
    #[error(transparent)]
    AgeDecrypt(#[from] age::DecryptError),
    #[error(transparent)]
    ValidationError(#[from] validator::ValidationErrors),
    #[error(transparent)]
    ThreadPoolBuildError(#[from] rayon::ThreadPoolBuildError),
    #[error(transparent)]
    SerdeYml(#[from] serde_yml::Error),
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
    #[error(transparent)]
    WalkDir(#[from] walkdir::Error),
    #[error("Source path does not exist: {0:?}")]
    SourceNotFound(PathBuf),
    #[error("Source path is a protected system path: {0:?}")]
    ProtectedPath(PathBuf),
    #[error("Copy {src:?} -> {dst:?} failed: {source}")]
    CopyFailed {
        src: PathBuf,
        dst: PathBuf,
        source: std::io::Error,
    },
    #[error("Checksum mismatch for {src:?}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        src: PathBuf,
        expected: String,
        actual: String,
    },
    #[error("Timed out after {waited:?} waiting for lock {path:?}")]
    LockTimeout { path: PathBuf, waited: Duration },
    #[error("{}:\n{}", msg, indent::indent_all_with("  ", error.to_string()))]
    WithMsg { msg: String, error: Box<Error> },
    #[error("{:?} {} failed:\n{}", obj_debug, fn_name, indent::indent_all_with("  ", error.to_string()))]
    WithDebugObjAndFnName {
        error: Box<Error>,
        obj_debug: Box<dyn Debug + Send>,
        fn_name: String,
    },
    #[error("{}", itertools::join(.0, "\n\n"))]
    LotsOfError(Vec<Error>),
}

impl<S: Into<String>, O: Debug + Send + 'static> WithDebugObjectAndFnName<S, O> for Error {
    fn with_debug_object_and_fn_name(self, obj: O, fn_name: S) -> Self {
        Error::WithDebugObjAndFnName {
            error: Box::new(self),
            obj_debug: Box::new(obj),
            fn_name: fn_name.into(),
        }
    }
}

impl<S: Into<String>> WithMsg<S> for Error {
    fn with_msg(self, msg: S) -> Self {
        Self::WithMsg {
            msg: msg.into(),
            error: Box::new(self),
        }
    }
}

impl From<Vec<Error>> for Error {
    fn from(errors: Vec<Error>) -> Self {
        if errors.is_empty() {
            panic!("Should not create lots of errors when error is empty")
        }
        Self::LotsOfError(errors.into_iter().flat_map(|e| e.into_iter()).collect_vec())
    }
}

impl Error {
    pub fn into_iter(self) -> Box<dyn Iterator<Item = Error>> {
        match self {
            Error::LotsOfError(v) => Box::new(v.into_iter().flat_map(|e| e.into_iter())),
            e => Box::new(std::iter::once(e)),
        }
    }

    pub fn chain(self, other: Error) -> Error {
        Error::LotsOfError(self.into_iter().chain(other.into_iter()).collect_vec())
    }

    /// Errors that abort the whole run rather than a single file or directory.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::SourceNotFound(_)
            | Error::ProtectedPath(_)
            | Error::LockTimeout { .. }
            | Error::ValidationError(_) => true,
            Error::WithMsg { error, .. } | Error::WithDebugObjAndFnName { error, .. } => {
                error.is_fatal()
            }
            Error::LotsOfError(errors) => errors.iter().any(Error::is_fatal),
            _ => false,
        }
    }

    /// Maps a failed per-file copy onto the record status it is reported as.
    pub fn copy_status(&self) -> RecordStatus {
        match self {
            Error::ChecksumMismatch { .. } => RecordStatus::ChecksumMismatch,
            Error::WithMsg { error, .. } | Error::WithDebugObjAndFnName { error, .. } => {
                error.copy_status()
            }
            _ => RecordStatus::CopyFailed,
        }
    }
}
