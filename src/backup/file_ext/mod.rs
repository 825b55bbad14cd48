use std::sync::Arc;

/// Extension contributed by a pipeline stage, without the leading dot.
pub trait FileExtProvider {
    fn file_ext(&self) -> Option<Arc<str>>;
}
