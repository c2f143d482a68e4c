use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A shared, cooperative cancellation flag
///
/// Clones share the same flag, so the host keeps one clone and hands another to the refinement.
/// Methods poll [Cancellable::is_cancelled] once per outer iteration and return at the next
/// boundary; an evaluation batch that was already submitted is still folded into the history.
///
/// Optionally the token also watches a stop file: if the file appears on disk, the token is
/// cancelled as if [Cancellable::cancel] had been called.
#[derive(Debug, Clone, Default)]
pub struct Cancellable {
    flag: Arc<AtomicBool>,
    stop_file: Option<Arc<PathBuf>>,
}

impl Cancellable {
    pub fn new() -> Self {
        Cancellable::default()
    }

    /// Also treat the existence of `path` as a cancellation request
    pub fn with_stop_file(mut self, path: impl AsRef<Path>) -> Self {
        self.stop_file = Some(Arc::new(path.as_ref().to_path_buf()));
        self
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Clear a previous request so the token can be reused for another run
    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        if self.flag.load(Ordering::SeqCst) {
            return true;
        }
        if let Some(path) = &self.stop_file {
            if path.exists() {
                tracing::warn!("Stopfile detected - breaking");
                self.cancel();
                return true;
            }
        }
        false
    }

    /// Remove a stop file left over from a previous run
    pub fn clear_stop_file(&self) -> std::io::Result<()> {
        if let Some(path) = &self.stop_file {
            if path.exists() {
                tracing::info!("Removing existing stop file prior to run");
                std::fs::remove_file(path.as_path())?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_flag() {
        let token = Cancellable::new();
        let other = token.clone();
        assert!(!other.is_cancelled());
        token.cancel();
        assert!(other.is_cancelled());
        other.reset();
        assert!(!token.is_cancelled());
    }

    #[test]
    fn test_stop_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stop");
        let token = Cancellable::new().with_stop_file(&path);
        assert!(!token.is_cancelled());

        std::fs::write(&path, b"").unwrap();
        assert!(token.is_cancelled());

        token.clear_stop_file().unwrap();
        assert!(!path.exists());
        // The flag stays raised until reset
        assert!(token.is_cancelled());
        token.reset();
        assert!(!token.is_cancelled());
    }
}
