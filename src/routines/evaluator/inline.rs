use super::{Backend, Job};
use crate::error::Result;

/// Runs every job synchronously on the submitting thread
///
/// Used when no pool is available, and always inside workers.
#[derive(Debug, Default)]
pub struct InlineBackend;

impl Backend for InlineBackend {
    fn name(&self) -> &'static str {
        "inline"
    }

    fn spawn(&self, job: Job) -> Result<()> {
        job();
        Ok(())
    }

    fn restart(&self) -> Result<()> {
        Ok(())
    }

    fn shutdown(&self) {}
}
