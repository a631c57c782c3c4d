use std::sync::Arc;

use codeflow_core::ArtifactKey;

use super::{Stage, StageContext, StageError};

/// In-process stage backed by a closure over the artifact text.
pub struct FnStage<F> {
    name: String,
    f: F,
}

impl<F> FnStage<F>
where
    F: Fn(&str) -> Result<String, String> + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self { name: name.into(), f }
    }

    /// Build the stage already erased to `Arc<dyn Stage>`.
    pub fn shared(name: impl Into<String>, f: F) -> Arc<dyn Stage> {
        Arc::new(Self::new(name, f))
    }
}

impl<F> Stage for FnStage<F>
where
    F: Fn(&str) -> Result<String, String> + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, ctx: &StageContext<'_>) -> Result<ArtifactKey, StageError> {
        let input = ctx.store.get(ctx.input)?;
        let output = (self.f)(&input).map_err(StageError::Failed)?;
        ctx.store.put(ctx.output, &output)?;
        Ok(ctx.output.clone())
    }
}
