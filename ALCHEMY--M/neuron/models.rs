//! Model-loading capability implemented by node variants.
//!
//! Generation itself happens outside this crate; the lifecycle manager only loads
//! the two pipelines once registration succeeded and optionally optimizes them.

use std::fmt;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tracing::info;

use crate::options::{GenerationArgs, NodeKind};

/// A loaded generation pipeline.
pub trait Pipeline: Send + Sync + fmt::Debug {
    /// Model identifier.
    fn name(&self) -> &str;

    /// Compiles the pipeline for throughput.
    ///
    /// # Errors
    /// Fails when the pipeline cannot be optimized on its device.
    fn optimize(&mut self) -> Result<()>;

    /// Whether [`Pipeline::optimize`] succeeded.
    fn is_optimized(&self) -> bool;
}

/// Text-to-image and image-to-image pipelines.
#[derive(Debug)]
pub struct ModelPair {
    /// Text-to-image pipeline.
    pub primary: Box<dyn Pipeline>,
    /// Image-to-image pipeline.
    pub secondary: Box<dyn Pipeline>,
}

impl ModelPair {
    /// Optimizes the primary pipeline, which serves most of the traffic.
    ///
    /// # Errors
    /// Propagates the pipeline error.
    pub fn optimize(&mut self) -> Result<()> {
        self.primary.optimize()?;
        info!(model = self.primary.name(), "primary pipeline optimized");
        Ok(())
    }
}

/// Node flavour supplying its own models.
#[async_trait]
pub trait NodeVariant: Send + Sync {
    /// Role of the node.
    fn kind(&self) -> NodeKind;

    /// Loads both pipelines.
    async fn load_models(&self, args: &GenerationArgs) -> Result<ModelPair>;
}

/// Pipeline descriptor bound to a device.
#[derive(Debug, Clone, PartialEq)]
pub struct NamedPipeline {
    name: String,
    args: GenerationArgs,
    optimized: bool,
}

impl NamedPipeline {
    /// Pipeline `name` configured with `args`.
    #[must_use]
    pub fn new(name: impl Into<String>, args: GenerationArgs) -> Self {
        Self {
            name: name.into(),
            args,
            optimized: false,
        }
    }

    /// Arguments the pipeline was loaded with.
    #[must_use]
    pub const fn args(&self) -> &GenerationArgs {
        &self.args
    }
}

impl Pipeline for NamedPipeline {
    fn name(&self) -> &str {
        &self.name
    }

    fn optimize(&mut self) -> Result<()> {
        if self.args.device == "cpu" {
            bail!("{} cannot be compiled on cpu", self.name);
        }
        self.optimized = true;
        Ok(())
    }

    fn is_optimized(&self) -> bool {
        self.optimized
    }
}

/// Stock miner loading the base diffusion model for both pipelines.
#[derive(Debug, Clone)]
pub struct DefaultMiner {
    model: String,
}

impl DefaultMiner {
    /// Base model shared by both pipelines.
    pub const BASE_MODEL: &'static str = "stabilityai/stable-diffusion-xl-base-1.0";

    /// Miner using [`Self::BASE_MODEL`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_model(Self::BASE_MODEL)
    }

    /// Miner using a custom model.
    #[must_use]
    pub fn with_model(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
        }
    }
}

impl Default for DefaultMiner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NodeVariant for DefaultMiner {
    fn kind(&self) -> NodeKind {
        NodeKind::Miner
    }

    async fn load_models(&self, args: &GenerationArgs) -> Result<ModelPair> {
        info!(model = %self.model, device = %args.device, "loading pipelines");
        Ok(ModelPair {
            primary: Box::new(NamedPipeline::new(&self.model, args.clone())),
            secondary: Box::new(NamedPipeline::new(
                format!("{}:img2img", self.model),
                args.clone(),
            )),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::NodeOptions;

    #[tokio::test]
    async fn default_miner_loads_pair_from_args() {
        let args = NodeOptions::default().generation_args();
        let miner = DefaultMiner::new();
        assert_eq!(miner.kind(), NodeKind::Miner);
        let mut pair = miner.load_models(&args).await.unwrap();
        assert_eq!(pair.primary.name(), DefaultMiner::BASE_MODEL);
        assert!(pair.secondary.name().ends_with(":img2img"));
        pair.optimize().unwrap();
        assert!(pair.primary.is_optimized());
        assert!(!pair.secondary.is_optimized());
    }

    #[test]
    fn cpu_pipelines_cannot_be_optimized() {
        let mut args = NodeOptions::default().generation_args();
        args.device = "cpu".into();
        let mut pipeline = NamedPipeline::new("tiny", args);
        assert!(pipeline.optimize().is_err());
        assert!(!pipeline.is_optimized());
    }
}
