//! `dockyard tag` command: create a tag that refers to an existing image.

use std::path::Path;

use clap::Args;
use dockyard_core::Result;
use dockyard_pipeline::ImageReference;

#[derive(Args)]
pub struct TagArgs {
    /// Source image reference
    pub source: String,

    /// Target image reference (new tag)
    pub target: String,
}

pub async fn execute(args: TagArgs, config_path: &Path) -> Result<()> {
    let source = ImageReference::parse(&args.source)?;
    let target = ImageReference::parse(&args.target)?;

    let config = super::load_config_or_default(config_path)?;
    let store = super::open_image_store(&config)?;
    // Same layout directory, no copy.
    let tagged = store.tag(&source, &target).await?;

    println!("{}", tagged.reference);
    Ok(())
}
