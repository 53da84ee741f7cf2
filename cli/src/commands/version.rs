//! `dockyard version` command.

use clap::Args;
use dockyard_core::Result;

#[derive(Args)]
pub struct VersionArgs;

pub async fn execute(_args: VersionArgs) -> Result<()> {
    println!("dockyard version {}", dockyard_core::VERSION);
    Ok(())
}
