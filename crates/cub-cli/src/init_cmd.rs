//! `cub init`: write the project's `.cub/config.toml`.

use std::path::Path;

use anyhow::{bail, Context, Result};

use cub_core::config::{save_config, ConfigFile};

pub fn run(project_dir: &Path, force: bool) -> Result<()> {
    let config_path = project_dir.join(".cub").join("config.toml");
    if config_path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", config_path.display());
    }
    let path = save_config(project_dir, &ConfigFile::default()).context("writing config file")?;
    println!("wrote {}", path.display());
    Ok(())
}
