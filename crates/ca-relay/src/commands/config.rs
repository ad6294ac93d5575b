//! Config command implementations

use std::path::Path;

use anyhow::{Context, Result};

use crate::output::{print_info, print_warning};

/// Print the configuration file location
pub fn config_path(config_path: &Path) -> Result<()> {
    println!("{}", config_path.display());
    Ok(())
}

/// Show the effective configuration
pub fn config_show(config_path: &Path) -> Result<()> {
    if config_path.exists() {
        print_info(&format!("Configuration file: {:?}", config_path));
    } else {
        print_warning(&format!(
            "No configuration file at {:?}; showing defaults",
            config_path
        ));
    }
    println!();

    let config = super::load(config_path)?;
    let content = toml::to_string_pretty(&config).context("Failed to render configuration")?;
    println!("{}", content);

    Ok(())
}
