//! Token command implementations

use std::path::Path;

use anyhow::Result;

use crate::output::{print_info, print_success, print_warning};

/// Print the current token, creating it on first use
pub fn token_show(config_path: &Path) -> Result<()> {
    let config = super::load(config_path)?;
    let tokens = super::open_tokens(&config, config_path)?;

    match tokens.path() {
        Some(path) => print_info(&format!("Token file: {:?}", path)),
        None => print_info(&format!("Token from {}", ca_core::token::TOKEN_ENV)),
    }
    println!("{}", tokens.token().as_str());
    Ok(())
}

/// Replace the token
///
/// A running relay keeps accepting the old token until it is reloaded
/// (SIGHUP) or restarted.
pub fn token_rotate(config_path: &Path) -> Result<()> {
    let config = super::load(config_path)?;
    let tokens = super::open_tokens(&config, config_path)?;

    if tokens.path().is_none() {
        print_warning(&format!(
            "Token is set by {}; change that variable instead",
            ca_core::token::TOKEN_ENV
        ));
        anyhow::bail!("Cannot rotate an environment-provided token");
    }

    let token = tokens.rotate()?;
    print_success("Token rotated");
    println!("{}", token.as_str());
    print_info("Send SIGHUP to (or restart) a running relay, then update paired devices");
    Ok(())
}
