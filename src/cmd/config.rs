//! Configuration view and validation commands: `gamenest config`.

use std::path::Path;

use anyhow::Result;

use gamenest::config::GamenestConfig;

use super::super::ConfigCommands;

pub fn cmd_config(
    config: &GamenestConfig,
    explicit: Option<&Path>,
    base_dir: &Path,
    command: Option<ConfigCommands>,
) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            let default_path = GamenestConfig::default_path(base_dir);
            match explicit {
                Some(path) => println!("# Config file: {}", path.display()),
                None if default_path.exists() => {
                    println!("# Config file: {}", default_path.display())
                }
                None => println!("# No config file found; using defaults"),
            }
            println!("# Effective values (with env overrides)");
            println!();
            print!("{}", config.to_redacted_toml()?);
        }
        Some(ConfigCommands::Validate) => {
            let warnings = config.validate();
            if warnings.is_empty() {
                println!("Configuration OK");
            } else {
                for warning in &warnings {
                    println!("warning: {}", warning);
                }
            }
        }
    }
    Ok(())
}
