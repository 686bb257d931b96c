//! Configuration view and validation commands: `flowboard config`.

use anyhow::Result;

use flowboard::board_config::CliOverrides;

use super::super::ConfigCommands;

pub fn cmd_config(
    project_dir: &std::path::Path,
    overrides: CliOverrides,
    command: Option<ConfigCommands>,
) -> Result<()> {
    use flowboard::board_config::{FlowboardConfig, FlowboardToml, get_config_dir};

    let config_dir = get_config_dir(project_dir);
    let config_path = config_dir.join(flowboard::board_config::CONFIG_FILE);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Flowboard Configuration");
            println!("=======================");
            println!();

            let toml = if config_path.exists() {
                println!("Config file: {}", config_path.display());
                FlowboardToml::load(&config_path)?
            } else {
                println!("No flowboard.toml found at {}", config_path.display());
                println!("Using default configuration.");
                FlowboardToml::default()
            };
            println!();

            println!("[server]");
            println!("  base_url = \"{}\"", toml.server.base_url);
            println!("  request_timeout_secs = {}", toml.server.request_timeout_secs);
            println!();
            println!("[scope]");
            if let Some(project) = &toml.scope.project_id {
                println!("  project_id = \"{}\"", project);
            }
            if let Some(discipline) = &toml.scope.discipline_id {
                println!("  discipline_id = \"{}\"", discipline);
            }
            println!();
            println!("[sync]");
            println!("  on_write_failure = \"{}\"", toml.sync.on_write_failure);
            println!("  event_buffer = {}", toml.sync.event_buffer);
            println!("  live_updates = {}", toml.sync.live_updates);
            println!();
            println!("[logging]");
            println!("  format = \"{}\"", toml.logging.format);
            println!();

            println!("Effective values (with env/CLI overrides):");
            let config = FlowboardConfig::with_cli_args(project_dir.to_path_buf(), overrides)?;
            println!("  base_url = \"{}\"", config.base_url());
            match config.scope() {
                Ok(scope) => println!("  scope = \"{}\"", scope),
                Err(e) => println!("  scope = (unset) {}", e),
            }
            println!("  log_format = \"{}\"", config.log_format());
            println!();

            if !config_path.exists() {
                println!("Run 'flowboard config init' to create a flowboard.toml file.");
                println!();
            }
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No flowboard.toml found. Using defaults (valid).");
                return Ok(());
            }

            let toml = FlowboardToml::load(&config_path)?;
            let warnings = toml.validate();

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("flowboard.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            if !config_dir.exists() {
                std::fs::create_dir_all(&config_dir)?;
            }

            let toml = FlowboardToml::default();
            toml.save(&config_path)?;

            println!("Created flowboard.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [server] base_url, request_timeout_secs");
            println!("  - [scope] project_id, discipline_id");
            println!("  - [sync] on_write_failure (retain | revert), event_buffer");
            println!();
        }
    }

    Ok(())
}
