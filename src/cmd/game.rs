//! Game management commands: `gamenest game ...`.

use anyhow::Result;

use gamenest::builds::models::GameRepository;
use gamenest::config::GamenestConfig;

use super::super::GameCommands;
use super::serve::open_db;

pub fn cmd_game(config: &GamenestConfig, command: GameCommands) -> Result<()> {
    let db = open_db(&config.server.db_path)?;

    match command {
        GameCommands::Link {
            title,
            repo_id,
            url,
            branch,
        } => {
            let repository = GameRepository {
                remote_id: repo_id,
                html_url: url,
                default_branch: branch,
            };
            let game = db.create_game(&title, &repository)?;
            println!(
                "Linked game {} \"{}\" to repository {} ({}, branch {})",
                game.id,
                game.title,
                game.repository.remote_id,
                game.repository.clone_url(),
                game.repository.default_branch
            );
        }
        GameCommands::Builds { game_id } => {
            if db.get_game(game_id)?.is_none() {
                anyhow::bail!("Game {} not found", game_id);
            }
            let builds = db.list_builds_for_game(game_id)?;
            if builds.is_empty() {
                println!("No builds for game {}", game_id);
            }
            for build in builds {
                println!(
                    "{:>6}  {:<8}  {}  {}",
                    build.id,
                    build.status.as_str(),
                    build.created_at,
                    build.path.as_deref().unwrap_or("-")
                );
            }
        }
    }

    Ok(())
}
