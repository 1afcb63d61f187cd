//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module   | Commands handled    |
//! |----------|---------------------|
//! | `serve`  | `Serve`, `InitDb`   |
//! | `game`   | `Game`              |
//! | `config` | `Config`            |

pub mod config;
pub mod game;
pub mod serve;

pub use config::cmd_config;
pub use game::cmd_game;
pub use serve::{cmd_init_db, cmd_serve};
