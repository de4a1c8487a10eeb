//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module     | Commands handled                           |
//! |------------|--------------------------------------------|
//! | `project`  | `Init`                                     |
//! | `config`   | `Config`                                   |
//! | `tasks`    | `List`, `Add`, `Remove`, `Archive`         |
//! | `run`      | `Run`                                      |
//! | `history`  | `History`                                  |

pub mod config;
pub mod history;
pub mod project;
pub mod run;
pub mod tasks;

pub use config::cmd_config;
pub use history::cmd_history;
pub use project::cmd_init;
pub use run::cmd_run;
pub use tasks::{cmd_add, cmd_archive, cmd_list, cmd_remove};
