//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module          | Commands handled                                   |
//! |-----------------|-----------------------------------------------------|
//! | `serve`         | `Serve`                                             |
//! | `database`      | `InitDb`, `SyncPartners`                            |
//! | `analyze`       | `Analyze`                                           |
//! | `config`        | `Config`                                            |

pub mod analyze;
pub mod config;
pub mod database;
pub mod serve;

pub use analyze::cmd_analyze;
pub use config::cmd_config;
pub use database::{cmd_init_db, cmd_sync_partners};
pub use serve::cmd_serve;
