//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module   | Commands handled                                  |
//! |----------|---------------------------------------------------|
//! | `serve`  | `Serve`, `Init`                                   |
//! | `batch`  | `Start`, `Pause`, `Resume`, `Stop`, `Status`      |
//! | `config` | `Config`                                          |

pub mod batch;
pub mod config;
pub mod serve;

pub use batch::{cmd_pause, cmd_resume, cmd_start, cmd_status, cmd_stop};
pub use config::cmd_config;
pub use serve::{cmd_init, cmd_serve};
