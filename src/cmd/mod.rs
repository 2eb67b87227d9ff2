//! CLI command implementations.
//!
//! Each submodule owns one `Commands` variant:
//!
//! | Module    | Commands handled                          |
//! |-----------|-------------------------------------------|
//! | `serve`   | `Serve`                                   |
//! | `detect`  | `Detect`                                  |
//! | `config`  | `Config` (`show`, `validate`, `init`)     |

pub mod config;
pub mod detect;
pub mod serve;

pub use config::cmd_config;
pub use detect::cmd_detect;
pub use serve::cmd_serve;
