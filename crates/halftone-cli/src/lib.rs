//! Command-line host for the Halftone Studio worker bridge
//!
//! Stands in for the desktop shell: runs startup provisioning, starts the
//! worker, issues image commands and answers provisioning dialogs on the
//! terminal.

pub mod commands;
pub mod common;
pub mod prompter;

pub use common::GlobalOpts;
pub use halftone_config as config;
pub use halftone_logger as logger;
