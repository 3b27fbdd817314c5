//! Configuration file sources, in increasing precedence.

mod global_file;
mod workspace_file;

pub use global_file::global_config_path;
pub use workspace_file::workspace_config_paths;

pub(crate) use global_file::add_to_builder as add_global_file;
pub(crate) use workspace_file::add_to_builder as add_workspace_files;
