//! CLI domain: parse, route and output only.
//! No orchestration of its own; the route table dispatches to the scheduler.

mod output;
mod parse;
mod route;

pub use output::{map_error, ConsoleSink};
pub use parse::{Cli, Commands, ConfigCommands};
pub use route::RunContext;
