//! CLI route: run context and the single route table.

use crate::cli::output::ConsoleSink;
use crate::cli::parse::{Commands, ConfigCommands};
use crate::config::{BotConfig, ConfigLoader};
use crate::error::CoreError;
use crate::scheduler::{ChatSubmission, Scheduler};
use crate::stream::{StreamEvent, StreamOutcome};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// Runtime context for CLI execution: the effective configuration and where
/// it came from.
pub struct RunContext {
    config: BotConfig,
    source: String,
}

impl RunContext {
    /// Load configuration from `config_path` if given, otherwise from the
    /// layered sources rooted at `workspace_root`.
    pub fn new(workspace_root: PathBuf, config_path: Option<PathBuf>) -> Result<Self, CoreError> {
        let (config, source) = match config_path {
            Some(path) => (
                ConfigLoader::load_from_file(&path)?,
                path.display().to_string(),
            ),
            None => (
                ConfigLoader::load(&workspace_root)?,
                format!("workspace {}", workspace_root.display()),
            ),
        };
        Ok(Self { config, source })
    }

    pub fn from_config(config: BotConfig) -> Self {
        Self {
            config,
            source: "in-memory".to_string(),
        }
    }

    pub fn config(&self) -> &BotConfig {
        &self.config
    }

    pub fn execute(&self, command: &Commands) -> Result<String, CoreError> {
        match command {
            Commands::Ask {
                channel,
                user,
                prompt,
            } => self.ask(channel, user, prompt),
            Commands::Config { command } => self.handle_config_command(command),
        }
    }

    fn handle_config_command(&self, command: &ConfigCommands) -> Result<String, CoreError> {
        match command {
            ConfigCommands::Show => toml::to_string_pretty(&self.config)
                .map_err(|e| CoreError::Config(format!("Failed to render config: {}", e))),
            ConfigCommands::Validate => match self.config.validate() {
                Ok(()) => Ok(format!("Configuration is valid ({})", self.source)),
                Err(errors) => {
                    let lines: Vec<String> = errors.iter().map(|e| format!("  - {}", e)).collect();
                    Err(CoreError::Config(format!(
                        "{} problem(s) in {}:\n{}",
                        errors.len(),
                        self.source,
                        lines.join("\n")
                    )))
                }
            },
        }
    }

    fn ask(&self, channel: &str, user: &str, prompt: &str) -> Result<String, CoreError> {
        if let Err(errors) = self.config.validate() {
            let first = errors
                .first()
                .map(|e| e.to_string())
                .unwrap_or_default();
            return Err(CoreError::Config(first));
        }

        let rt = tokio::runtime::Runtime::new()
            .map_err(|e| CoreError::Config(format!("Failed to create async runtime: {}", e)))?;

        rt.block_on(async {
            let scheduler = Scheduler::from_config(self.config.clone())?;
            let (events_tx, mut events_rx) = tokio::sync::mpsc::unbounded_channel();
            let submission = ChatSubmission::new(channel, user, prompt).with_events(events_tx);

            info!(channel = %channel, user = %user, "Asking");
            let outcome = scheduler
                .submit_chat(submission, Arc::new(ConsoleSink::stdout()))?
                .await?;

            let mut reaction = None;
            while let Ok(event) = events_rx.try_recv() {
                debug!(event = ?event, "Stream event");
                if let StreamEvent::MarkerExtracted(marker) = event {
                    reaction = Some(marker);
                }
            }

            Ok::<String, CoreError>(match outcome {
                StreamOutcome::Completed(completion) => {
                    let mut summary = String::from("\n");
                    if let Some(marker) = reaction {
                        summary.push_str(&format!("[reaction {}] ", marker));
                    }
                    summary.push_str(&format!(
                        "[{} unit(s), prompt tokens {}, reply tokens {}, {:?}]",
                        completion.units.len(),
                        count_or_dash(completion.usage.prompt_eval_count),
                        count_or_dash(completion.usage.eval_count),
                        completion.persist
                    ));
                    summary
                }
                StreamOutcome::Cancelled => "\n[cancelled]".to_string(),
            })
        })
    }
}

fn count_or_dash(count: Option<u64>) -> String {
    count.map(|c| c.to_string()).unwrap_or_else(|| "-".to_string())
}
