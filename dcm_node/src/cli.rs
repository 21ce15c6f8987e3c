use clap::{Parser, Subcommand};

/// DICOM routing node for radiotherapy plan data: receives over the wire,
/// organizes plans into patient folders and forwards them to configured
/// peers.
#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable logging at INFO level.
    #[arg(long, default_value_t = false)]
    pub verbose: bool,
    /// Enable logging at DEBUG level.
    #[arg(long, default_value_t = false)]
    pub debug: bool,
    /// Enable logging at TRACE level.
    #[arg(long, default_value_t = false)]
    pub trace: bool,
}

impl Cli {
    /// The tracing level selected by the verbosity flags; the most
    /// detailed requested level wins, warnings are always shown.
    pub fn log_level(&self) -> tracing::Level {
        if self.trace {
            tracing::Level::TRACE
        } else if self.debug {
            tracing::Level::DEBUG
        } else if self.verbose {
            tracing::Level::INFO
        } else {
            tracing::Level::WARN
        }
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Generate a sample configuration file.
    Generate,
    /// Show the parsed configuration.
    Show { config: Option<String> },
    /// Start the node: receiver, grouping pipeline and spool watcher.
    Start { config: Option<String> },
    /// Run the import folder through the grouping pipeline once.
    Import { config: Option<String> },
}
