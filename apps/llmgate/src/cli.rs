use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "llmgate")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Runs the Probe Engine (Keeper) against the configured providers.
    Worker {
        #[arg(long, default_value = "providers.yaml", env = "LLMGATE_CONFIG")]
        config: String,
    },
    /// Runs the Dispatch Engine (Conductor) HTTP surface.
    Gateway {
        #[arg(long, default_value = "providers.yaml", env = "LLMGATE_CONFIG")]
        config: String,
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long, default_value_t = 1)]
        workers: usize,
    },
    /// Scaffolds a provider stanza, e.g. `config create openai_like:my-provider`.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
pub enum ConfigAction {
    Create {
        /// `<type>:<name>`, type is `openai_like` or `gemini`.
        spec: String,
        /// YAML file the scaffolded provider block is appended to (created
        /// with a `providers:` header if it doesn't exist yet).
        #[arg(long, default_value = "providers.yaml")]
        out: String,
    },
}
