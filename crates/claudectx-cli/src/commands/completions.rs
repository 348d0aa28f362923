//! Shell completions generation command
//!
//! Generates shell completions for bash, zsh, fish, elvish, and powershell.
//! Usage: `claudectx completions bash > ~/.local/share/bash-completion/completions/claudectx`

use std::io;

use anyhow::Result;
use clap::CommandFactory;
use clap_complete::Shell;

/// Arguments for the completions subcommand
#[derive(Debug, clap::Args)]
pub struct CompletionsCommand {
    /// Shell to generate completions for
    #[arg(value_enum)]
    pub shell: Shell,
}

impl CompletionsCommand {
    /// Print completions for `self.shell` to stdout
    pub async fn execute(&self) -> Result<()> {
        let mut cmd = crate::Cli::command();
        let name = cmd.get_name().to_string();
        clap_complete::generate(self.shell, &mut cmd, name, &mut io::stdout());
        Ok(())
    }
}
