//! `tether` CLI: runs the session server and inspects configuration.

use std::io::IsTerminal;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use log::{info, LevelFilter};

use tether::agent::EchoAgent;
use tether::config::Settings;
use tether::server::SessionServer;

#[derive(Debug, Parser)]
#[command(
    name = "tether",
    version,
    about = "Session server for AI coding-agent clients"
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging (equivalent to -vv)
    #[arg(long, global = true)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
    /// Disable ANSI colors in output
    #[arg(long = "no-color", global = true)]
    no_color: bool,
}

impl CommonOpts {
    fn effective_log_level(&self) -> LevelFilter {
        if self.quiet {
            LevelFilter::Error
        } else if self.trace {
            LevelFilter::Trace
        } else if self.debug {
            LevelFilter::Debug
        } else {
            match self.verbose {
                0 => LevelFilter::Info,
                1 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }

    fn init_logging(&self) {
        let disable_color = self.no_color
            || std::env::var_os("NO_COLOR").is_some()
            || !std::io::stderr().is_terminal();

        let mut builder =
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
        builder.filter_level(self.effective_log_level());
        if disable_color {
            builder.write_style(env_logger::WriteStyle::Never);
        }
        builder.try_init().ok();
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the session server
    Serve(ServeCommand),
    /// Print the effective configuration as TOML
    Config,
    /// Generate shell completions
    Completions {
        /// Target shell
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Clone, Args)]
struct ServeCommand {
    /// Override the listen host
    #[arg(long, value_name = "HOST")]
    host: Option<String>,
    /// Override the listen port
    #[arg(short, long, value_name = "PORT")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    cli.common.init_logging();

    match cli.command {
        Command::Serve(cmd) => serve(&cli.common, cmd).await,
        Command::Config => {
            let settings = Settings::load(cli.common.config.as_deref())?;
            let rendered =
                toml::to_string_pretty(&settings).context("failed to render configuration")?;
            print!("{rendered}");
            Ok(())
        }
        Command::Completions { shell } => {
            let mut cmd = Cli::command();
            let name = cmd.get_name().to_string();
            clap_complete::generate(shell, &mut cmd, name, &mut std::io::stdout());
            Ok(())
        }
    }
}

async fn serve(common: &CommonOpts, cmd: ServeCommand) -> Result<()> {
    let mut settings = Settings::load(common.config.as_deref())?;
    if let Some(host) = cmd.host {
        settings.server.host = host;
    }
    if let Some(port) = cmd.port {
        settings.server.port = port;
    }

    let server = SessionServer::bind(&settings.server.bind_addr(), EchoAgent::factory())
        .await
        .context("failed to start session server")?;
    let shutdown = server.shutdown_handle();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received ctrl-c, shutting down");
            let _ = shutdown.send(());
        }
    });

    server.run().await
}
