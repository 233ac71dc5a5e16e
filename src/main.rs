//! stack-provisioner - 建站部署编排工具
//!
//! Usage:
//! - Provision: `stack-provisioner provision --domain example.com`
//! - Renew (run daily from cron): `stack-provisioner renew`
//! - Health: `stack-provisioner healthcheck --json`

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use stack_provisioner::commands;
use stack_provisioner::config::EnvConfig;

#[derive(Parser, Debug)]
#[command(name = "stack-provisioner", version, about = "Provision WordPress + n8n behind nginx with TLS")]
struct Cli {
    /// Directory holding the compose manifest, proxy config and generated secrets
    #[arg(long, global = true, env = "STACK_DIR")]
    base_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Bring the stack up and drive it to a verified TLS state
    Provision {
        /// Primary domain; the automation host becomes n8n.<domain>
        #[arg(long)]
        domain: String,
        /// ACME account contact
        #[arg(long, env = "LETSENCRYPT_EMAIL")]
        email: Option<String>,
    },
    /// Renew certificates and reload the proxy
    Renew {
        #[arg(long)]
        domain: Option<String>,
    },
    /// Probe containers, HTTPS endpoints, certificates and the database
    Healthcheck {
        #[arg(long)]
        domain: Option<String>,
        /// Print the report as JSON on stdout
        #[arg(long)]
        json: bool,
    },
}

fn main() {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    stack_provisioner::init_tracing();

    let mut config = EnvConfig::from_env();
    if let Some(base_dir) = cli.base_dir {
        config.base_dir = base_dir;
    }

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "Failed to create runtime");
            std::process::exit(1);
        }
    };

    let code = rt.block_on(async {
        let cancel_token = CancellationToken::new();
        let listener = cancel_token.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, stopping after the current phase");
                listener.cancel();
            }
        });

        let result = match cli.command {
            Command::Provision { domain, email } => {
                if email.is_some() {
                    config.contact_email = email.filter(|e| !e.is_empty());
                }
                commands::provision(config, &domain, cancel_token).await
            }
            Command::Renew { domain } => commands::renew(config, domain.as_deref()).await,
            Command::Healthcheck { domain, json } => {
                commands::healthcheck(config, domain.as_deref(), json).await
            }
        };

        result.unwrap_or_else(|e| {
            error!("{:#}", e);
            commands::exit_code_for(&e)
        })
    });

    // Leave the ctrl_c listener behind instead of waiting for it
    rt.shutdown_background();
    std::process::exit(code);
}
