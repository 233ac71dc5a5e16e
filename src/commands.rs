//! 子命令入口
//!
//! 每个子命令返回进程退出码；编排运行开始前的错误经
//! `ProvisionError::exit_code` 映射。

use anyhow::Context as _;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::EnvConfig;
use crate::domain::provision::Phase;
use crate::domain::DomainSet;
use crate::error::ProvisionError;
use crate::infra::notifier;
use crate::infra::SystemRunner;
use crate::services::health::{log_report, NetworkProbes};
use crate::services::provision::{ProvisionContext, Provisioner};
use crate::services::renewal::run_renewal;

/// 优先使用命令行域名，否则读取上次 provision 保存的域名集
pub fn resolve_domains(config: &EnvConfig, domain: Option<&str>) -> anyhow::Result<DomainSet> {
    match domain {
        Some(primary) => Ok(DomainSet::new(primary)?),
        None => {
            let path = config.paths().domains_file;
            DomainSet::load(&path).with_context(|| {
                format!(
                    "no --domain given and no saved domain set at {} (run `provision` first)",
                    path.display()
                )
            })
        }
    }
}

async fn context(
    config: EnvConfig,
    domains: DomainSet,
    cancel_token: CancellationToken,
) -> anyhow::Result<ProvisionContext> {
    let probes = Arc::new(NetworkProbes::new(&config.probe_host, config.https_port));
    Ok(ProvisionContext::build(config, domains, Arc::new(SystemRunner), probes, cancel_token).await?)
}

/// `provision --domain <host>`
pub async fn provision(config: EnvConfig, domain: &str, cancel_token: CancellationToken) -> anyhow::Result<i32> {
    let domains = DomainSet::new(domain)?;
    info!(
        domains = %domains,
        base_dir = %config.base_dir.display(),
        "stack-provisioner v{}",
        crate::config::env::constants::VERSION
    );

    let ctx = context(config, domains, cancel_token).await?;
    let outcome = Provisioner::new(ctx).run().await;
    Ok(outcome.state.exit_code())
}

/// `renew`
pub async fn renew(config: EnvConfig, domain: Option<&str>) -> anyhow::Result<i32> {
    let domains = resolve_domains(&config, domain)?;
    let notifier = notifier::from_config(&config.telegram);
    let ctx = context(config, domains, CancellationToken::new()).await?;

    let outcome = run_renewal(
        &ctx.domains,
        &ctx.certbot,
        &ctx.engine,
        ctx.proxy()?,
        &ctx.config.webroot(),
        notifier.as_ref(),
    )
    .await;

    if !outcome.renewed {
        error!(notified = outcome.notified, "Renewal failed");
        return Ok(ProvisionError::tool_failure("certbot", None, "").exit_code());
    }
    if !outcome.reloaded {
        warn!("Certificates renewed but the proxy could not be reloaded");
        return Ok(Phase::Restarted.exit_code());
    }
    info!("Renewal finished");
    Ok(0)
}

/// `healthcheck [--domain <host>] [--json]`
pub async fn healthcheck(config: EnvConfig, domain: Option<&str>, json: bool) -> anyhow::Result<i32> {
    let domains = resolve_domains(&config, domain)?;
    let ctx = context(config, domains, CancellationToken::new()).await?;
    let report = ctx.health_checker().check(&ctx.domains).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        info!(domains = %ctx.domains, "Health report");
        log_report(&report);
    }

    let failures = report.failures();
    match failures.first() {
        None => Ok(0),
        Some(probe) => {
            warn!(failures = ?failures, "Stack is degraded");
            Ok(ProvisionError::PartialHealthFailure { probe: probe.clone() }.exit_code())
        }
    }
}

/// 提前终止命令的错误对应的退出码
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<ProvisionError>()
        .map(ProvisionError::exit_code)
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_resolve_domains_from_flag() {
        let config = EnvConfig::with_base_dir(Path::new("/nonexistent"));
        let domains = resolve_domains(&config, Some("Example.com")).unwrap();
        assert_eq!(domains.primary(), "example.com");
    }

    #[test]
    fn test_resolve_domains_from_saved_set() {
        let dir = tempfile::tempdir().unwrap();
        let config = EnvConfig::with_base_dir(dir.path());
        assert!(resolve_domains(&config, None).is_err());

        DomainSet::new("tomated.app")
            .unwrap()
            .save(&config.paths().domains_file)
            .unwrap();
        let domains = resolve_domains(&config, None).unwrap();
        assert_eq!(domains.hostnames(), vec!["tomated.app", "n8n.tomated.app"]);
    }

    #[test]
    fn test_exit_code_for() {
        let err: anyhow::Error = ProvisionError::invalid_domain("a b", "whitespace").into();
        assert_eq!(exit_code_for(&err), 2);
        let err = resolve_domains(&EnvConfig::with_base_dir(Path::new("/nonexistent")), Some("bad host"))
            .unwrap_err();
        assert_eq!(exit_code_for(&err), 2);
        assert_eq!(exit_code_for(&anyhow::anyhow!("boom")), 1);
    }
}
