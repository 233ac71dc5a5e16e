//! 编排阶段
//!
//! 每个状态转换一个函数：完成、因目标状态已满足而跳过，或返回 `ProvisionError`。

use tracing::{info, warn};

use super::context::{remove_file, write_file, ProvisionContext};
use crate::config::env::constants::RENEWAL_WINDOW_DAYS;
use crate::config::stack::{upstream_for, PROXY_CERT_DIR, PROXY_WEBROOT};
use crate::domain::health::HealthReport;
use crate::domain::provision::ProvisioningResult;
use crate::domain::vhost::VHostConfig;
use crate::error::{ProvisionError, ProvisionResult};
use crate::services::health::log_report;
use crate::services::templates::{challenge_context, compose_context, vhost_context, TemplateId};

/// 阶段未失败时的结束方式
#[derive(Debug)]
pub enum StepOutcome {
    Done,
    Skipped(String),
    /// 仅验证阶段：检查未通过，运行停在 `Restarted`
    Degraded(HealthReport),
    Verified(HealthReport),
}

/// `Init → ChallengeConfigured`
///
/// 写入 compose manifest、域名集和 challenge vhost。已有有效证书时不写 challenge vhost，
/// 让 TLS vhost 继续服务。
pub async fn configure_challenge(ctx: &ProvisionContext, result: &mut ProvisioningResult) -> ProvisionResult<StepOutcome> {
    let paths = ctx.config.paths();

    for dir in [&paths.conf_dir, &ctx.config.letsencrypt_dir] {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::create_dir_all(ctx.config.webroot())?;
    for mount in ctx.services.iter().flat_map(|s| s.mounts.iter()) {
        std::fs::create_dir_all(&mount.host)?;
    }

    ctx.domains.save(&paths.domains_file)?;

    let manifest = ctx.renderer.render(
        TemplateId::ComposeManifest.as_str(),
        &ctx.domains,
        &compose_context(&ctx.services),
    )?;
    write_file(&paths.compose_file, &manifest)?;
    result.note(format!("wrote {}", paths.compose_file.display()));

    if let Some(cert) = ctx.current_certificate() {
        let note = format!(
            "certificate valid until {} already covers {}; challenge config not written",
            cert.window().not_after,
            ctx.domains
        );
        info!("{}", note);
        result.note(note);
        return Ok(StepOutcome::Done);
    }

    // TLS vhosts pointing at missing certificate files would stop the proxy from starting
    for host in ctx.domains.hostnames() {
        if remove_file(&paths.tls_conf(host))? {
            warn!(host = %host, "Removed TLS vhost without a valid certificate");
            result.note(format!("removed stale TLS config for {}", host));
        }
    }

    let challenge = ctx.renderer.render(
        TemplateId::ChallengeVhost.as_str(),
        &ctx.domains,
        &challenge_context(&ctx.domains, PROXY_WEBROOT),
    )?;
    write_file(&paths.challenge_conf(), &challenge)?;
    result.note(format!("wrote {}", paths.challenge_conf().display()));
    Ok(StepOutcome::Done)
}

/// `ChallengeConfigured → ProxyUp`
pub async fn start_stack(ctx: &ProvisionContext, result: &mut ProvisioningResult) -> ProvisionResult<StepOutcome> {
    ctx.engine.up(&[]).await?;
    result.note(format!("started {} services", ctx.services.len()));

    let attempts = ctx.wait_for_proxy().await?;
    result.note(format!(
        "proxy accepting connections on port {} after {} attempt(s)",
        ctx.config.http_port, attempts
    ));
    Ok(StepOutcome::Done)
}

/// `ProxyUp → CertIssued`
pub async fn issue_certificate(ctx: &ProvisionContext, result: &mut ProvisioningResult) -> ProvisionResult<StepOutcome> {
    let now = chrono::Utc::now();
    if let Some(cert) = ctx.current_certificate() {
        let days_left = cert.window().days_left(now);
        if days_left >= RENEWAL_WINDOW_DAYS {
            return Ok(StepOutcome::Skipped(format!(
                "certificate covers every host and is valid for {} more days",
                days_left
            )));
        }
        result.note(format!("certificate expires in {} days, re-issuing", days_left));
    }

    let hostnames = ctx.domains.hostnames();
    let output = ctx
        .certbot
        .issue(&hostnames, &ctx.config.webroot(), ctx.config.contact_email.as_deref())
        .await?;
    if !output.succeeded() {
        return Err(ProvisionError::tool_failure(
            "certbot",
            output.exit_code,
            output.combined(),
        ));
    }

    let cert = ctx.current_certificate().ok_or_else(|| {
        ProvisionError::tool_failure(
            "certbot",
            output.exit_code,
            format!("no valid certificate for {} after issuance", ctx.domains),
        )
    })?;
    result.note(format!("certificate valid until {}", cert.window().not_after));
    Ok(StepOutcome::Done)
}

/// `CertIssued → FinalConfigured`
///
/// 每个主机名写一个 TLS vhost，代理校验通过后删除 challenge vhost。
/// 校验失败时删除新写的 vhost，只保留 challenge vhost。
pub async fn configure_tls(ctx: &ProvisionContext, result: &mut ProvisioningResult) -> ProvisionResult<StepOutcome> {
    let paths = ctx.config.paths();
    let cert = ctx
        .current_certificate()
        .ok_or_else(|| ProvisionError::Config(format!("no valid certificate installed for {}", ctx.domains)))?;

    let automation_host = ctx.domains.automation_host();
    let mut rendered = Vec::new();
    for host in ctx.domains.hostnames() {
        let vhost = VHostConfig::full_tls(host, &cert, PROXY_CERT_DIR, upstream_for(&ctx.domains, host));
        let template = if host == automation_host {
            TemplateId::AutomationVhost
        } else {
            TemplateId::WordpressVhost
        };
        let content = ctx
            .renderer
            .render(template.as_str(), &ctx.domains, &vhost_context(&vhost, PROXY_WEBROOT))?;
        rendered.push((paths.tls_conf(host), content));
    }

    let mut written = Vec::new();
    let mut applied = Ok(());
    for (path, content) in &rendered {
        if let Err(e) = write_file(path, content) {
            applied = Err(e);
            break;
        }
        written.push(path.as_path());
    }
    if applied.is_ok() {
        applied = match ctx.proxy() {
            Ok(proxy) => ctx.engine.test_proxy_config(proxy).await.map(|_| ()),
            Err(e) => Err(e),
        };
    }
    if let Err(e) = applied {
        // a rejected TLS config must not survive a proxy restart
        for path in &written {
            if let Err(remove_err) = remove_file(path) {
                warn!(path = %path.display(), error = %remove_err, "Failed to remove rejected TLS config");
            }
        }
        warn!(removed = written.len(), "TLS config rejected, kept the challenge config");
        return Err(e);
    }
    for path in &written {
        result.note(format!("wrote {}", path.display()));
    }

    if remove_file(&paths.challenge_conf())? {
        result.note(format!("removed {}", paths.challenge_conf().display()));
    }
    Ok(StepOutcome::Done)
}

/// `FinalConfigured → Restarted`
pub async fn reload_proxy(ctx: &ProvisionContext, result: &mut ProvisioningResult) -> ProvisionResult<StepOutcome> {
    let proxy = ctx.proxy()?;
    match ctx.engine.reload(proxy).await {
        Ok(_) => {
            result.note("proxy configuration reloaded");
        }
        Err(e) => {
            warn!(error = %e, "Proxy reload failed, restarting once");
            result.note(format!("reload failed ({}), restarting", e));
            ctx.engine.restart(proxy).await?;
            ctx.wait_for_proxy().await?;
            result.note("proxy restarted");
        }
    }
    Ok(StepOutcome::Done)
}

/// `Restarted → Verified`
pub async fn verify(ctx: &ProvisionContext, result: &mut ProvisioningResult) -> ProvisionResult<StepOutcome> {
    let report = ctx.health_checker().check(&ctx.domains).await;
    log_report(&report);

    let failures = report.failures();
    if failures.is_empty() {
        result.note("all probes passed");
        Ok(StepOutcome::Verified(report))
    } else {
        for failure in &failures {
            result.note(format!("probe failed: {}", failure));
        }
        Ok(StepOutcome::Degraded(report))
    }
}
