//! 证书续期调度
//!
//! `install` 渲染续期和健康检查脚本，并把续期脚本注册为每日 cron 任务。
//! `run_renewal` 是同一任务的原生实现（`renew` 子命令）：续期，失败时通知一次，
//! 成功后重载代理。

use std::path::Path;
use std::sync::Arc;
use tera::Context;
use tracing::{error, info, warn};

use crate::config::env::constants::RENEWAL_FAILURE_MARKERS;
use crate::config::EnvConfig;
use crate::domain::service::ServiceSpec;
use crate::domain::DomainSet;
use crate::error::ProvisionResult;
use crate::infra::certbot::CertificateTool;
use crate::infra::container::ContainerEngine;
use crate::infra::crontab::Crontab;
use crate::infra::notifier::Notifier;
use crate::services::templates::{shell_quote, TemplateRenderer, TemplateId};

/// 写入续期任务并安装 cron 条目
pub struct RenewalScheduler {
    config: EnvConfig,
    renderer: Arc<TemplateRenderer>,
    crontab: Crontab,
    services: Vec<ServiceSpec>,
    proxy: ServiceSpec,
}

impl RenewalScheduler {
    pub fn new(
        config: EnvConfig,
        renderer: Arc<TemplateRenderer>,
        crontab: Crontab,
        services: Vec<ServiceSpec>,
        proxy: ServiceSpec,
    ) -> Self {
        Self {
            config,
            renderer,
            crontab,
            services,
            proxy,
        }
    }

    /// 写入 `script_path`（0755）并每日调度
    ///
    /// 返回 crontab 是否有改动。
    pub async fn install(&self, domains: &DomainSet, script_path: &Path) -> ProvisionResult<bool> {
        let script = self
            .renderer
            .render(TemplateId::RenewalScript.as_str(), domains, &self.script_context())?;
        write_executable(script_path, &script)?;
        info!(path = %script_path.display(), "Wrote renewal script");
        if !self.config.telegram.is_enabled() {
            warn!("Telegram not configured, renewal failures will only be logged");
        }

        let paths = self.config.paths();
        let mut health = Context::new();
        health.insert("docker_bin", &self.config.docker_bin);
        health.insert(
            "containers",
            &self.services.iter().map(|s| s.container_name.as_str()).collect::<Vec<_>>(),
        );
        let healthcheck = self
            .renderer
            .render(TemplateId::HealthcheckScript.as_str(), domains, &health)?;
        write_executable(&paths.healthcheck_script, &healthcheck)?;

        if let Some(log_dir) = paths.renewal_log.parent() {
            std::fs::create_dir_all(log_dir)?;
        }
        let command = format!(
            "{} >> {} 2>&1",
            shell_quote(&script_path.display().to_string()),
            shell_quote(&paths.renewal_log.display().to_string())
        );
        self.crontab.install_daily(self.config.renewal, &command).await
    }

    fn script_context(&self) -> Context {
        let mut context = Context::new();
        context.insert("certbot_bin", &self.config.certbot_bin);
        context.insert("webroot", &self.config.webroot().display().to_string());
        context.insert("letsencrypt_dir", &self.config.letsencrypt_dir.display().to_string());
        context.insert("docker_bin", &self.config.docker_bin);
        context.insert("proxy_container", &self.proxy.container_name);
        context.insert("failure_pattern", &RENEWAL_FAILURE_MARKERS.join("|"));
        context.insert(
            "telegram_bot_token",
            self.config.telegram.bot_token.as_deref().unwrap_or_default(),
        );
        context.insert(
            "telegram_chat_id",
            self.config.telegram.chat_id.as_deref().unwrap_or_default(),
        );
        context
    }
}

/// 一次续期的结果
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RenewalOutcome {
    pub renewed: bool,
    pub notified: bool,
    pub reloaded: bool,
}

/// 证书工具输出是否表示续期失败
pub fn output_reports_failure(output: &str) -> bool {
    let lower = output.to_ascii_lowercase();
    RENEWAL_FAILURE_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// 执行一次续期
///
/// 失败时只发一条列出全部主机名的通知，不动代理。
pub async fn run_renewal(
    domains: &DomainSet,
    certbot: &CertificateTool,
    engine: &ContainerEngine,
    proxy: &ServiceSpec,
    webroot: &Path,
    notifier: &dyn Notifier,
) -> RenewalOutcome {
    let (succeeded, output) = match certbot.renew(webroot).await {
        Ok(output) => (output.succeeded(), output.combined()),
        Err(e) => (false, e.to_string()),
    };

    if !succeeded || output_reports_failure(&output) {
        error!(output = %output, "Certificate renewal failed");
        let message = format!(
            "Certificate renewal failed for: {}\n\n{}",
            domains.hostnames().join(", "),
            tail(&output, 10)
        );
        let notified = notifier.notify(&message).await;
        return RenewalOutcome {
            renewed: false,
            notified,
            reloaded: false,
        };
    }
    info!("Certificates renewed (or not yet due)");

    let reloaded = match engine.reload(proxy).await {
        Ok(_) => true,
        Err(e) => {
            warn!(error = %e, "Proxy reload failed, restarting once");
            engine.restart(proxy).await.is_ok()
        }
    };
    RenewalOutcome {
        renewed: true,
        notified: false,
        reloaded,
    }
}

fn tail(output: &str, lines: usize) -> String {
    let all: Vec<&str> = output.lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}

fn write_executable(path: &Path, content: &str) -> ProvisionResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, content)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::env::TelegramConfig;
    use crate::config::{stack, StackSecrets};
    use crate::domain::service::{find_role, ServiceRole};
    use crate::infra::command::fake::ScriptedRunner;
    use crate::infra::command::CommandOutput;
    use crate::infra::crontab::fake::CrontabTable;
    use crate::infra::notifier::fake::RecordingNotifier;

    struct Fixture {
        config: EnvConfig,
        domains: DomainSet,
        services: Vec<ServiceSpec>,
        proxy: ServiceSpec,
    }

    fn fixture(base: &Path, primary: &str) -> Fixture {
        let config = EnvConfig::with_base_dir(base);
        let domains = DomainSet::new(primary).unwrap();
        let services = stack::stack_services(&config, &StackSecrets::generate(), &domains);
        let proxy = find_role(&services, ServiceRole::Proxy).unwrap().clone();
        Fixture {
            config,
            domains,
            services,
            proxy,
        }
    }

    fn tools(runner: Arc<ScriptedRunner>, fx: &Fixture) -> (CertificateTool, ContainerEngine) {
        (
            CertificateTool::new(runner.clone(), "certbot", &fx.config.letsencrypt_dir),
            ContainerEngine::new(runner, "docker", &fx.config.paths().compose_file, "stack"),
        )
    }

    #[test]
    fn test_output_reports_failure() {
        assert!(output_reports_failure("1 renew failure(s)\nAll renewals failed."));
        assert!(output_reports_failure("Renewal failed for tomated.app"));
        assert!(!output_reports_failure("Cert not yet due for renewal"));
    }

    #[tokio::test]
    async fn test_failed_renewal_notifies_once_with_every_host() {
        let dir = tempfile::tempdir().unwrap();
        let fx = fixture(dir.path(), "tomated.app");
        let runner = Arc::new(ScriptedRunner::new(|inv| {
            if inv.program == "certbot" {
                Ok(CommandOutput::success(
                    "Processing /etc/letsencrypt/renewal/tomated.app.conf\nrenewal failed: connection refused",
                ))
            } else {
                Ok(CommandOutput::success(""))
            }
        }));
        let (certbot, engine) = tools(runner.clone(), &fx);
        let notifier = RecordingNotifier::default();

        let outcome = run_renewal(
            &fx.domains,
            &certbot,
            &engine,
            &fx.proxy,
            &fx.config.webroot(),
            &notifier,
        )
        .await;

        assert!(!outcome.renewed);
        assert!(outcome.notified);
        let messages = notifier.messages();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].contains("tomated.app"));
        assert!(messages[0].contains("n8n.tomated.app"));
        assert!(runner.matching("nginx -s reload").is_empty());
    }

    #[tokio::test]
    async fn test_successful_renewal_reloads_proxy() {
        let dir = tempfile::tempdir().unwrap();
        let fx = fixture(dir.path(), "example.com");
        let runner = Arc::new(ScriptedRunner::new(|inv| {
            if inv.program == "certbot" {
                Ok(CommandOutput::success("Certificate not yet due for renewal"))
            } else {
                Ok(CommandOutput::success(""))
            }
        }));
        let (certbot, engine) = tools(runner.clone(), &fx);
        let notifier = RecordingNotifier::default();

        let outcome = run_renewal(
            &fx.domains,
            &certbot,
            &engine,
            &fx.proxy,
            &fx.config.webroot(),
            &notifier,
        )
        .await;

        assert_eq!(
            outcome,
            RenewalOutcome {
                renewed: true,
                notified: false,
                reloaded: true
            }
        );
        assert!(notifier.messages().is_empty());
        assert_eq!(runner.matching("docker exec stack-nginx nginx -s reload").len(), 1);
    }

    #[tokio::test]
    async fn test_install_writes_scripts_and_one_cron_line() {
        let dir = tempfile::tempdir().unwrap();
        let fx = fixture(dir.path(), "example.com");
        let table = CrontabTable::default();
        let answer = table.clone();
        let runner = Arc::new(ScriptedRunner::new(move |inv| answer.answer(inv)));

        let scheduler = RenewalScheduler::new(
            fx.config.clone(),
            Arc::new(TemplateRenderer::new().unwrap()),
            Crontab::new(runner),
            fx.services.clone(),
            fx.proxy.clone(),
        );
        let script = fx.config.paths().renewal_script;

        assert!(scheduler.install(&fx.domains, &script).await.unwrap());
        assert!(!scheduler.install(&fx.domains, &script).await.unwrap());

        let lines = table.lines();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("0 3 * * * '"));
        assert!(lines[0].contains("renew-certs.sh' >> '"));

        let rendered = std::fs::read_to_string(&script).unwrap();
        assert!(rendered.contains("PROXY_CONTAINER='stack-nginx'"));
        assert!(fx.config.paths().healthcheck_script.is_file());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&script).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o755);
        }
    }

    #[cfg(unix)]
    fn stub(bin: &Path, name: &str, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;
        let path = bin.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.display().to_string()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_rendered_script_notifies_once_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        let curl_log = dir.path().join("curl.log");
        let docker_log = dir.path().join("docker.log");

        let mut fx = fixture(&dir.path().join("stack"), "tomated.app");
        fx.config.certbot_bin = stub(&bin, "certbot", "echo 'renewal failed: connection refused'");
        fx.config.docker_bin = stub(&bin, "docker", &format!("echo \"$*\" >> '{}'", docker_log.display()));
        stub(&bin, "curl", &format!("echo \"$*\" >> '{}'", curl_log.display()));
        stub(&bin, "hostname", "echo web-1");
        fx.config.telegram = TelegramConfig {
            bot_token: Some("123:abc".into()),
            chat_id: Some("-100".into()),
        };

        let table = CrontabTable::default();
        let answer = table.clone();
        let runner = Arc::new(ScriptedRunner::new(move |inv| answer.answer(inv)));
        let scheduler = RenewalScheduler::new(
            fx.config.clone(),
            Arc::new(TemplateRenderer::new().unwrap()),
            Crontab::new(runner),
            fx.services.clone(),
            fx.proxy.clone(),
        );
        let script = fx.config.paths().renewal_script;
        scheduler.install(&fx.domains, &script).await.unwrap();

        let path = format!("{}:{}", bin.display(), std::env::var("PATH").unwrap_or_default());
        let status = std::process::Command::new("sh")
            .arg(&script)
            .env("PATH", path)
            .stdout(std::process::Stdio::null())
            .status()
            .unwrap();
        assert_eq!(status.code(), Some(1));

        let calls = std::fs::read_to_string(&curl_log).unwrap();
        let calls: Vec<&str> = calls.lines().collect();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].contains("chat_id=-100"));
        assert!(calls[0].contains("for: tomated.app, n8n.tomated.app"));
        assert!(!docker_log.exists());
    }
}
