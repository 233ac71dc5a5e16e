//! 编排上下文
//!
//! 一次运行所需的全部内容：配置、校验过的域名集、由此构建的服务描述，
//! 以及共用同一个 `ProcessRunner` 的各工具客户端。

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::env::constants::{
    READINESS_ATTEMPTS, READINESS_INITIAL_BACKOFF, READINESS_MAX_BACKOFF,
};
use crate::config::{stack, EnvConfig, StackSecrets};
use crate::domain::service::{find_role, ServiceRole, ServiceSpec};
use crate::domain::vhost::InstalledCertificate;
use crate::domain::DomainSet;
use crate::error::{ProvisionError, ProvisionResult};
use crate::infra::certbot::CertificateTool;
use crate::infra::container::ContainerEngine;
use crate::infra::crontab::Crontab;
use crate::infra::ProcessRunner;
use crate::services::health::{HealthChecker, Probes};
use crate::services::renewal::RenewalScheduler;
use crate::services::templates::TemplateRenderer;

/// 就绪等待的有界指数退避
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Backoff {
    pub attempts: u32,
    pub initial: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            attempts: READINESS_ATTEMPTS,
            initial: READINESS_INITIAL_BACKOFF,
            max: READINESS_MAX_BACKOFF,
        }
    }
}

impl Backoff {
    /// 第 N 次（从 1 计）失败后的等待时间
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.max)
    }
}

/// 一次编排、续期或健康检查运行的共享状态
pub struct ProvisionContext {
    pub config: EnvConfig,
    pub domains: DomainSet,
    pub secrets: StackSecrets,
    pub services: Vec<ServiceSpec>,
    pub renderer: Arc<TemplateRenderer>,
    pub engine: ContainerEngine,
    pub certbot: CertificateTool,
    pub probes: Arc<dyn Probes>,
    pub runner: Arc<dyn ProcessRunner>,
    pub cancel_token: CancellationToken,
    pub readiness: Backoff,
}

impl ProvisionContext {
    /// 加载凭据，构建服务描述和工具客户端
    pub async fn build(
        config: EnvConfig,
        domains: DomainSet,
        runner: Arc<dyn ProcessRunner>,
        probes: Arc<dyn Probes>,
        cancel_token: CancellationToken,
    ) -> ProvisionResult<Self> {
        domains.validate()?;
        let paths = config.paths();
        let secrets = StackSecrets::load_or_create(&paths.secrets_file)?;
        let services = stack::stack_services(&config, &secrets, &domains);
        if find_role(&services, ServiceRole::Proxy).is_none() {
            return Err(ProvisionError::Config("stack declares no proxy service".into()));
        }

        let engine = ContainerEngine::new(runner.clone(), &config.docker_bin, &paths.compose_file, &config.project)
            .detect_compose()
            .await;
        let certbot = CertificateTool::new(runner.clone(), &config.certbot_bin, &config.letsencrypt_dir);

        debug!(domains = %domains, services = services.len(), "Provision context ready");
        Ok(Self {
            config,
            domains,
            secrets,
            services,
            renderer: Arc::new(TemplateRenderer::new()?),
            engine,
            certbot,
            probes,
            runner,
            cancel_token,
            readiness: Backoff::default(),
        })
    }

    pub fn with_readiness(mut self, readiness: Backoff) -> Self {
        self.readiness = readiness;
        self
    }

    /// 反向代理服务
    pub fn proxy(&self) -> ProvisionResult<&ServiceSpec> {
        find_role(&self.services, ServiceRole::Proxy)
            .ok_or_else(|| ProvisionError::Config("stack declares no proxy service".into()))
    }

    /// 覆盖全部主机名且未过期的已安装证书
    pub fn current_certificate(&self) -> Option<InstalledCertificate> {
        let cert = self.certbot.installed(self.domains.primary())?;
        let missing: Vec<&str> = self
            .domains
            .hostnames()
            .into_iter()
            .filter(|host| !cert.covers(host))
            .collect();
        if missing.is_empty() {
            Some(cert)
        } else {
            debug!(missing = ?missing, "Installed certificate does not cover every hostname");
            None
        }
    }

    pub fn health_checker(&self) -> HealthChecker {
        HealthChecker::new(
            self.probes.clone(),
            self.engine.clone(),
            self.services.clone(),
        )
    }

    pub fn renewal_scheduler(&self) -> ProvisionResult<RenewalScheduler> {
        Ok(RenewalScheduler::new(
            self.config.clone(),
            self.renderer.clone(),
            Crontab::new(self.runner.clone()),
            self.services.clone(),
            self.proxy()?.clone(),
        ))
    }

    /// 等待代理在 HTTP 端口接受 TCP 连接
    pub async fn wait_for_proxy(&self) -> ProvisionResult<u32> {
        let host = self.config.probe_host.as_str();
        let port = self.config.http_port;
        for attempt in 1..=self.readiness.attempts {
            if self.probes.tcp_ready(host, port).await {
                return Ok(attempt);
            }
            if attempt < self.readiness.attempts {
                let delay = self.readiness.delay(attempt);
                debug!(attempt = attempt, ?delay, "Proxy not ready yet");
                tokio::time::sleep(delay).await;
            }
        }
        Err(ProvisionError::UnreadyService {
            name: self.proxy()?.name.clone(),
        })
    }
}

/// 写入 `content` 到 `path`，自动创建父目录
pub fn write_file(path: &Path, content: &str) -> ProvisionResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, content)?;
    Ok(())
}

/// 删除 `path`，文件不存在不算错误
pub fn remove_file(path: &Path) -> ProvisionResult<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let backoff = Backoff::default();
        assert_eq!(backoff.delay(1), Duration::from_millis(500));
        assert_eq!(backoff.delay(2), Duration::from_secs(1));
        assert_eq!(backoff.delay(4), Duration::from_secs(4));
        assert_eq!(backoff.delay(5), Duration::from_secs(8));
        assert_eq!(backoff.delay(40), Duration::from_secs(8));
    }

    #[test]
    fn test_remove_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone.conf");
        assert!(!remove_file(&path).unwrap());
        write_file(&path, "x").unwrap();
        assert!(remove_file(&path).unwrap());
    }
}
