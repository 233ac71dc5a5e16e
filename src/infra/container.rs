//! 容器引擎客户端
//!
//! 经由 `ProcessRunner` 调用 `docker compose` / `docker` 的薄封装。
//! 服务总是通过 `ServiceSpec` 定位，不硬编码名称。

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::env::constants::{COMMAND_TIMEOUT, COMPOSE_UP_TIMEOUT};
use crate::domain::health::ContainerState;
use crate::domain::service::ServiceSpec;
use crate::error::ProvisionResult;
use crate::infra::command::{args, CommandOutput, ProcessRunner};

/// 基于 compose 的容器引擎
#[derive(Clone)]
pub struct ContainerEngine {
    runner: Arc<dyn ProcessRunner>,
    docker: String,
    compose_file: PathBuf,
    project: String,
    /// `docker-compose` v1 binary instead of the `docker compose` plugin
    legacy_compose: bool,
}

impl ContainerEngine {
    pub fn new(runner: Arc<dyn ProcessRunner>, docker: &str, compose_file: &Path, project: &str) -> Self {
        Self {
            runner,
            docker: docker.to_string(),
            compose_file: compose_file.to_path_buf(),
            project: project.to_string(),
            legacy_compose: false,
        }
    }

    /// 优先使用 `docker compose` 插件，否则回退到 `docker-compose`
    pub async fn detect_compose(mut self) -> Self {
        let plugin = self
            .runner
            .run(&self.docker, &args(["compose", "version"]), COMMAND_TIMEOUT)
            .await;
        if !plugin.map(|o| o.succeeded()).unwrap_or(false) {
            let legacy = self
                .runner
                .run("docker-compose", &args(["version"]), COMMAND_TIMEOUT)
                .await;
            if legacy.map(|o| o.succeeded()).unwrap_or(false) {
                info!("Using docker-compose v1");
                self.legacy_compose = true;
            } else {
                warn!("Neither 'docker compose' nor 'docker-compose' responded");
            }
        }
        self
    }

    fn compose(&self, rest: &[&str]) -> (String, Vec<String>) {
        let mut argv = Vec::new();
        let program = if self.legacy_compose {
            "docker-compose".to_string()
        } else {
            argv.push("compose".to_string());
            self.docker.clone()
        };
        argv.extend(args([
            "-p",
            self.project.as_str(),
            "-f",
            &self.compose_file.display().to_string(),
        ]));
        argv.extend(rest.iter().map(|s| s.to_string()));
        (program, argv)
    }

    /// 创建/启动服务（`up -d`），空列表表示全部
    pub async fn up(&self, services: &[ServiceSpec]) -> ProvisionResult<CommandOutput> {
        let mut rest = vec!["up", "-d", "--remove-orphans"];
        rest.extend(services.iter().map(|s| s.name.as_str()));
        let (program, argv) = self.compose(&rest);
        let output = self.runner.run(&program, &argv, COMPOSE_UP_TIMEOUT).await?;
        output.check("docker compose up")
    }

    /// 原地重载代理配置
    pub async fn reload(&self, service: &ServiceSpec) -> ProvisionResult<CommandOutput> {
        let output = self.exec(service, &["nginx", "-s", "reload"]).await?;
        output.check("nginx reload")
    }

    /// 重启单个服务
    pub async fn restart(&self, service: &ServiceSpec) -> ProvisionResult<CommandOutput> {
        let (program, argv) = self.compose(&["restart", service.name.as_str()]);
        let output = self.runner.run(&program, &argv, COMMAND_TIMEOUT).await?;
        output.check("docker compose restart")
    }

    /// 校验代理配置但不应用
    pub async fn test_proxy_config(&self, service: &ServiceSpec) -> ProvisionResult<CommandOutput> {
        let output = self.exec(service, &["nginx", "-t"]).await?;
        output.check("nginx -t")
    }

    /// 在运行中的服务容器内执行命令
    ///
    /// 密钥应放在容器自身的环境变量中，不能出现在 `command` 里，
    /// 后者在宿主机进程列表中可见。
    pub async fn exec(&self, service: &ServiceSpec, command: &[&str]) -> ProvisionResult<CommandOutput> {
        let mut argv = args(["exec", service.container_name.as_str()]);
        argv.extend(command.iter().map(|s| s.to_string()));
        Ok(self.runner.run(&self.docker, &argv, COMMAND_TIMEOUT).await?)
    }

    /// 每个声明服务的状态，缺失的容器为 `Unknown`
    pub async fn status(&self, services: &[ServiceSpec]) -> BTreeMap<String, ContainerState> {
        let listed = match self
            .runner
            .run(
                &self.docker,
                &args(["ps", "-a", "--format", "{{.Names}}\t{{.State}}"]),
                COMMAND_TIMEOUT,
            )
            .await
        {
            Ok(output) if output.succeeded() => parse_ps(&output.stdout),
            Ok(output) => {
                warn!(output = %output.combined(), "docker ps failed");
                BTreeMap::new()
            }
            Err(e) => {
                warn!(error = %e, "docker ps failed");
                BTreeMap::new()
            }
        };

        services
            .iter()
            .map(|s| {
                let state = listed
                    .get(&s.container_name)
                    .copied()
                    .unwrap_or(ContainerState::Unknown);
                (s.name.clone(), state)
            })
            .collect()
    }
}

/// Parse `docker ps --format '{{.Names}}\t{{.State}}'`
fn parse_ps(stdout: &str) -> BTreeMap<String, ContainerState> {
    stdout
        .lines()
        .filter_map(|line| line.split_once('\t'))
        .map(|(name, state)| (name.trim().to_string(), ContainerState::from_docker(state)))
        .collect()
}
