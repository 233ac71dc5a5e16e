//! 健康报告模型

use serde::Serialize;
use std::collections::BTreeMap;

use super::vhost::CertWindow;

/// 容器状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    Running,
    Exited,
    Unknown,
}

impl ContainerState {
    /// 解析 `docker ps` 的状态字符串
    pub fn from_docker(state: &str) -> Self {
        match state.trim().to_ascii_lowercase().as_str() {
            "running" => ContainerState::Running,
            "exited" | "dead" => ContainerState::Exited,
            _ => ContainerState::Unknown,
        }
    }
}

/// 一次健康检查的结果，每次都实时重新计算
#[derive(Clone, Debug, Default, Serialize)]
pub struct HealthReport {
    pub container_statuses: BTreeMap<String, ContainerState>,
    pub http_reachable: BTreeMap<String, bool>,
    pub cert_validity: BTreeMap<String, Option<CertWindow>>,
    pub db_reachable: bool,
}

impl HealthReport {
    /// Names of failed probes, e.g. `http:example.com`
    pub fn failures(&self) -> Vec<String> {
        let mut failed = Vec::new();
        for (name, state) in &self.container_statuses {
            if *state != ContainerState::Running {
                failed.push(format!("container:{}", name));
            }
        }
        for (host, ok) in &self.http_reachable {
            if !ok {
                failed.push(format!("http:{}", host));
            }
        }
        let now = chrono::Utc::now();
        for (host, window) in &self.cert_validity {
            if !window.map(|w| w.is_current(now)).unwrap_or(false) {
                failed.push(format!("cert:{}", host));
            }
        }
        if !self.db_reachable {
            failed.push("db".to_string());
        }
        failed
    }

    pub fn is_healthy(&self) -> bool {
        self.failures().is_empty()
    }
}
