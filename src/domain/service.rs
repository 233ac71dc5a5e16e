//! 受管服务模型
//!
//! 每个容器对应一个 `ServiceSpec`。每次运行构建一次，只替换不修改；
//! compose manifest 直接由它们渲染。

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// 服务在栈中的角色
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceRole {
    Proxy,
    Database,
    Application,
    Automation,
    Cache,
    PhpRuntime,
}

/// 容器重启策略
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum RestartPolicy {
    #[serde(rename = "no")]
    Never,
    #[serde(rename = "always")]
    Always,
    #[serde(rename = "unless-stopped")]
    UnlessStopped,
}

/// 绑定挂载（宿主路径 -> 容器路径）
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Mount {
    pub host: String,
    pub container: String,
    pub read_only: bool,
}

/// 端口映射（宿主 -> 容器）
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PortBinding {
    pub host: u16,
    pub container: u16,
}

/// 单个受管容器的声明式描述
#[derive(Clone, Debug, Serialize)]
pub struct ServiceSpec {
    /// Compose service name
    pub name: String,
    /// Explicit container name, used for status lookups
    pub container_name: String,
    pub role: ServiceRole,
    pub image: String,
    pub restart_policy: RestartPolicy,
    pub env: BTreeMap<String, String>,
    pub mounts: Vec<Mount>,
    pub networks: BTreeSet<String>,
    pub ports: Vec<PortBinding>,
    pub depends_on: Vec<String>,
}

impl ServiceSpec {
    pub fn new(name: &str, role: ServiceRole, image: &str, project: &str) -> Self {
        Self {
            name: name.to_string(),
            container_name: format!("{}-{}", project, name),
            role,
            image: image.to_string(),
            restart_policy: RestartPolicy::UnlessStopped,
            env: BTreeMap::new(),
            mounts: Vec::new(),
            networks: BTreeSet::new(),
            ports: Vec::new(),
            depends_on: Vec::new(),
        }
    }

    pub fn env(mut self, key: &str, value: impl Into<String>) -> Self {
        self.env.insert(key.to_string(), value.into());
        self
    }

    pub fn mount(mut self, host: impl Into<String>, container: &str) -> Self {
        self.mounts.push(Mount {
            host: host.into(),
            container: container.to_string(),
            read_only: false,
        });
        self
    }

    pub fn mount_ro(mut self, host: impl Into<String>, container: &str) -> Self {
        self.mounts.push(Mount {
            host: host.into(),
            container: container.to_string(),
            read_only: true,
        });
        self
    }

    pub fn network(mut self, network: &str) -> Self {
        self.networks.insert(network.to_string());
        self
    }

    pub fn port(mut self, host: u16, container: u16) -> Self {
        self.ports.push(PortBinding { host, container });
        self
    }

    pub fn depends_on(mut self, service: &str) -> Self {
        self.depends_on.push(service.to_string());
        self
    }

    pub fn restart(mut self, policy: RestartPolicy) -> Self {
        self.restart_policy = policy;
        self
    }
}

/// 查找担任 `role` 的服务
pub fn find_role(services: &[ServiceSpec], role: ServiceRole) -> Option<&ServiceSpec> {
    services.iter().find(|s| s.role == role)
}
