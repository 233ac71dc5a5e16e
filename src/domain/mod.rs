//! 领域模型
//!
//! 纯数据结构，不访问进程或网络

pub mod domains;
pub mod health;
pub mod provision;
pub mod service;
pub mod vhost;

// Re-exports for convenience
pub use domains::{validate_hostname, DomainSet};
pub use health::{ContainerState, HealthReport};
pub use provision::{Phase, ProvisionOutcome, ProvisioningResult, RunState, StageStatus};
pub use service::{RestartPolicy, ServiceRole, ServiceSpec};
pub use vhost::{CertWindow, InstalledCertificate, Upstream, VHostConfig, VHostMode};
