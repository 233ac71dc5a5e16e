//! 服务层
//!
//! 模板渲染、部署编排、健康检查与证书续期

pub mod health;
pub mod provision;
pub mod renewal;
pub mod templates;

pub use health::{HealthChecker, NetworkProbes, Probes};
pub use provision::{ProvisionContext, Provisioner};
pub use renewal::{run_renewal, RenewalOutcome, RenewalScheduler};
pub use templates::{TemplateId, TemplateRenderer};
