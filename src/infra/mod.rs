//! 基础设施
//!
//! 外部工具客户端（进程执行、容器引擎、证书工具、crontab）与通知渠道

pub mod certbot;
pub mod command;
pub mod container;
pub mod crontab;
pub mod notifier;

pub use certbot::CertificateTool;
pub use command::{CommandOutput, ProcessRunner, SystemRunner};
pub use container::ContainerEngine;
pub use crontab::Crontab;
pub use notifier::{LogNotifier, Notifier, TelegramNotifier};
