//! 配置模块
//!
//! 环境变量解析、生成的凭据与服务栈组成

pub mod env;
pub mod secrets;
pub mod stack;

pub use env::{EnvConfig, RenewalSchedule, StackPaths, TelegramConfig};
pub use secrets::StackSecrets;
