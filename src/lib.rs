//! stack-provisioner
//!
//! WordPress、n8n、MySQL、Redis、PHP-FPM 部署编排，nginx 反向代理，
//! Let's Encrypt 证书签发与自动续期

pub mod commands;
pub mod config;
pub mod domain;
pub mod error;
pub mod infra;
pub mod services;

use tracing_subscriber::EnvFilter;

/// 初始化日志：优先 `RUST_LOG`，否则 `info`，输出到 stderr
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
