//! 环境变量配置加载

use std::env;
use std::path::{Path, PathBuf};
use tracing::warn;

/// 环境配置
#[derive(Clone, Debug)]
pub struct EnvConfig {
    /// 所有渲染产物所在目录
    pub base_dir: PathBuf,
    /// Compose 项目名，同时是容器名前缀
    pub project: String,
    /// 证书申请联系邮箱
    pub contact_email: Option<String>,
    /// Certificate tool config directory (contains `live/`)
    pub letsencrypt_dir: PathBuf,
    /// Certificate tool executable
    pub certbot_bin: String,
    /// Container engine executable
    pub docker_bin: String,
    /// Port the proxy serves the ACME challenge on
    pub http_port: u16,
    /// Port the proxy serves TLS on
    pub https_port: u16,
    /// Address used for readiness and HTTP probes
    pub probe_host: String,
    /// 续期失败的 Telegram 通知
    pub telegram: TelegramConfig,
    /// 每日续期时间
    pub renewal: RenewalSchedule,
}

/// Telegram 机器人配置
#[derive(Clone, Debug, Default)]
pub struct TelegramConfig {
    pub bot_token: Option<String>,
    pub chat_id: Option<String>,
}

impl TelegramConfig {
    pub fn from_env() -> Self {
        let bot_token = env::var("TELEGRAM_BOT_TOKEN").ok().filter(|s| !s.is_empty());
        let chat_id = env::var("TELEGRAM_CHAT_ID").ok().filter(|s| !s.is_empty());
        if bot_token.is_some() != chat_id.is_some() {
            warn!("TELEGRAM_BOT_TOKEN and TELEGRAM_CHAT_ID must both be set; notifications disabled");
            return Self::default();
        }
        Self { bot_token, chat_id }
    }

    pub fn is_enabled(&self) -> bool {
        self.bot_token.is_some() && self.chat_id.is_some()
    }
}

/// 续期任务的执行时刻
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenewalSchedule {
    pub hour: u8,
    pub minute: u8,
}

impl EnvConfig {
    /// 从环境变量加载配置
    pub fn from_env() -> Self {
        let base_dir = env::var("STACK_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/opt/stack"));

        let project = env::var("STACK_PROJECT").unwrap_or_else(|_| "stack".to_string());

        let contact_email = load_with_fallback("LETSENCRYPT_EMAIL", "CERTBOT_EMAIL")
            .filter(|s| !s.is_empty());
        if env::var("LETSENCRYPT_EMAIL").is_err() && env::var("CERTBOT_EMAIL").is_ok() {
            warn!("CERTBOT_EMAIL is deprecated, use LETSENCRYPT_EMAIL");
        }

        let letsencrypt_dir = env::var("LETSENCRYPT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/etc/letsencrypt"));

        let certbot_bin = env::var("CERTBOT_BIN").unwrap_or_else(|_| "certbot".to_string());
        let docker_bin = env::var("DOCKER_BIN").unwrap_or_else(|_| "docker".to_string());

        let http_port = parse_var("HTTP_PORT").unwrap_or(80);
        let https_port = parse_var("HTTPS_PORT").unwrap_or(443);
        let probe_host = env::var("PROBE_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());

        let renewal = RenewalSchedule {
            hour: parse_var("RENEWAL_HOUR").filter(|h| *h < 24).unwrap_or(3),
            minute: parse_var("RENEWAL_MINUTE").filter(|m| *m < 60).unwrap_or(0),
        };

        Self {
            base_dir,
            project,
            contact_email,
            letsencrypt_dir,
            certbot_bin,
            docker_bin,
            http_port,
            https_port,
            probe_host,
            telegram: TelegramConfig::from_env(),
            renewal,
        }
    }

    /// 以 `base_dir` 为根、其余取默认值的配置
    pub fn with_base_dir(base_dir: &Path) -> Self {
        Self {
            base_dir: base_dir.to_path_buf(),
            project: "stack".to_string(),
            contact_email: None,
            letsencrypt_dir: base_dir.join("letsencrypt"),
            certbot_bin: "certbot".to_string(),
            docker_bin: "docker".to_string(),
            http_port: 80,
            https_port: 443,
            probe_host: "127.0.0.1".to_string(),
            telegram: TelegramConfig::default(),
            renewal: RenewalSchedule { hour: 3, minute: 0 },
        }
    }

    /// `base_dir` 下的产物路径
    pub fn paths(&self) -> StackPaths {
        StackPaths::new(&self.base_dir)
    }

    /// 代理与证书工具共用的 ACME webroot
    pub fn webroot(&self) -> PathBuf {
        self.base_dir.join("certbot").join("www")
    }
}

/// 渲染产物路径
#[derive(Clone, Debug)]
pub struct StackPaths {
    pub compose_file: PathBuf,
    pub conf_dir: PathBuf,
    pub domains_file: PathBuf,
    pub secrets_file: PathBuf,
    pub renewal_script: PathBuf,
    pub renewal_log: PathBuf,
    pub healthcheck_script: PathBuf,
}

impl StackPaths {
    pub fn new(base: &Path) -> Self {
        Self {
            compose_file: base.join("docker-compose.yml"),
            conf_dir: base.join("nginx").join("conf.d"),
            domains_file: base.join("domains.json"),
            secrets_file: base.join(".env.stack"),
            renewal_script: base.join("renew-certs.sh"),
            renewal_log: base.join("logs").join("renew.log"),
            healthcheck_script: base.join("healthcheck.sh"),
        }
    }

    /// 覆盖全部主机名的 challenge 代理配置
    pub fn challenge_conf(&self) -> PathBuf {
        self.conf_dir.join("00-acme-challenge.conf")
    }

    /// 单个主机名的 TLS 代理配置
    pub fn tls_conf(&self, host: &str) -> PathBuf {
        self.conf_dir.join(format!("{}.conf", host))
    }
}

fn parse_var<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

/// 加载环境变量，支持 fallback
fn load_with_fallback(primary: &str, fallback: &str) -> Option<String> {
    env::var(primary).ok().or_else(|| env::var(fallback).ok())
}

/// 常量
pub mod constants {
    use std::time::Duration;

    /// Short commands (status, exec, crontab)
    pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

    /// `docker compose up` may pull images
    pub const COMPOSE_UP_TIMEOUT: Duration = Duration::from_secs(900);

    /// 证书签发 / 续期
    pub const CERTBOT_TIMEOUT: Duration = Duration::from_secs(300);

    /// 代理就绪等待：尝试次数与初始退避（翻倍，有上限）
    pub const READINESS_ATTEMPTS: u32 = 8;
    pub const READINESS_INITIAL_BACKOFF: Duration = Duration::from_millis(500);
    pub const READINESS_MAX_BACKOFF: Duration = Duration::from_secs(8);

    /// 健康检查单项超时
    pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

    /// 距过期少于此天数的证书会重新签发
    pub const RENEWAL_WINDOW_DAYS: i64 = 30;

    /// 标记续期失败的输出片段
    pub const RENEWAL_FAILURE_MARKERS: &[&str] = &["renewal failed", "renewals failed", "failed to renew"];

    /// 版本号
    pub const VERSION: &str = env!("CARGO_PKG_VERSION");
}
