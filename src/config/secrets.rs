//! 服务栈凭据
//!
//! 首次运行时生成并以 `KEY=VALUE` 行保存，
//! 之后的运行渲染出相同的 manifest。

use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

use crate::error::ProvisionResult;

const MYSQL_ROOT_PASSWORD: &str = "MYSQL_ROOT_PASSWORD";
const MYSQL_DATABASE: &str = "MYSQL_DATABASE";
const MYSQL_USER: &str = "MYSQL_USER";
const MYSQL_PASSWORD: &str = "MYSQL_PASSWORD";
const N8N_ENCRYPTION_KEY: &str = "N8N_ENCRYPTION_KEY";

/// 数据库与应用密钥
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StackSecrets {
    pub mysql_root_password: String,
    pub mysql_database: String,
    pub mysql_user: String,
    pub mysql_password: String,
    pub n8n_encryption_key: String,
}

impl StackSecrets {
    /// 生成新的随机密钥
    pub fn generate() -> Self {
        Self {
            mysql_root_password: random_secret(),
            mysql_database: "wordpress".to_string(),
            mysql_user: "wordpress".to_string(),
            mysql_password: random_secret(),
            n8n_encryption_key: random_secret(),
        }
    }

    /// 读取 `path`，补全并保存缺失项
    pub fn load_or_create(path: &Path) -> ProvisionResult<Self> {
        let existing = match std::fs::read_to_string(path) {
            Ok(raw) => parse_env_lines(&raw),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        let generated = Self::generate();
        let pick = |key: &str, fallback: &str| {
            existing
                .get(key)
                .filter(|v| !v.is_empty())
                .cloned()
                .unwrap_or_else(|| fallback.to_string())
        };
        let secrets = Self {
            mysql_root_password: pick(MYSQL_ROOT_PASSWORD, &generated.mysql_root_password),
            mysql_database: pick(MYSQL_DATABASE, &generated.mysql_database),
            mysql_user: pick(MYSQL_USER, &generated.mysql_user),
            mysql_password: pick(MYSQL_PASSWORD, &generated.mysql_password),
            n8n_encryption_key: pick(N8N_ENCRYPTION_KEY, &generated.n8n_encryption_key),
        };

        if existing.len() < 5 {
            info!(path = %path.display(), "Writing stack credentials");
            secrets.save(path)?;
        }
        Ok(secrets)
    }

    /// 写入密钥文件（仅属主可读写）
    pub fn save(&self, path: &Path) -> ProvisionResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let body = format!(
            "{}={}\n{}={}\n{}={}\n{}={}\n{}={}\n",
            MYSQL_ROOT_PASSWORD,
            self.mysql_root_password,
            MYSQL_DATABASE,
            self.mysql_database,
            MYSQL_USER,
            self.mysql_user,
            MYSQL_PASSWORD,
            self.mysql_password,
            N8N_ENCRYPTION_KEY,
            self.n8n_encryption_key,
        );
        std::fs::write(path, body)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }
}

/// 32 位十六进制字符，在 YAML、shell 和 SQL 中无需转义
fn random_secret() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

fn parse_env_lines(raw: &str) -> BTreeMap<String, String> {
    raw.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter_map(|l| l.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}
