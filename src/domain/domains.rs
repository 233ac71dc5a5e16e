//! 域名集模型
//!
//! `DomainSet` 由校验过的输入构建，之后不再修改。它以 JSON 保存在渲染产物旁，
//! 供 `renew` 和 `healthcheck` 复用；加载时会重新校验。

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{ProvisionError, ProvisionResult};

/// 自动化引擎子域名前缀
pub const AUTOMATION_PREFIX: &str = "n8n";

const MAX_HOSTNAME_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

/// 主域名及其派生子域名
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainSet {
    primary: String,
    subdomains: Vec<String>,
}

impl DomainSet {
    /// 校验 `primary` 并派生子域名
    pub fn new(primary: &str) -> ProvisionResult<Self> {
        let primary = primary.trim_end_matches('.').to_ascii_lowercase();
        validate_hostname(&primary)?;
        let subdomains = vec![format!("{}.{}", AUTOMATION_PREFIX, primary)];
        let set = Self { primary, subdomains };
        set.validate()?;
        Ok(set)
    }

    pub fn primary(&self) -> &str {
        &self.primary
    }

    pub fn subdomains(&self) -> &[String] {
        &self.subdomains
    }

    /// 自动化引擎主机名（`n8n.<primary>`）
    pub fn automation_host(&self) -> String {
        format!("{}.{}", AUTOMATION_PREFIX, self.primary)
    }

    /// 全部主机名，主域名在前
    pub fn hostnames(&self) -> Vec<&str> {
        std::iter::once(self.primary.as_str())
            .chain(self.subdomains.iter().map(String::as_str))
            .collect()
    }

    /// 按语法重新校验每个主机名
    ///
    /// 用于反序列化上次保存的域名集，以及渲染前的检查。
    pub fn validate(&self) -> ProvisionResult<()> {
        validate_hostname(&self.primary)?;
        for sub in &self.subdomains {
            validate_hostname(sub)?;
            if !sub.ends_with(&format!(".{}", self.primary)) {
                return Err(ProvisionError::invalid_domain(
                    sub.clone(),
                    format!("not a subdomain of {}", self.primary),
                ));
            }
        }
        Ok(())
    }

    /// 加载已保存的域名集
    pub fn load(path: &Path) -> ProvisionResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let set: DomainSet = serde_json::from_str(&raw)?;
        set.validate()?;
        Ok(set)
    }

    /// 保存域名集（覆盖）
    pub fn save(&self, path: &Path) -> ProvisionResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

impl std::fmt::Display for DomainSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.hostnames().join(", "))
    }
}

/// 按严格语法校验主机名
///
/// ASCII letters, digits, `-` and `.` only; labels of 1-63 characters that
/// neither start nor end with `-`.
pub fn validate_hostname(host: &str) -> ProvisionResult<()> {
    if host.is_empty() {
        return Err(ProvisionError::invalid_domain(host, "empty hostname"));
    }
    if host.len() > MAX_HOSTNAME_LEN {
        return Err(ProvisionError::invalid_domain(host, "hostname longer than 253 characters"));
    }
    if let Some(bad) = host
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '.'))
    {
        let reason = if bad.is_whitespace() {
            "contains whitespace".to_string()
        } else if !bad.is_ascii() {
            "contains non-ASCII characters".to_string()
        } else {
            format!("invalid character '{}'", bad)
        };
        return Err(ProvisionError::invalid_domain(host, reason));
    }
    for label in host.split('.') {
        if label.is_empty() {
            return Err(ProvisionError::invalid_domain(host, "empty label"));
        }
        if label.len() > MAX_LABEL_LEN {
            return Err(ProvisionError::invalid_domain(host, "label longer than 63 characters"));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(ProvisionError::invalid_domain(host, "label starts or ends with '-'"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_valid_hostnames() {
        assert!(validate_hostname("example.com").is_ok());
        assert!(validate_hostname("sub.example-1.co").is_ok());
        assert!(validate_hostname("localhost").is_ok());
    }

    #[test]
    fn test_rejects_invalid_hostnames() {
        for bad in [
            "",
            "exa mple.com",
            "example.com\n",
            "exämple.com",
            "example.com;rm",
            "exa_mple.com",
            "{{primary}}.com",
            "-bad.com",
            "bad-.com",
            "double..dot.com",
        ] {
            let err = validate_hostname(bad).unwrap_err();
            assert!(
                matches!(err, ProvisionError::InvalidDomain { .. }),
                "{:?} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_domain_set_derives_subdomains() {
        let set = DomainSet::new("Tomated.App").unwrap();
        assert_eq!(set.primary(), "tomated.app");
        assert_eq!(set.subdomains(), ["n8n.tomated.app".to_string()]);
        assert_eq!(set.hostnames(), vec!["tomated.app", "n8n.tomated.app"]);
        assert_eq!(set.to_string(), "tomated.app, n8n.tomated.app");
    }

    #[test]
    fn test_load_revalidates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("domains.json");

        let set = DomainSet::new("example.com").unwrap();
        set.save(&path).unwrap();
        assert_eq!(DomainSet::load(&path).unwrap(), set);

        std::fs::write(
            &path,
            r#"{"primary":"evil com","subdomains":["n8n.evil com"]}"#,
        )
        .unwrap();
        assert!(matches!(
            DomainSet::load(&path),
            Err(ProvisionError::InvalidDomain { .. })
        ));
    }
}
