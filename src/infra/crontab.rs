//! 用户 crontab 访问
//!
//! 用 `crontab -l` 读取，通过 stdin 交给 `crontab -` 整表替换。
//! 已存在的同命令条目不会重复添加。

use std::sync::Arc;
use tracing::{debug, info};

use crate::config::env::constants::COMMAND_TIMEOUT;
use crate::config::env::RenewalSchedule;
use crate::error::{ProvisionError, ProvisionResult};
use crate::infra::command::{args, ProcessRunner};

#[derive(Clone)]
pub struct Crontab {
    runner: Arc<dyn ProcessRunner>,
}

impl Crontab {
    pub fn new(runner: Arc<dyn ProcessRunner>) -> Self {
        Self { runner }
    }

    /// 当前条目，没有 crontab 的用户返回空
    pub async fn entries(&self) -> ProvisionResult<Vec<String>> {
        let output = self.runner.run("crontab", &args(["-l"]), COMMAND_TIMEOUT).await?;
        if output.succeeded() {
            return Ok(output.stdout.lines().map(str::to_string).collect());
        }
        if output.combined().to_ascii_lowercase().contains("no crontab") {
            debug!("No crontab installed yet");
            return Ok(Vec::new());
        }
        Err(ProvisionError::tool_failure(
            "crontab -l",
            output.exit_code,
            output.combined(),
        ))
    }

    /// 安装每日执行 `command` 的条目
    ///
    /// 已有执行 `command` 的条目时，时间一致则保留，否则原地改期。
    /// 表未改动时返回 `false`。
    pub async fn install_daily(&self, schedule: RenewalSchedule, command: &str) -> ProvisionResult<bool> {
        let line = daily_line(schedule, command);
        let command = command.trim();
        let mut entries = self.entries().await?;

        let existing: Vec<usize> = entries
            .iter()
            .enumerate()
            .filter(|(_, e)| entry_command(e) == Some(command))
            .map(|(i, _)| i)
            .collect();
        if existing.len() == 1 && entries[existing[0]].trim() == line {
            debug!(entry = %line, "Cron entry already installed");
            return Ok(false);
        }

        match existing.first() {
            Some(&first) => {
                info!(old = %entries[first].trim(), new = %line, "Rescheduling cron entry");
                entries[first] = line.clone();
                // later duplicates of the same command go away
                for &index in existing[1..].iter().rev() {
                    entries.remove(index);
                }
            }
            None => entries.push(line.clone()),
        }

        let mut table = entries.join("\n");
        table.push('\n');

        self.runner
            .run_with_input("crontab", &args(["-"]), &table, COMMAND_TIMEOUT)
            .await?
            .check("crontab -")?;
        info!(entry = %line, "Installed cron entry");
        Ok(true)
    }
}

/// 五字段 cron 行的命令部分；注释、变量和 `@` 简写返回 `None`
fn entry_command(entry: &str) -> Option<&str> {
    let entry = entry.trim();
    if entry.is_empty() || entry.starts_with('#') || entry.starts_with('@') {
        return None;
    }
    let mut rest = entry;
    for _ in 0..5 {
        let (field, tail) = rest.split_once(char::is_whitespace)?;
        if field.contains('=') {
            return None;
        }
        rest = tail.trim_start();
    }
    Some(rest.trim_end())
}

/// `M H * * * command`
pub fn daily_line(schedule: RenewalSchedule, command: &str) -> String {
    format!("{} {} * * * {}", schedule.minute, schedule.hour, command.trim())
}

/// 测试用内存 crontab
#[cfg(test)]
pub(crate) mod fake {
    use crate::infra::command::fake::Invocation;
    use crate::infra::command::{CommandError, CommandOutput};
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    pub struct CrontabTable {
        table: Arc<Mutex<Option<String>>>,
    }

    impl CrontabTable {
        pub fn with(initial: &str) -> Self {
            Self {
                table: Arc::new(Mutex::new(Some(initial.to_string()))),
            }
        }

        pub fn lines(&self) -> Vec<String> {
            self.table
                .lock()
                .unwrap()
                .as_deref()
                .unwrap_or_default()
                .lines()
                .map(str::to_string)
                .collect()
        }

        /// Answer a `crontab -l` / `crontab -` invocation
        pub fn answer(&self, inv: &Invocation) -> Result<CommandOutput, CommandError> {
            let mut table = self.table.lock().unwrap();
            match inv.args.first().map(String::as_str) {
                Some("-l") => match table.as_ref() {
                    Some(t) => Ok(CommandOutput::success(t.clone())),
                    None => Ok(CommandOutput::failure(1, "no crontab for root")),
                },
                Some("-") => {
                    *table = inv.input.clone();
                    Ok(CommandOutput::success(""))
                }
                _ => Ok(CommandOutput::failure(2, "usage")),
            }
        }
    }
}
