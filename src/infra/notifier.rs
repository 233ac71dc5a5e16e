//! 运维通知
//!
//! 续期失败推送到 Telegram。发送会重试几次，仍失败则记录日志后丢弃，
//! 不会导致续期运行失败。

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::env::TelegramConfig;

const TELEGRAM_API: &str = "https://api.telegram.org";
const SEND_ATTEMPTS: u32 = 3;

/// 运维消息通道
#[async_trait]
pub trait Notifier: Send + Sync {
    /// 发送 `message`，对端接受后返回 `true`
    async fn notify(&self, message: &str) -> bool;
}

/// 未配置时使用的通知器
#[derive(Clone, Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, message: &str) -> bool {
        warn!(message = %message, "No notifier configured, message only logged");
        false
    }
}

/// Telegram Bot API 客户端
#[derive(Clone)]
pub struct TelegramNotifier {
    client: Client,
    api_base: String,
    bot_token: String,
    chat_id: String,
    retry_delay: Duration,
}

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
    disable_web_page_preview: bool,
}

impl TelegramNotifier {
    pub fn new(bot_token: &str, chat_id: &str) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .pool_max_idle_per_host(1)
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            api_base: TELEGRAM_API.to_string(),
            bot_token: bot_token.to_string(),
            chat_id: chat_id.to_string(),
            retry_delay: Duration::from_secs(2),
        }
    }

    /// Point at another Bot API endpoint (self-hosted server, tests)
    pub fn with_api_base(mut self, api_base: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    fn send_url(&self) -> String {
        format!("{}/bot{}/sendMessage", self.api_base, self.bot_token)
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(&self, message: &str) -> bool {
        let url = self.send_url();
        let body = SendMessage {
            chat_id: &self.chat_id,
            text: message,
            disable_web_page_preview: true,
        };

        for attempt in 1..=SEND_ATTEMPTS {
            match self.client.post(&url).json(&body).send().await {
                Ok(resp) if resp.status().is_success() => {
                    info!(chat_id = %self.chat_id, attempt = attempt, "Notification sent");
                    return true;
                }
                Ok(resp) => {
                    warn!(
                        chat_id = %self.chat_id,
                        status = %resp.status(),
                        attempt = attempt,
                        "Telegram returned non-success status"
                    );
                }
                Err(e) => {
                    // the error text may contain the URL, and with it the token
                    warn!(
                        chat_id = %self.chat_id,
                        error = %e.without_url(),
                        attempt = attempt,
                        "Failed to send notification, will retry"
                    );
                }
            }

            if attempt < SEND_ATTEMPTS {
                tokio::time::sleep(self.retry_delay).await;
            }
        }

        error!(chat_id = %self.chat_id, "Failed to send notification after {} attempts", SEND_ATTEMPTS);
        false
    }
}

/// 按配置选择通知器
pub fn from_config(telegram: &TelegramConfig) -> Box<dyn Notifier> {
    match (&telegram.bot_token, &telegram.chat_id) {
        (Some(token), Some(chat_id)) => Box::new(TelegramNotifier::new(token, chat_id)),
        _ => {
            debug!("Telegram not configured");
            Box::new(LogNotifier)
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// One-shot HTTP server answering every request with `status`
    async fn serve(status: &'static str) -> (String, tokio::task::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let mut requests = Vec::new();
            for _ in 0..SEND_ATTEMPTS {
                let (mut socket, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => break,
                };
                let mut buf = vec![0u8; 8192];
                let n = socket.read(&mut buf).await.unwrap_or(0);
                requests.push(String::from_utf8_lossy(&buf[..n]).to_string());
                let response = format!(
                    "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: 2\r\nConnection: close\r\n\r\n{{}}",
                    status
                );
                let _ = socket.write_all(response.as_bytes()).await;
                if status.starts_with("200") {
                    break;
                }
            }
            requests
        });
        (format!("http://{}", addr), handle)
    }

    #[tokio::test]
    async fn test_telegram_success() {
        let (base, server) = serve("200 OK").await;
        let notifier = TelegramNotifier::new("123:abc", "42").with_api_base(&base);
        assert!(notifier.notify("renewal failed for example.com").await);

        let requests = server.await.unwrap();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].starts_with("POST /bot123:abc/sendMessage"));
    }

    #[tokio::test]
    async fn test_telegram_retries_then_gives_up() {
        let (base, server) = serve("500 Internal Server Error").await;
        let notifier = TelegramNotifier::new("123:abc", "42")
            .with_api_base(&base)
            .with_retry_delay(Duration::from_millis(10));
        assert!(!notifier.notify("hello").await);
        assert_eq!(server.await.unwrap().len(), SEND_ATTEMPTS as usize);
    }

    #[tokio::test]
    async fn test_unconfigured_falls_back_to_log() {
        let notifier = from_config(&TelegramConfig::default());
        assert!(!notifier.notify("hello").await);
    }
}
