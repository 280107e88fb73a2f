use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use rand::Rng;

use super::{AlertSink, CooldownTracker, Delivery, SightingAlert};

const API_BASE: &str = "https://api.telegram.org";
const MESSAGE_CHANNEL: &str = "message";
const PHOTO_CHANNEL: &str = "photo";

#[derive(Clone, Debug)]
pub struct TelegramSettings {
    pub bot_token: String,
    pub chat_id: String,
    /// Minimum spacing between two sends on the same channel.
    pub cooldown: Duration,
    pub message_timeout: Duration,
    pub photo_timeout: Duration,
}

impl TelegramSettings {
    pub fn new(bot_token: impl Into<String>, chat_id: impl Into<String>) -> Self {
        Self {
            bot_token: bot_token.into(),
            chat_id: chat_id.into(),
            cooldown: Duration::from_secs(30),
            message_timeout: Duration::from_secs(10),
            photo_timeout: Duration::from_secs(30),
        }
    }
}

/// Telegram Bot API alert sink.
///
/// Text alerts go through `sendMessage`, images through a multipart `sendPhoto`. Each
/// request carries its own timeout so a slow API cannot hold the downstream loop.
pub struct TelegramAlertSink {
    settings: TelegramSettings,
    api_base: String,
    agent: ureq::Agent,
    cooldown: CooldownTracker,
}

impl TelegramAlertSink {
    pub fn new(settings: TelegramSettings) -> Result<Self> {
        if settings.bot_token.trim().is_empty() || settings.chat_id.trim().is_empty() {
            return Err(anyhow!("telegram bot token and chat id are required"));
        }
        let cooldown = CooldownTracker::new(settings.cooldown);
        Ok(Self {
            settings,
            api_base: API_BASE.to_string(),
            agent: ureq::AgentBuilder::new().build(),
            cooldown,
        })
    }

    /// Point the sink at another Bot API host (self-hosted server, tests).
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    pub fn cooldown(&self) -> &CooldownTracker {
        &self.cooldown
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.settings.bot_token, method)
    }

    fn send_message(&self, text: &str) -> Result<()> {
        self.agent
            .get(&self.method_url("sendMessage"))
            .timeout(self.settings.message_timeout)
            .query("chat_id", &self.settings.chat_id)
            .query("text", text)
            .query("parse_mode", "HTML")
            .query("disable_web_page_preview", "true")
            .call()
            .map_err(describe_error)
            .context("telegram sendMessage")?;
        Ok(())
    }

    fn send_photo(&self, image: &[u8], file_name: &str, caption: &str) -> Result<()> {
        let boundary = format!("----sighting{:016x}", rand::thread_rng().gen::<u64>());
        let body = multipart_body(
            &boundary,
            &[
                ("chat_id", self.settings.chat_id.as_str()),
                ("caption", caption),
                ("parse_mode", "HTML"),
            ],
            ("photo", file_name, image),
        );
        self.agent
            .post(&self.method_url("sendPhoto"))
            .timeout(self.settings.photo_timeout)
            .set(
                "Content-Type",
                &format!("multipart/form-data; boundary={}", boundary),
            )
            .send_bytes(&body)
            .map_err(describe_error)
            .context("telegram sendPhoto")?;
        Ok(())
    }
}

impl AlertSink for TelegramAlertSink {
    fn name(&self) -> &'static str {
        "telegram"
    }

    fn notify(&self, alert: &SightingAlert) -> Result<Delivery> {
        if let Some(wait) = self.cooldown.remaining_at(MESSAGE_CHANNEL, Instant::now()) {
            log::info!("skipping telegram alert; rate limited for {:.1}s", wait.as_secs_f32());
            return Ok(Delivery::Suppressed);
        }
        self.send_message(&alert.to_html())?;
        self.cooldown.record(MESSAGE_CHANNEL);
        Ok(Delivery::Sent)
    }

    fn notify_with_image(&self, image_path: &Path, caption: &str) -> Result<Delivery> {
        if !self.cooldown.is_ready(PHOTO_CHANNEL) {
            log::info!("skipping telegram photo; rate limited");
            return Ok(Delivery::Suppressed);
        }
        let image = read_image(image_path)?;
        let file_name = image_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("sighting.jpg");
        self.send_photo(&image, file_name, caption)?;
        self.cooldown.record(PHOTO_CHANNEL);
        Ok(Delivery::Sent)
    }
}

/// Read an image for upload, rejecting missing or empty files.
fn read_image(path: &Path) -> Result<Vec<u8>> {
    let bytes =
        fs::read(path).with_context(|| format!("image file not found: {}", path.display()))?;
    if bytes.is_empty() {
        return Err(anyhow!("image file is empty: {}", path.display()));
    }
    Ok(bytes)
}

fn describe_error(err: ureq::Error) -> anyhow::Error {
    match err {
        ureq::Error::Status(code, response) => {
            let body = response.into_string().unwrap_or_default();
            anyhow!("HTTP {}: {}", code, body.trim())
        }
        ureq::Error::Transport(transport) => anyhow!("transport error: {}", transport),
    }
}

/// Encode text fields plus one file part as `multipart/form-data`.
fn multipart_body(boundary: &str, fields: &[(&str, &str)], file: (&str, &str, &[u8])) -> Vec<u8> {
    let mut body = Vec::with_capacity(file.2.len() + 512);
    for (name, value) in fields {
        body.extend_from_slice(
            format!(
                "--{}\r\nContent-Disposition: form-data; name=\"{}\"\r\n\r\n{}\r\n",
                boundary, name, value
            )
            .as_bytes(),
        );
    }
    let (name, file_name, bytes) = file;
    body.extend_from_slice(
        format!(
            "--{}\r\nContent-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n\
             Content-Type: image/jpeg\r\n\r\n",
            boundary, name, file_name
        )
        .as_bytes(),
    );
    body.extend_from_slice(bytes);
    body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());
    body
}
