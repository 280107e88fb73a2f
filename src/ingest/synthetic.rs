//! Synthetic decoder for `stub://` URLs.
//!
//! Produces RGB frames of the configured size: a dark background with an optional bright
//! "subject" rectangle whose position jitters by a few pixels between frames, the way a
//! standing person drifts in a real detector's output.
//!
//! Query parameters:
//! - `fps=N`: pacing (defaults to the stream frame rate)
//! - `subject=on|off|blink`: subject always visible, never visible, or 2s on / 2s off
//! - `fail_every=N`: every Nth read fails as a short read, exercising decoder restarts

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use rand::Rng;
use std::time::{Duration, Instant};
use url::Url;

use super::StreamConfig;
use crate::frame::Frame;

const BACKGROUND: u8 = 48;
const SUBJECT: u8 = 230;
const JITTER_PX: i64 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubjectMode {
    On,
    Off,
    Blink,
}

pub struct SyntheticDecoder {
    url: String,
    width: u32,
    height: u32,
    fps: u32,
    subject: SubjectMode,
    fail_every: u64,
    reads: u64,
    last_read_at: Option<Instant>,
}

impl SyntheticDecoder {
    pub fn new(config: &StreamConfig) -> Result<Self> {
        let url = Url::parse(&config.url).context("parse stub url")?;
        let mut fps = config.frame_rate;
        let mut subject = SubjectMode::On;
        let mut fail_every = 0u64;

        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "fps" => {
                    fps = value
                        .parse()
                        .map_err(|_| anyhow!("stub fps must be an integer, got '{}'", value))?;
                }
                "subject" => {
                    subject = match value.as_ref() {
                        "on" => SubjectMode::On,
                        "off" => SubjectMode::Off,
                        "blink" => SubjectMode::Blink,
                        other => return Err(anyhow!("unknown stub subject mode '{}'", other)),
                    };
                }
                "fail_every" => {
                    fail_every = value.parse().map_err(|_| {
                        anyhow!("stub fail_every must be an integer, got '{}'", value)
                    })?;
                }
                other => log::debug!("ignoring stub parameter '{}'", other),
            }
        }

        if fps == 0 {
            return Err(anyhow!("stub fps must be greater than zero"));
        }

        Ok(Self {
            url: config.url.clone(),
            width: config.width,
            height: config.height,
            fps,
            subject,
            fail_every,
            reads: 0,
            last_read_at: None,
        })
    }

    /// Synthetic streams are always reachable.
    pub fn open(&mut self) -> Result<()> {
        log::info!("SyntheticDecoder: connected to {}", self.url);
        Ok(())
    }

    pub fn read_frame(&mut self, sequence: u64) -> Result<Frame> {
        self.pace();
        self.reads += 1;
        if self.fail_every > 0 && self.reads % self.fail_every == 0 {
            return Err(anyhow!("short read from {} (simulated)", self.url));
        }

        let pixels = self.render(sequence);
        Frame::rgb(pixels, self.width, self.height, Utc::now(), sequence)
    }

    pub fn close(&mut self) {
        self.last_read_at = None;
    }

    fn pace(&mut self) {
        let interval = Duration::from_secs_f64(1.0 / self.fps as f64);
        if let Some(last) = self.last_read_at {
            let elapsed = last.elapsed();
            if elapsed < interval {
                std::thread::sleep(interval - elapsed);
            }
        }
        self.last_read_at = Some(Instant::now());
    }

    fn subject_visible(&self, sequence: u64) -> bool {
        match self.subject {
            SubjectMode::On => true,
            SubjectMode::Off => false,
            SubjectMode::Blink => {
                let period = self.fps as u64 * 2;
                (sequence / period.max(1)) % 2 == 0
            }
        }
    }

    fn render(&self, sequence: u64) -> Vec<u8> {
        let width = self.width as usize;
        let height = self.height as usize;
        let mut pixels = vec![BACKGROUND; width * height * 3];
        if !self.subject_visible(sequence) {
            return pixels;
        }

        let mut rng = rand::thread_rng();
        let jitter_x = rng.gen_range(-JITTER_PX..=JITTER_PX);
        let jitter_y = rng.gen_range(-JITTER_PX..=JITTER_PX);

        let box_w = (width / 8).max(2) as i64;
        let box_h = (height * 2 / 5).max(2) as i64;
        let left = (width as i64 * 2 / 5 + jitter_x).clamp(0, width as i64 - box_w);
        let top = (height as i64 * 3 / 10 + jitter_y).clamp(0, height as i64 - box_h);

        for y in top..top + box_h {
            let row = y as usize * width * 3;
            let start = row + left as usize * 3;
            let end = start + box_w as usize * 3;
            pixels[start..end].fill(SUBJECT);
        }
        pixels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(url: &str) -> StreamConfig {
        StreamConfig {
            url: url.to_string(),
            width: 80,
            height: 60,
            frame_rate: 1000,
            ..StreamConfig::default()
        }
    }

    #[test]
    fn renders_subject_on_dark_background() -> Result<()> {
        let mut decoder = SyntheticDecoder::new(&config("stub://lobby"))?;
        decoder.open()?;
        let frame = decoder.read_frame(1)?;
        assert_eq!(frame.byte_len(), 80 * 60 * 3);
        assert!(frame.pixels().contains(&SUBJECT));
        assert!(frame.pixels().contains(&BACKGROUND));
        Ok(())
    }

    #[test]
    fn subject_off_renders_background_only() -> Result<()> {
        let mut decoder = SyntheticDecoder::new(&config("stub://empty?subject=off"))?;
        let frame = decoder.read_frame(1)?;
        assert!(frame.pixels().iter().all(|&p| p == BACKGROUND));
        Ok(())
    }

    #[test]
    fn fail_every_simulates_short_reads() -> Result<()> {
        let mut decoder = SyntheticDecoder::new(&config("stub://flaky?fail_every=2"))?;
        assert!(decoder.read_frame(1).is_ok());
        assert!(decoder.read_frame(2).is_err());
        assert!(decoder.read_frame(2).is_ok());
        Ok(())
    }

    #[test]
    fn rejects_unknown_subject_mode() {
        assert!(SyntheticDecoder::new(&config("stub://x?subject=sometimes")).is_err());
        assert!(SyntheticDecoder::new(&config("stub://x?fps=0")).is_err());
    }
}
