//! External `ffmpeg` decode process.
//!
//! The decoder spawns `ffmpeg`, asks it for raw `rgb24` frames scaled to the configured
//! resolution on stdout, and reads exactly one frame's worth of bytes per call. Any short
//! read or pipe error is returned to the acquisition loop, which tears the process down
//! and starts a new one.

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use std::io::Read;
use std::process::{Child, ChildStdout, Command, Stdio};

use super::StreamConfig;
use crate::frame::{Frame, RGB_CHANNELS};

pub struct FfmpegDecoder {
    url: String,
    width: u32,
    height: u32,
    frame_rate: u32,
    rtsp_transport: String,
    child: Option<Child>,
    stdout: Option<ChildStdout>,
}

impl FfmpegDecoder {
    pub fn new(config: &StreamConfig) -> Self {
        Self {
            url: config.url.clone(),
            width: config.width,
            height: config.height,
            frame_rate: config.frame_rate,
            rtsp_transport: config.rtsp_transport.clone(),
            child: None,
            stdout: None,
        }
    }

    pub fn frame_bytes(&self) -> usize {
        self.width as usize * self.height as usize * RGB_CHANNELS as usize
    }

    /// Build the ffmpeg invocation for this stream.
    pub fn command(&self) -> Command {
        let mut cmd = Command::new("ffmpeg");
        cmd.arg("-hide_banner").arg("-loglevel").arg("error");

        if self.url.starts_with("rtsp://") || self.url.starts_with("rtsps://") {
            cmd.arg("-rtsp_transport").arg(&self.rtsp_transport);
        }

        cmd.arg("-probesize")
            .arg("32")
            .arg("-analyzeduration")
            .arg("0")
            .arg("-fflags")
            .arg("nobuffer")
            .arg("-flags")
            .arg("low_delay")
            .arg("-i")
            .arg(&self.url)
            .arg("-an")
            .arg("-vf")
            .arg(format!("scale={}:{}", self.width, self.height))
            .arg("-r")
            .arg(self.frame_rate.to_string())
            .arg("-pix_fmt")
            .arg("rgb24")
            .arg("-f")
            .arg("rawvideo")
            .arg("-");
        cmd
    }

    pub fn open(&mut self) -> Result<()> {
        self.close();
        let mut cmd = self.command();
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawn ffmpeg for {}", redact_credentials(&self.url)))?;
        let stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(anyhow!("failed to capture ffmpeg stdout"));
            }
        };

        log::info!(
            "FfmpegDecoder: decoding {} at {}x{}@{}",
            redact_credentials(&self.url),
            self.width,
            self.height,
            self.frame_rate
        );
        self.child = Some(child);
        self.stdout = Some(stdout);
        Ok(())
    }

    pub fn read_frame(&mut self, sequence: u64) -> Result<Frame> {
        let frame_bytes = self.frame_bytes();
        let stdout = self
            .stdout
            .as_mut()
            .ok_or_else(|| anyhow!("ffmpeg decoder not open"))?;

        let mut buffer = vec![0u8; frame_bytes];
        stdout
            .read_exact(&mut buffer)
            .map_err(|e| anyhow!("short read of {} byte frame: {}", frame_bytes, e))?;

        Frame::rgb(buffer, self.width, self.height, Utc::now(), sequence)
    }

    pub fn close(&mut self) {
        self.stdout = None;
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

impl Drop for FfmpegDecoder {
    fn drop(&mut self) {
        self.close();
    }
}

/// Strip `user:password@` from a URL before it reaches the logs.
fn redact_credentials(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    let authority_end = rest.find('/').unwrap_or(rest.len());
    match rest[..authority_end].rfind('@') {
        Some(at) => format!("{}://***@{}", scheme, &rest[at + 1..]),
        None => url.to_string(),
    }
}
