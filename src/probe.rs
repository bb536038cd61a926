#![forbid(unsafe_code)]

//! Portrait-orientation check for downloaded media.
//!
//! Dimensions come from `ffprobe`; the decision itself is a pure function so
//! it can be exercised without touching any media.

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, warn};

use crate::pipeline::FormatValidator;

/// Threshold below true 9:16 (about 1.778) so near-vertical encodes pass.
pub const DEFAULT_PORTRAIT_THRESHOLD: f64 = 1.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValidationOutcome {
    pub accepted: bool,
    /// `None` when probing failed before any dimensions were read.
    pub dimensions: Option<Dimensions>,
}

impl ValidationOutcome {
    fn rejected() -> Self {
        Self {
            accepted: false,
            dimensions: None,
        }
    }
}

/// `height / width >= threshold`, with zero sides always rejected.
pub fn meets_portrait_threshold(dimensions: Dimensions, threshold: f64) -> bool {
    if dimensions.width == 0 || dimensions.height == 0 {
        return false;
    }
    f64::from(dimensions.height) / f64::from(dimensions.width) >= threshold
}

/// Reads the pixel size of a media file's primary video stream.
pub trait MediaProbe {
    fn dimensions(&self, media: &Path) -> Result<Dimensions>;
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    #[serde(default)]
    width: u32,
    #[serde(default)]
    height: u32,
}

/// `ffprobe -select_streams v:0 -show_entries stream=width,height -of json`.
#[derive(Debug, Clone)]
pub struct Ffprobe {
    program: PathBuf,
}

impl Default for Ffprobe {
    fn default() -> Self {
        Self::new("ffprobe")
    }
}

impl Ffprobe {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl MediaProbe for Ffprobe {
    fn dimensions(&self, media: &Path) -> Result<Dimensions> {
        let output = Command::new(&self.program)
            .args(["-v", "error", "-select_streams", "v:0"])
            .args(["-show_entries", "stream=width,height", "-of", "json"])
            .arg(media)
            .output()
            .with_context(|| format!("running {}", self.program.display()))?;
        if !output.status.success() {
            bail!(
                "ffprobe exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        parse_probe_output(&output.stdout)
    }
}

fn parse_probe_output(raw: &[u8]) -> Result<Dimensions> {
    let parsed: ProbeOutput = serde_json::from_slice(raw).context("decoding ffprobe JSON")?;
    let stream = parsed
        .streams
        .first()
        .context("no video stream in ffprobe output")?;
    Ok(Dimensions {
        width: stream.width,
        height: stream.height,
    })
}

/// Accepts media whose aspect ratio is at least `threshold`. Probe failures
/// are logged and reported as a rejection, never as an error.
#[derive(Debug, Clone)]
pub struct PortraitValidator<P> {
    probe: P,
    threshold: f64,
}

impl<P: MediaProbe> PortraitValidator<P> {
    pub fn new(probe: P, threshold: f64) -> Self {
        Self { probe, threshold }
    }

    pub fn is_portrait(&self, media: &Path) -> bool {
        self.check(media).accepted
    }

    pub fn check(&self, media: &Path) -> ValidationOutcome {
        match self.probe.dimensions(media) {
            Ok(dimensions) => {
                let accepted = meets_portrait_threshold(dimensions, self.threshold);
                debug!(
                    width = dimensions.width,
                    height = dimensions.height,
                    accepted,
                    "probed {}",
                    media.display()
                );
                ValidationOutcome {
                    accepted,
                    dimensions: Some(dimensions),
                }
            }
            Err(err) => {
                warn!("could not read dimensions of {}: {err:#}", media.display());
                ValidationOutcome::rejected()
            }
        }
    }
}

impl<P: MediaProbe> FormatValidator for PortraitValidator<P> {
    fn validate(&self, media: &Path) -> ValidationOutcome {
        self.check(media)
    }
}
