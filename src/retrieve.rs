#![forbid(unsafe_code)]

//! Fetching source videos with yt-dlp.
//!
//! The source platform throttles anonymous scrapers, so a download is
//! attempted with a series of cookie sources: an exported `cookies.txt`,
//! then the cookie jars of locally installed browsers, then nothing at all.
//! The first strategy that leaves a file at the destination wins.

use anyhow::{Context, Result, bail};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::pipeline::Retriever;

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
(KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
const FORMAT_SELECTOR: &str = "best[height<=1080]";
const POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
pub enum RetrieveError {
    #[error("all {attempted} retrieval strategies failed for {url}")]
    Exhausted { url: String, attempted: usize },
    #[error("could not prepare {path}: {source}")]
    Destination {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// One way of producing a local copy of a remote video.
pub trait FetchStrategy {
    fn name(&self) -> &str;

    /// Strategies that cannot possibly work right now (missing cookie file)
    /// are skipped without counting as an attempt.
    fn is_available(&self) -> bool {
        true
    }

    fn attempt(&self, url: &str, dest: &Path) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CookieSource {
    File(PathBuf),
    Browser(String),
    Anonymous,
}

impl CookieSource {
    fn args(&self) -> Vec<String> {
        match self {
            CookieSource::File(path) => {
                vec!["--cookies".into(), path.to_string_lossy().into_owned()]
            }
            CookieSource::Browser(browser) => {
                vec!["--cookies-from-browser".into(), browser.clone()]
            }
            CookieSource::Anonymous => Vec::new(),
        }
    }

    fn label(&self) -> String {
        match self {
            CookieSource::File(_) => "cookie-file".to_string(),
            CookieSource::Browser(browser) => format!("browser:{browser}"),
            CookieSource::Anonymous => "anonymous".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct YtDlpStrategy {
    name: String,
    program: PathBuf,
    cookies: CookieSource,
    timeout: Duration,
}

impl YtDlpStrategy {
    pub fn new(program: impl Into<PathBuf>, cookies: CookieSource, timeout: Duration) -> Self {
        Self {
            name: cookies.label(),
            program: program.into(),
            cookies,
            timeout,
        }
    }

    fn command(&self, url: &str, dest: &Path) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(["--extractor-args", "youtube:player_client=default"])
            .args(["--user-agent", USER_AGENT])
            .args(["-f", FORMAT_SELECTOR])
            .arg("--no-warnings")
            .arg("-o")
            .arg(dest)
            .args(self.cookies.args())
            .arg(url)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        command
    }
}

impl FetchStrategy for YtDlpStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_available(&self) -> bool {
        match &self.cookies {
            CookieSource::File(path) => path.exists(),
            _ => true,
        }
    }

    fn attempt(&self, url: &str, dest: &Path) -> Result<()> {
        let mut child = self
            .command(url, dest)
            .spawn()
            .with_context(|| format!("spawning {}", self.program.display()))?;
        let started = Instant::now();
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if started.elapsed() >= self.timeout {
                let _ = child.kill();
                let _ = child.wait();
                bail!("timed out after {}s", self.timeout.as_secs());
            }
            thread::sleep(POLL_INTERVAL);
        };
        if !status.success() {
            bail!("yt-dlp exited with {status}");
        }
        if !dest.exists() {
            bail!("yt-dlp reported success but {} is missing", dest.display());
        }
        Ok(())
    }
}

/// Tries each strategy in order and stops at the first success.
pub struct FallbackRetriever {
    strategies: Vec<Box<dyn FetchStrategy>>,
}

impl FallbackRetriever {
    pub fn new(strategies: Vec<Box<dyn FetchStrategy>>) -> Self {
        Self { strategies }
    }

    /// cookie file, each browser in order, then anonymous.
    pub fn yt_dlp_chain(
        program: impl Into<PathBuf>,
        cookies_file: &Path,
        browsers: &[String],
        timeout: Duration,
    ) -> Self {
        let program = program.into();
        let mut sources = vec![CookieSource::File(cookies_file.to_path_buf())];
        sources.extend(browsers.iter().cloned().map(CookieSource::Browser));
        sources.push(CookieSource::Anonymous);
        let strategies = sources
            .into_iter()
            .map(|source| {
                Box::new(YtDlpStrategy::new(program.clone(), source, timeout))
                    as Box<dyn FetchStrategy>
            })
            .collect();
        Self::new(strategies)
    }

    pub fn strategy_names(&self) -> Vec<&str> {
        self.strategies.iter().map(|strategy| strategy.name()).collect()
    }

    /// Returns the name of the strategy that produced `dest`.
    pub fn fetch(&self, url: &str, dest: &Path) -> Result<String, RetrieveError> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|source| RetrieveError::Destination {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let mut attempted = 0;
        for strategy in &self.strategies {
            if !strategy.is_available() {
                debug!(strategy = strategy.name(), "strategy unavailable, skipping");
                continue;
            }
            // Leftovers from a failed attempt must not pass for a download.
            remove_if_present(dest);
            attempted += 1;
            match strategy.attempt(url, dest) {
                Ok(()) => {
                    info!(strategy = strategy.name(), "downloaded {url}");
                    return Ok(strategy.name().to_string());
                }
                Err(err) => {
                    warn!(strategy = strategy.name(), "download attempt failed: {err:#}");
                }
            }
        }
        remove_if_present(dest);
        Err(RetrieveError::Exhausted {
            url: url.to_string(),
            attempted,
        })
    }
}

impl Retriever for FallbackRetriever {
    fn retrieve(&self, url: &str, dest: &Path) -> Result<()> {
        self.fetch(url, dest)?;
        Ok(())
    }
}

fn remove_if_present(path: &Path) {
    if path.exists()
        && let Err(err) = fs::remove_file(path)
    {
        warn!("could not remove {}: {err}", path.display());
    }
}

/// Deletes files left in the download directory by an earlier run that
/// died mid-candidate. Returns how many were removed.
pub fn sweep_stale_artifacts(downloads: &Path) -> Result<usize> {
    if !downloads.exists() {
        return Ok(0);
    }
    let mut removed = 0;
    for entry in WalkDir::new(downloads)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
    {
        fs::remove_file(entry.path())
            .with_context(|| format!("removing stale {}", entry.path().display()))?;
        removed += 1;
    }
    if removed > 0 {
        info!(removed, "cleared stale downloads from {}", downloads.display());
    }
    Ok(removed)
}
