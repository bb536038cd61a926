#![forbid(unsafe_code)]

//! Runtime configuration for the relay binaries.
//!
//! Two layers live here. Where state is kept on disk comes from the process
//! environment, an optional `.env` file, and CLI overrides (in that order of
//! increasing precedence). How a run behaves comes from `relay.toml`, whose
//! every key is optional.

use anyhow::{Context, Result, anyhow};
use chrono::NaiveTime;
use serde::Deserialize;
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_CONFIG_FILE: &str = "relay.toml";
pub const STATE_ROOT_KEY: &str = "RELAY_STATE_ROOT";

const DOWNLOADS_SUBDIR: &str = "downloads";
const PUBLISHED_FILE: &str = "uploaded_videos.json";
const TOKEN_FILE: &str = "token.json";
const COOKIES_FILE: &str = "cookies.txt";
const LOCK_FILE: &str = "relay.lock";

/// Every filesystem location a run touches, derived from a single root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimePaths {
    pub state_root: PathBuf,
    pub downloads: PathBuf,
    pub published: PathBuf,
    pub token: PathBuf,
    pub cookies: PathBuf,
    pub lock: PathBuf,
}

impl RuntimePaths {
    pub fn with_root(state_root: &Path) -> Self {
        let state_root = state_root.to_path_buf();
        Self {
            downloads: state_root.join(DOWNLOADS_SUBDIR),
            published: state_root.join(PUBLISHED_FILE),
            token: state_root.join(TOKEN_FILE),
            cookies: state_root.join(COOKIES_FILE),
            lock: state_root.join(LOCK_FILE),
            state_root,
        }
    }

    /// Creates the download directory so later steps can assume it exists.
    pub fn prepare(&self) -> Result<()> {
        fs::create_dir_all(&self.downloads)
            .with_context(|| format!("creating {}", self.downloads.display()))
    }

    pub fn default_config_file(&self) -> PathBuf {
        self.state_root.join(DEFAULT_CONFIG_FILE)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub state_root: Option<PathBuf>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_runtime_paths(overrides: RuntimeOverrides) -> Result<RuntimePaths> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    Ok(build_runtime_paths(&file_vars, env_var_string, overrides))
}

fn build_runtime_paths(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> RuntimePaths {
    let state_root = overrides
        .state_root
        .or_else(|| {
            env_lookup(STATE_ROOT_KEY)
                .or_else(|| file_vars.get(STATE_ROOT_KEY).cloned())
                .map(PathBuf::from)
        })
        .unwrap_or_else(|| PathBuf::from("."));
    RuntimePaths::with_root(&state_root)
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Parses `KEY=value` lines, tolerating `export` prefixes, comments and
/// single or double quotes. A missing file yields an empty map.
pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        vars.insert(key.to_string(), unquote(raw.trim()).to_string());
    }
    Ok(vars)
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if let Some(inner) = value
            .strip_prefix(quote)
            .and_then(|rest| rest.strip_suffix(quote))
        {
            return inner;
        }
    }
    value
}

/// Knobs for one pipeline run.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub search_query: String,
    pub max_results: u32,
    pub duration_filter: String,
    pub run_cap: usize,
    pub portrait_threshold: f64,
    pub retrieval_timeout_secs: u64,
    pub throttle_delay_secs: u64,
    pub category_id: String,
    pub license_statement: String,
    pub tags: Vec<String>,
    pub hashtags: Vec<String>,
    /// Browsers whose cookie jars yt-dlp may borrow, tried in order.
    pub browsers: Vec<String>,
    /// Local times of day (`HH:MM`) at which the scheduler launches a run.
    pub schedule: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            search_query: "dogs".to_string(),
            max_results: 10,
            duration_filter: "short".to_string(),
            run_cap: 2,
            portrait_threshold: 1.5,
            retrieval_timeout_secs: 300,
            throttle_delay_secs: 5,
            category_id: "22".to_string(),
            license_statement: "Creative Commons License".to_string(),
            tags: to_strings(&[
                "shorts",
                "creative commons",
                "dogs",
                "dog",
                "puppy",
                "doglover",
                "dogvideos",
                "cutedog",
                "doglife",
                "doggo",
                "pet",
                "dogsofinstagram",
                "dogstagram",
                "funny dogs",
                "cute dogs",
                "dog compilation",
                "dog shorts",
                "puppies",
                "dog content",
                "dog videos",
                "shorts dogs",
            ]),
            hashtags: to_strings(&[
                "#dog",
                "#dogs",
                "#puppy",
                "#doglover",
                "#dogvideos",
                "#cutedog",
                "#doglife",
                "#doggo",
                "#pet",
                "#dogsofinstagram",
                "#dogstagram",
                "#funnydogs",
                "#cutedogs",
                "#dogcompilation",
                "#dogshorts",
                "#puppies",
                "#dogcontent",
                "#dogvideos",
                "#shortsdogs",
            ]),
            browsers: to_strings(&["chrome", "safari"]),
            schedule: to_strings(&["09:00", "21:00"]),
        }
    }
}

fn to_strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}

impl PipelineConfig {
    /// Loads `path` when it exists and falls back to defaults otherwise.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let config: Self =
            toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.search_query.trim().is_empty() {
            return Err(anyhow!("search_query must not be empty"));
        }
        if !(self.portrait_threshold.is_finite() && self.portrait_threshold > 0.0) {
            return Err(anyhow!(
                "portrait_threshold must be a positive number, got {}",
                self.portrait_threshold
            ));
        }
        self.schedule_times()?;
        Ok(())
    }

    pub fn retrieval_timeout(&self) -> Duration {
        Duration::from_secs(self.retrieval_timeout_secs)
    }

    pub fn throttle_delay(&self) -> Duration {
        Duration::from_secs(self.throttle_delay_secs)
    }

    pub fn schedule_times(&self) -> Result<Vec<NaiveTime>> {
        let mut times = self
            .schedule
            .iter()
            .map(|value| {
                NaiveTime::parse_from_str(value.trim(), "%H:%M")
                    .with_context(|| format!("invalid schedule time {value:?}, expected HH:MM"))
            })
            .collect::<Result<Vec<_>>>()?;
        times.sort();
        times.dedup();
        Ok(times)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn make_file(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", contents).unwrap();
        file
    }

    #[test]
    fn read_env_file_handles_export_and_quotes() {
        let file = make_file(
            r#"
            export RELAY_STATE_ROOT="/srv/relay"
            OTHER='single'
            SPACED =  "value"
            # comment
            INVALID_LINE
            "#,
        );
        let vars = read_env_file(file.path()).unwrap();
        assert_eq!(vars.get("RELAY_STATE_ROOT").unwrap(), "/srv/relay");
        assert_eq!(vars.get("OTHER").unwrap(), "single");
        assert_eq!(vars.get("SPACED").unwrap(), "value");
        assert!(!vars.contains_key("INVALID_LINE"));
    }

    #[test]
    fn read_env_file_missing_file_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let vars = read_env_file(&dir.path().join("missing.env")).unwrap();
        assert!(vars.is_empty());
    }

    #[test]
    fn runtime_paths_prefer_env_over_file() {
        let mut vars = HashMap::new();
        vars.insert(STATE_ROOT_KEY.to_string(), "/from-file".to_string());
        let paths = build_runtime_paths(
            &vars,
            |key| (key == STATE_ROOT_KEY).then(|| "/from-env".to_string()),
            RuntimeOverrides::default(),
        );
        assert_eq!(paths.state_root, PathBuf::from("/from-env"));
        assert_eq!(paths.published, PathBuf::from("/from-env/uploaded_videos.json"));
    }

    #[test]
    fn runtime_paths_override_beats_everything() {
        let mut vars = HashMap::new();
        vars.insert(STATE_ROOT_KEY.to_string(), "/from-file".to_string());
        let paths = build_runtime_paths(
            &vars,
            |_| Some("/from-env".to_string()),
            RuntimeOverrides {
                state_root: Some(PathBuf::from("/override")),
                env_path: None,
            },
        );
        assert_eq!(paths.downloads, PathBuf::from("/override/downloads"));
        assert_eq!(paths.lock, PathBuf::from("/override/relay.lock"));
    }

    #[test]
    fn runtime_paths_default_to_current_dir() {
        let paths = build_runtime_paths(&HashMap::new(), |_| None, RuntimeOverrides::default());
        assert_eq!(paths.state_root, PathBuf::from("."));
        assert_eq!(paths.token, PathBuf::from("./token.json"));
    }

    #[test]
    fn pipeline_config_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig::load(&dir.path().join("relay.toml")).unwrap();
        assert_eq!(config, PipelineConfig::default());
        assert_eq!(config.run_cap, 2);
        assert_eq!(config.portrait_threshold, 1.5);
        assert_eq!(config.retrieval_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn pipeline_config_partial_file_overrides_named_keys() {
        let file = make_file("search_query = \"cats\"\nthrottle_delay_secs = 0\n");
        let config = PipelineConfig::load(file.path()).unwrap();
        assert_eq!(config.search_query, "cats");
        assert_eq!(config.throttle_delay(), Duration::ZERO);
        assert_eq!(config.max_results, 10);
        assert_eq!(config.duration_filter, "short");
    }

    #[test]
    fn pipeline_config_rejects_unknown_keys_and_bad_times() {
        let unknown = make_file("serch_query = \"typo\"\n");
        assert!(PipelineConfig::load(unknown.path()).is_err());

        let bad_time = make_file("schedule = [\"25:00\"]\n");
        let err = PipelineConfig::load(bad_time.path()).unwrap_err();
        assert!(format!("{err:#}").contains("invalid schedule time"));
    }

    #[test]
    fn schedule_times_are_sorted_and_deduped() {
        let config = PipelineConfig {
            schedule: to_strings(&["21:00", "09:00", "21:00"]),
            ..PipelineConfig::default()
        };
        let times = config.schedule_times().unwrap();
        assert_eq!(
            times,
            vec![
                NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
                NaiveTime::from_hms_opt(21, 0, 0).unwrap(),
            ]
        );
    }
}
