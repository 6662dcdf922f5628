use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::render::TimeFormat;

pub const DEFAULT_USER_AGENT: &str = "srwikisync/0.3 (+https://github.com/srwikisync)";
pub const DEFAULT_LEADERBOARD_API: &str = "https://www.speedrun.com/api/v1";
pub const DEFAULT_TEMPLATE: &str = "Speedrun Record";
pub const DEFAULT_MAPPINGS_DIR: &str = "mappings";
pub const CURATION_DIR_NAME: &str = "curation";

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct SyncConfig {
    #[serde(default)]
    pub wiki: WikiSection,
    #[serde(default)]
    pub leaderboard: LeaderboardSection,
    #[serde(default)]
    pub behavior: BehaviorSection,
    /// Directory of the loaded config file; relative paths resolve against it.
    #[serde(skip)]
    pub base_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct WikiSection {
    pub api_url: Option<String>,
    pub page_title: Option<String>,
    pub user_agent: Option<String>,
    pub summary: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct LeaderboardSection {
    pub api_base: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct BehaviorSection {
    pub mappings_dir: Option<PathBuf>,
    pub curation_dir: Option<PathBuf>,
    pub terms_path: Option<PathBuf>,
    pub template: Option<String>,
    pub time_format: Option<TimeFormat>,
    pub section_name: Option<String>,
}

impl SyncConfig {
    /// Resolve the wiki API URL: env WIKI_API_URL > config.
    pub fn wiki_api_url(&self) -> Result<String> {
        env_override("WIKI_API_URL")
            .or_else(|| self.wiki.api_url.clone())
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| anyhow::anyhow!("wiki.api_url is not configured (or set WIKI_API_URL)"))
    }

    /// Resolve the target page: env WIKI_PAGE_TITLE > config.
    pub fn page_title(&self) -> Result<String> {
        env_override("WIKI_PAGE_TITLE")
            .or_else(|| self.wiki.page_title.clone())
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| {
                anyhow::anyhow!("wiki.page_title is not configured (or set WIKI_PAGE_TITLE)")
            })
    }

    /// Resolve user agent: env WIKI_USER_AGENT > config > DEFAULT_USER_AGENT.
    pub fn wiki_user_agent(&self) -> String {
        env_override("WIKI_USER_AGENT")
            .or_else(|| self.wiki.user_agent.clone())
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }

    /// Resolve the leaderboard base URL: env SRC_API_BASE > config > default.
    pub fn leaderboard_api_base(&self) -> String {
        env_override("SRC_API_BASE")
            .or_else(|| self.leaderboard.api_base.clone())
            .unwrap_or_else(|| DEFAULT_LEADERBOARD_API.to_string())
            .trim_end_matches('/')
            .to_string()
    }

    pub fn leaderboard_user_agent(&self) -> String {
        env_override("SRC_USER_AGENT")
            .or_else(|| self.leaderboard.user_agent.clone())
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }

    pub fn template(&self) -> &str {
        self.behavior
            .template
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(DEFAULT_TEMPLATE)
    }

    pub fn time_format(&self) -> TimeFormat {
        self.behavior.time_format.unwrap_or_default()
    }

    pub fn mappings_dir(&self) -> PathBuf {
        let configured = self
            .behavior
            .mappings_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_MAPPINGS_DIR));
        self.resolve_relative(&configured)
    }

    /// Curation files live next to the mappings unless configured elsewhere.
    pub fn curation_dir(&self) -> PathBuf {
        match &self.behavior.curation_dir {
            Some(dir) => self.resolve_relative(dir),
            None => self.mappings_dir().join(CURATION_DIR_NAME),
        }
    }

    pub fn terms_path(&self) -> Option<PathBuf> {
        self.behavior
            .terms_path
            .as_ref()
            .map(|path| self.resolve_relative(path))
    }

    /// Edit summary for one save, naming the sections that were rewritten.
    pub fn edit_summary(&self, sections: &[String]) -> String {
        let joined = sections.join(", ");
        match self.wiki.summary.as_deref().map(str::trim) {
            Some(template) if !template.is_empty() => template.replace("$sections", &joined),
            _ => format!("Update speedrun.com WRs for {joined} (automated)"),
        }
    }

    fn resolve_relative(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            return path.to_path_buf();
        }
        match &self.base_dir {
            Some(base) => base.join(path),
            None => path.to_path_buf(),
        }
    }
}

/// Load a config file. TOML by default, YAML for `.yaml`/`.yml`.
pub fn load_config(config_path: &Path) -> Result<SyncConfig> {
    if !config_path.exists() {
        bail!("config file not found: {}", config_path.display());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let mut parsed: SyncConfig = if is_yaml_path(config_path) {
        serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse {}", config_path.display()))?
    } else {
        toml::from_str(&content)
            .with_context(|| format!("failed to parse {}", config_path.display()))?
    };
    parsed.base_dir = config_path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .map(Path::to_path_buf);
    Ok(parsed)
}

fn is_yaml_path(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"))
}

pub(crate) fn env_override(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub(crate) fn env_value_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn load_config_fails_for_missing_file() {
        let error = load_config(Path::new("/nonexistent/srwikisync.toml")).expect_err("must fail");
        assert!(error.to_string().contains("config file not found"));
    }

    #[test]
    fn load_config_parses_toml_sections() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("srwikisync.toml");
        fs::write(
            &config_path,
            r#"
[wiki]
api_url = "https://zeldawiki.example/api.php"
page_title = "Speedrun Records"

[leaderboard]
user_agent = "test-agent/1.0"

[behavior]
mappings_dir = "maps"
template = "Record Row"
time_format = "units"
"#,
        )
        .expect("write config");

        let config = load_config(&config_path).expect("load config");
        assert_eq!(config.page_title().expect("title"), "Speedrun Records");
        assert_eq!(config.leaderboard_user_agent(), "test-agent/1.0");
        assert_eq!(config.template(), "Record Row");
        assert_eq!(config.time_format(), TimeFormat::Units);
        assert_eq!(config.mappings_dir(), temp.path().join("maps"));
        assert_eq!(
            config.curation_dir(),
            temp.path().join("maps").join(CURATION_DIR_NAME)
        );
    }

    #[test]
    fn load_config_parses_yaml_by_extension() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("wiki.yaml");
        fs::write(
            &config_path,
            "wiki:\n  page_title: Records\nbehavior:\n  terms_path: terms.json\n",
        )
        .expect("write config");

        let config = load_config(&config_path).expect("load config");
        assert_eq!(config.wiki.page_title.as_deref(), Some("Records"));
        assert_eq!(config.terms_path(), Some(temp.path().join("terms.json")));
    }

    #[test]
    fn load_config_returns_error_for_invalid_toml() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("srwikisync.toml");
        fs::write(&config_path, "[wiki\npage_title = \"oops\"").expect("write config");
        let error = load_config(&config_path).expect_err("must fail");
        assert!(error.to_string().contains("failed to parse"));
    }

    #[test]
    fn defaults_apply_when_sections_are_absent() {
        let config = SyncConfig::default();
        assert_eq!(config.template(), DEFAULT_TEMPLATE);
        assert_eq!(config.time_format(), TimeFormat::Clock);
        assert_eq!(config.mappings_dir(), PathBuf::from(DEFAULT_MAPPINGS_DIR));
        assert!(config.terms_path().is_none());
    }

    #[test]
    fn edit_summary_uses_template_when_configured() {
        let mut config = SyncConfig::default();
        let sections = vec!["PH".to_string(), "ST".to_string()];
        assert_eq!(
            config.edit_summary(&sections),
            "Update speedrun.com WRs for PH, ST (automated)"
        );
        config.wiki.summary = Some("Bot: refresh records ($sections)".to_string());
        assert_eq!(config.edit_summary(&sections), "Bot: refresh records (PH, ST)");
    }
}
