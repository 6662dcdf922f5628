use std::collections::BTreeMap;
use std::thread::sleep;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use chrono::NaiveDate;
use reqwest::Url;
use reqwest::blocking::Client;
use serde::Deserialize;
use serde_json::Value;

use crate::config::{SyncConfig, env_value_u64};
use crate::mapping::MappingEntry;

/// One verified run as reported by the leaderboard.
#[derive(Debug, Clone, PartialEq)]
pub struct Run {
    pub id: String,
    /// Display name; several players are joined with ", ".
    pub player: String,
    pub time_seconds: f64,
    pub date: Option<NaiveDate>,
    pub variable_values: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct LeaderboardQuery {
    pub game_id: String,
    pub category_id: String,
    pub level_id: Option<String>,
    pub variables: Vec<(String, String)>,
}

impl LeaderboardQuery {
    pub fn for_entry(entry: &MappingEntry) -> Self {
        Self {
            game_id: entry.game_id.clone(),
            category_id: entry.category_id.clone(),
            level_id: entry.level_id.clone(),
            variables: entry
                .pinned_variables()
                .map(|(id, value)| (id.to_string(), value.to_string()))
                .collect(),
        }
    }

    pub fn path(&self) -> String {
        match &self.level_id {
            Some(level) => format!(
                "/leaderboards/{}/level/{}/{}",
                self.game_id, level, self.category_id
            ),
            None => format!("/leaderboards/{}/category/{}", self.game_id, self.category_id),
        }
    }

    pub fn params(&self) -> Vec<(String, String)> {
        let mut params = vec![("embed".to_string(), "players".to_string())];
        for (id, value) in &self.variables {
            params.push((format!("var-{id}"), value.clone()));
        }
        params
    }
}

/// Read access to the leaderboard. Implementations return verified runs only.
pub trait LeaderboardApi {
    fn query(&mut self, query: &LeaderboardQuery) -> Result<Vec<Run>>;
    fn request_count(&self) -> usize;
}

#[derive(Debug, Clone)]
pub struct LeaderboardClientConfig {
    pub api_base: String,
    pub user_agent: String,
    pub timeout_ms: u64,
    pub rate_limit_ms: u64,
}

impl LeaderboardClientConfig {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            api_base: config.leaderboard_api_base(),
            user_agent: config.leaderboard_user_agent(),
            timeout_ms: env_value_u64("SRC_HTTP_TIMEOUT_MS", 30_000),
            rate_limit_ms: env_value_u64("SRC_RATE_LIMIT_MS", 600),
        }
    }
}

pub struct LeaderboardClient {
    client: Client,
    config: LeaderboardClientConfig,
    last_request_at: Option<Instant>,
    request_count: usize,
    user_names: BTreeMap<String, String>,
}

impl LeaderboardClient {
    pub fn new(config: LeaderboardClientConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .context("failed to build leaderboard HTTP client")?;

        Ok(Self {
            client,
            config,
            last_request_at: None,
            request_count: 0,
            user_names: BTreeMap::new(),
        })
    }

    /// GET one JSON document. No retries: a failure surfaces to the caller.
    fn request_json(&mut self, path: &str, params: &[(String, String)]) -> Result<Value> {
        let url = Url::parse(&format!("{}{}", self.config.api_base, path))
            .with_context(|| format!("invalid leaderboard URL: {}{path}", self.config.api_base))?;
        let body = self.get_text(url.clone(), params)?;

        // Slug-addressed requests may answer with an HTML meta refresh to the id URL.
        if looks_like_html(&body) {
            let target = extract_meta_refresh_url(&body).ok_or_else(|| {
                anyhow::anyhow!("leaderboard API returned HTML without a redirect for {url}")
            })?;
            let redirected = absolute_from_base(&url, &target)?;
            let body = self.get_text(redirected, params)?;
            return serde_json::from_str(&body)
                .context("failed to decode leaderboard JSON after redirect");
        }

        serde_json::from_str(&body).context("failed to decode leaderboard JSON response")
    }

    fn get_text(&mut self, url: Url, params: &[(String, String)]) -> Result<String> {
        self.apply_rate_limit();
        let response = self
            .client
            .get(url)
            .header("User-Agent", self.config.user_agent.clone())
            .header("Accept", "application/json")
            .query(params)
            .send()
            .context("failed to call leaderboard API")?;
        let status = response.status();
        if !status.is_success() {
            bail!("leaderboard API request failed with HTTP {status}");
        }
        response
            .text()
            .context("failed to read leaderboard API response")
    }

    fn apply_rate_limit(&mut self) {
        let delay = Duration::from_millis(self.config.rate_limit_ms);
        if let Some(last) = self.last_request_at {
            let elapsed = last.elapsed();
            if elapsed < delay {
                sleep(delay - elapsed);
            }
        }
        self.last_request_at = Some(Instant::now());
        self.request_count += 1;
    }

    fn user_name(&mut self, user_id: &str) -> Result<String> {
        if let Some(name) = self.user_names.get(user_id) {
            return Ok(name.clone());
        }
        let payload = self.request_json(&format!("/users/{user_id}"), &[])?;
        let parsed: UserResponse =
            serde_json::from_value(payload).context("failed to decode user response")?;
        let name = parsed.data.display_name().unwrap_or_else(|| "Unknown".to_string());
        self.user_names.insert(user_id.to_string(), name.clone());
        Ok(name)
    }
}

impl LeaderboardApi for LeaderboardClient {
    fn query(&mut self, query: &LeaderboardQuery) -> Result<Vec<Run>> {
        let payload = self.request_json(&query.path(), &query.params())?;
        let parsed: LeaderboardResponse =
            serde_json::from_value(payload).context("failed to decode leaderboard response")?;

        for player in &parsed.data.players.data {
            if let (Some(id), Some(name)) = (player.id.as_ref(), player.display_name()) {
                self.user_names.insert(id.clone(), name);
            }
        }

        let mut runs = Vec::with_capacity(parsed.data.runs.len());
        for placed in parsed.data.runs {
            let run = placed.run;
            let mut names = Vec::with_capacity(run.players.len());
            for player in &run.players {
                names.push(match (player.rel.as_str(), &player.id) {
                    ("user", Some(id)) => self.user_name(id)?,
                    _ => player.display_name().unwrap_or_else(|| "Unknown".to_string()),
                });
            }
            let player = names
                .into_iter()
                .filter(|name| !name.is_empty())
                .collect::<Vec<_>>()
                .join(", ");

            runs.push(Run {
                id: run.id,
                player: if player.is_empty() {
                    "Unknown".to_string()
                } else {
                    player
                },
                time_seconds: run.times.primary_t,
                date: run
                    .date
                    .as_deref()
                    .and_then(|value| NaiveDate::parse_from_str(value, "%Y-%m-%d").ok()),
                variable_values: run.values,
            });
        }
        Ok(runs)
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

fn looks_like_html(body: &str) -> bool {
    let trimmed = body.trim_start();
    ["<!doctype", "<html"].iter().any(|prefix| {
        trimmed
            .get(..prefix.len())
            .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
    })
}

/// The `url=` target of a `<meta http-equiv="refresh" content="0; url=...">` tag.
fn extract_meta_refresh_url(html: &str) -> Option<String> {
    let lowered = html.to_ascii_lowercase();
    let content_at = lowered.find("content=")?;
    let url_at = content_at + lowered[content_at..].find("url=")? + "url=".len();
    let target = html[url_at..]
        .split(|ch: char| ch == '"' || ch == '\'' || ch == '>' || ch.is_whitespace())
        .next()?
        .trim();
    if target.is_empty() {
        None
    } else {
        Some(target.to_string())
    }
}

fn absolute_from_base(base: &Url, target: &str) -> Result<Url> {
    base.join(target)
        .with_context(|| format!("invalid redirect target from leaderboard API: {target}"))
}

#[derive(Debug, Deserialize, Default)]
struct LeaderboardResponse {
    #[serde(default)]
    data: LeaderboardPayload,
}

#[derive(Debug, Deserialize, Default)]
struct LeaderboardPayload {
    #[serde(default)]
    runs: Vec<PlacedRun>,
    #[serde(default)]
    players: EmbeddedPlayers,
}

#[derive(Debug, Deserialize, Default)]
struct EmbeddedPlayers {
    #[serde(default)]
    data: Vec<PlayerItem>,
}

#[derive(Debug, Deserialize)]
struct PlacedRun {
    run: RunItem,
}

#[derive(Debug, Deserialize)]
struct RunItem {
    id: String,
    #[serde(default)]
    players: Vec<PlayerItem>,
    date: Option<String>,
    times: RunTimes,
    #[serde(default)]
    values: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct RunTimes {
    primary_t: f64,
}

#[derive(Debug, Deserialize, Default)]
struct PlayerItem {
    #[serde(default)]
    rel: String,
    id: Option<String>,
    name: Option<String>,
    names: Option<PlayerNames>,
}

impl PlayerItem {
    fn display_name(&self) -> Option<String> {
        self.names
            .as_ref()
            .and_then(|names| names.international.clone())
            .or_else(|| self.name.clone())
            .filter(|name| !name.trim().is_empty())
    }
}

#[derive(Debug, Deserialize, Default)]
struct PlayerNames {
    international: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct UserResponse {
    #[serde(default)]
    data: PlayerItem,
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use reqwest::Url;

    use super::{
        LeaderboardQuery, LeaderboardResponse, absolute_from_base, extract_meta_refresh_url,
        looks_like_html,
    };
    use crate::mapping::MappingEntry;

    #[test]
    fn query_uses_pinned_variables_and_level_path() {
        let entry = MappingEntry {
            ordinal: 0,
            section: "PH".to_string(),
            wiki_category_label: "Any%".to_string(),
            game_id: "tlozph".to_string(),
            category_id: "c1".to_string(),
            level_id: Some("lvl".to_string()),
            declared_variables: BTreeMap::new(),
            query_variables: BTreeMap::from([
                ("v1".to_string(), "x".to_string()),
                ("v2".to_string(), String::new()),
            ]),
            label_variable_ids: Vec::new(),
        };
        let query = LeaderboardQuery::for_entry(&entry);
        assert_eq!(query.path(), "/leaderboards/tlozph/level/lvl/c1");
        assert_eq!(
            query.params(),
            vec![
                ("embed".to_string(), "players".to_string()),
                ("var-v1".to_string(), "x".to_string()),
            ]
        );

        let full_game = LeaderboardQuery {
            level_id: None,
            ..query
        };
        assert_eq!(full_game.path(), "/leaderboards/tlozph/category/c1");
    }

    #[test]
    fn leaderboard_payload_decodes_runs_and_embedded_players() {
        let parsed: LeaderboardResponse = serde_json::from_str(
            r#"{"data": {
  "runs": [{"place": 1, "run": {"id": "r1", "date": "2021-03-04",
    "players": [{"rel": "user", "id": "u1"}, {"rel": "guest", "name": "Guesty"}],
    "times": {"primary_t": 99.5}, "values": {"v1": "x"}}}],
  "players": {"data": [{"rel": "user", "id": "u1", "names": {"international": "Runner"}}]}
}}"#,
        )
        .expect("decode");
        assert_eq!(parsed.data.runs.len(), 1);
        assert_eq!(parsed.data.runs[0].run.times.primary_t, 99.5);
        assert_eq!(
            parsed.data.players.data[0].display_name().as_deref(),
            Some("Runner")
        );
        assert_eq!(
            parsed.data.runs[0].run.players[1].display_name().as_deref(),
            Some("Guesty")
        );
    }

    #[test]
    fn meta_refresh_target_is_extracted_and_resolved() {
        let html = r#"<!DOCTYPE html><html><head><meta http-equiv="refresh" content="0; url=/api/v1/leaderboards/9d3rr0dl/category/c1"></head></html>"#;
        assert!(looks_like_html(html));
        assert!(!looks_like_html(r#"{"data": []}"#));
        let target = extract_meta_refresh_url(html).expect("target");
        assert_eq!(target, "/api/v1/leaderboards/9d3rr0dl/category/c1");

        let base = Url::parse("https://www.speedrun.com/api/v1/leaderboards/tlozph/category/c1")
            .expect("url");
        assert_eq!(
            absolute_from_base(&base, &target).expect("join").as_str(),
            "https://www.speedrun.com/api/v1/leaderboards/9d3rr0dl/category/c1"
        );
    }
}
