use std::collections::BTreeMap;
use std::env;
use std::thread::sleep;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use reqwest::Url;
use reqwest::blocking::Client;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::config::{SyncConfig, env_value_u64};
use crate::error::SyncError;

/// The wiki side: read one page, save one page.
pub trait WikiApi {
    fn login(&mut self, username: &str, password: &str) -> Result<()>;
    fn read(&mut self, title: &str) -> Result<String>;
    /// One edit request. A refusal by the wiki surfaces as [`SyncError::SaveRejected`].
    fn save(&mut self, title: &str, text: &str, summary: &str) -> Result<()>;
    fn request_count(&self) -> usize;
}

#[derive(Debug, Clone)]
pub struct MediaWikiClientConfig {
    pub api_url: String,
    pub user_agent: String,
    pub timeout_ms: u64,
    pub rate_limit_read_ms: u64,
    pub rate_limit_write_ms: u64,
}

impl MediaWikiClientConfig {
    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        Ok(Self {
            api_url: config.wiki_api_url()?,
            user_agent: config.wiki_user_agent(),
            timeout_ms: env_value_u64("WIKI_HTTP_TIMEOUT_MS", 30_000),
            rate_limit_read_ms: env_value_u64("WIKI_RATE_LIMIT_READ", 300),
            rate_limit_write_ms: env_value_u64("WIKI_RATE_LIMIT_WRITE", 1_000),
        })
    }
}

/// `WIKI_BOT_USER` / `WIKI_BOT_PASS`, when both are set.
pub fn credentials_from_env() -> Option<(String, String)> {
    let user = env::var("WIKI_BOT_USER").ok().filter(|v| !v.trim().is_empty())?;
    let pass = env::var("WIKI_BOT_PASS").ok().filter(|v| !v.is_empty())?;
    Some((user, pass))
}

pub struct MediaWikiClient {
    client: Client,
    config: MediaWikiClientConfig,
    last_request_at: Option<Instant>,
    request_count: usize,
    csrf_token: Option<String>,
    base_timestamps: BTreeMap<String, String>,
}

impl MediaWikiClient {
    pub fn new(config: MediaWikiClientConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .cookie_store(true)
            .build()
            .context("failed to build MediaWiki HTTP client")?;

        Ok(Self {
            client,
            config,
            last_request_at: None,
            request_count: 0,
            csrf_token: None,
            base_timestamps: BTreeMap::new(),
        })
    }

    fn request_json_get(&mut self, params: &[(&str, String)]) -> Result<Value> {
        let base_url = Url::parse(&self.config.api_url)
            .with_context(|| format!("invalid WIKI_API_URL: {}", self.config.api_url))?;
        let pairs = api_pairs(params);

        self.apply_rate_limit(false);
        let response = self
            .client
            .get(base_url)
            .header("User-Agent", self.config.user_agent.clone())
            .query(&pairs)
            .send()
            .context("failed to call MediaWiki API")?;
        let status = response.status();
        if !status.is_success() {
            bail!("MediaWiki API request failed with HTTP {status}");
        }
        let payload: Value = response
            .json()
            .context("failed to decode MediaWiki API JSON response")?;
        if let Some(message) = api_error(&payload) {
            bail!("MediaWiki API error {message}");
        }
        Ok(payload)
    }

    /// One POST, never repeated. API-level errors are left in the payload for
    /// the caller to interpret.
    fn request_json_post(&mut self, params: &[(&str, String)], is_write: bool) -> Result<Value> {
        let pairs = api_pairs(params);

        self.apply_rate_limit(is_write);
        let response = self
            .client
            .post(&self.config.api_url)
            .header("User-Agent", self.config.user_agent.clone())
            .form(&pairs)
            .send()
            .context("failed to call MediaWiki API")?;
        let status = response.status();
        if !status.is_success() {
            bail!("MediaWiki API request failed with HTTP {status}");
        }
        response
            .json()
            .context("failed to decode MediaWiki API JSON response")
    }

    fn apply_rate_limit(&mut self, is_write: bool) {
        let delay = if is_write {
            Duration::from_millis(self.config.rate_limit_write_ms)
        } else {
            Duration::from_millis(self.config.rate_limit_read_ms)
        };
        if let Some(last) = self.last_request_at {
            let elapsed = last.elapsed();
            if elapsed < delay {
                sleep(delay - elapsed);
            }
        }
        self.last_request_at = Some(Instant::now());
        self.request_count += 1;
    }

    fn ensure_csrf_token(&mut self) -> Result<String> {
        if let Some(token) = &self.csrf_token {
            return Ok(token.clone());
        }
        let response = self.request_json_get(&[
            ("action", "query".to_string()),
            ("meta", "tokens".to_string()),
        ])?;
        let parsed: TokenQueryResponse =
            serde_json::from_value(response).context("failed to decode csrf token response")?;
        let token = parsed
            .query
            .tokens
            .and_then(|tokens| tokens.csrftoken)
            .ok_or_else(|| anyhow::anyhow!("failed to get MediaWiki csrf token"))?;
        self.csrf_token = Some(token.clone());
        Ok(token)
    }
}

impl WikiApi for MediaWikiClient {
    fn login(&mut self, username: &str, password: &str) -> Result<()> {
        let token_response = self.request_json_get(&[
            ("action", "query".to_string()),
            ("meta", "tokens".to_string()),
            ("type", "login".to_string()),
        ])?;
        let token_payload: TokenQueryResponse = serde_json::from_value(token_response)
            .context("failed to decode login token response")?;
        let login_token = token_payload
            .query
            .tokens
            .and_then(|tokens| tokens.logintoken)
            .ok_or_else(|| anyhow::anyhow!("failed to get MediaWiki login token"))?;

        let login_response = self.request_json_post(
            &[
                ("action", "login".to_string()),
                ("lgname", username.to_string()),
                ("lgpassword", password.to_string()),
                ("lgtoken", login_token),
            ],
            true,
        )?;
        if let Some(message) = api_error(&login_response) {
            bail!("MediaWiki login failed: {message}");
        }
        let login_payload: LoginResponse =
            serde_json::from_value(login_response).context("failed to decode login response")?;
        match login_payload.login.result.as_deref() {
            Some("Success") => {
                self.csrf_token = None;
                debug!(user = username, "logged in to wiki");
                Ok(())
            }
            other => bail!(
                "MediaWiki login failed: {}",
                login_payload
                    .login
                    .reason
                    .or_else(|| other.map(ToString::to_string))
                    .unwrap_or_else(|| "unknown error".to_string())
            ),
        }
    }

    fn read(&mut self, title: &str) -> Result<String> {
        let response = self.request_json_get(&[
            ("action", "query".to_string()),
            ("titles", title.to_string()),
            ("prop", "revisions".to_string()),
            ("rvprop", "content|timestamp|ids".to_string()),
            ("rvslots", "main".to_string()),
        ])?;
        let parsed: QueryResponse = serde_json::from_value(response)
            .context("failed to decode page content API response")?;
        let (content, timestamp) = page_content(parsed, title)?;
        self.base_timestamps.insert(title.to_string(), timestamp);
        Ok(content)
    }

    fn save(&mut self, title: &str, text: &str, summary: &str) -> Result<()> {
        let token = self.ensure_csrf_token()?;
        let base_timestamp = self.base_timestamps.get(title).cloned().unwrap_or_default();
        let response = self.request_json_post(
            &[
                ("action", "edit".to_string()),
                ("title", title.to_string()),
                ("text", text.to_string()),
                ("summary", summary.to_string()),
                ("bot", "1".to_string()),
                ("nocreate", "1".to_string()),
                ("basetimestamp", base_timestamp),
                ("token", token),
            ],
            true,
        )?;
        edit_outcome(title, &response)?;
        Ok(())
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

fn api_pairs(params: &[(&str, String)]) -> Vec<(String, String)> {
    let mut pairs = Vec::with_capacity(params.len() + 2);
    pairs.push(("format".to_string(), "json".to_string()));
    pairs.push(("formatversion".to_string(), "2".to_string()));
    for (key, value) in params {
        if !value.is_empty() {
            pairs.push(((*key).to_string(), value.clone()));
        }
    }
    pairs
}

/// `[code]: info` for a top-level API error object.
fn api_error(payload: &Value) -> Option<String> {
    let error = payload.get("error")?;
    let code = error
        .get("code")
        .and_then(Value::as_str)
        .unwrap_or("unknown_error");
    let info = error
        .get("info")
        .and_then(Value::as_str)
        .unwrap_or("unknown info");
    Some(format!("[{code}]: {info}"))
}

fn page_content(parsed: QueryResponse, title: &str) -> Result<(String, String)> {
    let page = parsed
        .query
        .pages
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("page not returned by API: {title}"))?;
    if page.missing.unwrap_or(false) || page.invalid.unwrap_or(false) {
        bail!("page does not exist: {title}");
    }
    let revision = page
        .revisions
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("page has no revisions: {title}"))?;
    let content = revision
        .slots
        .and_then(|slots| slots.main)
        .map(|slot| slot.content)
        .ok_or_else(|| anyhow::anyhow!("page has no main slot content: {title}"))?;
    Ok((content, revision.timestamp))
}

/// Anything but `edit.result == "Success"` is a rejection, reported verbatim.
fn edit_outcome(title: &str, payload: &Value) -> Result<(), SyncError> {
    let rejected = |message: String| SyncError::SaveRejected {
        title: title.to_string(),
        message,
    };
    if let Some(message) = api_error(payload) {
        return Err(rejected(message));
    }
    let Some(edit) = payload.get("edit") else {
        return Err(rejected(format!("missing edit payload in API response: {payload}")));
    };
    let parsed: EditPayload = serde_json::from_value(edit.clone()).unwrap_or_default();
    if parsed.result.as_deref() == Some("Success") {
        return Ok(());
    }
    Err(rejected(edit.to_string()))
}

#[derive(Debug, Deserialize, Default)]
struct QueryResponse {
    #[serde(default)]
    query: QueryPayload,
}

#[derive(Debug, Deserialize, Default)]
struct QueryPayload {
    #[serde(default)]
    pages: Vec<PageQueryItem>,
}

#[derive(Debug, Deserialize)]
struct PageQueryItem {
    missing: Option<bool>,
    invalid: Option<bool>,
    #[serde(default)]
    revisions: Vec<RevisionQueryItem>,
}

#[derive(Debug, Deserialize)]
struct RevisionQueryItem {
    timestamp: String,
    slots: Option<RevisionSlotContainer>,
}

#[derive(Debug, Deserialize)]
struct RevisionSlotContainer {
    main: Option<RevisionMainSlot>,
}

#[derive(Debug, Deserialize)]
struct RevisionMainSlot {
    content: String,
}

#[derive(Debug, Deserialize, Default)]
struct TokenQueryResponse {
    #[serde(default)]
    query: TokenQueryPayload,
}

#[derive(Debug, Deserialize, Default)]
struct TokenQueryPayload {
    tokens: Option<TokenPayload>,
}

#[derive(Debug, Deserialize, Default)]
struct TokenPayload {
    logintoken: Option<String>,
    csrftoken: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct LoginResponse {
    #[serde(default)]
    login: LoginPayload,
}

#[derive(Debug, Deserialize, Default)]
struct LoginPayload {
    result: Option<String>,
    reason: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct EditPayload {
    result: Option<String>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{QueryResponse, api_pairs, edit_outcome, page_content};
    use crate::error::SyncError;

    #[test]
    fn api_pairs_add_format_and_skip_empty_values() {
        let pairs = api_pairs(&[
            ("action", "edit".to_string()),
            ("basetimestamp", String::new()),
        ]);
        assert_eq!(
            pairs,
            vec![
                ("format".to_string(), "json".to_string()),
                ("formatversion".to_string(), "2".to_string()),
                ("action".to_string(), "edit".to_string()),
            ]
        );
    }

    #[test]
    fn page_content_reads_main_slot() {
        let parsed: QueryResponse = serde_json::from_value(json!({
            "query": {"pages": [{"pageid": 7, "ns": 0, "title": "Speedruns",
                "revisions": [{"revid": 3, "timestamp": "2024-01-01T00:00:00Z",
                    "slots": {"main": {"content": "body"}}}]}]}
        }))
        .expect("decode");
        let (content, timestamp) = page_content(parsed, "Speedruns").expect("content");
        assert_eq!(content, "body");
        assert_eq!(timestamp, "2024-01-01T00:00:00Z");

        let missing: QueryResponse = serde_json::from_value(json!({
            "query": {"pages": [{"ns": 0, "title": "Nope", "missing": true}]}
        }))
        .expect("decode");
        let error = page_content(missing, "Nope").expect_err("missing page");
        assert!(error.to_string().contains("does not exist"));
    }

    #[test]
    fn successful_edit_is_accepted() {
        assert!(edit_outcome("P", &json!({"edit": {"result": "Success", "nochange": true}})).is_ok());
    }

    #[test]
    fn captcha_and_api_errors_are_rejections_with_verbatim_message() {
        let captcha = edit_outcome(
            "P",
            &json!({"edit": {"result": "Failure", "captcha": {"type": "image", "id": "42"}}}),
        )
        .expect_err("captcha");
        match captcha {
            SyncError::SaveRejected { title, message } => {
                assert_eq!(title, "P");
                assert!(message.contains("captcha"));
                assert!(message.contains("Failure"));
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let filtered = edit_outcome(
            "P",
            &json!({"error": {"code": "abusefilter-disallowed", "info": "This action has been disallowed."}}),
        )
        .expect_err("abuse filter");
        assert_eq!(
            filtered,
            SyncError::SaveRejected {
                title: "P".to_string(),
                message: "[abusefilter-disallowed]: This action has been disallowed.".to_string(),
            }
        );
    }
}
