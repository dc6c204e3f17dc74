use std::thread::sleep;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::Url;
use reqwest::blocking::Client;
use serde::Deserialize;
use serde_json::Value;

use crate::config::Settings;
use crate::model::{TRACKED_NAMESPACES, Wiki};

/// Usernames per `usercontribs` request; the API rejects longer `ucuser` lists.
const USERS_PER_REQUEST: usize = 50;

/// A contribution as reported by a wiki, before it is resolved to local ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRevision {
    pub rev_id: i64,
    pub page_id: i64,
    pub title: String,
    pub namespace: i32,
    pub username: String,
    pub timestamp: DateTime<Utc>,
    pub size_diff: i64,
    pub new_page: bool,
}

/// Read access to per-user revision history on a wiki.
pub trait RevisionSource {
    /// Revisions by `usernames` in tracked namespaces with timestamp in `(since, until]`.
    fn user_contributions(
        &mut self,
        wiki: &Wiki,
        usernames: &[String],
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<RemoteRevision>>;

    fn request_count(&self) -> usize;
}

#[derive(Debug, Clone)]
pub struct MediaWikiClientConfig {
    pub user_agent: String,
    pub timeout_ms: u64,
    pub rate_limit_read_ms: u64,
}

impl MediaWikiClientConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            user_agent: settings.user_agent.clone(),
            timeout_ms: settings.timeout_ms,
            rate_limit_read_ms: settings.rate_limit_read_ms,
        }
    }
}

pub struct MediaWikiClient {
    client: Client,
    config: MediaWikiClientConfig,
    last_request_at: Option<Instant>,
    request_count: usize,
}

impl MediaWikiClient {
    pub fn new(config: MediaWikiClientConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .context("failed to build MediaWiki HTTP client")?;

        Ok(Self {
            client,
            config,
            last_request_at: None,
            request_count: 0,
        })
    }

    fn request_json_get(&mut self, api_url: &str, params: &[(&str, String)]) -> Result<Value> {
        let base_url =
            Url::parse(api_url).with_context(|| format!("invalid API URL: {api_url}"))?;

        let mut pairs = Vec::with_capacity(params.len() + 2);
        pairs.push(("format".to_string(), "json".to_string()));
        pairs.push(("formatversion".to_string(), "2".to_string()));
        for (key, value) in params {
            if !value.is_empty() {
                pairs.push(((*key).to_string(), value.clone()));
            }
        }

        self.apply_rate_limit();
        let response = self
            .client
            .get(base_url)
            .header("User-Agent", self.config.user_agent.clone())
            .query(&pairs)
            .send()
            .with_context(|| format!("failed to call {api_url}"))?;

        let status = response.status();
        if !status.is_success() {
            bail!("MediaWiki API request to {api_url} failed with HTTP {status}");
        }

        let payload: Value = response
            .json()
            .context("failed to decode MediaWiki API JSON response")?;
        if let Some(error) = payload.get("error") {
            let code = error
                .get("code")
                .and_then(Value::as_str)
                .unwrap_or("unknown_error");
            let info = error
                .get("info")
                .and_then(Value::as_str)
                .unwrap_or("unknown info");
            bail!("MediaWiki API error [{code}]: {info}");
        }
        Ok(payload)
    }

    fn apply_rate_limit(&mut self) {
        let delay = Duration::from_millis(self.config.rate_limit_read_ms);
        if let Some(last) = self.last_request_at {
            let elapsed = last.elapsed();
            if elapsed < delay {
                sleep(delay - elapsed);
            }
        }
        self.last_request_at = Some(Instant::now());
        self.request_count += 1;
    }
}

impl RevisionSource for MediaWikiClient {
    fn user_contributions(
        &mut self,
        wiki: &Wiki,
        usernames: &[String],
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<RemoteRevision>> {
        let api_url = wiki.api_url();
        let namespace_filter = TRACKED_NAMESPACES
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("|");
        let mut out = Vec::new();

        for chunk in usernames.chunks(USERS_PER_REQUEST) {
            let mut continue_token: Option<String> = None;
            loop {
                let mut params = vec![
                    ("action", "query".to_string()),
                    ("list", "usercontribs".to_string()),
                    ("ucuser", chunk.join("|")),
                    ("ucdir", "newer".to_string()),
                    ("ucstart", api_timestamp(since)),
                    ("ucend", api_timestamp(until)),
                    ("ucnamespace", namespace_filter.clone()),
                    ("ucprop", "ids|title|timestamp|sizediff|flags".to_string()),
                    ("uclimit", "500".to_string()),
                ];
                if let Some(token) = &continue_token {
                    params.push(("uccontinue", token.clone()));
                    params.push(("continue", "-||".to_string()));
                }

                let response = self.request_json_get(&api_url, &params)?;
                let page = parse_usercontribs(response)
                    .with_context(|| format!("failed to decode usercontribs from {wiki}"))?;
                out.extend(
                    page.revisions
                        .into_iter()
                        .filter(|revision| revision.timestamp > since && revision.timestamp <= until),
                );
                continue_token = page.continue_token;
                if continue_token.is_none() {
                    break;
                }
            }
        }

        tracing::debug!(%wiki, users = usernames.len(), revisions = out.len(), "fetched user contributions");
        Ok(out)
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

/// One page of a `list=usercontribs` response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContributionsPage {
    pub revisions: Vec<RemoteRevision>,
    pub continue_token: Option<String>,
}

pub fn parse_usercontribs(payload: Value) -> Result<ContributionsPage> {
    let parsed: QueryResponse =
        serde_json::from_value(payload).context("unexpected usercontribs response shape")?;
    let mut revisions = Vec::with_capacity(parsed.query.usercontribs.len());
    for item in parsed.query.usercontribs {
        let timestamp = DateTime::parse_from_rfc3339(&item.timestamp)
            .with_context(|| format!("invalid revision timestamp {}", item.timestamp))?
            .with_timezone(&Utc);
        revisions.push(RemoteRevision {
            rev_id: item.revid,
            page_id: item.pageid,
            title: item.title,
            namespace: item.ns,
            username: item.user,
            timestamp,
            size_diff: item.sizediff.unwrap_or(0),
            new_page: item.new,
        });
    }
    Ok(ContributionsPage {
        revisions,
        continue_token: parsed.continuation.and_then(|cont| cont.uccontinue),
    })
}

fn api_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[derive(Debug, Deserialize, Default)]
struct QueryResponse {
    #[serde(default)]
    query: QueryPayload,
    #[serde(default, rename = "continue")]
    continuation: Option<ContinuationPayload>,
}

#[derive(Debug, Deserialize, Default)]
struct QueryPayload {
    #[serde(default)]
    usercontribs: Vec<ContributionItem>,
}

#[derive(Debug, Deserialize, Default)]
struct ContinuationPayload {
    uccontinue: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContributionItem {
    user: String,
    pageid: i64,
    revid: i64,
    ns: i32,
    title: String,
    timestamp: String,
    #[serde(default)]
    new: bool,
    sizediff: Option<i64>,
}
