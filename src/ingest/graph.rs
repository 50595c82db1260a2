//! Microsoft Graph mail source using delta queries.
//!
//! The delta link returned at the end of a sync round is the cursor: polling
//! with it yields only messages added or changed since. Pages are followed
//! through `@odata.nextLink`; entries marked `@removed` are skipped.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::GraphConfig;
use crate::error::{ConfigError, SourceError};
use crate::ingest::model::{AttachmentCandidate, SenderIdentity, SourceItem, SyncCursor};
use crate::ingest::source::{SourceBatch, SourceClient, is_member};

const SOURCE_NAME: &str = "graph";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Guard against a server that never ends a sync round.
const MAX_PAGES_PER_POLL: usize = 1000;
/// Refresh cached tokens this long before they expire.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);
const GRAPH_SCOPE: &str = "https://graph.microsoft.com/.default";

fn transient(reason: impl Into<String>) -> SourceError {
    SourceError::Transient {
        source_name: SOURCE_NAME.into(),
        reason: reason.into(),
    }
}

fn auth(reason: impl Into<String>) -> SourceError {
    SourceError::Auth {
        source_name: SOURCE_NAME.into(),
        reason: reason.into(),
    }
}

// ── Credentials ─────────────────────────────────────────────────────

/// Produces a bearer credential or fails.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn bearer_token(&self) -> Result<SecretString, SourceError>;

    /// Forget any cached credential after the server rejected it.
    async fn invalidate(&self) {}
}

/// A fixed token, e.g. from `SOURCE_BEARER_TOKEN`.
pub struct StaticTokenProvider {
    token: SecretString,
}

impl StaticTokenProvider {
    pub fn new(token: SecretString) -> Self {
        Self { token }
    }
}

#[async_trait]
impl CredentialProvider for StaticTokenProvider {
    async fn bearer_token(&self) -> Result<SecretString, SourceError> {
        Ok(self.token.clone())
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// OAuth2 client-credentials flow with an in-memory token cache.
pub struct ClientCredentialsProvider {
    client: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: SecretString,
    cached: Mutex<Option<(SecretString, Instant)>>,
}

impl ClientCredentialsProvider {
    pub fn new(
        client: reqwest::Client,
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: SecretString,
    ) -> Self {
        Self {
            client,
            token_url: token_url.into(),
            client_id: client_id.into(),
            client_secret,
            cached: Mutex::new(None),
        }
    }

    /// Token endpoint for an Azure AD tenant.
    pub fn token_url(authority_url: &str, tenant_id: &str) -> String {
        format!(
            "{}/{tenant_id}/oauth2/v2.0/token",
            authority_url.trim_end_matches('/')
        )
    }
}

#[async_trait]
impl CredentialProvider for ClientCredentialsProvider {
    async fn bearer_token(&self) -> Result<SecretString, SourceError> {
        let mut cached = self.cached.lock().await;
        if let Some((token, expires)) = cached.as_ref()
            && Instant::now() < *expires
        {
            return Ok(token.clone());
        }

        let form = [
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.expose_secret()),
            ("scope", GRAPH_SCOPE),
            ("grant_type", "client_credentials"),
        ];
        let resp = self
            .client
            .post(&self.token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| transient(format!("token request failed: {e}")))?;

        let status = resp.status();
        if status == StatusCode::BAD_REQUEST || status == StatusCode::UNAUTHORIZED {
            let body = resp.text().await.unwrap_or_default();
            return Err(auth(format!("token endpoint returned {status}: {body}")));
        }
        if !status.is_success() {
            return Err(transient(format!("token endpoint returned {status}")));
        }

        let token: TokenResponse = resp
            .json()
            .await
            .map_err(|e| transient(format!("bad token response: {e}")))?;
        let lifetime = Duration::from_secs(token.expires_in.unwrap_or(3600));
        let expires = Instant::now() + lifetime.saturating_sub(TOKEN_EXPIRY_MARGIN);
        let secret = SecretString::from(token.access_token);
        *cached = Some((secret.clone(), expires));
        debug!(expires_in_secs = lifetime.as_secs(), "Acquired Graph access token");
        Ok(secret)
    }

    async fn invalidate(&self) {
        *self.cached.lock().await = None;
    }
}

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct EmailAddress {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    address: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Recipient {
    #[serde(rename = "emailAddress")]
    email_address: Option<EmailAddress>,
}

#[derive(Debug, Deserialize)]
struct GraphMessage {
    id: String,
    #[serde(default)]
    subject: Option<String>,
    #[serde(default)]
    from: Option<Recipient>,
    #[serde(rename = "bodyPreview", default)]
    body_preview: Option<String>,
    #[serde(rename = "receivedDateTime", default)]
    received: Option<DateTime<Utc>>,
    #[serde(rename = "hasAttachments", default)]
    has_attachments: bool,
    #[serde(rename = "@removed", default)]
    removed: Option<serde_json::Value>,
}

impl GraphMessage {
    fn sender(&self) -> SenderIdentity {
        let email = self.from.as_ref().and_then(|r| r.email_address.as_ref());
        SenderIdentity::new(
            email.and_then(|e| e.name.clone()).unwrap_or_default(),
            email.and_then(|e| e.address.clone()).unwrap_or_default(),
        )
    }
}

#[derive(Debug, Deserialize)]
struct DeltaPageRaw {
    #[serde(default)]
    value: Vec<GraphMessage>,
    #[serde(rename = "@odata.nextLink", default)]
    next_link: Option<String>,
    #[serde(rename = "@odata.deltaLink", default)]
    delta_link: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GraphAttachment {
    #[serde(rename = "@odata.type", default)]
    odata_type: Option<String>,
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(rename = "contentType", default)]
    content_type: Option<String>,
    #[serde(default)]
    size: Option<u64>,
    #[serde(rename = "contentBytes", default)]
    content_bytes: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AttachmentPageRaw {
    #[serde(default)]
    value: Vec<GraphAttachment>,
}

/// One page of a delta round, with removed entries already dropped.
#[derive(Debug)]
struct DeltaPage {
    messages: Vec<GraphMessage>,
    next_link: Option<String>,
    delta_link: Option<String>,
}

fn parse_delta_page(body: &str) -> Result<DeltaPage, SourceError> {
    let raw: DeltaPageRaw =
        serde_json::from_str(body).map_err(|e| transient(format!("bad delta page: {e}")))?;
    Ok(DeltaPage {
        messages: raw.value.into_iter().filter(|m| m.removed.is_none()).collect(),
        next_link: raw.next_link,
        delta_link: raw.delta_link,
    })
}

/// File attachments of a message. Item and reference attachments are skipped.
fn parse_attachments(body: &str) -> Result<Vec<AttachmentCandidate>, SourceError> {
    let raw: AttachmentPageRaw =
        serde_json::from_str(body).map_err(|e| transient(format!("bad attachment list: {e}")))?;

    let mut out = Vec::new();
    for a in raw.value {
        if a.odata_type.as_deref() != Some("#microsoft.graph.fileAttachment") {
            debug!(attachment_id = %a.id, kind = ?a.odata_type, "Skipping non-file attachment");
            continue;
        }
        let content = match a.content_bytes.as_deref() {
            Some(b64) => BASE64
                .decode(b64)
                .map_err(|e| transient(format!("attachment {} content: {e}", a.id)))?,
            None => Vec::new(),
        };
        let mut candidate = AttachmentCandidate::new(
            a.id,
            a.name.unwrap_or_default(),
            a.content_type.unwrap_or_default(),
            content,
        );
        if let Some(size) = a.size {
            candidate.size_bytes = candidate.size_bytes.max(size);
        }
        out.push(candidate);
    }
    Ok(out)
}

// ── Source ──────────────────────────────────────────────────────────

/// Mail source reading one mailbox's inbox through Graph delta queries.
pub struct GraphMailSource {
    client: reqwest::Client,
    base_url: String,
    mailbox: String,
    membership: Vec<String>,
    credentials: Box<dyn CredentialProvider>,
}

impl GraphMailSource {
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        mailbox: impl Into<String>,
        membership: Vec<String>,
        credentials: Box<dyn CredentialProvider>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            mailbox: mailbox.into(),
            membership,
            credentials,
        }
    }

    /// Build from configuration. A static bearer token wins over client
    /// credentials when both are configured.
    pub fn from_config(config: &GraphConfig, membership: Vec<String>) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ConfigError::InvalidValue {
                key: "GRAPH_BASE_URL".into(),
                message: format!("could not build HTTP client: {e}"),
            })?;

        let credentials: Box<dyn CredentialProvider> = match (
            &config.bearer_token,
            &config.tenant_id,
            &config.client_id,
            &config.client_secret,
        ) {
            (Some(token), _, _, _) => Box::new(StaticTokenProvider::new(token.clone())),
            (None, Some(tenant), Some(client_id), Some(secret)) => {
                Box::new(ClientCredentialsProvider::new(
                    client.clone(),
                    ClientCredentialsProvider::token_url(&config.authority_url, tenant),
                    client_id.clone(),
                    secret.clone(),
                ))
            }
            _ => {
                return Err(ConfigError::MissingRequired {
                    key: "GRAPH_CLIENT_ID / GRAPH_CLIENT_SECRET".into(),
                    hint: "Set both alongside GRAPH_TENANT_ID, or set SOURCE_BEARER_TOKEN.".into(),
                });
            }
        };

        Ok(Self::new(
            client,
            config.base_url.clone(),
            config.mailbox.clone(),
            membership,
            credentials,
        ))
    }

    fn mailbox_path(&self) -> String {
        if self.mailbox == "me" {
            "me".to_string()
        } else {
            format!("users/{}", self.mailbox)
        }
    }

    fn baseline_url(&self) -> String {
        format!(
            "{}/{}/mailFolders/inbox/messages/delta?$select=id,subject,from,bodyPreview,receivedDateTime,hasAttachments",
            self.base_url,
            self.mailbox_path()
        )
    }

    /// GET `url` with the bearer token, mapping HTTP failures onto the
    /// auth / transient split.
    async fn get(&self, url: &str) -> Result<(StatusCode, String), SourceError> {
        let token = self.credentials.bearer_token().await?;
        let resp = self
            .client
            .get(url)
            .bearer_auth(token.expose_secret())
            .send()
            .await
            .map_err(|e| transient(format!("request failed: {e}")))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| transient(format!("reading response: {e}")))?;

        match status {
            s if s.is_success() => Ok((s, body)),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                self.credentials.invalidate().await;
                Err(auth(format!("{status}: {}", truncate_body(&body))))
            }
            StatusCode::GONE => Ok((status, body)),
            _ => Err(transient(format!("{status}: {}", truncate_body(&body)))),
        }
    }

    async fn fetch_attachments(&self, message_id: &str) -> Result<Vec<AttachmentCandidate>, SourceError> {
        let url = format!(
            "{}/{}/messages/{message_id}/attachments",
            self.base_url,
            self.mailbox_path()
        );
        let (_, body) = self.get(&url).await?;
        parse_attachments(&body)
    }
}

fn truncate_body(body: &str) -> String {
    crate::ingest::model::truncate_chars(body, 200)
}

#[async_trait]
impl SourceClient for GraphMailSource {
    fn name(&self) -> &str {
        SOURCE_NAME
    }

    async fn poll(&self, cursor: Option<&SyncCursor>) -> Result<SourceBatch, SourceError> {
        let mut url = match cursor {
            Some(c) => c.token.clone(),
            None => {
                info!("No sync cursor, running full baseline sync");
                self.baseline_url()
            }
        };
        let mut restarted = cursor.is_none();
        let mut messages: Vec<GraphMessage> = Vec::new();
        let mut pages = 0;

        let delta_link = loop {
            pages += 1;
            if pages > MAX_PAGES_PER_POLL {
                return Err(transient(format!("delta round exceeded {MAX_PAGES_PER_POLL} pages")));
            }

            let (status, body) = self.get(&url).await?;
            if status == StatusCode::GONE {
                // Sync state expired on the server; only a fresh baseline helps.
                if restarted {
                    return Err(transient("delta endpoint returned 410 Gone on baseline"));
                }
                warn!("Delta token expired, restarting baseline sync");
                restarted = true;
                messages.clear();
                url = self.baseline_url();
                continue;
            }

            let page = parse_delta_page(&body)?;
            messages.extend(page.messages);
            match (page.delta_link, page.next_link) {
                (Some(delta), _) => break delta,
                (None, Some(next)) => url = next,
                (None, None) => {
                    return Err(transient("delta page had neither nextLink nor deltaLink"));
                }
            }
        };

        let mut items = Vec::new();
        for message in messages {
            let sender = message.sender();
            if !is_member(&self.membership, &sender.address) {
                debug!(message_id = %message.id, sender = %sender.address, "Sender not in membership, skipping");
                continue;
            }

            let attachments = if message.has_attachments {
                self.fetch_attachments(&message.id).await?
            } else {
                Vec::new()
            };

            let mut item = SourceItem::new(
                message.id,
                message.subject.unwrap_or_default(),
                sender,
            )
            .with_snippet(message.body_preview.as_deref().unwrap_or_default());
            if let Some(received) = message.received {
                item = item.with_received_at(received);
            }
            item.attachments = attachments;
            items.push(item);
        }

        info!(items = items.len(), pages, "Graph delta poll complete");
        Ok(SourceBatch {
            items,
            next_cursor: SyncCursor::new(delta_link),
        })
    }
}
