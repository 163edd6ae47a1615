use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use super::{LookupError, LookupOutcome, MessagePage, RemoteMessage, ThreadLookup};

const GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1/users/me/";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Gmail REST API client used for thread ids. Authenticates with a pre-acquired OAuth2
/// access token; acquiring or refreshing tokens happens elsewhere.
pub struct GmailThreadApi {
    http: Client,
    base_url: Url,
    access_token: String,
    page_size: u32,
    concurrency: usize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse {
    #[serde(default)]
    messages: Vec<MessageRef>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageRef {
    id: String,
    thread_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageMetadata {
    thread_id: String,
    #[serde(default)]
    payload: Option<Payload>,
}

#[derive(Debug, Deserialize)]
struct Payload {
    #[serde(default)]
    headers: Vec<Header>,
}

#[derive(Debug, Deserialize)]
struct Header {
    name: String,
    value: String,
}

impl GmailThreadApi {
    pub fn new(access_token: &str, page_size: u32, concurrency: usize) -> Result<Self, LookupError> {
        let base_url = Url::parse(GMAIL_API_BASE).map_err(|e| LookupError::Transport(e.to_string()))?;
        Self::with_base_url(base_url, access_token, page_size, concurrency)
    }

    pub fn with_base_url(
        base_url: Url,
        access_token: &str,
        page_size: u32,
        concurrency: usize,
    ) -> Result<Self, LookupError> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| LookupError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            base_url,
            access_token: access_token.to_string(),
            page_size: page_size.clamp(1, 500),
            concurrency: concurrency.max(1),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, LookupError> {
        self.base_url
            .join(path)
            .map_err(|e| LookupError::Transport(format!("building {} url: {}", path, e)))
    }

    /// `Ok(None)` on HTTP 404.
    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<Option<T>, LookupError> {
        let resp = self
            .http
            .get(url)
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(|e| LookupError::Transport(e.to_string()))?;

        let status = resp.status();
        match status {
            StatusCode::NOT_FOUND => return Ok(None),
            StatusCode::TOO_MANY_REQUESTS => return Err(LookupError::RateLimited),
            StatusCode::UNAUTHORIZED => return Err(LookupError::Unauthorized),
            _ => {}
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(LookupError::Http {
                status: status.as_u16(),
                body,
            });
        }

        resp.json::<T>()
            .await
            .map(Some)
            .map_err(|e| LookupError::Decode(e.to_string()))
    }

    async fn message_id_header(&self, msg: MessageRef) -> Result<Option<RemoteMessage>, LookupError> {
        let mut url = self.endpoint(&format!("messages/{}", msg.id))?;
        url.query_pairs_mut()
            .append_pair("format", "metadata")
            .append_pair("metadataHeaders", "Message-ID");

        let Some(meta) = self.get_json::<MessageMetadata>(url).await? else {
            return Ok(None);
        };
        let message_id = meta
            .payload
            .into_iter()
            .flat_map(|p| p.headers)
            .find(|h| h.name.eq_ignore_ascii_case("Message-ID"))
            .map(|h| strip_angle_brackets(&h.value));

        let thread_id = if meta.thread_id.is_empty() { msg.thread_id } else { meta.thread_id };
        Ok(message_id.map(|message_id| RemoteMessage {
            message_id,
            thread_id,
        }))
    }
}

fn strip_angle_brackets(raw: &str) -> String {
    raw.trim().trim_start_matches('<').trim_end_matches('>').to_string()
}

#[async_trait]
impl ThreadLookup for GmailThreadApi {
    async fn lookup_by_message_id(&self, message_id: &str) -> Result<LookupOutcome, LookupError> {
        let mut url = self.endpoint("messages")?;
        url.query_pairs_mut()
            .append_pair("q", &format!("rfc822msgid:{}", strip_angle_brackets(message_id)))
            .append_pair("includeSpamTrash", "true");

        let found = self.get_json::<ListResponse>(url).await?;
        let thread_id = found
            .and_then(|list| list.messages.into_iter().next())
            .map(|m| m.thread_id)
            .filter(|t| !t.is_empty());

        Ok(match thread_id {
            Some(thread_id) => LookupOutcome::Found { thread_id },
            None => LookupOutcome::NotFound,
        })
    }

    async fn list_messages(&self, page_token: Option<&str>) -> Result<MessagePage, LookupError> {
        let mut url = self.endpoint("messages")?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("maxResults", &self.page_size.to_string())
                .append_pair("includeSpamTrash", "true");
            if let Some(token) = page_token {
                query.append_pair("pageToken", token);
            }
        }

        let Some(list) = self.get_json::<ListResponse>(url).await? else {
            return Ok(MessagePage::default());
        };

        let refs_count = list.messages.len();
        let results: Vec<Result<Option<RemoteMessage>, LookupError>> = stream::iter(list.messages)
            .map(|msg| self.message_id_header(msg))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut messages = Vec::with_capacity(refs_count);
        for result in results {
            match result {
                Ok(Some(msg)) => messages.push(msg),
                Ok(None) => {}
                Err(e @ (LookupError::RateLimited | LookupError::Unauthorized)) => return Err(e),
                Err(e) => warn!(error = %e, "Skipping message metadata in listing"),
            }
        }

        debug!(
            listed = refs_count,
            with_message_id = messages.len(),
            has_next = list.next_page_token.is_some(),
            "Fetched thread listing page"
        );
        Ok(MessagePage {
            messages,
            next_page_token: list.next_page_token,
        })
    }
}
