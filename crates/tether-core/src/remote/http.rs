use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;
use url::Url;

use super::{
    ConsumptionHorizon, Conversation, Member, ReactionGroup, ReactionUser, RemoteClient, RemoteError,
    RemoteMessage, RemoteResult,
};

const MESSAGE_PAGE_SIZE: u32 = 200;
const CONVERSATION_PAGE_SIZE: u32 = 100;

/// [`RemoteClient`] over the chat service's REST API.
///
/// Every call is a single attempt; retry policy belongs to the poll
/// backoff, not the transport.
#[derive(Debug, Clone)]
pub struct HttpRemoteClient {
    client: Client,
    base: Url,
}

impl HttpRemoteClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base = Url::parse(base_url).with_context(|| format!("invalid api_base_url: {}", base_url))?;
        if base.cannot_be_a_base() {
            bail!("api_base_url cannot be used as a base: {}", base_url);
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("building HTTP client")?;
        Ok(Self { client, base })
    }

    fn endpoint(&self, segments: &[&str]) -> RemoteResult<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| RemoteError::Transport(format!("invalid base url {}", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn messages_url(&self, conversation_id: &str) -> RemoteResult<Url> {
        let mut url = self.endpoint(&["users", "ME", "conversations", conversation_id, "messages"])?;
        url.query_pairs_mut()
            .append_pair("pageSize", &MESSAGE_PAGE_SIZE.to_string());
        Ok(url)
    }

    fn request(&self, method: Method, url: Url, token: &str) -> RequestBuilder {
        self.client
            .request(method, url)
            .header("Authorization", format!("Bearer {}", token))
            .header("Accept", "application/json")
    }

    async fn send(&self, builder: RequestBuilder) -> RemoteResult<Response> {
        let response = builder.send().await.map_err(|e| RemoteError::Transport(e.to_string()))?;
        classify(response).await
    }

    async fn send_json<T: DeserializeOwned>(&self, builder: RequestBuilder) -> RemoteResult<T> {
        let response = self.send(builder).await?;
        response.json::<T>().await.map_err(|e| RemoteError::Decode(e.to_string()))
    }

    async fn post_message(&self, token: &str, thread_id: &str, payload: Value) -> RemoteResult<String> {
        let url = self.endpoint(&["users", "ME", "conversations", thread_id, "messages"])?;
        let ack: SendAck = self
            .send_json(self.request(Method::POST, url, token).json(&payload))
            .await?;
        ack.message_id()
            .ok_or_else(|| RemoteError::Decode("send acknowledgement has no message id".to_string()))
    }
}

async fn classify(response: Response) -> RemoteResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = response
            .headers()
            .get("Retry-After")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        return Err(RemoteError::RateLimited { retry_after });
    }
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(RemoteError::Unauthorized {
            status: status.as_u16(),
        });
    }
    if status.is_server_error() {
        return Err(RemoteError::Server {
            status: status.as_u16(),
        });
    }
    Err(RemoteError::Client {
        status: status.as_u16(),
        body: response.text().await.unwrap_or_default(),
    })
}

#[async_trait]
impl RemoteClient for HttpRemoteClient {
    async fn list_conversations(&self, token: &str) -> RemoteResult<Vec<Conversation>> {
        let mut url = self.endpoint(&["users", "ME", "conversations"])?;
        url.query_pairs_mut()
            .append_pair("view", "msnp24Equivalent")
            .append_pair("pageSize", &CONVERSATION_PAGE_SIZE.to_string());

        let envelope: ConversationsEnvelope = self.send_json(self.request(Method::GET, url, token)).await?;
        debug!("listed {} conversations", envelope.conversations.len());
        Ok(envelope.conversations.into_iter().map(Conversation::from).collect())
    }

    async fn list_messages(
        &self,
        token: &str,
        conversation_id: &str,
        cursor: Option<&str>,
    ) -> RemoteResult<Vec<RemoteMessage>> {
        // The endpoint only filters by arrival time, and the cursor is a
        // sequence id. Ask for the newest page; ingestion drops anything at
        // or below the cursor.
        let url = self.messages_url(conversation_id)?;
        debug!("listing {} after {:?}", conversation_id, cursor);

        let envelope: MessagesEnvelope = self.send_json(self.request(Method::GET, url, token)).await?;
        Ok(envelope
            .messages
            .into_iter()
            .filter_map(WireMessage::into_message)
            .collect())
    }

    async fn add_reaction(
        &self,
        token: &str,
        thread_id: &str,
        message_id: &str,
        emotion_key: &str,
        at: DateTime<Utc>,
    ) -> RemoteResult<()> {
        let mut url = self.endpoint(&[
            "users",
            "ME",
            "conversations",
            thread_id,
            "messages",
            message_id,
            "properties",
        ])?;
        url.query_pairs_mut().append_pair("name", "emotions");
        let body = json!({ "emotions": { "key": emotion_key, "value": at.timestamp_millis() } });
        self.send(self.request(Method::PUT, url, token).json(&body)).await?;
        Ok(())
    }

    async fn remove_reaction(
        &self,
        token: &str,
        thread_id: &str,
        message_id: &str,
        emotion_key: &str,
        _at: DateTime<Utc>,
    ) -> RemoteResult<()> {
        let mut url = self.endpoint(&[
            "users",
            "ME",
            "conversations",
            thread_id,
            "messages",
            message_id,
            "properties",
        ])?;
        url.query_pairs_mut().append_pair("name", "emotions");
        let body = json!({ "emotions": { "key": emotion_key } });
        self.send(self.request(Method::DELETE, url, token).json(&body)).await?;
        Ok(())
    }

    async fn get_consumption_horizons(&self, token: &str, thread_id: &str) -> RemoteResult<Vec<ConsumptionHorizon>> {
        let url = self.endpoint(&["threads", thread_id, "consumptionhorizons"])?;
        let envelope: HorizonsEnvelope = self.send_json(self.request(Method::GET, url, token)).await?;
        Ok(envelope
            .consumption_horizons
            .into_iter()
            .map(|h| ConsumptionHorizon {
                user_id: h.id,
                horizon: h.consumption_horizon,
            })
            .collect())
    }

    async fn set_consumption_horizon(&self, token: &str, thread_id: &str, horizon: &str) -> RemoteResult<()> {
        let mut url = self.endpoint(&["users", "ME", "conversations", thread_id, "properties"])?;
        url.query_pairs_mut().append_pair("name", "consumptionhorizon");
        let body = json!({ "consumptionhorizon": horizon });
        self.send(self.request(Method::PUT, url, token).json(&body)).await?;
        Ok(())
    }

    async fn send_message_with_id(
        &self,
        token: &str,
        thread_id: &str,
        body: &str,
        sender_id: &str,
        correlation_id: &str,
    ) -> RemoteResult<String> {
        let payload = json!({
            "content": body,
            "messagetype": "RichText",
            "contenttype": "text",
            "from": sender_id,
            "clientmessageid": correlation_id,
        });
        self.post_message(token, thread_id, payload).await
    }

    async fn send_gif_with_id(
        &self,
        token: &str,
        thread_id: &str,
        url: &str,
        sender_id: &str,
        correlation_id: &str,
    ) -> RemoteResult<String> {
        let payload = json!({
            "content": crate::body::gif_markup(url),
            "messagetype": "RichText/Media_GenericFile",
            "contenttype": "text",
            "from": sender_id,
            "clientmessageid": correlation_id,
        });
        self.post_message(token, thread_id, payload).await
    }
}

// Wire shapes. Only the fields the engine reads are modelled.

#[derive(Debug, Deserialize)]
struct ConversationsEnvelope {
    #[serde(default)]
    conversations: Vec<WireConversation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireConversation {
    id: String,
    #[serde(default)]
    conversation_id: Option<String>,
    #[serde(default)]
    thread_properties: Option<WireThreadProperties>,
    #[serde(default)]
    members: Vec<WireMember>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireThreadProperties {
    #[serde(default)]
    topic: Option<String>,
    #[serde(default, alias = "onetoone")]
    one_to_one: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMember {
    id: String,
    #[serde(default, alias = "displayname")]
    display_name: Option<String>,
}

impl From<WireConversation> for Conversation {
    fn from(wire: WireConversation) -> Self {
        let props = wire.thread_properties.unwrap_or_default();
        Conversation {
            id: wire.id,
            conversation_id: wire.conversation_id,
            topic: props.topic,
            members: wire
                .members
                .into_iter()
                .map(|m| Member {
                    id: m.id,
                    display_name: m.display_name,
                })
                .collect(),
            one_to_one_hint: props.one_to_one.as_ref().and_then(flag),
        }
    }
}

/// Remote flags arrive as booleans or as "true"/"false" strings.
fn flag(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
struct MessagesEnvelope {
    #[serde(default)]
    messages: Vec<WireMessage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMessage {
    #[serde(default)]
    id: String,
    #[serde(default)]
    sequence_id: Option<Value>,
    #[serde(default)]
    from: String,
    #[serde(default, rename = "imdisplayname")]
    display_name: Option<String>,
    #[serde(default)]
    friendly_name: Option<String>,
    #[serde(default)]
    content: String,
    #[serde(default, rename = "messagetype")]
    message_type: String,
    #[serde(default, rename = "originalarrivaltime")]
    arrival_time: Option<DateTime<Utc>>,
    #[serde(default, rename = "composetime")]
    compose_time: Option<DateTime<Utc>>,
    #[serde(default, rename = "clientmessageid")]
    client_message_id: Option<String>,
    #[serde(default)]
    properties: Option<WireMessageProperties>,
}

#[derive(Debug, Default, Deserialize)]
struct WireMessageProperties {
    /// Either an embedded JSON string or an array.
    #[serde(default)]
    emotions: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct WireEmotion {
    key: String,
    #[serde(default)]
    users: Vec<WireEmotionUser>,
}

#[derive(Debug, Deserialize)]
struct WireEmotionUser {
    mri: String,
    #[serde(default)]
    time: Option<i64>,
}

impl WireMessage {
    /// Messages without a usable timestamp are dropped; ids are checked by
    /// ingestion.
    fn into_message(self) -> Option<RemoteMessage> {
        let timestamp = self.arrival_time.or(self.compose_time)?;
        let sequence = match self.sequence_id {
            Some(Value::Number(n)) => n.to_string(),
            Some(Value::String(s)) if !s.is_empty() => s,
            _ => self.id.clone(),
        };
        let reactions = self
            .properties
            .and_then(|p| p.emotions)
            .map(parse_emotions)
            .unwrap_or_default();

        Some(RemoteMessage {
            id: self.id,
            sequence,
            sender_id: self.from,
            sender_name: self.display_name.filter(|n| !n.is_empty()),
            sender_alt_name: self.friendly_name.filter(|n| !n.is_empty()),
            timestamp,
            content: self.content,
            message_type: self.message_type,
            correlation_id: self.client_message_id.filter(|c| !c.is_empty()),
            reactions,
        })
    }
}

fn parse_emotions(value: Value) -> Vec<ReactionGroup> {
    let value = match value {
        Value::String(embedded) => match serde_json::from_str(&embedded) {
            Ok(v) => v,
            Err(_) => return Vec::new(),
        },
        other => other,
    };
    let emotions: Vec<WireEmotion> = serde_json::from_value(value).unwrap_or_default();
    emotions
        .into_iter()
        .map(|e| ReactionGroup {
            key: e.key,
            users: e
                .users
                .into_iter()
                .map(|u| ReactionUser {
                    user_id: u.mri,
                    at: u.time.and_then(DateTime::from_timestamp_millis),
                })
                .collect(),
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct HorizonsEnvelope {
    #[serde(default, rename = "consumptionhorizons")]
    consumption_horizons: Vec<WireHorizon>,
}

#[derive(Debug, Deserialize)]
struct WireHorizon {
    id: String,
    #[serde(rename = "consumptionhorizon")]
    consumption_horizon: String,
}

#[derive(Debug, Deserialize)]
struct SendAck {
    #[serde(default, rename = "OriginalArrivalTime")]
    arrival_time: Option<i64>,
    #[serde(default)]
    id: Option<String>,
}

impl SendAck {
    fn message_id(&self) -> Option<String> {
        self.id
            .clone()
            .filter(|id| !id.is_empty())
            .or_else(|| self.arrival_time.map(|t| t.to_string()))
    }
}
