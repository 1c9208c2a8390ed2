use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::models::{CompletionError, CompletionRequest, CompletionService};
use crate::session::{ChatMessage, Direction};
use crate::settings::{resolve_generation_params, GlobalDefaults};
use crate::store::EntityStore;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyTexts {
    pub assistant_name: String,
    pub missing_profile: String,
    pub missing_credential: String,
    pub empty_response: String,
    pub service_error: String,
}

impl Default for ReplyTexts {
    fn default() -> Self {
        Self {
            assistant_name: "Assistant".into(),
            missing_profile: "Sorry, I could not find my profile settings.".into(),
            missing_credential: "Notice: no API key is configured. Please set it in the environment.".into(),
            empty_response: "I could not put a reply together.".into(),
            service_error: "Could not reach the assistant right now. Please try again later.".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReplyFailure {
    MissingProfile { profile_id: String },
    MissingCredential,
    EmptyResponse,
    Service { message: String },
}

impl ReplyFailure {
    fn label(&self) -> &'static str {
        match self {
            ReplyFailure::MissingProfile { .. } => "missing_profile",
            ReplyFailure::MissingCredential => "missing_credential",
            ReplyFailure::EmptyResponse => "empty_response",
            ReplyFailure::Service { .. } => "service_error",
        }
    }
}

pub type ReplyResult = Result<String, ReplyFailure>;

impl ReplyTexts {
    pub fn render(&self, result: &ReplyResult) -> String {
        match result {
            Ok(text) => text.clone(),
            Err(ReplyFailure::MissingProfile { .. }) => self.missing_profile.clone(),
            Err(ReplyFailure::MissingCredential) => self.missing_credential.clone(),
            Err(ReplyFailure::EmptyResponse) => self.empty_response.clone(),
            Err(ReplyFailure::Service { .. }) => self.service_error.clone(),
        }
    }
}

pub fn build_prompt(sender_name: &str, text: &str) -> String {
    format!("Message from {}: {}", sender_name, text)
}

#[derive(Default)]
struct InFlight {
    counts: Mutex<HashMap<String, usize>>,
}

impl InFlight {
    fn enter(self: &Arc<Self>, channel_id: &str) -> InFlightGuard {
        *self.counts.lock().entry(channel_id.to_string()).or_insert(0) += 1;
        InFlightGuard { registry: self.clone(), channel_id: channel_id.to_string() }
    }

    fn is_active(&self, channel_id: &str) -> bool {
        self.counts.lock().get(channel_id).is_some_and(|n| *n > 0)
    }

    fn active(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.counts.lock().keys().cloned().collect();
        ids.sort();
        ids
    }
}

struct InFlightGuard {
    registry: Arc<InFlight>,
    channel_id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut counts = self.registry.counts.lock();
        if let Some(n) = counts.get_mut(&self.channel_id) {
            *n -= 1;
            if *n == 0 {
                counts.remove(&self.channel_id);
            }
        }
    }
}

#[derive(Clone)]
pub struct ReplyPipeline {
    store: Arc<EntityStore>,
    completion: Arc<dyn CompletionService>,
    defaults: GlobalDefaults,
    texts: ReplyTexts,
    in_flight: Arc<InFlight>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyOutcome {
    pub channel_id: String,
    pub inbound: ChatMessage,
    pub outbound: ChatMessage,
    pub result: ReplyResult,
    pub delivered: bool,
}

// inbound message already appended, reply still owed
pub struct PendingReply {
    pipeline: ReplyPipeline,
    channel_id: String,
    profile_id: String,
    sender_name: String,
    text: String,
    inbound: ChatMessage,
    _guard: InFlightGuard,
}

impl ReplyPipeline {
    pub fn new(store: Arc<EntityStore>, completion: Arc<dyn CompletionService>) -> Self {
        Self {
            store,
            completion,
            defaults: GlobalDefaults::default(),
            texts: ReplyTexts::default(),
            in_flight: Arc::new(InFlight::default()),
        }
    }

    pub fn with_defaults(mut self, defaults: GlobalDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn with_texts(mut self, texts: ReplyTexts) -> Self {
        self.texts = texts;
        self
    }

    pub fn texts(&self) -> &ReplyTexts {
        &self.texts
    }

    pub fn is_generating(&self, channel_id: &str) -> bool {
        self.in_flight.is_active(channel_id)
    }

    pub fn generating_channels(&self) -> Vec<String> {
        self.in_flight.active()
    }

    // None: channel missing or not connected, nothing appended
    pub async fn run(&self, channel_id: &str, sender_name: &str, text: &str) -> Option<ReplyOutcome> {
        let pending = self.begin(channel_id, sender_name, text).await?;
        Some(pending.finish().await)
    }

    pub async fn begin(&self, channel_id: &str, sender_name: &str, text: &str) -> Option<PendingReply> {
        let appended = match self.store.append_inbound(channel_id, sender_name, text).await {
            Ok(appended) => appended,
            Err(e) => {
                tracing::debug!(channel = %channel_id, error = %e, "ignoring simulated message for unavailable channel");
                return None;
            }
        };
        if !appended.persisted {
            tracing::warn!(channel = %channel_id, "inbound message kept in memory only");
        }
        let guard = self.in_flight.enter(channel_id);
        Some(PendingReply {
            pipeline: self.clone(),
            channel_id: channel_id.to_string(),
            profile_id: appended.profile_id,
            sender_name: sender_name.to_string(),
            text: text.to_string(),
            inbound: appended.message,
            _guard: guard,
        })
    }

    async fn generate(&self, profile_id: &str, sender_name: &str, text: &str) -> ReplyResult {
        let Some(profile) = self.store.profile(profile_id).await else {
            tracing::warn!(profile = %profile_id, "channel references a missing profile");
            return Err(ReplyFailure::MissingProfile { profile_id: profile_id.to_string() });
        };
        if !self.completion.is_configured() {
            tracing::warn!("completion credential missing");
            return Err(ReplyFailure::MissingCredential);
        }
        let params = resolve_generation_params(&self.defaults, &profile);
        let req = CompletionRequest {
            model: params.model,
            prompt: build_prompt(sender_name, text),
            system_instruction: params.system_instruction,
            temperature: Some(params.temperature),
        };
        match self.completion.generate(req).await {
            Ok(resp) => resp.text.filter(|t| !t.trim().is_empty()).ok_or(ReplyFailure::EmptyResponse),
            Err(CompletionError::MissingCredential) => Err(ReplyFailure::MissingCredential),
            Err(e) => {
                tracing::error!(profile = %profile_id, error = %e, "completion call failed");
                Err(ReplyFailure::Service { message: e.to_string() })
            }
        }
    }
}

impl PendingReply {
    pub fn inbound(&self) -> &ChatMessage {
        &self.inbound
    }

    pub async fn finish(self) -> ReplyOutcome {
        let pipeline = &self.pipeline;
        let result = pipeline.generate(&self.profile_id, &self.sender_name, &self.text).await;
        let outcome_label = match &result {
            Ok(_) => "generated",
            Err(f) => f.label(),
        };
        metrics::counter!("autopilot_replies_total", "outcome" => outcome_label).increment(1);

        let texts = pipeline.texts();
        let reply = texts.render(&result);
        let (outbound, delivered) = match pipeline.store.append_outbound(&self.channel_id, &texts.assistant_name, &reply).await {
            Ok(appended) => {
                if !appended.persisted {
                    tracing::warn!(channel = %self.channel_id, "outbound message kept in memory only");
                }
                (appended.message, true)
            }
            Err(e) => {
                tracing::info!(channel = %self.channel_id, error = %e, "channel gone before reply landed, dropping reply");
                let dropped = ChatMessage::new(Direction::Outbound, texts.assistant_name.clone(), reply, chrono::Utc::now());
                (dropped, false)
            }
        };
        ReplyOutcome {
            channel_id: self.channel_id.clone(),
            inbound: self.inbound.clone(),
            outbound,
            result,
            delivered,
        }
    }
}
