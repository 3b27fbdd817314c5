//! Scheduler
//!
//! The context object that composes the job core: one keyed queue for chat
//! channels, one global lane for heavy operations, and the registries a stop
//! command needs to reach whatever is running. Everything is owned here and
//! injected, so tests build isolated instances.

use crate::config::BotConfig;
use crate::error::CoreError;
use crate::periodic::{start_periodic, DotsAnimation, PeriodicHandle};
use crate::provider::{ChatMessage, ChatRequest, ChatSource, OllamaClient};
use crate::queue::{JobHandle, KeyedSequentialQueue, QueueOccupancy, QueueStats};
use crate::registry::{GenerationRegistry, ImageServiceCancel, RemoteCancel};
use crate::stream::{
    ActiveStreamRegistry, OutputChunker, OutputSink, PersistencePolicy, ReactionExtractor,
    SideChannelExtractor, SinkCleaner, SinkUnitId, StreamAggregator, StreamEvent,
    StreamOutcome, StreamTicket,
};
use crate::types::{GenerationKind, OperationKind, OwnerId, ResourceId};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};

/// One user message to answer in a channel.
#[derive(Debug)]
pub struct ChatSubmission {
    pub channel: ResourceId,
    pub owner: OwnerId,
    pub prompt: String,
    /// Prior turns, oldest first
    pub history: Vec<ChatMessage>,
    pub kind: OperationKind,
    /// Typing indicator to stop once the reply appears
    pub indicator: Option<PeriodicHandle>,
    pub events: Option<UnboundedSender<StreamEvent>>,
}

impl ChatSubmission {
    pub fn new(
        channel: impl Into<ResourceId>,
        owner: impl Into<OwnerId>,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            owner: owner.into(),
            prompt: prompt.into(),
            history: Vec::new(),
            kind: OperationKind::Llm,
            indicator: None,
            events: None,
        }
    }

    pub fn with_history(mut self, history: Vec<ChatMessage>) -> Self {
        self.history = history;
        self
    }

    pub fn with_kind(mut self, kind: OperationKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_indicator(mut self, indicator: PeriodicHandle) -> Self {
        self.indicator = Some(indicator);
        self
    }

    pub fn with_events(mut self, events: UnboundedSender<StreamEvent>) -> Self {
        self.events = Some(events);
        self
    }
}

/// Aggregate counters across the scheduler's parts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub channels: QueueStats,
    pub global: QueueStats,
    pub active_streams: usize,
    pub active_generations: usize,
    pub queued_owners: usize,
}

struct Shared {
    config: BotConfig,
    system_prompt: String,
    channels: KeyedSequentialQueue<ResourceId>,
    global: KeyedSequentialQueue<()>,
    streams: ActiveStreamRegistry,
    generations: GenerationRegistry,
    occupancy: QueueOccupancy,
    source: Arc<dyn ChatSource>,
    extractor: Arc<dyn SideChannelExtractor>,
    policy: Arc<PersistencePolicy>,
    cleaner: SinkCleaner,
}

#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl Scheduler {
    /// Build with injected collaborators.
    pub fn new(
        config: BotConfig,
        source: Arc<dyn ChatSource>,
        transport: Arc<dyn RemoteCancel>,
    ) -> Result<Self, CoreError> {
        let system_prompt = config.persona.resolve_system_prompt()?;
        let extractor: Arc<dyn SideChannelExtractor> =
            Arc::new(ReactionExtractor::new(&config.persona.name)?);
        let policy = Arc::new(PersistencePolicy::new(&config.policy)?);
        let generations = GenerationRegistry::new(transport, config.image_service.marker_scope);

        Ok(Self {
            shared: Arc::new(Shared {
                system_prompt,
                channels: KeyedSequentialQueue::new(),
                global: KeyedSequentialQueue::new(),
                streams: ActiveStreamRegistry::new(),
                generations,
                occupancy: QueueOccupancy::new(),
                source,
                extractor,
                policy,
                cleaner: SinkCleaner::new()?,
                config,
            }),
        })
    }

    /// Build against the configured Ollama and image-service endpoints.
    pub fn from_config(config: BotConfig) -> Result<Self, CoreError> {
        let source = Arc::new(OllamaClient::new(&config.ollama, &config.retry)?);
        let transport = Arc::new(ImageServiceCancel::new(&config.image_service)?);
        Self::new(config, source, transport)
    }

    /// Queue a streamed reply on the submission's channel.
    ///
    /// Refused with [`CoreError::OwnerBusy`] while the same owner still has a
    /// request queued or running. On cancellation or failure the configured
    /// notice is sent to `sink` before the handle resolves.
    pub fn submit_chat(
        &self,
        submission: ChatSubmission,
        sink: Arc<dyn OutputSink>,
    ) -> Result<JobHandle<StreamOutcome>, CoreError> {
        let shared = Arc::clone(&self.shared);
        if !shared.occupancy.try_add(&submission.owner, submission.kind) {
            debug!(owner = %submission.owner, "Owner already queued; submission refused");
            return Err(CoreError::OwnerBusy(submission.owner));
        }

        let channel = submission.channel.clone();
        info!(
            channel = %channel,
            owner = %submission.owner,
            kind = %submission.kind,
            "Chat submitted"
        );

        Ok(self
            .shared
            .channels
            .enqueue(channel, move || run_chat(shared, submission, sink)))
    }

    /// Run `job` on the single process-wide lane.
    pub fn enqueue_globally<F, Fut, T>(&self, job: F) -> JobHandle<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, CoreError>> + Send + 'static,
        T: Send + 'static,
    {
        self.shared.global.enqueue((), job)
    }

    /// Set the abort flag of the stream running in `channel`.
    pub fn abort_channel(&self, channel: &str) -> bool {
        self.shared.streams.abort(channel)
    }

    /// Abort the stream owned by `owner`, wherever it runs.
    pub fn abort_owner(&self, owner: &str) -> bool {
        self.shared.streams.abort_owner(owner)
    }

    pub fn cancel_generation(&self, owner: &str) -> bool {
        self.shared.generations.cancel(owner)
    }

    pub fn cancel_generations_in(&self, resource: &str, requester: &str, privileged: bool) -> bool {
        self.shared
            .generations
            .cancel_by_resource(resource, requester, privileged)
    }

    /// Stop everything `requester` may stop in `channel`: the running stream
    /// and any image generation. Returns whether anything was stopped.
    pub fn stop_in(&self, channel: &str, requester: &str, privileged: bool) -> bool {
        let stream = self
            .shared
            .streams
            .abort_resource(channel, requester, privileged);
        let generations = self.cancel_generations_in(channel, requester, privileged);
        stream || generations
    }

    /// Show `label` with cycling dots in a new unit of `sink`, advancing one
    /// frame every `stream.indicator_interval_ms`. Stopping the handle leaves
    /// the last frame in place.
    pub async fn start_progress(
        &self,
        sink: Arc<dyn OutputSink>,
        label: &str,
    ) -> Result<(SinkUnitId, PeriodicHandle), CoreError> {
        let mut animation = DotsAnimation::new(label);
        let unit = sink.create_unit(&animation.initial()).await?;
        let interval = Duration::from_millis(self.shared.config.stream.indicator_interval_ms.max(1));
        let handle = start_periodic(interval, move || {
            let frame = animation.next_frame();
            let sink = Arc::clone(&sink);
            async move {
                if let Err(err) = sink.update_unit(unit, &frame).await {
                    debug!(unit = unit.0, error = %err, "Progress frame not delivered");
                }
            }
        });
        Ok((unit, handle))
    }

    /// Track an image-service job for `owner` behind a progress animation.
    /// The animation stops when the generation is cancelled, replaced or
    /// unregistered.
    pub async fn track_generation(
        &self,
        owner: &str,
        resource: &str,
        kind: GenerationKind,
        sink: Arc<dyn OutputSink>,
        label: &str,
    ) -> Result<SinkUnitId, CoreError> {
        let (unit, progress) = self.start_progress(sink, label).await?;
        self.shared
            .generations
            .register(owner, resource, kind, Some(progress));
        Ok(unit)
    }

    pub fn generations(&self) -> &GenerationRegistry {
        &self.shared.generations
    }

    pub fn streams(&self) -> &ActiveStreamRegistry {
        &self.shared.streams
    }

    pub fn occupancy(&self) -> &QueueOccupancy {
        &self.shared.occupancy
    }

    pub fn config(&self) -> &BotConfig {
        &self.shared.config
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            channels: self.shared.channels.stats(),
            global: self.shared.global.stats(),
            active_streams: self.shared.streams.count(),
            active_generations: self.shared.generations.count(),
            queued_owners: self.shared.occupancy.len(),
        }
    }
}

/// Releases the owner's queue place and the stream registration on every
/// exit path, panics included.
struct ChatGuard {
    shared: Arc<Shared>,
    owner: OwnerId,
    ticket: Option<StreamTicket>,
}

impl Drop for ChatGuard {
    fn drop(&mut self) {
        if let Some(ticket) = self.ticket.take() {
            self.shared.streams.unregister(&ticket);
        }
        self.shared.occupancy.remove(&self.owner);
    }
}

async fn run_chat(
    shared: Arc<Shared>,
    submission: ChatSubmission,
    sink: Arc<dyn OutputSink>,
) -> Result<StreamOutcome, CoreError> {
    let ChatSubmission {
        channel,
        owner,
        prompt,
        history,
        kind,
        indicator,
        events,
    } = submission;

    let ticket = shared.streams.register(&channel, &owner, kind);
    let abort = ticket.token.clone();
    let _guard = ChatGuard {
        shared: Arc::clone(&shared),
        owner: owner.clone(),
        ticket: Some(ticket),
    };

    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.push(ChatMessage::system(shared.system_prompt.clone()));
    messages.extend(history);
    messages.push(ChatMessage::user(prompt));

    let config = &shared.config;
    let chunker = OutputChunker::from_config(&config.stream).with_cleaner(shared.cleaner.clone());
    let mut aggregator = StreamAggregator::new(
        &config.stream,
        chunker,
        Arc::clone(&shared.extractor),
        Arc::clone(&shared.policy),
        abort.clone(),
    );
    if let Some(indicator) = indicator {
        aggregator = aggregator.with_indicator(indicator);
    }
    if let Some(events) = events.clone() {
        aggregator = aggregator.with_events(events);
    }

    let opened = tokio::select! {
        biased;
        _ = abort.cancelled() => None,
        opened = shared.source.open_stream(ChatRequest::new(messages)) => Some(opened),
    };

    let outcome = match opened {
        None => {
            info!(channel = %channel, owner = %owner, "Aborted before the stream opened");
            if let Some(events) = &events {
                let _ = events.send(StreamEvent::Cancelled);
            }
            Ok(StreamOutcome::Cancelled)
        }
        Some(Err(err)) => {
            if let Some(events) = &events {
                let _ = events.send(StreamEvent::Failed(err.to_string()));
            }
            Err(err)
        }
        Some(Ok(source)) => aggregator.run(source, sink.as_ref()).await,
    };

    match &outcome {
        Ok(StreamOutcome::Cancelled) => {
            if let Some(notice) = &config.notices.cancelled {
                deliver_notice(sink.as_ref(), &channel, notice).await;
            }
        }
        Ok(StreamOutcome::Completed(completion)) => debug!(
            channel = %channel,
            owner = %owner,
            persist = ?completion.persist,
            marker = ?completion.first_marker,
            "Chat reply delivered"
        ),
        Err(err) => {
            warn!(channel = %channel, owner = %owner, error = %err, "Chat reply failed");
            deliver_notice(sink.as_ref(), &channel, &config.notices.failed).await;
        }
    }
    outcome
}

async fn deliver_notice(sink: &dyn OutputSink, channel: &str, notice: &str) {
    if let Err(err) = sink.create_unit(notice).await {
        error!(channel = %channel, error = %err, "Failed to deliver notice");
    }
}
