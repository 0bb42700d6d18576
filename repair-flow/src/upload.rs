//! Photo upload and analysis orchestration.
//!
//! Each file moves through `pending -> uploading -> analyzing -> completed`,
//! or to `error` from any state but `completed`. `error` re-enters `pending`
//! only through an explicit retry. Files that fail validation never enter
//! the queue.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    channel::{Channel, ChannelEvent, Envelope, Subscription, Topic},
    error::{FlowError, Result},
    messages::{PhotoUploadRequest, ProcessingStage, UploadEvent},
    model::{AnalysisResult, PhotoRecord, SessionId},
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadPolicy {
    pub allowed_types: Vec<String>,
    pub max_file_bytes: u64,
    pub max_queue: usize,
    /// How long an upload may wait for its analysis before it is failed.
    pub response_timeout: Duration,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self {
            allowed_types: ["image/jpeg", "image/png", "image/webp", "image/heic"]
                .into_iter()
                .map(String::from)
                .collect(),
            max_file_bytes: 10 * 1024 * 1024,
            max_queue: 10,
            response_timeout: Duration::from_secs(30),
        }
    }
}

impl UploadPolicy {
    /// Returns a user-readable reason when the file is not acceptable.
    pub fn check(&self, file: &PhotoFile) -> std::result::Result<(), String> {
        let content_type = file.content_type.to_ascii_lowercase();
        if !self.allowed_types.iter().any(|t| t.eq_ignore_ascii_case(&content_type)) {
            return Err(format!(
                "{}: file type {} is not supported (allowed: {})",
                file.name,
                file.content_type,
                self.allowed_types.join(", ")
            ));
        }
        if file.data.is_empty() {
            return Err(format!("{}: file is empty", file.name));
        }
        let size = file.data.len() as u64;
        if size > self.max_file_bytes {
            return Err(format!(
                "{}: file is {} which exceeds the {} limit",
                file.name,
                human_size(size),
                human_size(self.max_file_bytes)
            ));
        }
        Ok(())
    }
}

fn human_size(bytes: u64) -> String {
    const MB: f64 = 1024.0 * 1024.0;
    if bytes as f64 >= MB {
        format!("{:.1} MB", bytes as f64 / MB)
    } else {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    }
}

/// A file picked by the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhotoFile {
    pub name: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Pending,
    Uploading,
    Analyzing,
    Completed,
    Error,
}

impl UploadStatus {
    /// Completed items never change again.
    pub fn is_done(&self) -> bool {
        matches!(self, UploadStatus::Completed)
    }

    /// Nothing is happening to the item: it is done, or failed and waiting
    /// for a retry or removal.
    pub fn is_resting(&self) -> bool {
        matches!(self, UploadStatus::Completed | UploadStatus::Error)
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(self, UploadStatus::Uploading | UploadStatus::Analyzing)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadItem {
    pub id: Uuid,
    pub file_name: String,
    pub content_type: String,
    pub size: u64,
    pub status: UploadStatus,
    pub progress: u8,
    pub analysis: Option<AnalysisResult>,
    pub error: Option<String>,
    #[serde(skip)]
    data: Vec<u8>,
}

impl UploadItem {
    fn new(file: PhotoFile) -> Self {
        Self {
            id: Uuid::new_v4(),
            file_name: file.name,
            content_type: file.content_type,
            size: file.data.len() as u64,
            status: UploadStatus::Pending,
            progress: 0,
            analysis: None,
            error: None,
            data: file.data,
        }
    }

    pub fn file(&self) -> PhotoFile {
        PhotoFile {
            name: self.file_name.clone(),
            content_type: self.content_type.clone(),
            data: self.data.clone(),
        }
    }
}

/// The per-session list of uploads and its state transitions.
#[derive(Debug, Clone, Default)]
pub struct UploadQueue {
    policy: UploadPolicy,
    items: Vec<UploadItem>,
}

impl UploadQueue {
    pub fn new(policy: UploadPolicy) -> Self {
        Self {
            policy,
            items: Vec::new(),
        }
    }

    pub fn policy(&self) -> &UploadPolicy {
        &self.policy
    }

    pub fn items(&self) -> &[UploadItem] {
        &self.items
    }

    pub fn get(&self, id: Uuid) -> Option<&UploadItem> {
        self.items.iter().find(|i| i.id == id)
    }

    /// Validates and enqueues files in order. Once the queue is full the
    /// remaining (newest) files are rejected.
    pub fn add_files(&mut self, files: Vec<PhotoFile>) -> Vec<Result<Uuid>> {
        files
            .into_iter()
            .map(|file| {
                if let Err(reason) = self.policy.check(&file) {
                    info!(file = %file.name, %reason, "photo rejected");
                    return Err(FlowError::UploadRejected(reason));
                }
                if self.items.len() >= self.policy.max_queue {
                    return Err(FlowError::UploadRejected(format!(
                        "{}: no more than {} photos can be attached",
                        file.name, self.policy.max_queue
                    )));
                }
                let item = UploadItem::new(file);
                let id = item.id;
                self.items.push(item);
                Ok(id)
            })
            .collect()
    }

    pub fn remove(&mut self, id: Uuid) -> Result<UploadItem> {
        let position = self
            .items
            .iter()
            .position(|i| i.id == id)
            .ok_or_else(|| FlowError::UploadNotFound(id.to_string()))?;
        Ok(self.items.remove(position))
    }

    pub fn retry(&mut self, id: Uuid) -> Result<()> {
        let item = self.item_mut(id)?;
        if item.status != UploadStatus::Error {
            return Err(FlowError::InvalidTransition(format!(
                "only failed uploads can be retried, {} is {:?}",
                item.file_name, item.status
            )));
        }
        item.status = UploadStatus::Pending;
        item.progress = 0;
        item.error = None;
        Ok(())
    }

    pub fn pending_ids(&self) -> Vec<Uuid> {
        self.ids_with(UploadStatus::Pending)
    }

    pub fn in_flight(&self) -> usize {
        self.items.iter().filter(|i| i.status.is_in_flight()).count()
    }

    pub fn mark_uploading(&mut self, id: Uuid) -> Result<()> {
        let item = self.item_mut(id)?;
        if item.status != UploadStatus::Pending {
            return Err(FlowError::InvalidTransition(format!(
                "{} is {:?}, not pending",
                item.file_name, item.status
            )));
        }
        item.status = UploadStatus::Uploading;
        item.progress = 0;
        Ok(())
    }

    /// Applies a channel event. Returns `false` when the event was ignored
    /// (unknown item or not applicable in the item's state).
    pub fn apply(&mut self, event: &UploadEvent) -> bool {
        let Some(item) = self.items.iter_mut().find(|i| i.id == event.upload_id()) else {
            return false;
        };
        match event {
            UploadEvent::Progress(progress) if item.status == UploadStatus::Uploading => {
                item.progress = item.progress.max(progress.progress.min(100));
                true
            }
            UploadEvent::Processing(status) if item.status.is_in_flight() => {
                match status.stage {
                    ProcessingStage::Received => item.progress = 100,
                    ProcessingStage::Analyzing => {
                        item.progress = 100;
                        item.status = UploadStatus::Analyzing;
                    }
                }
                true
            }
            UploadEvent::Analyzed(ready) if item.status.is_in_flight() => {
                item.status = UploadStatus::Completed;
                item.progress = 100;
                item.analysis = Some(ready.analysis.clone());
                true
            }
            UploadEvent::Failed(failure) if item.status.is_in_flight() => {
                item.status = UploadStatus::Error;
                item.error = Some(failure.message.clone());
                true
            }
            _ => false,
        }
    }

    pub fn complete(&mut self, id: Uuid, analysis: AnalysisResult) -> Result<()> {
        let item = self.item_mut(id)?;
        if !item.status.is_in_flight() {
            return Err(FlowError::InvalidTransition(format!(
                "{} is {:?}, not in flight",
                item.file_name, item.status
            )));
        }
        item.status = UploadStatus::Completed;
        item.progress = 100;
        item.analysis = Some(analysis);
        Ok(())
    }

    /// Marks an item that has not completed as failed.
    pub fn fail(&mut self, id: Uuid, message: impl Into<String>) -> Result<()> {
        let item = self.item_mut(id)?;
        if item.status.is_done() {
            return Err(FlowError::InvalidTransition(format!(
                "{} is already completed",
                item.file_name
            )));
        }
        item.status = UploadStatus::Error;
        item.error = Some(message.into());
        Ok(())
    }

    pub fn completed_records(&self) -> Vec<PhotoRecord> {
        self.items
            .iter()
            .filter_map(|item| {
                item.analysis.as_ref().map(|analysis| PhotoRecord {
                    upload_id: item.id,
                    file_name: item.file_name.clone(),
                    analysis: analysis.clone(),
                })
            })
            .collect()
    }

    fn ids_with(&self, status: UploadStatus) -> Vec<Uuid> {
        self.items
            .iter()
            .filter(|i| i.status == status)
            .map(|i| i.id)
            .collect()
    }

    fn item_mut(&mut self, id: Uuid) -> Result<&mut UploadItem> {
        self.items
            .iter_mut()
            .find(|i| i.id == id)
            .ok_or_else(|| FlowError::UploadNotFound(id.to_string()))
    }
}

enum Settle {
    Deadline,
    Envelope(Option<Envelope>),
    Connection(bool),
}

/// Analysis over a request/response transport, used when the channel is
/// unavailable.
#[async_trait]
pub trait PhotoAnalyzer: Send + Sync {
    async fn analyze(&self, file: &PhotoFile) -> Result<AnalysisResult>;
}

/// Drives an [`UploadQueue`] over the channel, falling back to a
/// [`PhotoAnalyzer`] while disconnected.
pub struct UploadOrchestrator {
    session_id: SessionId,
    channel: Arc<dyn Channel>,
    fallback: Option<Arc<dyn PhotoAnalyzer>>,
    queue: UploadQueue,
    subscription: Option<Subscription>,
}

impl UploadOrchestrator {
    pub fn new(session_id: SessionId, channel: Arc<dyn Channel>, policy: UploadPolicy) -> Self {
        Self {
            session_id,
            channel,
            fallback: None,
            queue: UploadQueue::new(policy),
            subscription: None,
        }
    }

    pub fn with_fallback(mut self, analyzer: Arc<dyn PhotoAnalyzer>) -> Self {
        self.fallback = Some(analyzer);
        self
    }

    pub fn queue(&self) -> &UploadQueue {
        &self.queue
    }

    pub fn mount(&mut self) {
        if self.subscription.is_none() {
            self.subscription = Some(self.channel.subscribe(&[
                Topic::UploadProgress,
                Topic::PhotoProcessingStatus,
                Topic::PhotoAnalysisResult,
                Topic::PhotoAnalysisError,
            ]));
        }
    }

    pub fn unmount(&mut self) {
        self.subscription = None;
    }

    pub fn add_files(&mut self, files: Vec<PhotoFile>) -> Vec<Result<Uuid>> {
        self.queue.add_files(files)
    }

    pub fn retry(&mut self, id: Uuid) -> Result<()> {
        self.queue.retry(id)
    }

    pub fn remove(&mut self, id: Uuid) -> Result<UploadItem> {
        self.queue.remove(id)
    }

    /// Starts every pending upload. Channel uploads complete later through
    /// events; fallback uploads complete before this returns.
    pub async fn upload_pending(&mut self) -> Result<()> {
        for id in self.queue.pending_ids() {
            self.queue.mark_uploading(id)?;
            let file = match self.queue.get(id) {
                Some(item) => item.file(),
                None => continue,
            };

            if self.channel.connection_state().is_connected() {
                let request = PhotoUploadRequest {
                    session_id: self.session_id,
                    upload_id: id,
                    file_name: file.name.clone(),
                    content_type: file.content_type.clone(),
                    data: BASE64.encode(&file.data),
                };
                let sent = match Envelope::new(Topic::PhotoUploadAndAnalyze, &request) {
                    Ok(envelope) => self.channel.publish(envelope).await,
                    Err(e) => Err(e),
                };
                match sent {
                    Ok(()) => {
                        debug!(upload_id = %id, file = %file.name, "photo sent over channel");
                        continue;
                    }
                    Err(e) => warn!(upload_id = %id, error = %e, "channel upload failed"),
                }
            }

            self.upload_via_fallback(id, &file).await?;
        }
        Ok(())
    }

    async fn upload_via_fallback(&mut self, id: Uuid, file: &PhotoFile) -> Result<()> {
        let Some(analyzer) = self.fallback.clone() else {
            return self
                .queue
                .fail(id, "upload service is unavailable, please retry");
        };
        match analyzer.analyze(file).await {
            Ok(analysis) => {
                info!(upload_id = %id, "photo analyzed via fallback");
                self.queue.complete(id, analysis)
            }
            Err(e) => {
                warn!(upload_id = %id, error = %e, "fallback analysis failed");
                self.queue.fail(id, e.to_string())
            }
        }
    }

    /// Applies one envelope if it belongs to this session.
    pub fn handle_envelope(&mut self, envelope: &Envelope) -> bool {
        match UploadEvent::from_envelope(envelope) {
            Some(event) if event.session_id() == self.session_id => self.queue.apply(&event),
            _ => false,
        }
    }

    /// Processes channel events until nothing is in flight. Whatever is
    /// still in flight when the response timeout elapses, or when the
    /// channel disconnects, is failed and can be retried.
    pub async fn run_until_settled(&mut self) {
        let deadline = Instant::now() + self.queue.policy().response_timeout;
        let mut connection = self.channel.watch_connection();
        let mut watching = true;

        while self.queue.in_flight() > 0 {
            if !connection.borrow_and_update().is_connected() {
                warn!(session_id = %self.session_id, "channel disconnected during photo analysis");
                self.fail_in_flight("connection lost before analysis finished, please retry");
                return;
            }
            let Some(subscription) = self.subscription.as_mut() else {
                self.fail_in_flight("not listening for upload results");
                return;
            };

            let wake = tokio::select! {
                _ = sleep_until(deadline) => Settle::Deadline,
                envelope = subscription.recv() => Settle::Envelope(envelope),
                changed = connection.changed(), if watching => Settle::Connection(changed.is_ok()),
            };

            match wake {
                Settle::Deadline => {
                    warn!(session_id = %self.session_id, "photo analysis timed out");
                    self.fail_in_flight("analysis timed out, please retry");
                    return;
                }
                Settle::Envelope(Some(envelope)) => {
                    self.handle_envelope(&envelope);
                }
                Settle::Envelope(None) => {
                    self.fail_in_flight("connection closed before analysis finished");
                    return;
                }
                // re-checked at the top of the loop
                Settle::Connection(true) => {}
                Settle::Connection(false) => watching = false,
            }
        }
    }

    fn fail_in_flight(&mut self, message: &str) {
        let ids: Vec<Uuid> = self
            .queue
            .items()
            .iter()
            .filter(|i| i.status.is_in_flight())
            .map(|i| i.id)
            .collect();
        for id in ids {
            let _ = self.queue.fail(id, message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelHub;
    use crate::messages::{PhotoAnalysisError, PhotoAnalysisReady, PhotoProcessingStatus, UploadProgress};
    use crate::model::RepairCategory;

    fn jpeg(name: &str, size: usize) -> PhotoFile {
        PhotoFile {
            name: name.to_string(),
            content_type: "image/jpeg".to_string(),
            data: vec![0xFF; size],
        }
    }

    fn analysis() -> AnalysisResult {
        AnalysisResult {
            detected_issues: vec![RepairCategory::ScreenRepair],
            confidence: 0.8,
            width: Some(1024),
            height: Some(768),
            notes: vec![],
        }
    }

    struct StaticAnalyzer;

    #[async_trait]
    impl PhotoAnalyzer for StaticAnalyzer {
        async fn analyze(&self, _file: &PhotoFile) -> Result<AnalysisResult> {
            Ok(analysis())
        }
    }

    #[test]
    fn oversize_file_is_rejected_with_reason() {
        let policy = UploadPolicy {
            max_file_bytes: 1024,
            ..Default::default()
        };
        let mut queue = UploadQueue::new(policy);

        let results = queue.add_files(vec![jpeg("crack.jpg", 2048)]);

        match &results[0] {
            Err(FlowError::UploadRejected(reason)) => {
                assert!(reason.contains("crack.jpg"));
                assert!(reason.contains("exceeds"));
            }
            other => panic!("expected rejection, got {:?}", other),
        }
        assert!(queue.items().is_empty());
    }

    #[test]
    fn unsupported_type_is_rejected() {
        let mut queue = UploadQueue::default();
        let file = PhotoFile {
            name: "notes.pdf".to_string(),
            content_type: "application/pdf".to_string(),
            data: vec![1, 2, 3],
        };
        let results = queue.add_files(vec![file]);
        assert!(matches!(&results[0], Err(FlowError::UploadRejected(r)) if r.contains("not supported")));
    }

    #[test]
    fn queue_limit_rejects_newest() {
        let policy = UploadPolicy {
            max_queue: 2,
            ..Default::default()
        };
        let mut queue = UploadQueue::new(policy);
        let results = queue.add_files(vec![jpeg("a.jpg", 10), jpeg("b.jpg", 10), jpeg("c.jpg", 10)]);

        assert!(results[0].is_ok());
        assert!(results[1].is_ok());
        assert!(matches!(&results[2], Err(FlowError::UploadRejected(r)) if r.contains("c.jpg")));
        assert_eq!(queue.items().len(), 2);
    }

    #[test]
    fn retry_only_from_error() {
        let mut queue = UploadQueue::default();
        let id = queue.add_files(vec![jpeg("a.jpg", 10)]).remove(0).unwrap();

        assert!(queue.retry(id).is_err());
        queue.mark_uploading(id).unwrap();
        queue.fail(id, "network down").unwrap();
        queue.retry(id).unwrap();

        let item = queue.get(id).unwrap();
        assert_eq!(item.status, UploadStatus::Pending);
        assert_eq!(item.error, None);
    }

    #[test]
    fn events_for_completed_items_are_ignored() {
        let mut queue = UploadQueue::default();
        let session_id = SessionId::new();
        let id = queue.add_files(vec![jpeg("a.jpg", 10)]).remove(0).unwrap();
        queue.mark_uploading(id).unwrap();
        queue.complete(id, analysis()).unwrap();

        let late = UploadEvent::Failed(PhotoAnalysisError {
            session_id,
            upload_id: id,
            message: "late".to_string(),
        });
        assert!(!queue.apply(&late));
        assert_eq!(queue.get(id).unwrap().status, UploadStatus::Completed);
    }

    #[tokio::test]
    async fn channel_lifecycle() {
        let hub = Arc::new(ChannelHub::default());
        let mut requests = hub.subscribe(&[Topic::PhotoUploadAndAnalyze]);
        let session_id = SessionId::new();
        let mut orchestrator = UploadOrchestrator::new(session_id, hub.clone(), UploadPolicy::default());
        orchestrator.mount();

        let id = orchestrator.add_files(vec![jpeg("screen.jpg", 64)]).remove(0).unwrap();
        orchestrator.upload_pending().await.unwrap();
        assert_eq!(orchestrator.queue().get(id).unwrap().status, UploadStatus::Uploading);

        let request: PhotoUploadRequest = requests.recv().await.unwrap().decode().unwrap();
        assert_eq!(request.upload_id, id);
        assert_eq!(BASE64.decode(request.data).unwrap().len(), 64);

        for envelope in [
            Envelope::new(
                Topic::UploadProgress,
                UploadProgress { session_id, upload_id: id, progress: 60 },
            ),
            Envelope::new(
                Topic::PhotoProcessingStatus,
                PhotoProcessingStatus { session_id, upload_id: id, stage: ProcessingStage::Analyzing },
            ),
            Envelope::new(
                Topic::PhotoAnalysisResult,
                PhotoAnalysisReady { session_id, upload_id: id, analysis: analysis() },
            ),
        ] {
            hub.publish(envelope.unwrap()).await.unwrap();
        }

        orchestrator.run_until_settled().await;
        let item = orchestrator.queue().get(id).unwrap();
        assert_eq!(item.status, UploadStatus::Completed);
        assert_eq!(item.progress, 100);
        assert_eq!(orchestrator.queue().completed_records().len(), 1);
    }

    #[tokio::test]
    async fn disconnected_uses_fallback() {
        let hub = Arc::new(ChannelHub::default());
        hub.disconnect();
        let mut orchestrator =
            UploadOrchestrator::new(SessionId::new(), hub.clone(), UploadPolicy::default())
                .with_fallback(Arc::new(StaticAnalyzer));

        let id = orchestrator.add_files(vec![jpeg("a.jpg", 10)]).remove(0).unwrap();
        orchestrator.upload_pending().await.unwrap();

        let item = orchestrator.queue().get(id).unwrap();
        assert_eq!(item.status, UploadStatus::Completed);
        assert_eq!(item.analysis.as_ref().unwrap().detected_issues, vec![RepairCategory::ScreenRepair]);
    }

    #[tokio::test]
    async fn disconnected_without_fallback_marks_error() {
        let hub = Arc::new(ChannelHub::default());
        hub.disconnect();
        let mut orchestrator =
            UploadOrchestrator::new(SessionId::new(), hub.clone(), UploadPolicy::default());

        let id = orchestrator.add_files(vec![jpeg("a.jpg", 10)]).remove(0).unwrap();
        orchestrator.upload_pending().await.unwrap();

        let item = orchestrator.queue().get(id).unwrap();
        assert_eq!(item.status, UploadStatus::Error);
        orchestrator.retry(id).unwrap();
        assert_eq!(orchestrator.queue().pending_ids(), vec![id]);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_server_times_out() {
        let hub = Arc::new(ChannelHub::default());
        let mut orchestrator =
            UploadOrchestrator::new(SessionId::new(), hub.clone(), UploadPolicy::default());
        orchestrator.mount();

        let id = orchestrator.add_files(vec![jpeg("a.jpg", 10)]).remove(0).unwrap();
        orchestrator.upload_pending().await.unwrap();
        orchestrator.run_until_settled().await;

        let item = orchestrator.queue().get(id).unwrap();
        assert_eq!(item.status, UploadStatus::Error);
        assert!(item.error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn other_sessions_traffic_does_not_extend_the_deadline() {
        let hub = Arc::new(ChannelHub::default());
        let mut orchestrator =
            UploadOrchestrator::new(SessionId::new(), hub.clone(), UploadPolicy::default());
        orchestrator.mount();
        let id = orchestrator.add_files(vec![jpeg("a.jpg", 10)]).remove(0).unwrap();
        orchestrator.upload_pending().await.unwrap();

        let chatter = tokio::spawn({
            let hub = hub.clone();
            async move {
                let other = SessionId::new();
                loop {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    let progress = UploadProgress {
                        session_id: other,
                        upload_id: Uuid::new_v4(),
                        progress: 10,
                    };
                    let _ = hub
                        .publish(Envelope::new(Topic::UploadProgress, progress).unwrap())
                        .await;
                }
            }
        });

        let started = Instant::now();
        orchestrator.run_until_settled().await;
        chatter.abort();

        assert!(started.elapsed() <= Duration::from_secs(31));
        let item = orchestrator.queue().get(id).unwrap();
        assert_eq!(item.status, UploadStatus::Error);
        assert!(item.error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_fails_in_flight_uploads() {
        let hub = Arc::new(ChannelHub::default());
        let mut orchestrator =
            UploadOrchestrator::new(SessionId::new(), hub.clone(), UploadPolicy::default());
        orchestrator.mount();
        let id = orchestrator.add_files(vec![jpeg("a.jpg", 10)]).remove(0).unwrap();
        orchestrator.upload_pending().await.unwrap();

        tokio::spawn({
            let hub = hub.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                hub.disconnect();
            }
        });

        let started = Instant::now();
        orchestrator.run_until_settled().await;

        assert!(started.elapsed() < Duration::from_secs(5));
        let item = orchestrator.queue().get(id).unwrap();
        assert_eq!(item.status, UploadStatus::Error);
        assert!(item.error.as_deref().unwrap().contains("connection lost"));
        assert!(item.status.is_resting());
        assert!(!item.status.is_done());
    }
}
