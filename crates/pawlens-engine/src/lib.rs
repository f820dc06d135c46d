use std::env;
use std::fs;
use std::io::Write as _;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use pawlens_contracts::error::PipelineError;
use pawlens_contracts::events::{EventPayload, EventWriter};
use pawlens_contracts::profile::PetProfile;
use pawlens_contracts::record::AnalysisRecord;
use pawlens_contracts::tasks::{
    prompt_for, AnalysisTask, MediaKind, PollPolicy, TaskRegistry, TaskSpec,
};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use reqwest::header::CONTENT_TYPE;
use serde_json::{json, Value};
use tempfile::NamedTempFile;

const UPLOAD_TIMEOUT_SECS: u64 = 120;
const GENERATE_TIMEOUT_SECS: u64 = 90;

/// Media bytes written to a transient backing store, ready for upload.
///
/// The backing file is deleted when the value drops, so the staged resource
/// is released exactly once on every exit path of the analysis call that
/// created it.
#[derive(Debug)]
pub struct StagedMedia {
    file: NamedTempFile,
    declared_name: String,
    mime_type: &'static str,
    byte_len: u64,
}

impl StagedMedia {
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn declared_name(&self) -> &str {
        &self.declared_name
    }

    pub fn mime_type(&self) -> &'static str {
        self.mime_type
    }

    pub fn byte_len(&self) -> u64 {
        self.byte_len
    }
}

/// Writes raw media bytes to a named temp file and derives the transport
/// content-type from the declared file name.
pub fn stage(
    bytes: &[u8],
    declared_name: &str,
    kind: MediaKind,
) -> Result<StagedMedia, PipelineError> {
    let mut file = NamedTempFile::new()?;
    file.write_all(bytes)?;
    file.as_file().sync_all()?;
    Ok(StagedMedia {
        file,
        declared_name: declared_name.to_string(),
        mime_type: transport_mime_type(declared_name, kind),
        byte_len: bytes.len() as u64,
    })
}

fn transport_mime_type(declared_name: &str, kind: MediaKind) -> &'static str {
    let ext = Path::new(declared_name)
        .extension()
        .and_then(|value| value.to_str())
        .map(|value| value.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "mov" => "video/quicktime",
        "mp4" => "video/mp4",
        "mpeg" | "mpg" => "video/mpeg",
        "avi" => "video/x-msvideo",
        "webm" => "video/webm",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "heic" => "image/heic",
        _ => match kind {
            MediaKind::Video => "video/mp4",
            MediaKind::Image => "image/png",
        },
    }
}

/// Server-side processing state of an uploaded asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetState {
    Processing,
    Ready,
    Failed,
}

impl AssetState {
    fn from_remote(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "ACTIVE" => AssetState::Ready,
            "FAILED" => AssetState::Failed,
            _ => AssetState::Processing,
        }
    }
}

/// Server-side handle referencing uploaded media.
#[derive(Debug, Clone)]
pub struct RemoteAsset {
    pub name: String,
    pub uri: String,
    pub state: AssetState,
    pub mime_type: String,
}

/// Narrow outbound contract to the remote inference service. The credential
/// lives behind the implementation; callers never see it.
pub trait RemoteInference {
    fn upload_asset(&self, media: &StagedMedia) -> Result<RemoteAsset>;
    fn asset_status(&self, name: &str) -> Result<RemoteAsset>;
    fn delete_asset(&self, name: &str) -> Result<()>;
    fn generate(&self, model: &str, asset: Option<&RemoteAsset>, prompt: &str) -> Result<String>;
}

/// Blocking client for the Gemini Files + generateContent APIs.
pub struct GeminiService {
    api_base: String,
    api_key: String,
    http: HttpClient,
}

impl GeminiService {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_base: env::var("GEMINI_API_BASE")
                .ok()
                .map(|value| value.trim().trim_end_matches('/').to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| "https://generativelanguage.googleapis.com".to_string()),
            api_key: api_key.into(),
            http: HttpClient::new(),
        }
    }

    fn upload_start_endpoint(&self) -> String {
        format!("{}/upload/v1beta/files", self.api_base)
    }

    fn resource_endpoint(&self, name: &str) -> String {
        format!("{}/v1beta/{}", self.api_base, name.trim_start_matches('/'))
    }

    fn generate_endpoint(&self, model: &str) -> String {
        let trimmed = model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!("{}/v1beta/{}:generateContent", self.api_base, model_path)
    }

    fn asset_from_file_payload(payload: &Value) -> Result<RemoteAsset> {
        let file = payload.get("file").unwrap_or(payload);
        let name = file
            .get("name")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| anyhow::anyhow!("Gemini file payload missing resource name"))?;
        let uri = file
            .get("uri")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(name);
        let state = file
            .get("state")
            .and_then(Value::as_str)
            .map(AssetState::from_remote)
            .unwrap_or(AssetState::Processing);
        let mime_type = file
            .get("mimeType")
            .or_else(|| file.get("mime_type"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Ok(RemoteAsset {
            name: name.to_string(),
            uri: uri.to_string(),
            state,
            mime_type,
        })
    }
}

impl RemoteInference for GeminiService {
    fn upload_asset(&self, media: &StagedMedia) -> Result<RemoteAsset> {
        let bytes = fs::read(media.path())
            .with_context(|| format!("failed reading staged media {}", media.path().display()))?;
        let endpoint = self.upload_start_endpoint();
        let start = self
            .http
            .post(&endpoint)
            .query(&[("key", self.api_key.as_str())])
            .header("X-Goog-Upload-Protocol", "resumable")
            .header("X-Goog-Upload-Command", "start")
            .header("X-Goog-Upload-Header-Content-Length", bytes.len().to_string())
            .header("X-Goog-Upload-Header-Content-Type", media.mime_type())
            .timeout(Duration::from_secs(UPLOAD_TIMEOUT_SECS))
            .json(&json!({ "file": { "display_name": media.declared_name() } }))
            .send()
            .with_context(|| format!("Gemini upload start failed ({endpoint})"))?;
        if !start.status().is_success() {
            let code = start.status().as_u16();
            let body = start.text().unwrap_or_default();
            bail!(
                "Gemini upload start failed ({code}): {}",
                truncate_text(&body, 512)
            );
        }
        let session_url = start
            .headers()
            .get("x-goog-upload-url")
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| anyhow::anyhow!("Gemini upload start missing X-Goog-Upload-URL header"))?
            .to_string();

        let response = self
            .http
            .post(&session_url)
            .header("X-Goog-Upload-Command", "upload, finalize")
            .header("X-Goog-Upload-Offset", "0")
            .header(CONTENT_TYPE, media.mime_type())
            .timeout(Duration::from_secs(UPLOAD_TIMEOUT_SECS))
            .body(bytes)
            .send()
            .context("Gemini upload finalize failed")?;
        let payload = response_json_or_error("Gemini upload", response)?;
        Self::asset_from_file_payload(&payload)
    }

    fn asset_status(&self, name: &str) -> Result<RemoteAsset> {
        let endpoint = self.resource_endpoint(name);
        let response = self
            .http
            .get(&endpoint)
            .query(&[("key", self.api_key.as_str())])
            .send()
            .with_context(|| format!("Gemini file status request failed ({endpoint})"))?;
        let payload = response_json_or_error("Gemini file status", response)?;
        Self::asset_from_file_payload(&payload)
    }

    fn delete_asset(&self, name: &str) -> Result<()> {
        let endpoint = self.resource_endpoint(name);
        let response = self
            .http
            .delete(&endpoint)
            .query(&[("key", self.api_key.as_str())])
            .send()
            .with_context(|| format!("Gemini file delete request failed ({endpoint})"))?;
        if !response.status().is_success() {
            bail!("Gemini file delete failed ({})", response.status().as_u16());
        }
        Ok(())
    }

    fn generate(&self, model: &str, asset: Option<&RemoteAsset>, prompt: &str) -> Result<String> {
        let endpoint = self.generate_endpoint(model);
        let mut parts = Vec::new();
        if let Some(asset) = asset {
            parts.push(json!({
                "fileData": {
                    "fileUri": asset.uri,
                    "mimeType": asset.mime_type,
                }
            }));
        }
        parts.push(json!({ "text": prompt }));
        let payload = json!({
            "contents": [{
                "role": "user",
                "parts": parts,
            }],
            "generationConfig": {
                "responseMimeType": "application/json",
            },
        });
        let response = self
            .http
            .post(&endpoint)
            .query(&[("key", self.api_key.as_str())])
            .timeout(Duration::from_secs(GENERATE_TIMEOUT_SECS))
            .json(&payload)
            .send()
            .with_context(|| format!("Gemini generate request failed ({endpoint})"))?;
        let payload = response_json_or_error("Gemini generate", response)?;
        extract_reply_text(&payload)
    }
}

fn extract_reply_text(payload: &Value) -> Result<String> {
    let parts = payload
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|rows| rows.first())
        .and_then(|candidate| candidate.get("content"))
        .and_then(|content| content.get("parts"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let mut out = String::new();
    for part in parts {
        if let Some(text) = part.get("text").and_then(Value::as_str) {
            out.push_str(text);
        }
    }
    if out.trim().is_empty() {
        bail!("Gemini reply contained no text parts");
    }
    Ok(out)
}

/// Offline stand-in for the remote service: assets are ready immediately
/// and replies are canned per task. Used by tests and the CLI dry-run path.
pub struct DryrunService;

impl RemoteInference for DryrunService {
    fn upload_asset(&self, media: &StagedMedia) -> Result<RemoteAsset> {
        Ok(RemoteAsset {
            name: "files/dryrun".to_string(),
            uri: "dryrun://asset".to_string(),
            state: AssetState::Ready,
            mime_type: media.mime_type().to_string(),
        })
    }

    fn asset_status(&self, name: &str) -> Result<RemoteAsset> {
        Ok(RemoteAsset {
            name: name.to_string(),
            uri: "dryrun://asset".to_string(),
            state: AssetState::Ready,
            mime_type: String::new(),
        })
    }

    fn delete_asset(&self, _name: &str) -> Result<()> {
        Ok(())
    }

    fn generate(&self, _model: &str, _asset: Option<&RemoteAsset>, prompt: &str) -> Result<String> {
        let body = if prompt.contains("\"mood\"") {
            json!({
                "mood": "content",
                "translation": "I am comfortable and in charge here.",
                "energy_score": 6,
                "advice": "Keep the current play routine.",
            })
        } else if prompt.contains("\"rating\"") {
            json!({
                "rating": 7,
                "highlights": ["named meat listed first"],
                "concerns": ["unspecified meat meal"],
                "advice": "Rotate in a higher-protein formula.",
            })
        } else {
            json!({
                "daily_calories_kcal": 320,
                "daily_water_ml": 260,
                "meal_plan": ["08:00 wet food 85 g", "19:00 kibble 30 g"],
                "tips": ["Weigh portions with a kitchen scale."],
            })
        };
        Ok(body.to_string())
    }
}

/// Uploads staged media and waits for the remote side to finish
/// preprocessing. No retry here: a transport failure ends the call, and the
/// poll loop is bounded by the policy deadline.
fn ingest(
    service: &dyn RemoteInference,
    media: &StagedMedia,
    policy: PollPolicy,
    events: Option<&EventWriter>,
) -> Result<RemoteAsset, PipelineError> {
    let mut asset = service.upload_asset(media).map_err(PipelineError::Upload)?;
    emit(
        events,
        "asset_uploaded",
        payload(json!({ "asset": asset.name, "state": format!("{:?}", asset.state) })),
    );
    let started = Instant::now();
    loop {
        match asset.state {
            AssetState::Ready => {
                emit(events, "asset_ready", payload(json!({ "asset": asset.name })));
                return Ok(asset);
            }
            AssetState::Failed => {
                return Err(PipelineError::Processing {
                    asset: asset.name,
                    reason: "remote preprocessing reported state FAILED".to_string(),
                });
            }
            AssetState::Processing => {
                if started.elapsed() >= policy.deadline {
                    return Err(PipelineError::Processing {
                        asset: asset.name,
                        reason: format!(
                            "not ready within the {:.0}s poll deadline",
                            policy.deadline.as_secs_f64()
                        ),
                    });
                }
                thread::sleep(policy.interval);
                asset = service.asset_status(&asset.name).map_err(|err| {
                    PipelineError::Processing {
                        asset: asset.name.clone(),
                        reason: format!("status poll failed: {err:#}"),
                    }
                })?;
            }
        }
    }
}

/// Removes fenced code-block delimiters line-wise, leaving interior lines
/// untouched. Idempotent on unfenced input.
pub fn strip_code_fences(raw: &str) -> String {
    let trimmed = raw.trim();
    if !trimmed.starts_with("```") {
        return trimmed.to_string();
    }
    let mut lines: Vec<&str> = trimmed.lines().collect();
    lines.remove(0);
    if lines
        .last()
        .map(|line| line.trim() == "```")
        .unwrap_or(false)
    {
        lines.pop();
    }
    lines.join("\n").trim().to_string()
}

/// Parses a raw model reply into a single record. A list-wrapped reply
/// collapses to its first element: the model is instructed to return one
/// object but occasionally wraps it in a one-element array. Field presence
/// is not validated here; absent fields read back as display defaults.
pub fn normalize_reply(task: AnalysisTask, raw: &str) -> Result<AnalysisRecord> {
    let cleaned = strip_code_fences(raw);
    let parsed: Value = serde_json::from_str(&cleaned).context("model reply is not valid JSON")?;
    let record_value = match parsed {
        Value::Array(rows) => rows
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("model reply was an empty list"))?,
        other => other,
    };
    let Value::Object(fields) = record_value else {
        bail!("model reply was not a JSON object");
    };
    Ok(AnalysisRecord::new(task, fields))
}

enum AttemptError {
    Invoke(anyhow::Error),
    Parse(anyhow::Error),
}

impl AttemptError {
    fn text(&self) -> String {
        match self {
            AttemptError::Invoke(err) | AttemptError::Parse(err) => format!("{err:#}"),
        }
    }
}

/// Walks the candidate list in configured order and returns the first
/// normalized record. Every per-candidate failure, transport or parse, is
/// recorded and the loop advances; only the final candidate's parse failure
/// is surfaced distinctly, since no later candidate can mask it.
fn run_cascade(
    service: &dyn RemoteInference,
    spec: &TaskSpec,
    asset: Option<&RemoteAsset>,
    prompt: &str,
    events: Option<&EventWriter>,
) -> Result<(String, AnalysisRecord), PipelineError> {
    let mut last: Option<AttemptError> = None;
    let mut attempts = 0usize;
    for model in &spec.candidates {
        attempts += 1;
        emit(events, "model_attempt", payload(json!({ "model": model })));
        let outcome = service
            .generate(model, asset, prompt)
            .with_context(|| format!("candidate '{model}' failed"))
            .map_err(AttemptError::Invoke)
            .and_then(|raw| {
                normalize_reply(spec.task, &raw)
                    .with_context(|| format!("candidate '{model}' returned an unusable reply"))
                    .map_err(AttemptError::Parse)
            });
        match outcome {
            Ok(record) => {
                emit(events, "model_selected", payload(json!({ "model": model })));
                return Ok((model.clone(), record));
            }
            Err(err) => {
                emit(
                    events,
                    "model_attempt_failed",
                    payload(json!({ "model": model, "error": err.text() })),
                );
                last = Some(err);
            }
        }
    }
    match last {
        Some(AttemptError::Parse(err)) => Err(PipelineError::Malformed(err)),
        Some(AttemptError::Invoke(err)) => Err(PipelineError::Exhausted { attempts, last: err }),
        None => Err(PipelineError::Exhausted {
            attempts: 0,
            last: anyhow::anyhow!("no candidate models configured"),
        }),
    }
}

/// Input to one analysis call: media bytes for the vision tasks, a pet
/// profile for the feeding-plan task.
pub enum AnalysisInput {
    Media {
        bytes: Vec<u8>,
        declared_name: String,
    },
    Profile(PetProfile),
}

#[derive(Debug, Clone)]
pub struct AnalysisOutcome {
    pub record: AnalysisRecord,
    pub model: String,
    pub asset: Option<String>,
}

/// Composes staging, ingestion, the model cascade and normalization into
/// one blocking call per analysis. The staged backing file is released on
/// every exit path; the remote asset is deleted best-effort after the
/// cascade regardless of its outcome.
pub struct AnalysisEngine {
    service: Box<dyn RemoteInference>,
    registry: TaskRegistry,
    events: Option<EventWriter>,
}

impl AnalysisEngine {
    pub fn new(
        service: Box<dyn RemoteInference>,
        registry: TaskRegistry,
        events: Option<EventWriter>,
    ) -> Self {
        Self {
            service,
            registry,
            events,
        }
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut TaskRegistry {
        &mut self.registry
    }

    pub fn analyze(
        &self,
        task: AnalysisTask,
        input: AnalysisInput,
    ) -> Result<AnalysisOutcome, PipelineError> {
        let spec = self
            .registry
            .get(task)
            .ok_or_else(|| PipelineError::Input(format!("no task spec registered for {task}")))?;
        emit(
            self.events.as_ref(),
            "analysis_started",
            payload(json!({ "task": task.as_str() })),
        );
        let result = self.run(spec, input);
        match &result {
            Ok(outcome) => emit(
                self.events.as_ref(),
                "analysis_completed",
                payload(json!({ "task": task.as_str(), "model": outcome.model })),
            ),
            Err(err) => emit(
                self.events.as_ref(),
                "analysis_failed",
                payload(json!({
                    "task": task.as_str(),
                    "kind": err.kind(),
                    "error": err.to_string(),
                })),
            ),
        }
        result
    }

    fn run(&self, spec: &TaskSpec, input: AnalysisInput) -> Result<AnalysisOutcome, PipelineError> {
        match spec.media {
            None => {
                let AnalysisInput::Profile(profile) = input else {
                    return Err(PipelineError::Input(format!(
                        "{} takes a pet profile, not media",
                        spec.task
                    )));
                };
                let prompt = prompt_for(spec.task, Some(&profile));
                let (model, record) = run_cascade(
                    self.service.as_ref(),
                    spec,
                    None,
                    &prompt,
                    self.events.as_ref(),
                )?;
                Ok(AnalysisOutcome {
                    record,
                    model,
                    asset: None,
                })
            }
            Some(kind) => {
                let AnalysisInput::Media {
                    bytes,
                    declared_name,
                } = input
                else {
                    return Err(PipelineError::Input(format!(
                        "{} takes media bytes, not a pet profile",
                        spec.task
                    )));
                };
                let staged = stage(&bytes, &declared_name, kind)?;
                emit(
                    self.events.as_ref(),
                    "media_staged",
                    payload(json!({
                        "path": staged.path().display().to_string(),
                        "mime_type": staged.mime_type(),
                        "bytes": staged.byte_len(),
                    })),
                );
                // `staged` drops here on success and on every error path,
                // releasing the backing file exactly once.
                self.run_media(spec, &staged)
            }
        }
    }

    fn run_media(
        &self,
        spec: &TaskSpec,
        staged: &StagedMedia,
    ) -> Result<AnalysisOutcome, PipelineError> {
        let asset = ingest(self.service.as_ref(), staged, spec.poll, self.events.as_ref())?;
        let prompt = prompt_for(spec.task, None);
        let result = run_cascade(
            self.service.as_ref(),
            spec,
            Some(&asset),
            &prompt,
            self.events.as_ref(),
        );
        // Remote cleanup is best-effort; the server expires files on its own.
        let _ = self.service.delete_asset(&asset.name);
        let (model, record) = result?;
        Ok(AnalysisOutcome {
            record,
            model,
            asset: Some(asset.name),
        })
    }
}

// Observability must never abort an analysis, so emission failures are
// swallowed here.
fn emit(events: Option<&EventWriter>, event_type: &str, payload: EventPayload) {
    if let Some(writer) = events {
        let _ = writer.emit(event_type, payload);
    }
}

fn payload(value: Value) -> EventPayload {
    value.as_object().cloned().unwrap_or_default()
}

fn response_json_or_error(label: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{label} response body read failed"))?;
    if !status.is_success() {
        bail!(
            "{label} request failed ({code}): {}",
            truncate_text(&body, 512)
        );
    }
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{label} returned invalid JSON payload"))?;
    Ok(parsed)
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}
