//! Room control endpoints: text injection, speech, questions, permissions.

use std::sync::Arc;

use axum::{
    extract::{Multipart, Path as AxumPath, State},
    Json,
};
use base64::Engine;
use uuid::Uuid;

use crate::audit::AuditEvent;
use crate::error::{PortalError, Result};
use crate::hub::ServerMessage;
use crate::permission::{policy_decide, Decision, PermissionRequest};
use crate::question::Question;
use crate::registry::PermissionMode;

use super::routes::AppState;
use super::types::*;
use super::resolve_room;

/// Raw audio bytes per base64 `audio` frame.
const AUDIO_CHUNK: usize = 48 * 1024;

/// POST /send/{name} - Deliver text to the room's agent as keystrokes.
pub async fn send(
    State(state): State<Arc<AppState>>,
    AxumPath(name): AxumPath<String>,
    Json(req): Json<SendRequest>,
) -> Result<Json<SuccessResponse>> {
    let (room, _channel) = resolve_room(&state, &name).await?;
    state
        .mux
        .send_keys(&room.id.host, &room.id.session_name(), &req.text)
        .await?;
    Ok(Json(SuccessResponse::ok()))
}

/// POST /api/say/{name} - Synthesize text and stream audio frames to the
/// room's subscribers.
pub async fn say(
    State(state): State<Arc<AppState>>,
    AxumPath(name): AxumPath<String>,
    Json(req): Json<SayRequest>,
) -> Result<Json<SuccessResponse>> {
    let (room, channel) = resolve_room(&state, &name).await?;
    let voice = req
        .voice
        .or(room.voice)
        .unwrap_or_else(|| "default".to_string());

    channel.broadcast(&ServerMessage::TtsStart {
        text: req.text.clone(),
    });
    let wav = state.speech.synthesize(&req.text, &voice).await?;

    let encoder = base64::engine::general_purpose::STANDARD;
    for chunk in wav.chunks(AUDIO_CHUNK) {
        channel.broadcast(&ServerMessage::Audio {
            data: encoder.encode(chunk),
        });
    }
    state.hub.touch_activity(&room.id.canonical()).await;
    Ok(Json(SuccessResponse::ok()))
}

/// How an answer reaches the pane.
#[derive(Debug, PartialEq, Eq)]
enum AnswerKeys {
    /// Paced key groups composing one submission (free-text flow: select the
    /// type-something option, then the text), then a single Enter.
    Groups(Vec<String>),
    /// One text through the keystroke contract, which submits on its own.
    Text(String),
}

/// Translate an answer request against the pending question into keystrokes.
fn plan_answer(question: &Question, req: &AnswerRequest) -> Result<AnswerKeys> {
    if req.custom {
        let free = question
            .options
            .iter()
            .find(|o| o.free_text)
            .ok_or_else(|| {
                PortalError::Conflict("question has no free-text option".to_string())
            })?;
        let text = req.answer.clone().unwrap_or_default();
        return Ok(AnswerKeys::Groups(vec![free.number.clone(), text]));
    }
    if let Some(number) = &req.option_number {
        return Ok(AnswerKeys::Text(number.clone()));
    }
    if let Some(answer) = &req.answer {
        return Ok(AnswerKeys::Text(answer.clone()));
    }
    Err(PortalError::Conflict(
        "answer or option_number required".to_string(),
    ))
}

/// POST /api/answer/{name} - Answer the pending question.
pub async fn answer(
    State(state): State<Arc<AppState>>,
    AxumPath(name): AxumPath<String>,
    Json(req): Json<AnswerRequest>,
) -> Result<Json<SuccessResponse>> {
    let (room, channel) = resolve_room(&state, &name).await?;
    let question = channel
        .current_question()
        .await
        .ok_or_else(|| PortalError::NotFound(format!("no pending question in '{}'", name)))?;

    let keys = plan_answer(&question, &req)?;
    channel.take_question().await;

    let session = room.id.session_name();
    match keys {
        AnswerKeys::Groups(groups) => {
            state
                .mux
                .send_key_groups(&room.id.host, &session, &groups)
                .await?;
            state.mux.press_enter(&room.id.host, &session).await?;
        }
        AnswerKeys::Text(text) => {
            state.mux.send_keys(&room.id.host, &session, &text).await?;
        }
    }
    Ok(Json(SuccessResponse::ok()))
}

/// POST /api/permission/{name} - Agent hook entry point; blocks until a
/// decision, a policy verdict, or the deadline.
pub async fn permission_hook(
    State(state): State<Arc<AppState>>,
    AxumPath(name): AxumPath<String>,
    Json(req): Json<PermissionHookRequest>,
) -> Result<Json<Decision>> {
    let (room, channel) = resolve_room(&state, &name).await?;
    let key = room.id.canonical();

    // Restricted rooms never surface requests to browsers.
    if room.mode == PermissionMode::Restricted {
        let decision = policy_decide(&req.tool_name, &req.tool_input);
        state
            .audit
            .record(AuditEvent::PermissionDecision {
                session: key,
                tool: req.tool_name,
                decision: decision_label(&decision),
                by_policy: true,
            })
            .await;
        return Ok(Json(decision));
    }

    let request = PermissionRequest {
        id: Uuid::new_v4(),
        tool: req.tool_name.clone(),
        input: req.tool_input.clone(),
        message: req.message.clone(),
    };
    let rx = state.permissions.register(&key, &request).await?;
    channel.set_permission(request.clone()).await;

    let deadline = state.permissions.deadline();
    let decision = match tokio::time::timeout(deadline, rx).await {
        Ok(Ok(decision)) => decision,
        // The sender vanished: the room was destroyed underneath us.
        Ok(Err(_)) => Decision::deny("session closed"),
        Err(_) => {
            if state.permissions.expire(&key, request.id).await {
                channel.resolve_permission().await;
            }
            Decision::deny("timeout")
        }
    };

    state
        .audit
        .record(AuditEvent::PermissionDecision {
            session: key,
            tool: req.tool_name,
            decision: decision_label(&decision),
            by_policy: false,
        })
        .await;
    Ok(Json(decision))
}

/// POST /api/permission/{name}/respond - Browser decision for the pending
/// request.
pub async fn permission_respond(
    State(state): State<Arc<AppState>>,
    AxumPath(name): AxumPath<String>,
    Json(req): Json<PermissionRespondRequest>,
) -> Result<Json<SuccessResponse>> {
    let (room, channel) = resolve_room(&state, &name).await?;
    let key = room.id.canonical();
    state
        .permissions
        .respond(
            &key,
            Decision {
                decision: req.decision,
                message: req.message,
            },
        )
        .await?;
    channel.resolve_permission().await;
    Ok(Json(SuccessResponse::ok()))
}

fn decision_label(decision: &Decision) -> String {
    serde_json::to_value(decision.decision)
        .ok()
        .and_then(|v| v.as_str().map(String::from))
        .unwrap_or_else(|| "deny".to_string())
}

/// POST /transcribe - Multipart audio in, text out.
pub async fn transcribe(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<TranscribeResponse>> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| PortalError::Internal(format!("multipart: {}", e)))?
    {
        if field.name() != Some("audio") {
            continue;
        }
        let mime = field
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();
        let data = field
            .bytes()
            .await
            .map_err(|e| PortalError::Internal(format!("multipart read: {}", e)))?;
        let text = state.speech.transcribe(&data, &mime).await?;
        return Ok(Json(TranscribeResponse { text }));
    }
    Err(PortalError::Conflict("missing 'audio' field".to_string()))
}

/// GET /api/voices - Cached voice list from the speech engines, plus any
/// uploaded samples.
pub async fn voices(State(state): State<Arc<AppState>>) -> Result<Json<Vec<String>>> {
    let mut voices = state.speech.voices().await?;
    if let Ok(mut entries) = tokio::fs::read_dir(state.config.uploads_dir()).await {
        while let Ok(Some(entry)) = entries.next_entry().await {
            if let Some(stem) = entry.path().file_stem().and_then(|s| s.to_str()) {
                if !voices.iter().any(|v| v == stem) {
                    voices.push(stem.to_string());
                }
            }
        }
    }
    Ok(Json(voices))
}

/// POST /api/voices/upload - Store a user voice sample in the upload
/// directory. Registration with the engine stays external.
pub async fn upload_voice(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<SuccessResponse>> {
    let mut name: Option<String> = None;
    let mut audio: Option<Vec<u8>> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| PortalError::Internal(format!("multipart: {}", e)))?
    {
        match field.name() {
            Some("name") => {
                name = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| PortalError::Internal(format!("multipart read: {}", e)))?,
                );
            }
            Some("audio") => {
                audio = Some(
                    field
                        .bytes()
                        .await
                        .map_err(|e| PortalError::Internal(format!("multipart read: {}", e)))?
                        .to_vec(),
                );
            }
            _ => {}
        }
    }

    let name = name.ok_or_else(|| PortalError::Conflict("missing 'name' field".to_string()))?;
    let audio = audio.ok_or_else(|| PortalError::Conflict("missing 'audio' field".to_string()))?;
    if name.is_empty() || name.contains(['/', '\\', '.']) {
        return Err(PortalError::BadName(name));
    }

    let path = state.config.uploads_dir().join(format!("{}.wav", name));
    tokio::fs::write(&path, &audio).await?;
    tracing::info!("stored voice sample '{}' ({} bytes)", name, audio.len());
    Ok(Json(SuccessResponse::with_message(
        path.to_string_lossy().to_string(),
    )))
}

/// GET /api/machines - Configured remote machines.
pub async fn machines(State(state): State<Arc<AppState>>) -> Json<Vec<MachineInfo>> {
    let mut machines: Vec<MachineInfo> = state
        .config
        .machines
        .iter()
        .map(|(id, m)| MachineInfo {
            id: id.clone(),
            ssh: m.ssh.clone(),
        })
        .collect();
    machines.sort_by(|a, b| a.id.cmp(&b.id));
    Json(machines)
}

/// GET /api/tunnels - Forward health.
pub async fn tunnels(
    State(state): State<Arc<AppState>>,
) -> Json<Vec<crate::tunnel::TunnelStatus>> {
    Json(state.tunnels.status().await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::question::parse_question;

    fn request(
        answer: Option<&str>,
        option_number: Option<&str>,
        custom: bool,
    ) -> AnswerRequest {
        AnswerRequest {
            answer: answer.map(String::from),
            option_number: option_number.map(String::from),
            custom,
        }
    }

    #[test]
    fn plain_answer_goes_through_the_keystroke_contract() {
        let q = parse_question("☐ Pick\n\nWhich?\n\n1. a\n2. b\n").unwrap();
        assert_eq!(
            plan_answer(&q, &request(Some("2"), None, false)).unwrap(),
            AnswerKeys::Text("2".to_string())
        );
        // An explicit option number wins over the answer text.
        assert_eq!(
            plan_answer(&q, &request(Some("b"), Some("1"), false)).unwrap(),
            AnswerKeys::Text("1".to_string())
        );
    }

    #[test]
    fn free_text_answer_uses_key_groups() {
        let q =
            parse_question("☐ Pick\n\nWhich?\n\n1. a\n2. b\n3. type something\n").unwrap();
        assert_eq!(
            plan_answer(&q, &request(Some("use tabs"), None, true)).unwrap(),
            AnswerKeys::Groups(vec!["3".to_string(), "use tabs".to_string()])
        );
    }

    #[test]
    fn custom_without_free_text_option_conflicts() {
        let q = parse_question("☐ Pick\n\nWhich?\n\n1. a\n2. b\n").unwrap();
        let err = plan_answer(&q, &request(Some("x"), None, true)).unwrap_err();
        assert_eq!(err.kind(), "Conflict");
    }

    #[test]
    fn empty_answer_conflicts() {
        let q = parse_question("☐ Pick\n\nWhich?\n\n1. a\n").unwrap();
        let err = plan_answer(&q, &request(None, None, false)).unwrap_err();
        assert_eq!(err.kind(), "Conflict");
    }
}
