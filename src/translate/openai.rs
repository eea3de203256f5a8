//! OpenAI Chat Completions wire shape.

use serde::{Deserialize, Serialize};

use crate::types::{is_allowed_inline_mime, Message, Part, Role};

use super::native::{NativeCandidate, NativeContent, NativeGenerateResponse, NativePart};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiChatRequest {
    pub model: String,
    pub messages: Vec<OpenAiMessage>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiMessage {
    pub role: String,
    pub content: OpenAiContent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OpenAiContent {
    Text(String),
    Parts(Vec<OpenAiContentPart>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OpenAiContentPart {
    Text { text: String },
    ImageUrl { image_url: OpenAiImageUrl },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiImageUrl {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiChatResponse {
    pub id: String,
    pub object: &'static str,
    pub model: String,
    pub choices: Vec<OpenAiChoice>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiChoice {
    pub index: u32,
    pub message: OpenAiResponseMessage,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiResponseMessage {
    pub role: &'static str,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiStreamChunk {
    pub id: String,
    pub object: &'static str,
    pub model: String,
    pub choices: Vec<OpenAiStreamChoice>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiStreamChoice {
    pub index: u32,
    pub delta: OpenAiDelta,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OpenAiDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// Flatten a `system` message into the first user turn, since the internal
/// model has no `System` role, and parse `data:` image URLs into inline
/// parts.
pub fn to_internal(req: OpenAiChatRequest) -> anyhow::Result<super::ParsedRequest> {
    let mut system_preamble = String::new();
    let mut turns = Vec::new();

    for msg in req.messages {
        let parts = content_to_parts(msg.content)?;
        match msg.role.as_str() {
            "system" => {
                for part in &parts {
                    if let Part::Text(t) = part {
                        if !system_preamble.is_empty() {
                            system_preamble.push('\n');
                        }
                        system_preamble.push_str(t);
                    }
                }
            }
            "assistant" => turns.push(Message { role: Role::Model, parts }),
            _ => turns.push(Message { role: Role::User, parts }),
        }
    }

    if !system_preamble.is_empty() {
        match turns.first_mut() {
            Some(first) if first.role == Role::User => {
                first.parts.insert(0, Part::text(system_preamble));
            }
            _ => turns.insert(0, Message::user(system_preamble)),
        }
    }

    Ok(super::ParsedRequest {
        model: req.model,
        turns,
        max_output_tokens: req.max_tokens,
        temperature: req.temperature,
        top_p: req.top_p,
        stream: req.stream,
    })
}

fn content_to_parts(content: OpenAiContent) -> anyhow::Result<Vec<Part>> {
    match content {
        OpenAiContent::Text(text) => Ok(vec![Part::text(text)]),
        OpenAiContent::Parts(parts) => parts
            .into_iter()
            .map(|p| match p {
                OpenAiContentPart::Text { text } => Ok(Part::text(text)),
                OpenAiContentPart::ImageUrl { image_url } => parse_data_url(&image_url.url),
            })
            .collect(),
    }
}

/// Parse a `data:<mime>;base64,<data>` URL into an inline part, rejecting
/// unsupported mime types.
fn parse_data_url(url: &str) -> anyhow::Result<Part> {
    let rest = url
        .strip_prefix("data:")
        .ok_or_else(|| anyhow::anyhow!("image_url must be a data: URL"))?;
    let (header, data) = rest
        .split_once(',')
        .ok_or_else(|| anyhow::anyhow!("malformed data URL"))?;
    let mime_type = header
        .strip_suffix(";base64")
        .ok_or_else(|| anyhow::anyhow!("only base64 data URLs are supported"))?
        .to_string();
    if !is_allowed_inline_mime(&mime_type) {
        anyhow::bail!("unsupported inline mime type: {mime_type}");
    }
    Ok(Part::InlineData {
        mime_type,
        data: data.to_string(),
    })
}

/// Wrap a native reply into an OpenAI chat completion, synthesizing an
/// empty assistant message if the upstream returned no candidates at all —
/// some clients choke on a missing `message` field entirely.
pub fn from_native(model: &str, reply: &NativeGenerateResponse) -> OpenAiChatResponse {
    let choices = if reply.candidates.is_empty() {
        vec![OpenAiChoice {
            index: 0,
            message: OpenAiResponseMessage {
                role: "assistant",
                content: String::new(),
            },
            finish_reason: Some("stop".to_string()),
        }]
    } else {
        reply
            .candidates
            .iter()
            .enumerate()
            .map(|(i, candidate)| OpenAiChoice {
                index: i as u32,
                message: OpenAiResponseMessage {
                    role: "assistant",
                    content: candidate_text(&candidate.content),
                },
                finish_reason: candidate.finish_reason.clone(),
            })
            .collect()
    };

    OpenAiChatResponse {
        id: format!("chatcmpl-{}", uuid::Uuid::new_v4()),
        object: "chat.completion",
        model: model.to_string(),
        choices,
    }
}

fn candidate_text(content: &NativeContent) -> String {
    content
        .parts
        .iter()
        .filter_map(|p| match p {
            NativePart::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("")
}

/// Translate one native streaming event into an OpenAI `chat.completion.chunk`.
pub fn chunk_from_native(
    model: &str,
    event: &NativeGenerateResponse,
    chunk_index: u64,
) -> OpenAiStreamChunk {
    let candidate = event.candidates.first();
    let delta = OpenAiDelta {
        role: if chunk_index == 0 { Some("assistant") } else { None },
        content: candidate.map(|c| candidate_text(&c.content)),
    };
    let finish_reason = candidate.and_then(|c| c.finish_reason.clone());

    OpenAiStreamChunk {
        id: format!("chatcmpl-{}", uuid::Uuid::new_v4()),
        object: "chat.completion.chunk",
        model: model.to_string(),
        choices: vec![OpenAiStreamChoice {
            index: 0,
            delta,
            finish_reason,
        }],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_message_prepends_to_first_user_turn() {
        let req = OpenAiChatRequest {
            model: "m".to_string(),
            messages: vec![
                OpenAiMessage {
                    role: "system".to_string(),
                    content: OpenAiContent::Text("be terse".to_string()),
                },
                OpenAiMessage {
                    role: "user".to_string(),
                    content: OpenAiContent::Text("hi".to_string()),
                },
            ],
            max_tokens: None,
            temperature: None,
            top_p: None,
            stream: false,
        };
        let parsed = to_internal(req).unwrap();
        assert_eq!(parsed.turns.len(), 1);
        assert_eq!(parsed.turns[0].parts.len(), 2);
    }

    #[test]
    fn data_url_parses_allowed_mime_type() {
        let part = parse_data_url("data:image/png;base64,aGVsbG8=").unwrap();
        assert!(matches!(part, Part::InlineData { mime_type, .. } if mime_type == "image/png"));
    }

    #[test]
    fn data_url_rejects_disallowed_mime_type() {
        assert!(parse_data_url("data:application/pdf;base64,aGVsbG8=").is_err());
    }

    #[test]
    fn empty_candidates_synthesize_empty_assistant_message() {
        let reply = NativeGenerateResponse { candidates: vec![] };
        let resp = from_native("m", &reply);
        assert_eq!(resp.choices.len(), 1);
        assert_eq!(resp.choices[0].message.content, "");
    }
}
