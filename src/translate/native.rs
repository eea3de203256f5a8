//! Native generateContent wire shape.

use serde::{Deserialize, Serialize};

use crate::types::{is_allowed_inline_mime, Message, Part, Role};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NativeGenerateRequest {
    pub contents: Vec<NativeContent>,
    #[serde(default)]
    pub generation_config: Option<NativeGenerationConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NativeContent {
    pub role: String,
    pub parts: Vec<NativePart>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NativePart {
    Text {
        text: String,
    },
    InlineData {
        #[serde(rename = "inline_data")]
        inline_data: NativeInlineData,
    },
    FunctionCall {
        #[serde(rename = "functionCall")]
        function_call: NativeFunctionCall,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NativeInlineData {
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NativeFunctionCall {
    pub name: String,
    pub args: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NativeGenerationConfig {
    #[serde(default)]
    pub max_output_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NativeGenerateResponse {
    pub candidates: Vec<NativeCandidate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NativeCandidate {
    pub content: NativeContent,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

pub fn to_internal(req: NativeGenerateRequest) -> anyhow::Result<super::ParsedRequest> {
    let mut turns = Vec::with_capacity(req.contents.len());
    for content in req.contents {
        let role = match content.role.as_str() {
            "model" => Role::Model,
            _ => Role::User,
        };
        let mut parts = Vec::with_capacity(content.parts.len());
        for part in content.parts {
            match part {
                NativePart::Text { text } => parts.push(Part::Text(text)),
                NativePart::InlineData { inline_data } => {
                    if !is_allowed_inline_mime(&inline_data.mime_type) {
                        anyhow::bail!("unsupported inline mime type: {}", inline_data.mime_type);
                    }
                    parts.push(Part::InlineData {
                        mime_type: inline_data.mime_type,
                        data: inline_data.data,
                    });
                }
                NativePart::FunctionCall { function_call } => {
                    parts.push(Part::Text(serde_json::to_string(&function_call)?));
                }
            }
        }
        turns.push(Message { role, parts });
    }

    let config = req.generation_config.unwrap_or_default();
    Ok(super::ParsedRequest {
        model: String::new(),
        turns,
        max_output_tokens: config.max_output_tokens,
        temperature: config.temperature,
        top_p: config.top_p,
        stream: false,
    })
}

/// Compensate for a known upstream omission: a `write_to_file`-style tool
/// call that arrives without the required `line_count` argument. Computes
/// it from the call's own `content` argument rather than failing the call.
/// Walk every candidate's parts and apply [`inject_missing_line_count`] to
/// any function call found. Applied to every reply before it's rendered
/// back to the caller, in both wire formats.
pub fn compensate_function_calls(reply: &mut NativeGenerateResponse) {
    for candidate in &mut reply.candidates {
        for part in &mut candidate.content.parts {
            if let NativePart::FunctionCall { function_call } = part {
                inject_missing_line_count(function_call);
            }
        }
    }
}

pub fn inject_missing_line_count(call: &mut NativeFunctionCall) {
    if call.name != "write_to_file" {
        return;
    }
    if call.args.contains_key("line_count") {
        return;
    }
    if let Some(serde_json::Value::String(content)) = call.args.get("content") {
        let line_count = content.lines().count().max(1);
        call.args
            .insert("line_count".to_string(), serde_json::Value::from(line_count));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn injects_line_count_from_content_length() {
        let mut call = NativeFunctionCall {
            name: "write_to_file".to_string(),
            args: serde_json::Map::new(),
        };
        call.args.insert(
            "content".to_string(),
            serde_json::Value::String("a\nb\nc".to_string()),
        );
        inject_missing_line_count(&mut call);
        assert_eq!(call.args.get("line_count").and_then(|v| v.as_u64()), Some(3));
    }

    #[test]
    fn does_not_overwrite_existing_line_count() {
        let mut call = NativeFunctionCall {
            name: "write_to_file".to_string(),
            args: serde_json::Map::new(),
        };
        call.args.insert("line_count".to_string(), serde_json::Value::from(99));
        call.args.insert(
            "content".to_string(),
            serde_json::Value::String("a\nb".to_string()),
        );
        inject_missing_line_count(&mut call);
        assert_eq!(call.args.get("line_count").and_then(|v| v.as_u64()), Some(99));
    }

    #[test]
    fn compensate_function_calls_walks_every_candidate() {
        let mut call = NativeFunctionCall {
            name: "write_to_file".to_string(),
            args: serde_json::Map::new(),
        };
        call.args.insert(
            "content".to_string(),
            serde_json::Value::String("one\ntwo".to_string()),
        );
        let mut reply = NativeGenerateResponse {
            candidates: vec![NativeCandidate {
                content: NativeContent {
                    role: "model".to_string(),
                    parts: vec![NativePart::FunctionCall { function_call: call }],
                },
                finish_reason: None,
            }],
        };
        compensate_function_calls(&mut reply);
        let NativePart::FunctionCall { function_call } = &reply.candidates[0].content.parts[0] else {
            panic!("expected function call part");
        };
        assert_eq!(function_call.args.get("line_count").and_then(|v| v.as_u64()), Some(2));
    }

    #[test]
    fn rejects_disallowed_inline_mime_type() {
        let req = NativeGenerateRequest {
            contents: vec![NativeContent {
                role: "user".to_string(),
                parts: vec![NativePart::InlineData {
                    inline_data: NativeInlineData {
                        mime_type: "application/pdf".to_string(),
                        data: "YQ==".to_string(),
                    },
                }],
            }],
            generation_config: None,
        };
        assert!(to_internal(req).is_err());
    }
}
