//! Format Translator.
//!
//! Two stateless directions between the caller-facing OpenAI Chat
//! Completions shape and the upstream's native generateContent shape.
//! Native-format requests pass straight through with only mime-type
//! validation; OpenAI-format requests are flattened into the internal
//! [`crate::types::Message`] model at the edge.

pub mod native;
pub mod openai;

pub use native::{NativeContent, NativeGenerateRequest, NativeGenerateResponse};
pub use openai::{OpenAiChatRequest, OpenAiChatResponse, OpenAiStreamChunk};

use crate::types::Message;

/// Which wire shape a request arrived in, carried through the pipeline so
/// the response is rendered back in the same shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    OpenAi,
    Native,
}

/// Translate an inbound request body into the internal turn sequence plus
/// generation parameters, tagging which wire format it came in as.
pub fn parse_request(format: WireFormat, body: &[u8]) -> anyhow::Result<ParsedRequest> {
    match format {
        WireFormat::OpenAi => {
            let req: OpenAiChatRequest = serde_json::from_slice(body)?;
            openai::to_internal(req)
        }
        WireFormat::Native => {
            let req: NativeGenerateRequest = serde_json::from_slice(body)?;
            native::to_internal(req)
        }
    }
}

#[derive(Debug, Clone)]
pub struct ParsedRequest {
    pub model: String,
    pub turns: Vec<Message>,
    pub max_output_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub stream: bool,
}

/// Render a non-streaming upstream reply back into the caller's wire shape.
pub fn render_response(
    format: WireFormat,
    model: &str,
    reply: &NativeGenerateResponse,
) -> anyhow::Result<Vec<u8>> {
    let mut reply = reply.clone();
    native::compensate_function_calls(&mut reply);
    match format {
        WireFormat::OpenAi => {
            let resp = openai::from_native(model, &reply);
            Ok(serde_json::to_vec(&resp)?)
        }
        WireFormat::Native => Ok(serde_json::to_vec(&reply)?),
    }
}

/// Incremental streaming translator. Holds the small amount of state needed
/// to number chunks and carry the finish reason to the terminal event.
pub struct StreamTranslator {
    format: WireFormat,
    model: String,
    chunk_index: u64,
}

impl StreamTranslator {
    pub fn new(format: WireFormat, model: impl Into<String>) -> Self {
        Self {
            format,
            model: model.into(),
            chunk_index: 0,
        }
    }

    /// Translate one upstream native streaming event into zero or more
    /// wire-format SSE `data:` payloads (without the `data: ` prefix or the
    /// trailing blank line — the HTTP layer adds framing).
    pub fn translate_chunk(&mut self, native_event: &NativeGenerateResponse) -> anyhow::Result<Vec<u8>> {
        let mut native_event = native_event.clone();
        native::compensate_function_calls(&mut native_event);
        let payload = match self.format {
            WireFormat::Native => serde_json::to_vec(&native_event)?,
            WireFormat::OpenAi => {
                let chunk = openai::chunk_from_native(&self.model, &native_event, self.chunk_index);
                self.chunk_index += 1;
                serde_json::to_vec(&chunk)?
            }
        };
        Ok(payload)
    }

    /// Emitted once after the last chunk. `None` for native format, which
    /// has no explicit terminator; `Some("[DONE]")` for OpenAI.
    pub fn finalize(&self) -> Option<&'static [u8]> {
        match self.format {
            WireFormat::OpenAi => Some(b"[DONE]"),
            WireFormat::Native => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openai_request_round_trips_through_internal_model() {
        let body = br#"{"model":"gemini-1.5-flash","messages":[
            {"role":"system","content":"be terse"},
            {"role":"user","content":"hi"}
        ]}"#;
        let parsed = parse_request(WireFormat::OpenAi, body).unwrap();
        // system flattens into the first user turn; no separate turn for it.
        assert_eq!(parsed.turns.len(), 1);
        assert_eq!(parsed.turns[0].role, crate::types::Role::User);
    }

    #[test]
    fn native_request_passes_through_without_flattening() {
        let body = br#"{"contents":[{"role":"user","parts":[{"kind":"text","text":"hi"}]}]}"#;
        let parsed = parse_request(WireFormat::Native, body).unwrap();
        assert_eq!(parsed.turns.len(), 1);
    }

    #[test]
    fn finalize_emits_done_only_for_openai() {
        let openai = StreamTranslator::new(WireFormat::OpenAi, "m");
        let native = StreamTranslator::new(WireFormat::Native, "m");
        assert_eq!(openai.finalize(), Some(&b"[DONE]"[..]));
        assert_eq!(native.finalize(), None);
    }
}
