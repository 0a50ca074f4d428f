use serde_json::Value;

use super::framing::Frame;
use super::openai_types::{
    ChatCompletionChunk, ChatCompletionRequest, ChatContent, ChatCompletionResponse, ChatMessage,
    Prompt, TextChoice, TextCompletion, TextCompletionRequest,
};
use crate::error::{Result, RouterError};

const OBJECT: &str = "text_completion";

/// Rewrite a text-completion body as a chat-completions body.
pub fn chat_request(body: Value) -> Result<Value> {
    let req: TextCompletionRequest = serde_json::from_value(body)
        .map_err(|e| RouterError::invalid_request(format!("Invalid completion request: {e}")))?;

    let prompt = match req.prompt {
        Prompt::One(text) => text,
        Prompt::Many(mut prompts) if prompts.len() == 1 => prompts.remove(0),
        Prompt::Many(_) => {
            return Err(RouterError::invalid_request(
                "Exactly one prompt is supported per request",
            ))
        }
    };

    let chat = ChatCompletionRequest {
        model: req.model,
        messages: vec![ChatMessage {
            role: "user".to_string(),
            content: Some(ChatContent::Text(prompt)),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }],
        max_tokens: req.max_tokens,
        max_completion_tokens: None,
        temperature: req.temperature,
        top_p: req.top_p,
        stream: req.stream,
        stream_options: None,
        tools: None,
        tool_choice: None,
        stop: req.stop,
        user: req.user,
        metadata: None,
    };
    Ok(serde_json::to_value(chat)?)
}

/// Fold a unary chat completion into a text completion.
pub fn completion_response(body: Value) -> Result<Value> {
    let resp: ChatCompletionResponse = serde_json::from_value(body)?;
    let completion = TextCompletion {
        id: resp.id,
        object: OBJECT.to_string(),
        created: resp.created,
        model: resp.model,
        choices: resp
            .choices
            .into_iter()
            .map(|choice| TextChoice {
                index: choice.index,
                text: choice.message.content.unwrap_or_default(),
                logprobs: None,
                finish_reason: choice.finish_reason,
            })
            .collect(),
        usage: resp.usage,
    };
    Ok(serde_json::to_value(completion)?)
}

/// Fold one streamed chat chunk. The `[DONE]` sentinel and error frames pass
/// through untouched.
pub fn completion_frame(frame: Frame) -> Frame {
    let value: Value = match serde_json::from_str(&frame.data) {
        Ok(value) => value,
        Err(_) => return frame,
    };
    if value.get("error").is_some() {
        return frame;
    }
    let chunk: ChatCompletionChunk = match serde_json::from_value(value) {
        Ok(chunk) => chunk,
        Err(_) => return frame,
    };

    let completion = TextCompletion {
        id: chunk.id,
        object: OBJECT.to_string(),
        created: chunk.created,
        model: chunk.model,
        choices: chunk
            .choices
            .into_iter()
            .map(|choice| TextChoice {
                index: choice.index,
                text: choice.delta.content.unwrap_or_default(),
                logprobs: None,
                finish_reason: choice.finish_reason,
            })
            .collect(),
        usage: chunk.usage,
    };
    match serde_json::to_string(&completion) {
        Ok(data) => Frame { data, ..frame },
        Err(_) => frame,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_prompt_becomes_user_message() {
        let body = chat_request(json!({
            "model": "fast",
            "prompt": ["Say hi"],
            "max_tokens": 5,
            "stop": "\n",
            "stream": true
        }))
        .unwrap();
        assert_eq!(body["messages"], json!([{"role": "user", "content": "Say hi"}]));
        assert_eq!(body["max_tokens"], 5);
        assert_eq!(body["stop"], "\n");
        assert_eq!(body["stream"], true);
    }

    #[test]
    fn test_batched_prompts_rejected() {
        let err = chat_request(json!({"model": "fast", "prompt": ["a", "b"]})).unwrap_err();
        assert!(matches!(err, RouterError::InvalidRequest { .. }));
        assert!(chat_request(json!({"model": "fast"})).is_err());
    }

    #[test]
    fn test_unary_reply_folded() {
        let body = completion_response(json!({
            "id": "chatcmpl-1",
            "object": "chat.completion",
            "created": 7,
            "model": "fast",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "hi"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 2, "completion_tokens": 1, "total_tokens": 3}
        }))
        .unwrap();
        assert_eq!(body["object"], "text_completion");
        assert_eq!(body["choices"][0]["text"], "hi");
        assert_eq!(body["choices"][0]["finish_reason"], "stop");
        assert!(body["choices"][0]["logprobs"].is_null());
        assert_eq!(body["usage"]["total_tokens"], 3);
    }

    #[test]
    fn test_stream_frames_folded() {
        let frame = completion_frame(Frame::data(
            r#"{"id":"c","object":"chat.completion.chunk","created":1,"model":"fast","choices":[{"index":0,"delta":{"content":"he"},"finish_reason":null}]}"#,
        ));
        let value: Value = serde_json::from_str(&frame.data).unwrap();
        assert_eq!(value["object"], "text_completion");
        assert_eq!(value["choices"][0]["text"], "he");

        assert_eq!(completion_frame(Frame::data("[DONE]")), Frame::data("[DONE]"));
        let error = Frame::data(r#"{"error":{"message":"boom","type":"api_error"}}"#);
        assert_eq!(completion_frame(error.clone()), error);
    }
}
