//! Chat chunk stream -> OpenResponses event stream.
//!
//! `ResponseEventStream` is a single-producer state machine wrapped in a
//! pull-based `Stream`: the downstream SSE writer drives it, so HTTP
//! backpressure propagates straight through to the upstream socket. All
//! state lives on the emitter; nothing is shared with the request handler.
//!
//! Ordering contract:
//! - `sequence_number` is strictly increasing across all emitted events;
//! - `response.created` comes first, `response.completed` (or
//!   `response.failed`) comes last;
//! - every `.delta` for an item sits between that item's `.added` and
//!   `.done`, and every open item is closed before the terminal event.
//!
//! Each item is assigned its `output_index` when it opens and keeps it for
//! its whole `added`/`delta`/`done` life; the counter advances at open so
//! concurrently open items never share an index.

use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::Stream;
use serde_json::json;
use tracing::warn;
use uuid::Uuid;

use crate::conversion::new_response_id;
use crate::models::chat::{ChatCompletionChunk, ChatUsage, ToolCallDelta};
use crate::models::responses::{
    ItemStatus, OutputContent, OutputItem, ResponseStatus, ResponsesResponse, ResponsesUsage,
    StreamEvent,
};
use crate::provider::ProviderError;

struct OpenMessage {
    id: String,
    output_index: u32,
    text: String,
}

struct OpenFunctionCall {
    id: String,
    call_id: String,
    name: String,
    output_index: u32,
    arguments: String,
}

enum Phase {
    Start,
    Streaming,
    Finished,
}

pub struct ResponseEventStream<S> {
    inner: S,
    phase: Phase,
    pending: VecDeque<StreamEvent>,

    sequence: u64,
    response_id: String,
    model: String,
    created_at: u64,
    provider: Option<String>,

    next_output_index: u32,
    message: Option<OpenMessage>,
    function_call: Option<OpenFunctionCall>,
    finished_items: Vec<(u32, OutputItem)>,
    usage: Option<ChatUsage>,
}

impl<S> ResponseEventStream<S> {
    pub fn new(inner: S, model: String, provider: Option<String>, created_at: u64) -> Self {
        Self {
            inner,
            phase: Phase::Start,
            pending: VecDeque::new(),
            sequence: 0,
            response_id: new_response_id(),
            model,
            created_at,
            provider,
            next_output_index: 0,
            message: None,
            function_call: None,
            finished_items: Vec::new(),
            usage: None,
        }
    }

    pub fn response_id(&self) -> &str {
        &self.response_id
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.sequence;
        self.sequence += 1;
        seq
    }

    fn snapshot(&self, status: ResponseStatus, error: Option<serde_json::Value>) -> ResponsesResponse {
        let mut items: Vec<(u32, OutputItem)> = self.finished_items.clone();
        items.sort_by_key(|(index, _)| *index);
        ResponsesResponse {
            id: self.response_id.clone(),
            object: "response".to_string(),
            status,
            output: items.into_iter().map(|(_, item)| item).collect(),
            error,
            usage: self.usage.as_ref().map(|u| ResponsesUsage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            }),
            model: self.model.clone(),
            created_at: self.created_at,
            provider: self.provider.clone(),
            cached: None,
        }
    }

    fn emit_open_events(&mut self) {
        let placeholder = self.snapshot(ResponseStatus::InProgress, None);
        let created = StreamEvent::Created {
            sequence_number: self.next_seq(),
            response: placeholder.clone(),
        };
        let in_progress = StreamEvent::InProgress {
            sequence_number: self.next_seq(),
            response: placeholder,
        };
        self.pending.push_back(created);
        self.pending.push_back(in_progress);
    }

    fn open_function_call(&mut self, delta: &ToolCallDelta, name: String) {
        let call = OpenFunctionCall {
            id: format!("fc_{}", Uuid::new_v4().simple()),
            call_id: delta
                .id
                .clone()
                .unwrap_or_else(|| format!("call_{}", Uuid::new_v4().simple())),
            name,
            output_index: self.next_output_index,
            arguments: String::new(),
        };
        self.next_output_index += 1;

        let event = StreamEvent::OutputItemAdded {
            sequence_number: self.next_seq(),
            output_index: call.output_index,
            item: OutputItem::FunctionCall {
                id: call.id.clone(),
                name: call.name.clone(),
                call_id: call.call_id.clone(),
                arguments: String::new(),
                status: ItemStatus::InProgress,
            },
        };
        self.pending.push_back(event);
        self.function_call = Some(call);
    }

    fn push_function_arguments(&mut self, fragment: &str) {
        let Some(call) = self.function_call.as_mut() else {
            return;
        };
        call.arguments.push_str(fragment);
        let (item_id, output_index) = (call.id.clone(), call.output_index);
        let event = StreamEvent::FunctionCallArgumentsDelta {
            sequence_number: self.next_seq(),
            item_id,
            output_index,
            delta: fragment.to_string(),
        };
        self.pending.push_back(event);
    }

    fn open_message(&mut self) {
        let message = OpenMessage {
            id: format!("msg_{}", Uuid::new_v4().simple()),
            output_index: self.next_output_index,
            text: String::new(),
        };
        self.next_output_index += 1;

        let added = StreamEvent::OutputItemAdded {
            sequence_number: self.next_seq(),
            output_index: message.output_index,
            item: OutputItem::Message {
                id: message.id.clone(),
                role: "assistant".to_string(),
                status: ItemStatus::InProgress,
                content: Vec::new(),
            },
        };
        self.pending.push_back(added);

        let part_added = StreamEvent::ContentPartAdded {
            sequence_number: self.next_seq(),
            item_id: message.id.clone(),
            output_index: message.output_index,
            content_index: 0,
            part: OutputContent::OutputText {
                text: String::new(),
                annotations: Vec::new(),
            },
        };
        self.pending.push_back(part_added);
        self.message = Some(message);
    }

    fn push_text(&mut self, fragment: &str) {
        if self.message.is_none() {
            self.open_message();
        }
        let message = self.message.as_mut().expect("message just opened");
        message.text.push_str(fragment);
        let (item_id, output_index) = (message.id.clone(), message.output_index);
        let event = StreamEvent::OutputTextDelta {
            sequence_number: self.next_seq(),
            item_id,
            output_index,
            content_index: 0,
            delta: fragment.to_string(),
        };
        self.pending.push_back(event);
    }

    fn close_function_call(&mut self) {
        let Some(call) = self.function_call.take() else {
            return;
        };

        let args_done = StreamEvent::FunctionCallArgumentsDone {
            sequence_number: self.next_seq(),
            item_id: call.id.clone(),
            output_index: call.output_index,
            arguments: call.arguments.clone(),
        };
        self.pending.push_back(args_done);

        let item = OutputItem::FunctionCall {
            id: call.id.clone(),
            name: call.name.clone(),
            call_id: call.call_id.clone(),
            arguments: call.arguments.clone(),
            status: ItemStatus::Completed,
        };
        let done = StreamEvent::OutputItemDone {
            sequence_number: self.next_seq(),
            output_index: call.output_index,
            item: item.clone(),
        };
        self.pending.push_back(done);
        self.finished_items.push((call.output_index, item));
    }

    fn close_message(&mut self) {
        let Some(message) = self.message.take() else {
            return;
        };

        let text_done = StreamEvent::OutputTextDone {
            sequence_number: self.next_seq(),
            item_id: message.id.clone(),
            output_index: message.output_index,
            content_index: 0,
            text: message.text.clone(),
        };
        self.pending.push_back(text_done);

        let part = OutputContent::OutputText {
            text: message.text.clone(),
            annotations: Vec::new(),
        };
        let part_done = StreamEvent::ContentPartDone {
            sequence_number: self.next_seq(),
            item_id: message.id.clone(),
            output_index: message.output_index,
            content_index: 0,
            part: part.clone(),
        };
        self.pending.push_back(part_done);

        let item = OutputItem::Message {
            id: message.id.clone(),
            role: "assistant".to_string(),
            status: ItemStatus::Completed,
            content: vec![part],
        };
        let done = StreamEvent::OutputItemDone {
            sequence_number: self.next_seq(),
            output_index: message.output_index,
            item: item.clone(),
        };
        self.pending.push_back(done);
        self.finished_items.push((message.output_index, item));
    }

    fn process_chunk(&mut self, chunk: ChatCompletionChunk) {
        if chunk.usage.is_some() {
            self.usage = chunk.usage;
        }

        for choice in &chunk.choices {
            if let Some(tool_calls) = &choice.delta.tool_calls {
                for tc in tool_calls {
                    if let Some(function) = &tc.function {
                        if let Some(name) = &function.name {
                            if self.function_call.is_none() {
                                self.open_function_call(tc, name.clone());
                            }
                        }
                        if let Some(arguments) = &function.arguments {
                            if !arguments.is_empty() {
                                if self.function_call.is_some() {
                                    self.push_function_arguments(arguments);
                                } else {
                                    warn!("dropping tool-call arguments before any tool call opened");
                                }
                            }
                        }
                    }
                }
            }

            if let Some(content) = &choice.delta.content {
                if !content.is_empty() {
                    self.push_text(content);
                }
            }

            if choice.finish_reason.is_some() {
                // Function call closes before the message.
                self.close_function_call();
                self.close_message();
            }
        }
    }

    fn finish(&mut self) {
        // An upstream that never sent finish_reason still gets well-formed
        // closure.
        self.close_function_call();
        self.close_message();

        let response = self.snapshot(ResponseStatus::Completed, None);
        let completed = StreamEvent::Completed {
            sequence_number: self.next_seq(),
            response,
        };
        self.pending.push_back(completed);
    }

    fn fail(&mut self, error: ProviderError) {
        self.close_function_call();
        self.close_message();

        let detail = json!({
            "type": "api_error",
            "code": "stream_error",
            "message": error.to_string(),
        });
        let response = self.snapshot(ResponseStatus::Failed, Some(detail));
        let failed = StreamEvent::Failed {
            sequence_number: self.next_seq(),
            response,
        };
        self.pending.push_back(failed);
    }
}

impl<S> Stream for ResponseEventStream<S>
where
    S: Stream<Item = Result<ChatCompletionChunk, ProviderError>> + Unpin,
{
    type Item = StreamEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            if let Some(event) = this.pending.pop_front() {
                return Poll::Ready(Some(event));
            }

            match this.phase {
                Phase::Start => {
                    this.emit_open_events();
                    this.phase = Phase::Streaming;
                }
                Phase::Streaming => match Pin::new(&mut this.inner).poll_next(cx) {
                    Poll::Ready(Some(Ok(chunk))) => this.process_chunk(chunk),
                    Poll::Ready(Some(Err(error))) => {
                        this.fail(error);
                        this.phase = Phase::Finished;
                    }
                    Poll::Ready(None) => {
                        this.finish();
                        this.phase = Phase::Finished;
                    }
                    Poll::Pending => return Poll::Pending,
                },
                Phase::Finished => return Poll::Ready(None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use serde_json::json;

    fn chunk(value: serde_json::Value) -> Result<ChatCompletionChunk, ProviderError> {
        Ok(serde_json::from_value(value).unwrap())
    }

    async fn run(
        chunks: Vec<Result<ChatCompletionChunk, ProviderError>>,
    ) -> Vec<StreamEvent> {
        let inner = futures_util::stream::iter(chunks);
        ResponseEventStream::new(inner, "test-model".into(), Some("groq".into()), 123)
            .collect()
            .await
    }

    fn event_types(events: &[StreamEvent]) -> Vec<&'static str> {
        events.iter().map(StreamEvent::event_type).collect()
    }

    fn assert_sequence_is_gapless(events: &[StreamEvent]) {
        for (expected, event) in events.iter().enumerate() {
            assert_eq!(event.sequence_number(), expected as u64);
        }
    }

    #[tokio::test]
    async fn text_only_stream_emits_the_canonical_event_order() {
        let events = run(vec![
            chunk(json!({"choices": [{"delta": {"role": "assistant", "content": "hel"}}]})),
            chunk(json!({"choices": [{"delta": {"content": "lo"}}]})),
            chunk(json!({"choices": [{"delta": {}, "finish_reason": "stop"}]})),
        ])
        .await;

        assert_eq!(
            event_types(&events),
            [
                "response.created",
                "response.in_progress",
                "response.output_item.added",
                "response.content_part.added",
                "response.output_text.delta",
                "response.output_text.delta",
                "response.output_text.done",
                "response.content_part.done",
                "response.output_item.done",
                "response.completed",
            ]
        );
        assert_sequence_is_gapless(&events);

        // Round-trip law: deltas concatenate to the final text.
        let deltas: String = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::OutputTextDelta { delta, .. } => Some(delta.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(deltas, "hello");
        let done_text = events
            .iter()
            .find_map(|e| match e {
                StreamEvent::OutputTextDone { text, .. } => Some(text.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(done_text, "hello");

        match events.last().unwrap() {
            StreamEvent::Completed { response, .. } => {
                assert_eq!(response.status, ResponseStatus::Completed);
                assert_eq!(response.output.len(), 1);
                assert_eq!(response.provider.as_deref(), Some("groq"));
                match &response.output[0] {
                    OutputItem::Message { status, content, .. } => {
                        assert_eq!(*status, ItemStatus::Completed);
                        assert!(matches!(
                            &content[0],
                            OutputContent::OutputText { text, .. } if text == "hello"
                        ));
                    }
                    _ => panic!("expected message item"),
                }
            }
            _ => panic!("expected response.completed last"),
        }
    }

    #[tokio::test]
    async fn tool_call_then_text_closes_the_function_call_first() {
        let events = run(vec![
            chunk(json!({"choices": [{"delta": {"tool_calls": [
                {"index": 0, "id": "call_1", "type": "function",
                 "function": {"name": "f"}}]}}]})),
            chunk(json!({"choices": [{"delta": {"tool_calls": [
                {"index": 0, "function": {"arguments": "{\"x\":"}}]}}]})),
            chunk(json!({"choices": [{"delta": {"tool_calls": [
                {"index": 0, "function": {"arguments": "1}"}}]}}]})),
            chunk(json!({"choices": [{"delta": {"content": "done"}}]})),
            chunk(json!({"choices": [{"delta": {}, "finish_reason": "stop"}]})),
        ])
        .await;

        assert_eq!(
            event_types(&events),
            [
                "response.created",
                "response.in_progress",
                "response.output_item.added",
                "response.function_call_arguments.delta",
                "response.function_call_arguments.delta",
                "response.output_item.added",
                "response.content_part.added",
                "response.output_text.delta",
                "response.function_call_arguments.done",
                "response.output_item.done",
                "response.output_text.done",
                "response.content_part.done",
                "response.output_item.done",
                "response.completed",
            ]
        );
        assert_sequence_is_gapless(&events);

        // The function call holds index 0 for its whole life, the message
        // holds index 1.
        let added_indices: Vec<u32> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::OutputItemAdded { output_index, .. } => Some(*output_index),
                _ => None,
            })
            .collect();
        let done_indices: Vec<u32> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::OutputItemDone { output_index, .. } => Some(*output_index),
                _ => None,
            })
            .collect();
        assert_eq!(added_indices, [0, 1]);
        assert_eq!(done_indices, [0, 1]);

        let args_done = events
            .iter()
            .find_map(|e| match e {
                StreamEvent::FunctionCallArgumentsDone { arguments, .. } => {
                    Some(arguments.clone())
                }
                _ => None,
            })
            .unwrap();
        assert_eq!(args_done, "{\"x\":1}");

        match events.last().unwrap() {
            StreamEvent::Completed { response, .. } => {
                assert_eq!(response.output.len(), 2);
                match &response.output[0] {
                    OutputItem::FunctionCall {
                        call_id, arguments, ..
                    } => {
                        assert_eq!(call_id, "call_1");
                        assert_eq!(arguments, "{\"x\":1}");
                    }
                    _ => panic!("function call should come first"),
                }
                assert!(matches!(response.output[1], OutputItem::Message { .. }));
            }
            _ => panic!("expected response.completed last"),
        }
    }

    #[tokio::test]
    async fn missing_call_id_is_minted() {
        let events = run(vec![
            chunk(json!({"choices": [{"delta": {"tool_calls": [
                {"index": 0, "function": {"name": "f", "arguments": "{}"}}]}}]})),
            chunk(json!({"choices": [{"delta": {}, "finish_reason": "tool_calls"}]})),
        ])
        .await;

        let call_id = events
            .iter()
            .find_map(|e| match e {
                StreamEvent::OutputItemDone {
                    item: OutputItem::FunctionCall { call_id, .. },
                    ..
                } => Some(call_id.clone()),
                _ => None,
            })
            .unwrap();
        assert!(call_id.starts_with("call_"));
    }

    #[tokio::test]
    async fn unterminated_stream_still_closes_items() {
        // No finish_reason at all; upstream just ends.
        let events = run(vec![chunk(
            json!({"choices": [{"delta": {"content": "partial"}}]}),
        )])
        .await;

        let types = event_types(&events);
        assert_eq!(*types.last().unwrap(), "response.completed");
        assert!(types.contains(&"response.output_item.done"));
        assert_sequence_is_gapless(&events);
    }

    #[tokio::test]
    async fn upstream_error_ends_with_response_failed() {
        let inner = futures_util::stream::iter(vec![
            chunk(json!({"choices": [{"delta": {"content": "par"}}]})),
            Err(ProviderError::Network {
                provider: "groq".into(),
                message: "connection reset".into(),
            }),
        ]);
        let events: Vec<StreamEvent> =
            ResponseEventStream::new(inner, "m".into(), None, 0).collect().await;

        let types = event_types(&events);
        assert_eq!(*types.last().unwrap(), "response.failed");
        assert_sequence_is_gapless(&events);
        match events.last().unwrap() {
            StreamEvent::Failed { response, .. } => {
                assert_eq!(response.status, ResponseStatus::Failed);
                let error = response.error.as_ref().unwrap();
                assert_eq!(error["code"], "stream_error");
            }
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn usage_from_final_chunk_lands_on_the_completed_response() {
        let events = run(vec![
            chunk(json!({"choices": [{"delta": {"content": "ok"}, "finish_reason": "stop"}],
                         "usage": {"prompt_tokens": 2, "completion_tokens": 4, "total_tokens": 6}})),
        ])
        .await;
        match events.last().unwrap() {
            StreamEvent::Completed { response, .. } => {
                let usage = response.usage.unwrap();
                assert_eq!(usage.input_tokens, 2);
                assert_eq!(usage.output_tokens, 4);
                assert_eq!(usage.total_tokens, 6);
            }
            _ => panic!("expected completed"),
        }
    }
}
