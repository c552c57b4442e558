//! Prior-response store.
//!
//! Short-lived map from response id to the (input, output) pair that
//! produced it, used to expand `previous_response_id` conversations.
//! Bounded by an LRU cap and a TTL; entries past their deadline read as
//! absent.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;

use crate::models::responses::{
    ContentPart, InputItem, MessageContent, OutputContent, OutputItem, ResponsesResponse,
};

pub const DEFAULT_MAX_ENTRIES: usize = 1000;
pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone)]
pub struct StoredResponse {
    pub response: ResponsesResponse,
    pub input: Vec<InputItem>,
}

struct Entry {
    stored: StoredResponse,
    expires_at: Instant,
}

pub struct ResponseStore {
    entries: Mutex<LruCache<String, Entry>>,
    ttl: Duration,
}

impl Default for ResponseStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES, DEFAULT_TTL)
    }
}

impl ResponseStore {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(max_entries.max(1)).expect("max(1) is non-zero");
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    pub fn set(&self, response: ResponsesResponse, input: Vec<InputItem>) {
        let id = response.id.clone();
        let entry = Entry {
            stored: StoredResponse { response, input },
            expires_at: Instant::now() + self.ttl,
        };
        self.entries
            .lock()
            .expect("store mutex poisoned")
            .put(id, entry);
    }

    pub fn get(&self, id: &str) -> Option<StoredResponse> {
        let mut entries = self.entries.lock().expect("store mutex poisoned");
        match entries.get(id) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.stored.clone()),
            Some(_) => {
                entries.pop(id);
                None
            }
            None => None,
        }
    }

    pub fn delete(&self, id: &str) {
        self.entries.lock().expect("store mutex poisoned").pop(id);
    }

    pub fn clear(&self) {
        self.entries.lock().expect("store mutex poisoned").clear();
    }
}

/// Rebuild the conversation input for a continuation request: the stored
/// input, then the stored output projected back into input items, then the
/// new input.
///
/// Projection: message `output_text` parts become assistant `input_text`
/// parts; `function_call` items become `function_call_output` items with an
/// empty placeholder output for the caller to fill.
pub fn expand_previous(stored: &StoredResponse, new_input: Vec<InputItem>) -> Vec<InputItem> {
    let mut expanded = stored.input.clone();

    for item in &stored.response.output {
        match item {
            OutputItem::Message { content, .. } => {
                let parts: Vec<ContentPart> = content
                    .iter()
                    .filter_map(|part| match part {
                        OutputContent::OutputText { text, .. } => Some(ContentPart::InputText {
                            text: text.clone(),
                        }),
                        OutputContent::Refusal { .. } => None,
                    })
                    .collect();
                expanded.push(InputItem::Message {
                    role: "assistant".to_string(),
                    content: MessageContent::Parts(parts),
                });
            }
            OutputItem::FunctionCall { call_id, .. } => {
                expanded.push(InputItem::FunctionCallOutput {
                    call_id: call_id.clone(),
                    output: String::new(),
                });
            }
        }
    }

    expanded.extend(new_input);
    expanded
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::responses::{ItemStatus, ResponseStatus};

    fn response_with_text(id: &str, text: &str) -> ResponsesResponse {
        ResponsesResponse {
            id: id.to_string(),
            object: "response".to_string(),
            status: ResponseStatus::Completed,
            output: vec![OutputItem::Message {
                id: format!("msg_{id}"),
                role: "assistant".to_string(),
                status: ItemStatus::Completed,
                content: vec![OutputContent::OutputText {
                    text: text.to_string(),
                    annotations: Vec::new(),
                }],
            }],
            error: None,
            usage: None,
            model: "m".to_string(),
            created_at: 0,
            provider: None,
            cached: None,
        }
    }

    fn user_message(text: &str) -> InputItem {
        InputItem::Message {
            role: "user".to_string(),
            content: MessageContent::Parts(vec![ContentPart::InputText {
                text: text.to_string(),
            }]),
        }
    }

    #[test]
    fn set_get_delete_round_trip() {
        let store = ResponseStore::default();
        store.set(response_with_text("resp_abc", "hi there"), vec![user_message("hi")]);

        let stored = store.get("resp_abc").expect("stored response");
        assert_eq!(stored.response.id, "resp_abc");
        assert_eq!(stored.input.len(), 1);

        store.delete("resp_abc");
        assert!(store.get("resp_abc").is_none());
    }

    #[test]
    fn expired_entries_read_as_absent() {
        let store = ResponseStore::new(10, Duration::from_millis(0));
        store.set(response_with_text("resp_old", "x"), vec![]);
        std::thread::sleep(Duration::from_millis(5));
        assert!(store.get("resp_old").is_none());
    }

    #[test]
    fn lru_bound_evicts_the_oldest() {
        let store = ResponseStore::new(2, Duration::from_secs(60));
        store.set(response_with_text("resp_1", "a"), vec![]);
        store.set(response_with_text("resp_2", "b"), vec![]);
        store.set(response_with_text("resp_3", "c"), vec![]);
        assert!(store.get("resp_1").is_none());
        assert!(store.get("resp_3").is_some());
    }

    #[test]
    fn expansion_orders_prior_input_then_outputs_then_new_input() {
        let stored = StoredResponse {
            response: response_with_text("resp_abc", "hi there"),
            input: vec![user_message("hi")],
        };
        let expanded = expand_previous(&stored, vec![user_message("what now?")]);

        assert_eq!(expanded.len(), 3);
        assert!(matches!(
            &expanded[0],
            InputItem::Message { role, .. } if role == "user"
        ));
        match &expanded[1] {
            InputItem::Message { role, content } => {
                assert_eq!(role, "assistant");
                let MessageContent::Parts(parts) = content else {
                    panic!("expected parts");
                };
                assert!(
                    matches!(&parts[0], ContentPart::InputText { text } if text == "hi there")
                );
            }
            _ => panic!("expected assistant message"),
        }
        assert!(matches!(
            &expanded[2],
            InputItem::Message { role, .. } if role == "user"
        ));
    }

    #[test]
    fn function_calls_project_to_placeholder_outputs() {
        let mut response = response_with_text("resp_fc", "");
        response.output = vec![OutputItem::FunctionCall {
            id: "fc_1".to_string(),
            name: "f".to_string(),
            call_id: "call_7".to_string(),
            arguments: "{}".to_string(),
            status: ItemStatus::Completed,
        }];
        let stored = StoredResponse {
            response,
            input: vec![],
        };
        let expanded = expand_previous(&stored, vec![]);
        assert!(matches!(
            &expanded[0],
            InputItem::FunctionCallOutput { call_id, output }
                if call_id == "call_7" && output.is_empty()
        ));
    }
}
