//! Wire-format data models.
//!
//! - `chat`: OpenAI Chat Completions shapes (requests, responses, stream
//!   chunks) plus the gateway extension fields.
//! - `responses`: OpenResponses shapes (input/output items, responses,
//!   stream events).

pub mod chat;
pub mod responses;
