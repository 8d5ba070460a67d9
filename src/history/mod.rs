mod http;
mod source;
mod types;

pub use http::HttpHistorySource;
pub use source::{HistoryError, HistorySource};
pub use types::{parse_source_timestamp, ChannelInfo, MessagePayload, UserProfile};
