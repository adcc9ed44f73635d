#![forbid(unsafe_code)]

pub mod http;
pub mod records;
pub mod repository;
pub mod sqlite;

pub use http::{HttpSessionRemote, RemoteConfig};
pub use records::{AnswerRecord, DrillItemRecord, LocalSnapshot, SessionRecord};
pub use repository::{
    InMemoryLocalCache, InMemoryQuestionBank, InMemorySessionRemote, LocalCache, QuestionBank,
    QuestionRecord, RemoteCall, RemoteError, SessionRemote, Storage, StorageError,
};
