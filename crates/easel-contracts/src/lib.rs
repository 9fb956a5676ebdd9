//! Data contracts shared by the easel engine and CLI: the gallery record model,
//! its versioned storage schema, key/value stores, the activity log and the chat
//! command grammar.

pub mod chat;
pub mod events;
pub mod gallery;
pub mod store;
