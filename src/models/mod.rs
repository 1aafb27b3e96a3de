pub mod auth;
pub mod chat;
pub mod collection;
pub mod document;
pub mod pagination;
pub mod retrieval;
