pub mod auth;
pub mod context_store;
pub mod conversation;
pub mod directives;
pub mod dispatcher;
pub mod modes;
pub mod registry;
pub mod tools;
