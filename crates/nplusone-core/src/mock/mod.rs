//! In-memory mock database for exercising collectors without a real server.
//!
//! [`MockDatabase`] keeps a tiny blog schema (users and posts) and publishes
//! an [`crate::event::Event`] for every statement it "executes", the way an
//! instrumented driver would. It implements
//! [`crate::executor::TransactionProvider`] with snapshot/restore, so every
//! executor cycle starts from the same data.

mod database;
mod scenarios;

pub use database::{MockDatabase, Post, User};
