//! mailsweep - Provider-agnostic email automation core
//!
//! This crate provides the pieces needed to run scheduled mailbox
//! automation against Gmail and Outlook: an encrypted credential vault,
//! provider adapters behind one router, a schedule calculator, the task
//! executor and the cron runner that drives them.

pub mod config;
pub mod domain;
pub mod providers;
pub mod router;
pub mod schedule;
pub mod services;
pub mod storage;
pub mod vault;

#[cfg(test)]
pub(crate) mod testing;

pub use router::{CallContext, Dispatched, ProviderRouter, RouterError};
pub use services::{CronRunner, TaskExecutor};
