//! Queue/integration dispatch — the per-message decision procedure.
//!
//! Every inbound message that survives triage flows through
//! `Dispatcher::dispatch`, which decides: continue a sticky integration,
//! auto-route (0/1 queue), present a queue menu (2+ queues), or resolve
//! a menu reply.

pub mod dispatcher;
pub mod menu;

pub use dispatcher::Dispatcher;
