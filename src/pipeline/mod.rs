//! The multi-stage reply pipeline.
//!
//! ```text
//! transcriptions ─▶ Request ─▶ replies ─▶ Distributor ─┬─▶ renderer
//!                                                      ├─▶ speech ─▶ Generation ─▶ audio ─▶ Playback
//!                                                      └─▶ animation ─▶ Animation
//! ```
//!
//! Each stage runs on its own thread and talks to its neighbours only through
//! [`channel::BoundedChannel`]s. The [`coordinator::LifecycleCoordinator`]
//! owns the shutdown/interrupt signals and the worker threads.

pub mod animation;
pub mod channel;
pub mod coordinator;
pub mod distributor;
pub mod executor;
pub mod health;
pub mod messages;
pub mod request;
pub mod segments;
pub mod signals;
pub mod speech;
