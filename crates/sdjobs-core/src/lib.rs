//! Job orchestration for the `sd-cli` image generation and model
//! conversion binary.
//!
//! A [`Registry`] stores jobs and their logs, an [`EventBus`] fans job
//! updates out to subscribers, a [`Supervisor`] runs one subprocess per job,
//! and [`Subscriptions`] merge stored history with live updates for clients.

pub mod bus;
pub mod invocation;
pub mod job;
pub mod normalize;
pub mod registry;
pub mod subscription;
pub mod supervisor;

pub use bus::{Envelope, EventBus};
pub use invocation::{
    BinaryLocation, ConvertParams, GenerateParams, Invocation, InvocationError, resolve_binary,
};
pub use job::{Job, JobKind, JobStatus, JobUpdate, LogEntry, Progress, StreamKind};
pub use normalize::{LineBuffer, LogNormalizer, extract_progress};
pub use registry::Registry;
pub use subscription::Subscriptions;
pub use supervisor::{QuiescencePolicy, Supervisor, SupervisorConfig};
