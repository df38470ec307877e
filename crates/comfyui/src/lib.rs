//! ComfyUI REST client and job dispatcher.
//!
//! Submits mapped workflow templates to a local ComfyUI instance and polls
//! its history endpoint until the run completes, fails, or exhausts the
//! poll budget.

pub mod api;
pub mod dispatcher;
pub mod history;

pub use dispatcher::{ComfyUIDispatcher, DispatchError, GenerationBackend, JobHandle, Outputs};
