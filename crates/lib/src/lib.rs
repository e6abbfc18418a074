//! lamina-lib: event-driven build and deploy pipeline for parser functions
//!
//! An inbound event names a parser. Its source is packaged with a generated
//! recipe into a reproducible build context, built into an image by a
//! worker pool, and deployed as a serverless service:
//! - `event`: CloudEvent envelope and payload validation
//! - `idempotency`: duplicate delivery suppression
//! - `build`: recipe rendering, deterministic archives, staging
//! - `dispatch`: job queue, workers, retries and cancellation
//! - `provision`: resource descriptors applied to the runtime platform
//! - `engine`: the pipeline that ties these together
//! - `api`: HTTP ingress and the operator API

pub mod api;
pub mod build;
pub mod config;
pub mod consts;
pub mod dispatch;
pub mod engine;
pub mod event;
pub mod executor;
pub mod idempotency;
pub mod provision;
pub mod registry;
pub mod source;
pub mod util;
