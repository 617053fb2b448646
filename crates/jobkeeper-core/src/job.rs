//! Job Record: immutable identity plus mutable reservation/attempt
//! metadata for one queued unit of work.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Map;
use uuid::Uuid;

use crate::error::Result;
use crate::handler::Args;

/// Opaque unique identity for a Job Record. Never reused within a backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub String);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Canonical payload carried by a Job Record: `{ "class": <handler name>,
/// "args": <argument bag> }`. `Map<String, Value>` is a `BTreeMap` under
/// serde_json's default (non `preserve_order`) feature set, giving the
/// insertion-order-independent, canonical encoding the spec requires for
/// payload round-tripping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub class: String,
    pub args: Args,
}

impl Payload {
    pub fn new(class: impl Into<String>, args: Args) -> Self {
        Self {
            class: class.into(),
            args,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// One queued unit. See the data model invariants I1-I5: `attempts`
/// counts reservation events (incremented exactly at `pop`), never
/// handler invocations; `reserved_at` is non-null iff the record is
/// currently held by a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub queue: String,
    pub payload: Vec<u8>,
    pub attempts: u32,
    pub reserved_at: Option<DateTime<Utc>>,
    pub available_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// Allocate a new Pending record: fresh id, zero attempts, no
    /// reservation, `available_at := now + delay`.
    pub fn fresh(queue: impl Into<String>, payload: Vec<u8>, delay: chrono::Duration) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            queue: queue.into(),
            payload,
            attempts: 0,
            reserved_at: None,
            available_at: now + delay,
            created_at: now,
        }
    }

    /// Rehydrate a record from its stored fields.
    #[allow(clippy::too_many_arguments)]
    pub fn rehydrate(
        id: JobId,
        queue: String,
        payload: Vec<u8>,
        attempts: u32,
        reserved_at: Option<DateTime<Utc>>,
        available_at: DateTime<Utc>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            queue,
            payload,
            attempts,
            reserved_at,
            available_at,
            created_at,
        }
    }

    pub fn is_reserved(&self) -> bool {
        self.reserved_at.is_some()
    }

    pub fn decode_payload(&self) -> Result<Payload> {
        Payload::decode(&self.payload)
    }
}

/// A Job Record moved to failed storage after reaching `max_attempts`.
/// Same identity and payload, plus a formatted error and `failed_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedJob {
    pub id: JobId,
    pub queue: String,
    pub payload: Vec<u8>,
    pub exception: String,
    pub failed_at: DateTime<Utc>,
}

impl FailedJob {
    pub fn new(job: &Job, exception: impl Into<String>) -> Self {
        Self {
            id: job.id.clone(),
            queue: job.queue.clone(),
            payload: job.payload.clone(),
            exception: exception.into(),
            failed_at: Utc::now(),
        }
    }

    /// Produce a new fresh Job Record from a failed one: new id,
    /// `attempts := 0`. Caller is responsible for deleting this
    /// FailedJob in the same operation.
    pub fn into_retried_job(self) -> Job {
        Job::fresh(self.queue, self.payload, chrono::Duration::zero())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_job_has_zero_attempts_and_no_reservation() {
        let job = Job::fresh("default", b"{}".to_vec(), chrono::Duration::zero());
        assert_eq!(job.attempts, 0);
        assert!(job.reserved_at.is_none());
        assert!(!job.is_reserved());
    }

    #[test]
    fn fresh_job_delay_pushes_available_at_into_future() {
        let job = Job::fresh("default", b"{}".to_vec(), chrono::Duration::seconds(5));
        assert!(job.available_at > job.created_at);
    }

    #[test]
    fn payload_roundtrip_is_byte_stable_for_equal_inputs() {
        let mut args = Args::new();
        args.insert("x".to_string(), serde_json::Value::from(1));
        args.insert("y".to_string(), serde_json::Value::from("hi"));

        let payload = Payload::new("SendEmail", args);
        let encoded = payload.encode().unwrap();
        let decoded = Payload::decode(&encoded).unwrap();

        assert_eq!(payload, decoded);
        assert_eq!(decoded.class, "SendEmail");
    }

    #[test]
    fn failed_job_retry_resets_attempts_and_mints_new_id() {
        let mut job = Job::fresh("default", b"{}".to_vec(), chrono::Duration::zero());
        job.attempts = 3;
        let original_id = job.id.clone();

        let failed = FailedJob::new(&job, "boom");
        let retried = failed.into_retried_job();

        assert_ne!(retried.id, original_id);
        assert_eq!(retried.attempts, 0);
    }
}
