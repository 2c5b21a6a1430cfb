//! In-process transport that records deliveries instead of sending them.
//!
//! Failures can be scripted per endpoint, either for every attempt or for
//! the next few, which makes retry and pruning behavior observable.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::push::payload::NotificationPayload;
use crate::push::{DeliveryError, PushTransport};
use crate::scheduler::tasks::PushSubscription;

/// One delivery attempt seen by [`RecordingTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedPush {
    pub owner: String,
    pub endpoint: String,
    pub payload: NotificationPayload,
    pub outcome: Result<(), DeliveryError>,
}

#[derive(Debug, Default)]
struct Script {
    always: HashMap<String, DeliveryError>,
    queued: HashMap<String, VecDeque<DeliveryError>>,
}

/// Transport that accepts everything unless told otherwise.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    attempts: Mutex<Vec<RecordedPush>>,
    script: Mutex<Script>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every delivery to `endpoint` fails with `error`.
    pub fn fail_always(&self, endpoint: impl Into<String>, error: DeliveryError) {
        lock(&self.script).always.insert(endpoint.into(), error);
    }

    /// The next delivery to `endpoint` fails with `error`; later ones follow
    /// the rest of the script.
    pub fn fail_next(&self, endpoint: impl Into<String>, error: DeliveryError) {
        lock(&self.script)
            .queued
            .entry(endpoint.into())
            .or_default()
            .push_back(error);
    }

    /// Every attempt, successful or not, in order.
    pub fn attempts(&self) -> Vec<RecordedPush> {
        lock(&self.attempts).clone()
    }

    /// Payloads that were accepted.
    pub fn delivered(&self) -> Vec<RecordedPush> {
        lock(&self.attempts)
            .iter()
            .filter(|p| p.outcome.is_ok())
            .cloned()
            .collect()
    }

    /// Wire kinds of accepted payloads, e.g. `task-due`.
    pub fn delivered_kinds(&self) -> Vec<&'static str> {
        lock(&self.attempts)
            .iter()
            .filter(|p| p.outcome.is_ok())
            .map(|p| p.payload.kind())
            .collect()
    }

    pub fn clear(&self) {
        lock(&self.attempts).clear();
    }

    fn outcome_for(&self, endpoint: &str) -> Result<(), DeliveryError> {
        let mut script = lock(&self.script);
        if let Some(error) = script.queued.get_mut(endpoint).and_then(VecDeque::pop_front) {
            return Err(error);
        }
        match script.always.get(endpoint) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl PushTransport for RecordingTransport {
    fn id(&self) -> &'static str {
        "recording"
    }

    async fn send(
        &self,
        subscription: &PushSubscription,
        payload: &NotificationPayload,
    ) -> Result<(), DeliveryError> {
        let outcome = self.outcome_for(&subscription.endpoint);
        lock(&self.attempts).push(RecordedPush {
            owner: subscription.owner.clone(),
            endpoint: subscription.endpoint.clone(),
            payload: payload.clone(),
            outcome: outcome.clone(),
        });
        outcome
    }
}
