use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use health::HealthHandle;
use metrics::counter;
use rdkafka::consumer::StreamConsumer;
use rdkafka::message::Message;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{error, info, warn};
use uuid::Uuid;

use scout_common::kafka::{publish_json, PublishError, Publisher};
use scout_common::messages::{CredentialAnswered, CredentialRequested, CREDENTIAL_REQUESTED_TOPIC};

use crate::credentials::CredentialStore;
use crate::store::StoreError;

/// Enumeration of errors for the credential relay's requesting side.
/// `Timeout` is the expected failure mode: the collector aborts its login
/// attempt and the orchestrator retries on the next cycle.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("timed out waiting for a credential code")]
    Timeout,
    #[error("credential request abandoned before an answer arrived")]
    Abandoned,
    #[error("failed to publish credential request: {0}")]
    Broker(#[from] PublishError),
    #[error("database error in credential flow: {0}")]
    Database(#[from] StoreError),
}

pub struct Subscription {
    pub request_id: Uuid,
    /// True when this subscription created the request; only the creator
    /// persists the row and publishes the broker event.
    pub fresh: bool,
    pub receiver: oneshot::Receiver<String>,
}

#[derive(Default)]
struct PendingInner {
    by_request: HashMap<Uuid, Vec<oneshot::Sender<String>>>,
    by_session: HashMap<String, Uuid>,
}

/// In-process registry of waiters for credential codes, keyed by the
/// correlation token. Several collectors waiting on the same session share
/// one outstanding request, so the administrator is only prompted once.
#[derive(Default)]
pub struct PendingCodes {
    inner: Mutex<PendingInner>,
}

impl PendingCodes {
    pub fn subscribe(&self, session_id: &str) -> Subscription {
        let mut inner = self.inner.lock().expect("poisoned pending codes lock");
        let (sender, receiver) = oneshot::channel();

        if let Some(&request_id) = inner.by_session.get(session_id) {
            inner
                .by_request
                .entry(request_id)
                .or_default()
                .push(sender);
            return Subscription {
                request_id,
                fresh: false,
                receiver,
            };
        }

        let request_id = Uuid::new_v4();
        inner.by_session.insert(session_id.to_owned(), request_id);
        inner.by_request.insert(request_id, vec![sender]);
        Subscription {
            request_id,
            fresh: true,
            receiver,
        }
    }

    /// Hand a code to every waiter of `request_id`. Returns false when
    /// nobody is waiting anymore (late answer, or a restart lost the map).
    pub fn resolve(&self, request_id: Uuid, code: &str) -> bool {
        let mut inner = self.inner.lock().expect("poisoned pending codes lock");
        let Some(waiters) = inner.by_request.remove(&request_id) else {
            return false;
        };
        inner.by_session.retain(|_, pending| *pending != request_id);

        for waiter in waiters {
            // A waiter that already timed out dropped its receiver.
            drop(waiter.send(code.to_owned()));
        }
        true
    }

    /// Drop all waiters of `request_id`, e.g. once the request expired.
    pub fn forget(&self, request_id: Uuid) {
        let mut inner = self.inner.lock().expect("poisoned pending codes lock");
        inner.by_request.remove(&request_id);
        inner.by_session.retain(|_, pending| *pending != request_id);
    }
}

/// The requesting side of the credential relay.
///
/// `request_code` persists a pending request, publishes `credential.requested`
/// and suspends the calling collector's login flow until the matching
/// `credential.answered` event arrives or the wait window elapses. Only that
/// single unit of work blocks; sibling collectors keep their schedules.
pub struct CredentialRelay {
    store: CredentialStore,
    publisher: Arc<dyn Publisher>,
    pending: PendingCodes,
    wait_window: Duration,
}

impl CredentialRelay {
    pub fn new(store: CredentialStore, publisher: Arc<dyn Publisher>, wait_window: Duration) -> Self {
        Self {
            store,
            publisher,
            pending: PendingCodes::default(),
            wait_window,
        }
    }

    pub async fn request_code(&self, session_id: &str, hint: &str) -> Result<String, RelayError> {
        let Subscription {
            request_id,
            fresh,
            receiver,
        } = self.pending.subscribe(session_id);

        if fresh {
            if let Err(error) = self.open_request(request_id, session_id, hint).await {
                self.pending.forget(request_id);
                return Err(error);
            }
            info!(
                request_id = %request_id,
                session_id = session_id,
                "published credential request"
            );
        }

        match tokio::time::timeout(self.wait_window, receiver).await {
            Ok(Ok(code)) => {
                counter!("scout_credential_requests_total", &[("result", "answered")]).increment(1);
                Ok(code)
            }
            Ok(Err(_)) => Err(RelayError::Abandoned),
            Err(_) => {
                self.pending.forget(request_id);
                if self.store.expire(request_id).await? {
                    warn!(request_id = %request_id, "credential request expired unanswered");
                }
                counter!("scout_credential_requests_total", &[("result", "expired")]).increment(1);
                Err(RelayError::Timeout)
            }
        }
    }

    async fn open_request(
        &self,
        request_id: Uuid,
        session_id: &str,
        hint: &str,
    ) -> Result<(), RelayError> {
        self.store
            .create_pending(request_id, session_id, hint)
            .await?;

        let message = CredentialRequested {
            request_id,
            session_id: session_id.to_owned(),
            hint: hint.to_owned(),
        };
        if let Err(error) = publish_json(
            self.publisher.as_ref(),
            CREDENTIAL_REQUESTED_TOPIC,
            Some(session_id),
            &message,
        )
        .await
        {
            // Nobody will ever answer a request that never reached the
            // broker, close the row immediately.
            drop(self.store.expire(request_id).await);
            return Err(RelayError::Broker(error));
        }
        Ok(())
    }

    /// Apply one `credential.answered` event. The persisted transition is
    /// the idempotence guard: a late or duplicate answer finds the row no
    /// longer pending and is dropped.
    pub async fn deliver_answer(&self, answer: CredentialAnswered) -> Result<(), StoreError> {
        if self.store.answer(answer.request_id, &answer.code).await? {
            if !self.pending.resolve(answer.request_id, &answer.code) {
                warn!(
                    request_id = %answer.request_id,
                    "answered credential request had no in-process waiter"
                );
            }
        } else {
            warn!(
                request_id = %answer.request_id,
                "dropping credential code: request is not pending"
            );
            counter!("scout_credential_answers_dropped_total").increment(1);
        }
        Ok(())
    }
}

/// Consume `credential.answered` events and feed them to the relay.
pub async fn run_answer_consumer(
    consumer: StreamConsumer,
    relay: Arc<CredentialRelay>,
    liveness: HealthHandle,
) {
    let mut stream = consumer.stream();
    let mut interval = tokio::time::interval(Duration::from_secs(10));

    loop {
        tokio::select! {
            _ = interval.tick() => {
                liveness.report_healthy();
            }
            result = stream.next() => {
                let Some(result) = result else {
                    continue;
                };
                let message = match result {
                    Ok(message) => message,
                    Err(e) => {
                        error!("credential answer consumer error: {}", e);
                        continue;
                    }
                };
                let Some(payload) = message.payload() else {
                    continue;
                };
                let answer = match serde_json::from_slice::<CredentialAnswered>(payload) {
                    Ok(answer) => answer,
                    Err(e) => {
                        warn!("failed to deserialize credential answer: {}", e);
                        continue;
                    }
                };
                if let Err(e) = relay.deliver_answer(answer).await {
                    error!("failed to apply credential answer: {}", e);
                }
            }
        }
    }
}
