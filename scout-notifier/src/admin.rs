use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use metrics::counter;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use scout_common::kafka::{publish_json, Publisher};
use scout_common::messages::{CredentialAnswered, CredentialRequested, CREDENTIAL_ANSWERED_TOPIC};

use crate::bot::BotClient;

#[derive(Default)]
struct AdminState {
    /// Request ids we have already prompted for; duplicate broker deliveries
    /// of the same request must not prompt the administrator twice.
    seen: HashSet<Uuid>,
    /// Prompts waiting for a reply, oldest first. The next code-looking
    /// admin message answers the front of the queue.
    outstanding: VecDeque<Uuid>,
}

/// The answering side of the credential relay: forwards "code needed"
/// prompts to the fixed administrator chat and publishes the reply back as
/// `credential.answered`.
pub struct AdminRelay {
    bot: Arc<dyn BotClient>,
    publisher: Arc<dyn Publisher>,
    admin_chat_id: i64,
    state: Mutex<AdminState>,
}

impl AdminRelay {
    pub fn new(bot: Arc<dyn BotClient>, publisher: Arc<dyn Publisher>, admin_chat_id: i64) -> Self {
        Self {
            bot,
            publisher,
            admin_chat_id,
            state: Mutex::new(AdminState::default()),
        }
    }

    /// Apply one `credential.requested` event.
    pub async fn handle_request(&self, request: CredentialRequested) {
        {
            let mut state = self.state.lock().expect("poisoned admin state lock");
            if !state.seen.insert(request.request_id) {
                debug!(request_id = %request.request_id, "ignoring duplicate credential request");
                return;
            }
            state.outstanding.push_back(request.request_id);
        }

        let prompt = format!(
            "A scraping session needs a login code.\n\n{}\n\nReply with the code to continue.",
            request.hint
        );
        match self.bot.send_message(self.admin_chat_id, &prompt).await {
            Ok(()) => info!(
                request_id = %request.request_id,
                session_id = %request.session_id,
                "forwarded credential prompt to administrator"
            ),
            // Keep the slot: the admin may still reply late, and the
            // requesting side's timeout cleans up abandoned requests.
            Err(e) => error!(
                request_id = %request.request_id,
                "failed to prompt administrator: {}", e
            ),
        }
    }

    /// Inspect one message from the administrator chat. Returns true when
    /// the message was consumed as a credential code.
    pub async fn handle_admin_message(&self, text: &str) -> bool {
        let code = text.trim();
        if !looks_like_code(code) {
            return false;
        }

        let request_id = {
            let mut state = self.state.lock().expect("poisoned admin state lock");
            match state.outstanding.pop_front() {
                Some(request_id) => request_id,
                None => {
                    debug!("received code-like message with no outstanding prompt");
                    return false;
                }
            }
        };

        let answer = CredentialAnswered {
            request_id,
            code: code.to_owned(),
        };
        if let Err(e) = publish_json(
            self.publisher.as_ref(),
            CREDENTIAL_ANSWERED_TOPIC,
            None,
            &answer,
        )
        .await
        {
            // Put the prompt back so the admin can retry the same code.
            self.state
                .lock()
                .expect("poisoned admin state lock")
                .outstanding
                .push_front(request_id);
            error!(request_id = %request_id, "failed to publish credential answer: {}", e);
            return false;
        }

        counter!("scout_credential_answers_published_total").increment(1);
        info!(request_id = %request_id, "published credential answer");

        if let Err(e) = self
            .bot
            .send_message(self.admin_chat_id, &format!("Code {} forwarded.", code))
            .await
        {
            warn!("failed to acknowledge administrator: {}", e);
        }
        true
    }
}

/// A short digit-or-alphanumeric message that is not a bot command.
fn looks_like_code(text: &str) -> bool {
    if text.is_empty() || text.starts_with('/') {
        return false;
    }
    text.chars().all(|c| c.is_ascii_digit()) || text.len() <= 10
}
