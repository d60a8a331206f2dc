//! Runs effects as tokio tasks and reports their outcome as actions.
//!
//! Every request runs under a cancellation token scoped to the tab that
//! issued it and, for chat requests, to that chat within the tab. Cancelled
//! requests dispatch nothing; the handler that cancelled them has already
//! rolled back whatever they were carrying.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::api::{ApiClient, ApiError};
use crate::core::actions::{Action, ActionDispatcher};
use crate::core::effects::{Effect, EffectRequest};
use crate::core::ids::{ChatId, TabId};

/// Attempts made for idempotent reads before reporting failure.
const READ_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(50);

/// A cancellation scope. Every request running under it holds a clone of
/// `live`, so a scope whose `live` is unshared has nothing left to cancel.
struct Scope {
    token: CancellationToken,
    live: Arc<()>,
}

impl Scope {
    fn child_of(parent: &CancellationToken) -> Self {
        Self {
            token: parent.child_token(),
            live: Arc::new(()),
        }
    }

    fn is_idle(&self) -> bool {
        Arc::strong_count(&self.live) == 1
    }
}

struct TabScope {
    scope: Scope,
    chats: HashMap<ChatId, Scope>,
}

/// What a spawned request carries: its token and a hold on each scope.
struct RequestScope {
    token: CancellationToken,
    holds: Vec<Arc<()>>,
}

pub struct EffectExecutor {
    api: Arc<dyn ApiClient>,
    dispatcher: ActionDispatcher,
    root: CancellationToken,
    tabs: HashMap<TabId, TabScope>,
}

impl EffectExecutor {
    pub fn new(api: Arc<dyn ApiClient>, dispatcher: ActionDispatcher) -> Self {
        Self {
            api,
            dispatcher,
            root: CancellationToken::new(),
            tabs: HashMap::new(),
        }
    }

    /// Starts the request behind `request`, or applies a cancellation.
    /// Returns the task handle for requests.
    pub fn execute(&mut self, request: EffectRequest) -> Option<JoinHandle<()>> {
        let EffectRequest { tab_id, effect } = request;
        let scope = match &effect {
            Effect::CancelTab => {
                self.cancel_tab(&tab_id);
                return None;
            }
            Effect::CancelChat { chat_id } => {
                self.cancel_chat(chat_id);
                return None;
            }
            Effect::CancelAll => {
                self.cancel_all();
                return None;
            }
            other => self.token_for(&tab_id, other.chat_id()),
        };

        let api = Arc::clone(&self.api);
        let handle = match effect {
            Effect::LoadChats => self.spawn(scope, tab_id, "loadChats", async move {
                match with_retries("loadChats", || api.load_chats()).await {
                    Ok(page) => Action::ChatsLoaded {
                        chats: page.chats,
                        users: page.users,
                        messages: page.messages,
                        replace: true,
                    },
                    Err(err) => Action::ChatsLoadFailed {
                        error: err.to_string(),
                    },
                }
            }),
            Effect::SendMessage {
                chat_id,
                text,
                correlation,
            } => self.spawn(scope, tab_id, "sendMessage", async move {
                match api.send_message(&chat_id, &text, correlation).await {
                    Ok(message) => Action::SendMessageSucceeded {
                        correlation,
                        message,
                    },
                    Err(err) => Action::SendMessageFailed {
                        correlation,
                        error: err.to_string(),
                    },
                }
            }),
            Effect::DeleteMessages {
                chat_id,
                message_ids,
            } => self.spawn(scope, tab_id, "deleteMessages", async move {
                match api.delete_messages(&chat_id, &message_ids).await {
                    Ok(()) => Action::MessagesDeleted {
                        chat_id,
                        message_ids,
                    },
                    Err(err) => Action::DeleteMessagesFailed {
                        chat_id,
                        message_ids,
                        error: err.to_string(),
                    },
                }
            }),
            Effect::PinMessage {
                chat_id,
                message_id,
                is_pinned,
                correlation,
            } => self.spawn(scope, tab_id, "pinMessage", async move {
                match api.pin_message(&chat_id, message_id, is_pinned).await {
                    Ok(()) => Action::PinMessageSucceeded { correlation },
                    Err(err) => Action::PinMessageFailed {
                        correlation,
                        error: err.to_string(),
                    },
                }
            }),
            Effect::UpdateContact { user, correlation } => {
                self.spawn(scope, tab_id, "updateContact", async move {
                    match api.update_contact(&user).await {
                        Ok(user) => Action::UpdateContactSucceeded { correlation, user },
                        Err(err) => Action::UpdateContactFailed {
                            correlation,
                            error: err.to_string(),
                        },
                    }
                })
            }
            Effect::UploadProfilePhoto {
                user_id,
                file_name,
                correlation,
            } => self.spawn(scope, tab_id, "uploadProfilePhoto", async move {
                match api.upload_profile_photo(&user_id, &file_name).await {
                    Ok(photo) => Action::UploadProfilePhotoSucceeded { correlation, photo },
                    Err(err) => Action::UploadProfilePhotoFailed {
                        correlation,
                        error: err.to_string(),
                    },
                }
            }),
            Effect::FetchCountryList { language } => {
                self.spawn(scope, tab_id, "fetchCountryList", async move {
                    match with_retries("fetchCountryList", || api.fetch_country_list(&language))
                        .await
                    {
                        Ok(countries) => Action::CountryListLoaded { countries },
                        Err(err) => Action::CountryListLoadFailed {
                            error: err.to_string(),
                        },
                    }
                })
            }
            Effect::CancelTab | Effect::CancelChat { .. } | Effect::CancelAll => return None,
        };
        Some(handle)
    }

    /// Cancels every request issued by `tab_id`.
    pub fn cancel_tab(&mut self, tab_id: &TabId) {
        if let Some(tab) = self.tabs.remove(tab_id) {
            debug!(tab = %tab_id, "cancelling tab requests");
            tab.scope.token.cancel();
        }
    }

    /// Cancels requests about `chat_id` from every tab.
    pub fn cancel_chat(&mut self, chat_id: &ChatId) {
        for tab in self.tabs.values_mut() {
            if let Some(chat) = tab.chats.remove(chat_id) {
                chat.token.cancel();
            }
        }
        debug!(chat = %chat_id, "cancelled chat requests");
    }

    pub fn cancel_all(&mut self) {
        self.root.cancel();
        self.root = CancellationToken::new();
        self.tabs.clear();
        debug!("cancelled all requests");
    }

    /// Drops the scopes of chats and tabs with no request in flight.
    pub fn prune(&mut self) {
        self.tabs.retain(|_, tab| {
            tab.chats.retain(|_, chat| !chat.is_idle());
            !tab.scope.is_idle()
        });
    }

    /// Number of tabs with a live request scope.
    pub fn scoped_tabs(&self) -> usize {
        self.tabs.len()
    }

    pub fn scoped_chats(&self) -> usize {
        self.tabs.values().map(|tab| tab.chats.len()).sum()
    }

    fn token_for(&mut self, tab_id: &TabId, chat_id: Option<&ChatId>) -> RequestScope {
        let root = &self.root;
        let tab = self.tabs.entry(tab_id.clone()).or_insert_with(|| TabScope {
            scope: Scope::child_of(root),
            chats: HashMap::new(),
        });
        let mut holds = vec![Arc::clone(&tab.scope.live)];
        let token = match chat_id {
            Some(chat_id) => {
                let tab_token = &tab.scope.token;
                let chat = tab
                    .chats
                    .entry(chat_id.clone())
                    .or_insert_with(|| Scope::child_of(tab_token));
                holds.push(Arc::clone(&chat.live));
                chat.token.clone()
            }
            None => tab.scope.token.child_token(),
        };
        RequestScope { token, holds }
    }

    fn spawn<F>(
        &self,
        scope: RequestScope,
        tab_id: TabId,
        label: &'static str,
        work: F,
    ) -> JoinHandle<()>
    where
        F: Future<Output = Action> + Send + 'static,
    {
        let dispatcher = self.dispatcher.clone();
        let RequestScope { token, holds } = scope;
        tokio::spawn(async move {
            let _holds = holds;
            tokio::select! {
                _ = token.cancelled() => {
                    debug!(effect = label, tab = %tab_id, "request cancelled");
                }
                action = work => {
                    dispatcher.dispatch(&tab_id, action);
                }
            }
        })
    }
}

async fn with_retries<T, F, Fut>(label: &'static str, mut attempt: F) -> Result<T, ApiError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    let mut tries = 1;
    loop {
        match attempt().await {
            Err(err) if err.is_transient() && tries < READ_ATTEMPTS => {
                warn!(effect = label, attempt = tries, error = %err, "retrying request");
                tokio::time::sleep(RETRY_BACKOFF * tries).await;
                tries += 1;
            }
            result => return result,
        }
    }
}
