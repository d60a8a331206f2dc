#[cfg(test)]
use std::collections::BTreeMap;
#[cfg(test)]
use std::sync::Arc;

#[cfg(test)]
use chrono::{DateTime, Duration, TimeZone, Utc};

#[cfg(test)]
use crate::api::{ApiClient, ApiError, ChatsPage};
#[cfg(test)]
use crate::core::account::{AuthSession, AuthState};
#[cfg(test)]
use crate::core::entities::{Chat, ChatKind, CountryCode, Message, PhotoRef, User};
#[cfg(test)]
use crate::core::ids::{ChatId, CorrelationId, CountryIso, MessageId, TabId, UserId};
#[cfg(test)]
use crate::core::patch::{EntityPatch, TablePatch};
#[cfg(test)]
use crate::core::snapshot::Snapshot;
#[cfg(test)]
use crate::core::tab_state::TabState;

#[cfg(test)]
pub fn fixed_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

#[cfg(test)]
pub fn sample_chat(id: &str, title: &str) -> Chat {
    Chat {
        id: ChatId::from(id),
        title: title.to_string(),
        kind: ChatKind::Private,
        member_ids: Vec::new(),
        is_muted: false,
        unread_count: 0,
        last_message_id: None,
        last_message_date: None,
    }
}

#[cfg(test)]
pub fn sample_user(id: &str, first_name: &str) -> User {
    User {
        id: UserId::from(id),
        first_name: first_name.to_string(),
        last_name: None,
        phone: None,
        is_contact: false,
        photo: None,
    }
}

/// Server message `n` in `chat`, sent by `u1` `n` minutes after
/// [`fixed_time`].
#[cfg(test)]
pub fn sample_message(chat: &str, n: i64, text: &str) -> Message {
    Message {
        id: MessageId::Server(n),
        chat_id: ChatId::from(chat),
        sender_id: Some(UserId::from("u1")),
        text: text.to_string(),
        date: fixed_time() + Duration::minutes(n),
        is_pinned: false,
        is_pending: false,
    }
}

/// Two registered tabs (`A`, `B`), chat `c1` between `u1` and `u2` holding
/// messages 1 to 3, signed in as `u1`.
#[cfg(test)]
pub fn seeded_snapshot() -> Snapshot {
    let mut snapshot = Snapshot::default();

    let mut chat = sample_chat("c1", "Lovelace & Hopper");
    chat.member_ids = vec![UserId::from("u1"), UserId::from("u2")];
    chat.last_message_id = Some(MessageId::Server(3));
    chat.last_message_date = Some(fixed_time() + Duration::minutes(3));

    EntityPatch::Chats(TablePatch::merge(vec![chat])).apply(&mut snapshot.entities);
    EntityPatch::Users(TablePatch::merge(vec![
        sample_user("u1", "Ada"),
        sample_user("u2", "Grace"),
    ]))
    .apply(&mut snapshot.entities);
    EntityPatch::Messages {
        chat_id: ChatId::from("c1"),
        patch: TablePatch::merge(vec![
            sample_message("c1", 1, "hello"),
            sample_message("c1", 2, "how are you"),
            sample_message("c1", 3, "see you"),
        ]),
    }
    .apply(&mut snapshot.entities);

    let tabs: BTreeMap<TabId, Arc<TabState>> = ["A", "B"]
        .into_iter()
        .map(|id| (TabId::from(id), Arc::new(TabState::new(TabId::from(id)))))
        .collect();
    snapshot.by_tab = Arc::new(tabs);
    snapshot.auth = Arc::new(AuthState {
        session: Some(AuthSession {
            user_id: UserId::from("u1"),
            token: "token".to_string(),
            dc_id: 2,
            created_at: fixed_time(),
        }),
    });
    snapshot.last_sync_time = Some(fixed_time());
    snapshot
}

/// Scripted [`ApiClient`] for effect and runtime tests.
///
/// Succeeds by default. Requests can be made to fail, to fail transiently a
/// number of times, or to wait on a semaphore until the test releases them.
#[cfg(test)]
#[derive(Default)]
pub struct MockApi {
    fail: bool,
    gate: Option<Arc<tokio::sync::Semaphore>>,
    transient_failures: std::sync::atomic::AtomicUsize,
    next_id: std::sync::atomic::AtomicI64,
    calls: std::sync::Mutex<Vec<String>>,
}

#[cfg(test)]
impl MockApi {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn gated(gate: Arc<tokio::sync::Semaphore>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::default()
        }
    }

    /// Makes the next `count` reads answer 503.
    pub fn fail_transiently(&self, count: usize) {
        self.transient_failures
            .store(count, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    async fn enter(&self, call: &str) -> Result<(), ApiError> {
        self.calls.lock().unwrap().push(call.to_string());
        if let Some(gate) = &self.gate {
            let _permit = gate.acquire().await;
        }
        if self.fail {
            return Err(ApiError::Status {
                status: 400,
                body: format!("{call} refused"),
            });
        }
        Ok(())
    }

    fn read_fault(&self) -> Result<(), ApiError> {
        use std::sync::atomic::Ordering;
        let remaining = self.transient_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(ApiError::Status {
                status: 503,
                body: "unavailable".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
#[async_trait::async_trait]
impl ApiClient for MockApi {
    async fn load_chats(&self) -> Result<ChatsPage, ApiError> {
        self.enter("loadChats").await?;
        self.read_fault()?;
        let mut chat = sample_chat("c1", "Lovelace & Hopper");
        chat.member_ids = vec![UserId::from("u1"), UserId::from("u2")];
        chat.last_message_id = Some(MessageId::Server(3));
        chat.last_message_date = Some(fixed_time() + Duration::minutes(3));
        Ok(ChatsPage {
            chats: vec![chat],
            users: vec![sample_user("u1", "Ada"), sample_user("u2", "Grace")],
            messages: vec![
                sample_message("c1", 1, "hello"),
                sample_message("c1", 2, "how are you"),
                sample_message("c1", 3, "see you"),
            ],
        })
    }

    async fn send_message(
        &self,
        chat_id: &ChatId,
        text: &str,
        _correlation: CorrelationId,
    ) -> Result<Message, ApiError> {
        self.enter("sendMessage").await?;
        let n = 100
            + self
                .next_id
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(Message {
            id: MessageId::Server(n),
            chat_id: chat_id.clone(),
            sender_id: Some(UserId::from("u1")),
            text: text.to_string(),
            date: fixed_time() + Duration::hours(1),
            is_pinned: false,
            is_pending: false,
        })
    }

    async fn delete_messages(
        &self,
        _chat_id: &ChatId,
        _message_ids: &[MessageId],
    ) -> Result<(), ApiError> {
        self.enter("deleteMessages").await
    }

    async fn pin_message(
        &self,
        _chat_id: &ChatId,
        _message_id: MessageId,
        _is_pinned: bool,
    ) -> Result<(), ApiError> {
        self.enter("pinMessage").await
    }

    async fn update_contact(&self, user: &User) -> Result<User, ApiError> {
        self.enter("updateContact").await?;
        Ok(user.clone())
    }

    async fn upload_profile_photo(
        &self,
        _user_id: &UserId,
        file_name: &str,
    ) -> Result<PhotoRef, ApiError> {
        self.enter("uploadProfilePhoto").await?;
        Ok(PhotoRef {
            id: format!("photo-{file_name}"),
            width: 640,
            height: 640,
            is_local: false,
        })
    }

    async fn fetch_country_list(&self, language: &str) -> Result<Vec<CountryCode>, ApiError> {
        self.enter("fetchCountryList").await?;
        self.read_fault()?;
        Ok(vec![CountryCode {
            iso2: CountryIso::from("FR"),
            default_name: "France".to_string(),
            name: (language != "en").then(|| format!("France ({language})")),
            calling_codes: vec!["33".to_string()],
            is_hidden: false,
        }])
    }
}
