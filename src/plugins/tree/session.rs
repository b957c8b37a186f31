use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use tokio::task::JoinHandle;

use crate::plugins::kv::KvStore;
use crate::services::ai::{ChatMessage, CompletionBackend};
use crate::services::ids::ConversationId;

use super::TreeError;
use super::index::conversation_key;
use super::node::NodeType;
use super::tree::{ConversationTree, Effect, Effects, GenerationOutcome};

/// A [`ConversationTree`] bound to its storage and completion backend.
///
/// Tree mutations are applied under a short synchronous lock; the effects they
/// report (autosave, background title) run afterwards without holding it.
#[derive(Clone)]
pub struct ConversationSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    tree: Mutex<ConversationTree>,
    store: Arc<dyn KvStore>,
    completions: Arc<dyn CompletionBackend>,
    // Serializes snapshot+write so an older snapshot never overwrites a newer one.
    save_lock: tokio::sync::Mutex<()>,
    title_in_flight: AtomicBool,
    title_task: Mutex<Option<JoinHandle<()>>>,
}

impl ConversationSession {
    pub fn new(
        tree: ConversationTree,
        store: Arc<dyn KvStore>,
        completions: Arc<dyn CompletionBackend>,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                tree: Mutex::new(tree),
                store,
                completions,
                save_lock: tokio::sync::Mutex::new(()),
                title_in_flight: AtomicBool::new(false),
                title_task: Mutex::new(None),
            }),
        }
    }

    /// Fresh conversation. Written immediately when `handle` is set.
    pub async fn initialize(
        handle: Option<ConversationId>,
        store: Arc<dyn KvStore>,
        completions: Arc<dyn CompletionBackend>,
    ) -> Self {
        let session = Self::new(ConversationTree::initialize(handle), store, completions);
        session.autosave().await;
        session
    }

    /// `Ok(None)` when nothing is stored under `handle`.
    pub async fn load(
        handle: ConversationId,
        store: Arc<dyn KvStore>,
        completions: Arc<dyn CompletionBackend>,
    ) -> Result<Option<Self>, TreeError> {
        let key = conversation_key(&handle);
        let Some(raw) = store.get(&key).await? else {
            return Ok(None);
        };
        let tree = ConversationTree::deserialize_state(Some(handle), &raw)?;
        log::info!("Loaded conversation {} ({} nodes)", key, tree.len());
        Ok(Some(Self::new(tree, store, completions)))
    }

    pub async fn load_or_initialize(
        handle: ConversationId,
        store: Arc<dyn KvStore>,
        completions: Arc<dyn CompletionBackend>,
    ) -> Result<Self, TreeError> {
        if let Some(session) = Self::load(handle.clone(), store.clone(), completions.clone()).await? {
            return Ok(session);
        }
        log::info!("No stored conversation {}; starting a new one", handle);
        Ok(Self::initialize(Some(handle), store, completions).await)
    }

    fn tree(&self) -> Result<MutexGuard<'_, ConversationTree>, TreeError> {
        self.inner
            .tree
            .lock()
            .map_err(|_| TreeError::internal("Conversation lock poisoned"))
    }

    pub fn handle(&self) -> Option<ConversationId> {
        self.tree().ok().and_then(|tree| tree.handle().cloned())
    }

    pub fn with_tree<R>(&self, f: impl FnOnce(&ConversationTree) -> R) -> Result<R, TreeError> {
        let tree = self.tree()?;
        Ok(f(&*tree))
    }

    pub fn snapshot(&self) -> Result<ConversationTree, TreeError> {
        self.with_tree(ConversationTree::clone)
    }

    /// Bind the conversation to `handle` and write it.
    pub async fn set_handle(&self, handle: ConversationId) -> Result<(), TreeError> {
        self.tree()?.set_handle(handle);
        self.save().await.map(|_| ())
    }

    // ------------------------------------------------------------------
    // Tree operations
    // ------------------------------------------------------------------

    pub async fn add_child(&self, parent_id: &str, child_type: NodeType) -> Result<String, TreeError> {
        let applied = self.tree()?.add_child(parent_id, child_type)?;
        self.apply_effects(&applied.effects).await;
        Ok(applied.value)
    }

    pub async fn update_text(&self, node_id: &str, text: &str) -> Result<(), TreeError> {
        let applied = self.tree()?.update_text(node_id, text)?;
        self.apply_effects(&applied.effects).await;
        Ok(())
    }

    /// Returns the removed ids.
    pub async fn delete_node(&self, node_id: &str) -> Result<Vec<String>, TreeError> {
        let applied = self.tree()?.delete_node(node_id)?;
        self.apply_effects(&applied.effects).await;
        Ok(applied.value)
    }

    pub fn build_messages_from_tree(&self, target_id: &str) -> Result<Vec<ChatMessage>, TreeError> {
        self.with_tree(|tree| tree.build_messages_from_tree(target_id))
    }

    /// Ask the completion backend for the text of llm node `node_id`.
    ///
    /// On failure the node text is replaced by an error marker and the error is
    /// returned. The node leaves the generating set on every path.
    pub async fn generate_llm_response(&self, node_id: &str) -> Result<String, TreeError> {
        let messages = self.tree()?.begin_generation(node_id)?;
        let guard = GenerationGuard {
            session: self.inner.as_ref(),
            node_id,
            armed: true,
        };

        log::info!(
            "Generating response for {} ({} context messages)",
            node_id,
            messages.len()
        );
        let result = self.inner.completions.complete(&messages).await;

        let applied = self
            .tree()?
            .finish_generation(node_id, result.as_ref().map(String::as_str));
        guard.disarm();
        self.apply_effects(&applied.effects).await;

        match result {
            Ok(content) => Ok(content),
            Err(err) => {
                if applied.value != GenerationOutcome::NodeGone {
                    log::warn!("Generation for {} failed: {}", node_id, err);
                }
                Err(TreeError::from(err))
            }
        }
    }

    // ------------------------------------------------------------------
    // Title
    // ------------------------------------------------------------------

    /// Name the conversation from its transcript. Best effort: failures are
    /// logged and yield `None`, as does an already-titled conversation.
    pub async fn generate_conversation_title(&self) -> Option<String> {
        let transcript = match self.tree() {
            Ok(tree) => tree.title_transcript(),
            Err(err) => {
                log::warn!("Title generation skipped: {}", err);
                None
            }
        }?;

        let title = match self.inner.completions.generate_title(&transcript).await {
            Ok(title) => title,
            Err(err) => {
                log::warn!("Title generation failed: {}", err);
                return None;
            }
        };

        let (applied, stored) = {
            let mut tree = self.tree().ok()?;
            let applied = tree.apply_title(&title);
            (applied, tree.title().to_string())
        };
        if !applied.value {
            return None;
        }
        if applied.persists() {
            self.autosave().await;
        }
        log::info!("Conversation titled {:?}", stored);
        Some(stored)
    }

    fn spawn_title_generation(&self) {
        if self.inner.title_in_flight.swap(true, Ordering::SeqCst) {
            return;
        }
        let session = self.clone();
        let handle = tokio::spawn(async move {
            let _ = session.generate_conversation_title().await;
            session.inner.title_in_flight.store(false, Ordering::SeqCst);
        });
        if let Ok(mut slot) = self.inner.title_task.lock() {
            *slot = Some(handle);
        }
    }

    /// Wait for the most recent background title task, if any.
    pub async fn wait_for_title(&self) {
        let handle = self.inner.title_task.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                log::warn!("Title task ended abnormally: {}", err);
            }
        }
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    /// Write the current state. `Ok(false)` when no handle is assigned yet.
    pub async fn save(&self) -> Result<bool, TreeError> {
        let _save = self.inner.save_lock.lock().await;

        let (key, raw) = {
            let mut tree = self.tree()?;
            let Some(handle) = tree.handle().cloned() else {
                return Ok(false);
            };
            tree.touch(Utc::now());
            (conversation_key(&handle), tree.serialize_state()?)
        };

        self.inner.store.set(&key, &raw).await?;
        log::debug!("Saved {} ({} bytes)", key, raw.len());
        Ok(true)
    }

    async fn autosave(&self) {
        if let Err(err) = self.save().await {
            log::warn!("Autosave failed: {}", err);
        }
    }

    async fn apply_effects(&self, effects: &Effects) {
        for effect in effects {
            match effect {
                Effect::Persist => self.autosave().await,
                Effect::GenerateTitle => self.spawn_title_generation(),
            }
        }
    }
}

/// Releases a node from generating status if the call future is dropped
/// before the result is recorded.
struct GenerationGuard<'a> {
    session: &'a SessionInner,
    node_id: &'a str,
    armed: bool,
}

impl GenerationGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for GenerationGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Ok(mut tree) = self.session.tree.lock() {
            tree.release_generation(self.node_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use super::*;
    use crate::plugins::kv::{MemoryKvStore, StoreError};
    use crate::services::ai::AiError;
    use crate::services::prompts;

    #[derive(Default)]
    struct ScriptedBackend {
        replies: Mutex<VecDeque<Result<String, AiError>>>,
        titles: Mutex<VecDeque<Result<String, AiError>>>,
        seen: Mutex<Vec<Vec<ChatMessage>>>,
        title_calls: AtomicUsize,
        gate: Option<Arc<Notify>>,
    }

    impl ScriptedBackend {
        fn replying(replies: Vec<Result<String, AiError>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                ..Default::default()
            }
        }

        fn gated(gate: Arc<Notify>) -> Self {
            Self {
                gate: Some(gate),
                ..Default::default()
            }
        }

        fn with_titles(self, titles: Vec<Result<String, AiError>>) -> Self {
            *self.titles.lock().unwrap() = titles.into();
            self
        }
    }

    #[async_trait]
    impl CompletionBackend for ScriptedBackend {
        async fn complete(&self, messages: &[ChatMessage]) -> Result<String, AiError> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            self.seen.lock().unwrap().push(messages.to_vec());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok("ok".to_string()))
        }

        async fn generate_title(&self, _transcript: &str) -> Result<String, AiError> {
            self.title_calls.fetch_add(1, Ordering::SeqCst);
            self.titles
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok("A title".to_string()))
        }
    }

    struct FailingStore;

    #[async_trait]
    impl KvStore for FailingStore {
        async fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
            Ok(None)
        }

        async fn set(&self, _key: &str, _value: &str) -> Result<(), StoreError> {
            Err(StoreError::database("disk full"))
        }

        async fn remove(&self, _key: &str) -> Result<bool, StoreError> {
            Ok(false)
        }

        async fn keys(&self) -> Result<Vec<String>, StoreError> {
            Ok(Vec::new())
        }
    }

    async fn session_with(
        backend: Arc<ScriptedBackend>,
    ) -> (ConversationSession, Arc<MemoryKvStore>, ConversationId) {
        let store = Arc::new(MemoryKvStore::new());
        let handle = ConversationId::new();
        let session =
            ConversationSession::initialize(Some(handle.clone()), store.clone(), backend).await;
        (session, store, handle)
    }

    fn root_of(session: &ConversationSession) -> String {
        session
            .with_tree(|t| t.root().unwrap().id.clone())
            .unwrap()
    }

    async fn stored(store: &MemoryKvStore, handle: &ConversationId) -> ConversationTree {
        let raw = store.get(&conversation_key(handle)).await.unwrap().unwrap();
        ConversationTree::deserialize_state(Some(handle.clone()), &raw).unwrap()
    }

    #[tokio::test]
    async fn test_mutations_autosave() {
        let backend = Arc::new(ScriptedBackend::default());
        let (session, store, handle) = session_with(backend).await;
        assert_eq!(stored(&store, &handle).await.len(), 1);

        let root = root_of(&session);
        let user = session.add_child(&root, NodeType::User).await.unwrap();
        session.update_text(&user, "Hello").await.unwrap();
        let saved = stored(&store, &handle).await;
        assert_eq!(saved.node(&user).unwrap().text, "Hello");

        session.delete_node(&user).await.unwrap();
        assert_eq!(stored(&store, &handle).await.len(), 1);
    }

    #[tokio::test]
    async fn test_autosave_noop_without_handle() {
        let store = Arc::new(MemoryKvStore::new());
        let session = ConversationSession::initialize(
            None,
            store.clone(),
            Arc::new(ScriptedBackend::default()),
        )
        .await;
        let root = root_of(&session);
        session.add_child(&root, NodeType::User).await.unwrap();
        assert!(store.keys().await.unwrap().is_empty());
        assert!(!session.save().await.unwrap());

        let handle = ConversationId::new();
        session.set_handle(handle.clone()).await.unwrap();
        assert_eq!(stored(&store, &handle).await.len(), 2);
    }

    #[tokio::test]
    async fn test_third_add_fails_leaving_two_nodes() {
        let (session, _store, _) = session_with(Arc::new(ScriptedBackend::default())).await;
        let root = root_of(&session);
        let user = session.add_child(&root, NodeType::User).await.unwrap();
        session.add_child(&user, NodeType::Llm).await.unwrap();
        let err = session.add_child(&user, NodeType::Llm).await.unwrap_err();
        assert!(err.message().contains("already has a child"));
        assert_eq!(session.with_tree(|t| t.len()).unwrap() - 1, 2);
    }

    #[tokio::test]
    async fn test_generate_success_and_title_once() {
        let backend = Arc::new(
            ScriptedBackend::replying(vec![Ok("First".into()), Ok("Second".into())])
                .with_titles(vec![Ok("Greetings".into())]),
        );
        let (session, store, handle) = session_with(backend.clone()).await;
        let root = root_of(&session);
        let user = session.add_child(&root, NodeType::User).await.unwrap();
        session.update_text(&user, "Hi").await.unwrap();
        let llm = session.add_child(&user, NodeType::Llm).await.unwrap();

        let text = session.generate_llm_response(&llm).await.unwrap();
        assert_eq!(text, "First");
        session.wait_for_title().await;

        let sent = backend.seen.lock().unwrap()[0].clone();
        assert_eq!(
            sent,
            vec![
                ChatMessage::system(prompts::SYSTEM_NODE_DEFAULT),
                ChatMessage::user("Hi"),
            ]
        );

        let text = session.generate_llm_response(&llm).await.unwrap();
        assert_eq!(text, "Second");
        session.wait_for_title().await;
        assert_eq!(backend.title_calls.load(Ordering::SeqCst), 1);

        let saved = stored(&store, &handle).await;
        assert_eq!(saved.title(), "Greetings");
        assert!(saved.title_generated());
        assert_eq!(saved.node(&llm).unwrap().text, "Second");
        assert_eq!(session.generate_conversation_title().await, None);
    }

    #[tokio::test]
    async fn test_title_failure_is_swallowed() {
        let backend = Arc::new(
            ScriptedBackend::default().with_titles(vec![Err(AiError::transport("offline"))]),
        );
        let (session, _store, _) = session_with(backend.clone()).await;
        assert_eq!(session.generate_conversation_title().await, None);
        assert!(!session.with_tree(|t| t.title_generated()).unwrap());

        assert_eq!(
            session.generate_conversation_title().await.as_deref(),
            Some("A title")
        );
        assert_eq!(backend.title_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_generate_on_user_node_changes_nothing() {
        let backend = Arc::new(ScriptedBackend::default());
        let (session, _store, _) = session_with(backend.clone()).await;
        let root = root_of(&session);
        let user = session.add_child(&root, NodeType::User).await.unwrap();
        let before = session.snapshot().unwrap();

        let err = session.generate_llm_response(&user).await.unwrap_err();
        assert!(matches!(err, TreeError::WrongNodeType { .. }));
        let after = session.snapshot().unwrap();
        assert_eq!(after.generating_nodes().count(), 0);
        assert_eq!(after.node(&user), before.node(&user));
        assert!(backend.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rate_limited_generation_marks_node() {
        let backend = Arc::new(ScriptedBackend::replying(vec![Err(AiError::provider(
            Some(429),
            "Rate limit reached for requests",
        ))]));
        let (session, store, handle) = session_with(backend.clone()).await;
        let root = root_of(&session);
        let user = session.add_child(&root, NodeType::User).await.unwrap();
        let llm = session.add_child(&user, NodeType::Llm).await.unwrap();

        let err = session.generate_llm_response(&llm).await.unwrap_err();
        match &err {
            TreeError::Completion { error } => assert_eq!(error.status(), Some(429)),
            other => panic!("unexpected error: {other:?}"),
        }

        let tree = session.snapshot().unwrap();
        let text = &tree.node(&llm).unwrap().text;
        assert!(prompts::is_generation_error_marker(text));
        assert!(text.contains("Rate limit"));
        assert!(!tree.is_generating(&llm));
        assert!(!tree.title_generated());

        session.wait_for_title().await;
        assert_eq!(backend.title_calls.load(Ordering::SeqCst), 0);
        assert!(prompts::is_generation_error_marker(
            &stored(&store, &handle).await.node(&llm).unwrap().text
        ));
    }

    #[tokio::test]
    async fn test_second_generation_rejected_while_in_flight() {
        let gate = Arc::new(Notify::new());
        let backend = Arc::new(ScriptedBackend::gated(gate.clone()));
        let (session, _store, _) = session_with(backend).await;
        let root = root_of(&session);
        let user = session.add_child(&root, NodeType::User).await.unwrap();
        let llm = session.add_child(&user, NodeType::Llm).await.unwrap();

        let first = {
            let session = session.clone();
            let llm = llm.clone();
            tokio::spawn(async move { session.generate_llm_response(&llm).await })
        };
        while !session.with_tree(|t| t.is_generating(&llm)).unwrap() {
            tokio::task::yield_now().await;
        }

        let err = session.generate_llm_response(&llm).await.unwrap_err();
        assert!(matches!(err, TreeError::AlreadyGenerating { .. }));

        gate.notify_one();
        assert_eq!(first.await.unwrap().unwrap(), "ok");
        assert!(!session.with_tree(|t| t.is_generating(&llm)).unwrap());
    }

    #[tokio::test]
    async fn test_node_deleted_mid_flight() {
        let gate = Arc::new(Notify::new());
        let backend = Arc::new(ScriptedBackend::gated(gate.clone()));
        let (session, store, handle) = session_with(backend).await;
        let root = root_of(&session);
        let user = session.add_child(&root, NodeType::User).await.unwrap();
        let llm = session.add_child(&user, NodeType::Llm).await.unwrap();

        let pending = {
            let session = session.clone();
            let llm = llm.clone();
            tokio::spawn(async move { session.generate_llm_response(&llm).await })
        };
        while !session.with_tree(|t| t.is_generating(&llm)).unwrap() {
            tokio::task::yield_now().await;
        }
        session.delete_node(&user).await.unwrap();

        gate.notify_one();
        assert!(pending.await.unwrap().is_ok());

        let tree = session.snapshot().unwrap();
        assert!(!tree.contains(&llm));
        assert_eq!(tree.generating_nodes().count(), 0);
        assert_eq!(stored(&store, &handle).await.len(), 1);
    }

    #[tokio::test]
    async fn test_dropped_call_releases_node() {
        let gate = Arc::new(Notify::new());
        let backend = Arc::new(ScriptedBackend::gated(gate));
        let (session, _store, _) = session_with(backend).await;
        let root = root_of(&session);
        let user = session.add_child(&root, NodeType::User).await.unwrap();
        let llm = session.add_child(&user, NodeType::Llm).await.unwrap();

        let pending = {
            let session = session.clone();
            let llm = llm.clone();
            tokio::spawn(async move { session.generate_llm_response(&llm).await })
        };
        while !session.with_tree(|t| t.is_generating(&llm)).unwrap() {
            tokio::task::yield_now().await;
        }
        pending.abort();
        let _ = pending.await;

        let tree = session.snapshot().unwrap();
        assert!(!tree.is_generating(&llm));
        assert_eq!(tree.node(&llm).unwrap().text, prompts::LLM_NODE_PLACEHOLDER);
    }

    #[tokio::test]
    async fn test_write_failure_keeps_mutation() {
        let session = ConversationSession::initialize(
            Some(ConversationId::new()),
            Arc::new(FailingStore),
            Arc::new(ScriptedBackend::default()),
        )
        .await;
        let root = root_of(&session);
        let user = session.add_child(&root, NodeType::User).await.unwrap();
        assert!(session.with_tree(|t| t.contains(&user)).unwrap());
        assert!(matches!(
            session.save().await,
            Err(TreeError::Storage { .. })
        ));
    }

    #[tokio::test]
    async fn test_load_or_initialize() {
        let store = Arc::new(MemoryKvStore::new());
        let backend: Arc<dyn CompletionBackend> = Arc::new(ScriptedBackend::default());
        let handle = ConversationId::new();

        assert!(
            ConversationSession::load(handle.clone(), store.clone(), backend.clone())
                .await
                .unwrap()
                .is_none()
        );

        let session =
            ConversationSession::load_or_initialize(handle.clone(), store.clone(), backend.clone())
                .await
                .unwrap();
        let root = root_of(&session);
        let user = session.add_child(&root, NodeType::User).await.unwrap();

        let reloaded = ConversationSession::load_or_initialize(handle.clone(), store, backend)
            .await
            .unwrap();
        assert_eq!(reloaded.handle(), Some(handle));
        assert!(reloaded.with_tree(|t| t.contains(&user)).unwrap());
        assert_eq!(reloaded.with_tree(|t| t.seq()).unwrap(), 2);
    }
}
