//! One conversational turn across the retrieval engine, the memory store and
//! the two language-model collaborators.

use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::context_engine::collaborators::{AnswerGenerator, ProfileExtractor};
use crate::context_engine::context_builder::{BuiltContext, ContextBuilder};
use crate::error::{IndexError, StoreError, TurnError};
use crate::memory_db::{ExtractedProfile, MemoryDatabase, Role, StoredMessage, UserProfile};
use crate::retry::RetryPolicy;
use crate::vector_index::VectorIndexEngine;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub top_k: usize,
    pub max_context_chars: usize,
    pub retry: RetryPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            max_context_chars: 12_000,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnReply {
    pub answer: String,
    pub context_documents: usize,
    pub profile_merged: bool,
}

pub struct TurnOrchestrator {
    database: Arc<MemoryDatabase>,
    index: Arc<VectorIndexEngine>,
    generator: Arc<dyn AnswerGenerator>,
    extractor: Arc<dyn ProfileExtractor>,
    context_builder: ContextBuilder,
    config: OrchestratorConfig,
}

impl TurnOrchestrator {
    pub fn new(
        database: Arc<MemoryDatabase>,
        index: Arc<VectorIndexEngine>,
        generator: Arc<dyn AnswerGenerator>,
        extractor: Arc<dyn ProfileExtractor>,
        config: OrchestratorConfig,
    ) -> Self {
        info!(
            "Turn orchestrator initialized (top_k={}, max_context_chars={})",
            config.top_k, config.max_context_chars
        );
        Self {
            database,
            index,
            generator,
            extractor,
            context_builder: ContextBuilder::new(config.max_context_chars),
            config,
        }
    }

    pub fn database(&self) -> &Arc<MemoryDatabase> {
        &self.database
    }

    pub fn index(&self) -> &Arc<VectorIndexEngine> {
        &self.index
    }

    /// Register a new user or log an existing one in; returns the user id.
    pub async fn register_or_login(
        &self,
        username: &str,
        password: &str,
        is_register: bool,
    ) -> Result<String, TurnError> {
        let username = username.to_string();
        let password = password.to_string();
        let user_id = if is_register {
            self.on_store_retrying("store:register", move |db| {
                if db.users.get_user_by_username(&username)?.is_some() {
                    return Err(StoreError::DuplicateUsername(username.clone()));
                }
                db.users.create_user(&username, &password)
            })
            .await?
        } else {
            self.on_store_retrying("store:login", move |db| db.users.authenticate(&username, &password))
                .await?
        };
        Ok(user_id)
    }

    /// Alias of [`handle_turn`](Self::handle_turn) matching the request surface.
    pub async fn submit_turn(&self, user_id: &str, question: &str) -> Result<TurnReply, TurnError> {
        self.handle_turn(user_id, question).await
    }

    /// Run one turn:
    ///
    /// 1. record the user's message,
    /// 2. retrieve the top-k similar exchanges,
    /// 3. generate the answer from them,
    /// 4. extract profile facts (concurrently with 2 and 3),
    /// 5. merge the facts,
    /// 6. record the answer,
    /// 7. return it.
    ///
    /// The user message is committed before anything can fail upstream and
    /// stays committed whatever happens afterwards.
    pub async fn handle_turn(&self, user_id: &str, question: &str) -> Result<TurnReply, TurnError> {
        let result = self.run_turn(user_id, question).await;
        #[cfg(feature = "cli")]
        crate::metrics::inc_turn(if result.is_ok() { "ok" } else { "error" });
        result
    }

    async fn run_turn(&self, user_id: &str, question: &str) -> Result<TurnReply, TurnError> {
        self.append(user_id, question, Role::User).await?;

        let answering = async {
            let context = self.retrieve(question).await?;
            let answer = self.generate(&context.text, question).await?;
            Ok::<_, TurnError>((answer, context.documents_used))
        };
        let (answered, extracted) = futures::join!(answering, self.extract(question));
        let (answer, context_documents) = answered?;

        let profile_merged = match extracted {
            Some(profile) if !profile.is_empty() => self.merge(user_id, profile).await,
            _ => false,
        };

        self.append(user_id, &answer, Role::Assistant).await?;

        debug!(
            "Turn complete for {} ({} context documents, profile merged: {})",
            user_id, context_documents, profile_merged
        );
        Ok(TurnReply { answer, context_documents, profile_merged })
    }

    async fn retrieve(&self, question: &str) -> Result<BuiltContext, TurnError> {
        let started = Instant::now();
        let documents = self
            .index
            .query(question, self.config.top_k)
            .await
            .map_err(retrieval_error)?;
        #[cfg(feature = "cli")]
        crate::metrics::observe_retrieval(started.elapsed().as_secs_f64());
        debug!("Retrieved {} documents in {:?}", documents.len(), started.elapsed());
        Ok(self.context_builder.build(&documents))
    }

    async fn generate(&self, context: &str, question: &str) -> Result<String, TurnError> {
        let generator = &self.generator;
        let answer = self
            .config
            .retry
            .run("generate", move || async move { generator.generate(context, question).await })
            .await?;
        Ok(answer.trim().to_string())
    }

    /// Extraction never fails the turn; any error means no profile update.
    async fn extract(&self, question: &str) -> Option<ExtractedProfile> {
        let extractor = &self.extractor;
        match self
            .config
            .retry
            .run("extract", move || async move { extractor.extract(question).await })
            .await
        {
            Ok(profile) => Some(profile),
            Err(e) => {
                warn!("Profile extraction skipped this turn: {}", e);
                #[cfg(feature = "cli")]
                crate::metrics::inc_extraction_failure();
                None
            }
        }
    }

    /// A failed merge loses this turn's profile facts, never the answer.
    async fn merge(&self, user_id: &str, profile: ExtractedProfile) -> bool {
        let user = user_id.to_string();
        match self
            .on_store_retrying("store:merge_profile", move |db| {
                db.profiles.merge_profile(&user, &profile)
            })
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!("Profile merge skipped for {}: {}", user_id, e);
                false
            }
        }
    }

    async fn append(&self, user_id: &str, text: &str, role: Role) -> Result<StoredMessage, TurnError> {
        let user = user_id.to_string();
        let text = text.to_string();
        Ok(self
            .on_store_retrying("store:append_message", move |db| {
                db.conversations.append_message(&user, &text, role)
            })
            .await?)
    }

    /// Ordered history; an empty history is reported as `NoHistory`.
    pub async fn fetch_history(&self, user_id: &str) -> Result<Vec<StoredMessage>, TurnError> {
        let user = user_id.to_string();
        let history = self
            .on_store_retrying("store:get_history", move |db| db.conversations.get_history(&user))
            .await?;
        if history.is_empty() {
            return Err(TurnError::NoHistory(user_id.to_string()));
        }
        Ok(history)
    }

    /// Store a message outside a turn. `role` must be `user` or `assistant`.
    pub async fn record_message(&self, user_id: &str, text: &str, role: &str) -> Result<StoredMessage, TurnError> {
        let role: Role = role.parse()?;
        self.append(user_id, text, role).await
    }

    pub async fn get_profile(&self, user_id: &str) -> Result<UserProfile, TurnError> {
        let user = user_id.to_string();
        Ok(self
            .on_store_retrying("store:get_profile", move |db| db.profiles.get_profile(&user))
            .await?)
    }

    /// Run a blocking store call off the async executor.
    async fn on_store<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&MemoryDatabase) -> Result<T, StoreError> + Send + 'static,
    {
        let database = Arc::clone(&self.database);
        tokio::task::spawn_blocking(move || f(&database))
            .await
            .map_err(|e| StoreError::Worker(e.to_string()))?
    }

    /// [`on_store`](Self::on_store) under the retry policy; only busy/locked
    /// database errors and pool timeouts are retried.
    async fn on_store_retrying<T, F>(&self, label: &str, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: Fn(&MemoryDatabase) -> Result<T, StoreError> + Clone + Send + 'static,
    {
        let this = self;
        self.config
            .retry
            .run(label, move || {
                let f = f.clone();
                this.on_store(move |db| f(db))
            })
            .await
    }
}

fn retrieval_error(e: IndexError) -> TurnError {
    match e {
        IndexError::Upstream(upstream) => TurnError::UpstreamFailure(upstream),
        other => TurnError::Index(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::UpstreamError;
    use crate::memory_db::FamilyMemberDelta;
    use crate::retry::Backoff;
    use crate::test_support::{
        fixture_corpus, BagOfWordsEmbedder, ExtractorMode, ScriptedExtractor, ScriptedGenerator,
    };
    use crate::vector_index::IndexArtifacts;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Harness {
        orchestrator: TurnOrchestrator,
        generator: Arc<ScriptedGenerator>,
        _dir: TempDir,
    }

    async fn harness(generator: ScriptedGenerator, extractor: ScriptedExtractor) -> Harness {
        let dir = TempDir::new().unwrap();
        let index = VectorIndexEngine::new(
            Arc::new(BagOfWordsEmbedder::new(64)),
            IndexArtifacts::in_dir(dir.path()),
        );
        index.build(fixture_corpus()).await.unwrap();

        let generator = Arc::new(generator);
        let config = OrchestratorConfig {
            top_k: 2,
            max_context_chars: 1000,
            retry: RetryPolicy::new(3, Backoff::Fixed(Duration::from_millis(1))),
        };
        let orchestrator = TurnOrchestrator::new(
            Arc::new(MemoryDatabase::new_in_memory().unwrap()),
            Arc::new(index),
            generator.clone(),
            Arc::new(extractor),
            config,
        );
        Harness { orchestrator, generator, _dir: dir }
    }

    fn fever_profile() -> ExtractedProfile {
        ExtractedProfile {
            name: Some("Alice".into()),
            symptoms: vec!["fever".into()],
            family_members: vec![FamilyMemberDelta {
                relation: Some("son".into()),
                age: Some(19),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    async fn register(h: &Harness) -> String {
        h.orchestrator.register_or_login("alice", "pw", true).await.unwrap()
    }

    #[tokio::test]
    async fn test_full_turn_records_both_messages_and_profile() {
        let h = harness(ScriptedGenerator::echo(), ScriptedExtractor::new(ExtractorMode::Profile(fever_profile()))).await;
        let user = register(&h).await;

        let reply = h.orchestrator.handle_turn(&user, "I have a fever").await.unwrap();
        assert_eq!(reply.answer, "answer to: I have a fever");
        assert_eq!(reply.context_documents, 2);
        assert!(reply.profile_merged);

        // Nearest document leads the context.
        assert!(h.generator.last_context().unwrap().starts_with("fever and cough"));

        let history = h.orchestrator.fetch_history(&user).await.unwrap();
        let pairs: Vec<_> = history.iter().map(|m| (m.text.as_str(), m.role)).collect();
        assert_eq!(
            pairs,
            vec![("I have a fever", Role::User), ("answer to: I have a fever", Role::Assistant)]
        );

        let profile = h.orchestrator.get_profile(&user).await.unwrap();
        assert_eq!(profile.name.as_deref(), Some("Alice"));
        assert_eq!(profile.symptoms, vec!["fever"]);
        assert_eq!(profile.family_members[0].age, Some(19));
    }

    #[tokio::test]
    async fn test_generation_failure_keeps_user_message() {
        let h = harness(ScriptedGenerator::failing(UpstreamError::permanent("llm", "401")), ScriptedExtractor::empty()).await;
        let user = register(&h).await;

        let err = h.orchestrator.handle_turn(&user, "Is loss of smell serious?").await.unwrap_err();
        assert!(matches!(err, TurnError::UpstreamFailure(_)));
        assert_eq!(h.generator.calls(), 1);

        let history = h.orchestrator.fetch_history(&user).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].role, Role::User);
    }

    #[tokio::test]
    async fn test_transient_generation_failures_are_retried() {
        let h = harness(ScriptedGenerator::flaky(2), ScriptedExtractor::empty()).await;
        let user = register(&h).await;

        let reply = h.orchestrator.handle_turn(&user, "cough").await.unwrap();
        assert_eq!(reply.answer, "answer to: cough");
        assert_eq!(h.generator.calls(), 3);
    }

    #[tokio::test]
    async fn test_retry_budget_exhaustion_is_upstream_failure() {
        let h = harness(ScriptedGenerator::flaky(10), ScriptedExtractor::empty()).await;
        let user = register(&h).await;

        assert!(matches!(
            h.orchestrator.handle_turn(&user, "cough").await,
            Err(TurnError::UpstreamFailure(_))
        ));
        assert_eq!(h.generator.calls(), 3);
        assert_eq!(h.orchestrator.fetch_history(&user).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_extraction_format_error_still_answers() {
        let h = harness(ScriptedGenerator::echo(), ScriptedExtractor::new(ExtractorMode::FormatError)).await;
        let user = register(&h).await;

        let reply = h.orchestrator.handle_turn(&user, "headache").await.unwrap();
        assert!(!reply.profile_merged);
        assert_eq!(h.orchestrator.fetch_history(&user).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_extraction_upstream_error_still_answers() {
        let h = harness(ScriptedGenerator::echo(), ScriptedExtractor::new(ExtractorMode::Unavailable)).await;
        let user = register(&h).await;

        let reply = h.orchestrator.handle_turn(&user, "headache").await.unwrap();
        assert!(!reply.profile_merged);
        assert_eq!(reply.answer, "answer to: headache");
    }

    #[tokio::test]
    async fn test_unknown_user_turn_rejected_before_generation() {
        let h = harness(ScriptedGenerator::echo(), ScriptedExtractor::empty()).await;

        assert!(matches!(
            h.orchestrator.handle_turn("ghost", "hello").await,
            Err(TurnError::Store(StoreError::UnknownUser(_)))
        ));
        assert_eq!(h.generator.calls(), 0);
    }

    #[tokio::test]
    async fn test_register_or_login_surface() {
        let h = harness(ScriptedGenerator::echo(), ScriptedExtractor::empty()).await;
        let id = register(&h).await;

        assert!(matches!(
            h.orchestrator.register_or_login("alice", "pw", true).await,
            Err(TurnError::Store(StoreError::DuplicateUsername(_)))
        ));
        assert_eq!(h.orchestrator.register_or_login("alice", "pw", false).await.unwrap(), id);
        assert!(matches!(
            h.orchestrator.register_or_login("alice", "nope", false).await,
            Err(TurnError::Store(StoreError::BadCredential))
        ));
        assert!(matches!(
            h.orchestrator.register_or_login("bob", "pw", false).await,
            Err(TurnError::Store(StoreError::UserNotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_fetch_history_empty_is_no_history() {
        let h = harness(ScriptedGenerator::echo(), ScriptedExtractor::empty()).await;
        let user = register(&h).await;
        assert!(matches!(h.orchestrator.fetch_history(&user).await, Err(TurnError::NoHistory(_))));
    }

    #[tokio::test]
    async fn test_record_message_validates_role_and_user() {
        let h = harness(ScriptedGenerator::echo(), ScriptedExtractor::empty()).await;
        let user = register(&h).await;

        h.orchestrator.record_message(&user, "hi", "user").await.unwrap();
        h.orchestrator.record_message(&user, "hello", "assistant").await.unwrap();
        assert!(matches!(
            h.orchestrator.record_message(&user, "?", "system").await,
            Err(TurnError::Store(StoreError::InvalidRole(_)))
        ));
        assert!(matches!(
            h.orchestrator.record_message("ghost", "hi", "user").await,
            Err(TurnError::Store(StoreError::UnknownUser(_)))
        ));

        let roles: Vec<_> = h
            .orchestrator
            .fetch_history(&user)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.role)
            .collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant]);
    }

    #[tokio::test]
    async fn test_unloaded_index_fails_turn_but_keeps_message() {
        let dir = TempDir::new().unwrap();
        let index = VectorIndexEngine::new(
            Arc::new(BagOfWordsEmbedder::new(64)),
            IndexArtifacts::in_dir(dir.path()),
        );
        let orchestrator = TurnOrchestrator::new(
            Arc::new(MemoryDatabase::new_in_memory().unwrap()),
            Arc::new(index),
            Arc::new(ScriptedGenerator::echo()),
            Arc::new(ScriptedExtractor::empty()),
            OrchestratorConfig::default(),
        );
        let user = orchestrator.register_or_login("alice", "pw", true).await.unwrap();

        assert!(matches!(
            orchestrator.handle_turn(&user, "fever").await,
            Err(TurnError::Index(IndexError::NotLoaded))
        ));
        assert_eq!(orchestrator.fetch_history(&user).await.unwrap().len(), 1);
    }

    async fn file_backed(dir: &TempDir, extractor: ScriptedExtractor) -> (TurnOrchestrator, std::path::PathBuf) {
        let db_path = dir.path().join("turns.db");
        let index = VectorIndexEngine::new(
            Arc::new(BagOfWordsEmbedder::new(64)),
            IndexArtifacts::in_dir(dir.path()),
        );
        index.build(fixture_corpus()).await.unwrap();
        let orchestrator = TurnOrchestrator::new(
            Arc::new(MemoryDatabase::new(&db_path).unwrap()),
            Arc::new(index),
            Arc::new(ScriptedGenerator::echo()),
            Arc::new(extractor),
            OrchestratorConfig {
                top_k: 2,
                max_context_chars: 1000,
                retry: RetryPolicy::new(2, Backoff::Fixed(Duration::from_millis(1))),
            },
        );
        (orchestrator, db_path)
    }

    #[tokio::test]
    async fn test_failed_profile_merge_still_records_answer() {
        let dir = TempDir::new().unwrap();
        let (orchestrator, db_path) =
            file_backed(&dir, ScriptedExtractor::new(ExtractorMode::Profile(fever_profile()))).await;
        let user = orchestrator.register_or_login("alice", "pw", true).await.unwrap();

        // Every profile write now aborts with a constraint error.
        rusqlite::Connection::open(&db_path)
            .unwrap()
            .execute_batch(
                "CREATE TRIGGER reject_profile_writes BEFORE UPDATE ON users
                 BEGIN SELECT RAISE(ABORT, 'profile writes disabled'); END;",
            )
            .unwrap();

        let reply = orchestrator.handle_turn(&user, "I have a fever").await.unwrap();
        assert_eq!(reply.answer, "answer to: I have a fever");
        assert!(!reply.profile_merged);

        let history = orchestrator.fetch_history(&user).await.unwrap();
        let pairs: Vec<_> = history.iter().map(|m| (m.text.as_str(), m.role)).collect();
        assert_eq!(
            pairs,
            vec![("I have a fever", Role::User), ("answer to: I have a fever", Role::Assistant)]
        );

        let profile = orchestrator.get_profile(&user).await.unwrap();
        assert_eq!(profile.name, None);
        assert!(profile.symptoms.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_registration_succeeds_under_write_contention() {
        let dir = TempDir::new().unwrap();
        let (orchestrator, db_path) = file_backed(&dir, ScriptedExtractor::empty()).await;

        let (locked_tx, locked_rx) = std::sync::mpsc::channel();
        let holder = std::thread::spawn(move || {
            let conn = rusqlite::Connection::open(&db_path).unwrap();
            conn.execute_batch("BEGIN EXCLUSIVE").unwrap();
            locked_tx.send(()).unwrap();
            std::thread::sleep(Duration::from_millis(200));
            conn.execute_batch("COMMIT").unwrap();
        });
        locked_rx.recv().unwrap();

        let id = orchestrator.register_or_login("alice", "pw", true).await.unwrap();
        holder.join().unwrap();
        assert_eq!(orchestrator.register_or_login("alice", "pw", false).await.unwrap(), id);
    }
}
