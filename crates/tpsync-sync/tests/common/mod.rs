#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tpsync_adapters::NameAliases;
use tpsync_core::{SessionCredential, SourceFormat};
use tpsync_storage::memory::MemoryDestination;
use tpsync_storage::{
    BiApi, BiCredentials, CredentialError, CredentialManager, CredentialStore, FeedApi, FetchError,
    SourceFetcher,
};
use tpsync_sync::{JobRegistry, SyncOrchestrator, TableSynchronizer};

pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

pub fn fixture(rel: &str) -> String {
    let path = workspace_root().join("fixtures").join(rel);
    std::fs::read_to_string(&path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display()))
}

/// Question id -> fixture body, as wired in the shipped `sync-jobs.yaml`.
pub fn shipped_questions() -> HashMap<u64, String> {
    HashMap::from([
        (101, fixture("metabase/class_schedule.csv")),
        (102, fixture("metabase/piket_roster.csv")),
        (103, fixture("metabase/answers.csv")),
        (104, fixture("metabase/answer_keys.csv")),
        (105, fixture("metabase/student_roster.csv")),
        (106, fixture("metabase/teacher_photos.json")),
    ])
}

/// Fake BI endpoint: logins hand out `token-N`; queries made with a token in
/// `rejected` get a 401.
pub struct FakeBi {
    pub bodies: HashMap<u64, String>,
    pub rejected: Mutex<HashSet<String>>,
    pub logins: AtomicUsize,
    pub queries: AtomicUsize,
}

impl FakeBi {
    pub fn new(bodies: HashMap<u64, String>) -> Self {
        Self {
            bodies,
            rejected: Mutex::new(HashSet::new()),
            logins: AtomicUsize::new(0),
            queries: AtomicUsize::new(0),
        }
    }

    pub fn reject(&self, token: &str) {
        self.rejected.lock().unwrap().insert(token.to_string());
    }

    pub fn logins(&self) -> usize {
        self.logins.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BiApi for FakeBi {
    async fn login(&self, _username: &str, _password: &str) -> Result<String, FetchError> {
        let n = self.logins.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("token-{n}"))
    }

    async fn query(
        &self,
        token: &str,
        question_id: u64,
        format: SourceFormat,
    ) -> Result<String, FetchError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        let url = format!("https://bi.test/api/card/{question_id}/query/{}", format.as_str());
        if self.rejected.lock().unwrap().contains(token) {
            return Err(FetchError::Unauthorized { url });
        }
        self.bodies
            .get(&question_id)
            .cloned()
            .ok_or(FetchError::HttpStatus {
                status: 404,
                url,
                body: "Not found.".into(),
            })
    }
}

pub struct FakeFeed(pub String);

#[async_trait]
impl FeedApi for FakeFeed {
    async fn get(&self, _url: &str) -> Result<String, FetchError> {
        Ok(self.0.clone())
    }
}

#[derive(Default)]
pub struct MemoryStore(pub Mutex<Option<SessionCredential>>);

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn load(&self) -> Result<Option<SessionCredential>, CredentialError> {
        Ok(self.0.lock().unwrap().clone())
    }

    async fn save(&self, credential: &SessionCredential) -> Result<(), CredentialError> {
        *self.0.lock().unwrap() = Some(credential.clone());
        Ok(())
    }
}

pub struct Harness {
    pub bi: Arc<FakeBi>,
    pub store: Arc<MemoryStore>,
    pub destination: Arc<MemoryDestination>,
    pub orchestrator: SyncOrchestrator,
}

pub fn harness(registry: JobRegistry, bi: FakeBi, feed: &str, batch_size: usize) -> Harness {
    harness_with_store(registry, bi, feed, batch_size, MemoryStore::default())
}

pub fn harness_with_store(
    registry: JobRegistry,
    bi: FakeBi,
    feed: &str,
    batch_size: usize,
    store: MemoryStore,
) -> Harness {
    let bi = Arc::new(bi);
    let store = Arc::new(store);
    let destination = Arc::new(MemoryDestination::default());
    let credentials = Arc::new(CredentialManager::new(
        bi.clone(),
        BiCredentials {
            username: "sync@example.test".into(),
            password: "secret".into(),
        },
        store.clone(),
    ));
    let fetcher = SourceFetcher::new(bi.clone(), Arc::new(FakeFeed(feed.to_string())), credentials);
    let aliases = NameAliases::from_rules_dir(&workspace_root().join("rules")).unwrap();
    let orchestrator = SyncOrchestrator::new(
        registry,
        Arc::new(fetcher),
        TableSynchronizer::new(destination.clone(), batch_size),
        aliases,
    )
    .with_job_delay(std::time::Duration::ZERO);
    Harness {
        bi,
        store,
        destination,
        orchestrator,
    }
}
