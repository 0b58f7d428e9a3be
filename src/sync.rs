use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::api::RaindropSource;
use crate::config::Config;
use crate::error::{NoteError, unpack_error};
use crate::model::{Collection, Raindrop};
use crate::reconcile::{NoteState, Reconciled, ReplacePolicy, reconcile};
use crate::render::Renderer;
use crate::slug::{collection_dir, fold_text, note_path};

const REPORT_EVERY: Duration = Duration::from_secs(60);
const REPLACE_BACKOFF: Duration = Duration::from_millis(50);

pub enum SyncResult<T> {
    Created(T),
    Updated(T),
    Unchanged(T),
    Error,
}

impl<T> SyncResult<T> {
    pub fn record(self, stats: &mut SyncStats) -> Option<T> {
        match self {
            SyncResult::Created(value) => {
                stats.created += 1;
                Some(value)
            }
            SyncResult::Updated(value) => {
                stats.updated += 1;
                Some(value)
            }
            SyncResult::Unchanged(value) => {
                stats.unchanged += 1;
                Some(value)
            }
            SyncResult::Error => {
                stats.failed += 1;
                None
            }
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncStats {
    pub created: i32,
    pub updated: i32,
    pub unchanged: i32,
    pub failed: i32,
    pub highlights_appended: usize,
}

pub fn log_reconcile_error(collection: &str, raindrop_id: i64, path: &Path, e: &NoteError) {
    tracing::error!(
        collection,
        raindrop_id,
        path = %path.display(),
        error = %unpack_error(e),
        "failed to sync note"
    );
}

pub fn handle_reconcile_result(
    result: Result<Reconciled, NoteError>,
    collection: &str,
    raindrop_id: i64,
    path: &Path,
) -> SyncResult<usize> {
    match result {
        Ok(done) if done.state == NoteState::Absent => SyncResult::Created(done.appended),
        Ok(done) if done.written => SyncResult::Updated(done.appended),
        Ok(done) => SyncResult::Unchanged(done.appended),
        Err(e) => {
            log_reconcile_error(collection, raindrop_id, path, &e);
            SyncResult::Error
        }
    }
}

/// Drives sync cycles: fetch every configured collection, then reconcile each
/// Raindrop on a bounded pool of workers.
pub struct Syncer {
    source: Arc<dyn RaindropSource>,
    renderer: Arc<dyn Renderer>,
    target_dir: PathBuf,
    collections: Vec<i64>,
    max_threads: usize,
    page_size: u32,
    replace: ReplacePolicy,
}

impl Syncer {
    pub fn new(cfg: &Config, source: Arc<dyn RaindropSource>, renderer: Arc<dyn Renderer>) -> Self {
        Self {
            source,
            renderer,
            target_dir: cfg.target_dir.clone(),
            collections: cfg.collections.clone(),
            max_threads: cfg.max_threads.max(1),
            page_size: cfg.page_size.max(1),
            replace: ReplacePolicy {
                attempts: cfg.replace_attempts,
                backoff: REPLACE_BACKOFF,
            },
        }
    }

    pub fn with_replace_policy(mut self, replace: ReplacePolicy) -> Self {
        self.replace = replace;
        self
    }

    /// Every page of a collection. A failed page ends the listing; whatever was
    /// fetched before it is still synced.
    async fn fetch_items(&self, collection_id: i64) -> Vec<Raindrop> {
        let mut items = Vec::new();
        let mut page = 0;
        loop {
            match self.source.list_items(collection_id, page, self.page_size).await {
                Ok(batch) => {
                    let last_page = batch.len() < self.page_size as usize;
                    items.extend(batch);
                    if last_page {
                        break;
                    }
                    page += 1;
                }
                Err(e) => {
                    tracing::error!(
                        collection_id,
                        page,
                        error = %unpack_error(&e),
                        "failed to fetch raindrops"
                    );
                    break;
                }
            }
        }
        items
    }

    /// One full pass over all configured collections.
    pub async fn run_cycle(&self) -> SyncStats {
        let mut stats = SyncStats::default();
        let semaphore = Arc::new(Semaphore::new(self.max_threads));
        let mut tasks = JoinSet::new();
        let mut seen = HashSet::new();

        for &collection_id in &self.collections {
            let collection = match self.source.get_collection(collection_id).await {
                Ok(collection) => Arc::new(collection),
                Err(e) => {
                    tracing::error!(
                        collection_id,
                        error = %unpack_error(&e),
                        "failed to fetch collection, skipping it this cycle"
                    );
                    continue;
                }
            };

            tracing::info!("Syncing collection {}", describe(&collection));
            let dir = collection_dir(&self.target_dir, &collection.title);
            if let Err(e) = tokio::fs::create_dir_all(&dir).await {
                tracing::error!(path = %dir.display(), error = %e, "failed to create collection directory");
                continue;
            }

            for raindrop in self.fetch_items(collection_id).await {
                // One id, one note: never hand the same note to two workers.
                if !seen.insert(raindrop.id) {
                    tracing::debug!(raindrop_id = raindrop.id, "raindrop listed twice, skipping");
                    continue;
                }

                let Ok(permit) = semaphore.clone().acquire_owned().await else {
                    break;
                };
                let path = note_path(&self.target_dir, &collection.title, raindrop.id, &raindrop.title);
                tracing::info!(
                    "Syncing {}: {}",
                    fold_text(&collection.title, false),
                    fold_text(&raindrop.title, false)
                );

                let collection = Arc::clone(&collection);
                let renderer = Arc::clone(&self.renderer);
                let replace = self.replace;
                tasks.spawn(async move {
                    let _permit = permit;
                    let result = reconcile(&path, &raindrop, &collection, renderer.as_ref(), replace).await;
                    handle_reconcile_result(result, &collection.title, raindrop.id, &path)
                });
            }
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => {
                    if let Some(appended) = result.record(&mut stats) {
                        stats.highlights_appended += appended;
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "sync worker panicked");
                    stats.failed += 1;
                }
            }
        }

        stats
    }

    /// Runs cycles until `token` is cancelled, sleeping `interval` between them.
    pub async fn run(&self, interval: Duration, token: CancellationToken) {
        loop {
            let stats = tokio::select! {
                stats = self.run_cycle() => stats,
                _ = token.cancelled() => break,
            };
            tracing::info!(
                created = stats.created,
                updated = stats.updated,
                unchanged = stats.unchanged,
                failed = stats.failed,
                highlights = stats.highlights_appended,
                "Done syncing"
            );
            tracing::info!("Syncing again in {} minutes", interval.as_secs() / 60);

            if !wait(interval, REPORT_EVERY, &token).await {
                break;
            }
        }
        tracing::info!("sync loop shutting down");
    }
}

/// Sleeps for `total`, logging the time left every `report_every`.
/// Returns false if `token` was cancelled first.
pub async fn wait(total: Duration, report_every: Duration, token: &CancellationToken) -> bool {
    let mut left = total;
    while !left.is_zero() {
        let step = left.min(report_every);
        tokio::select! {
            _ = tokio::time::sleep(step) => {}
            _ = token.cancelled() => return false,
        }
        left -= step;
        if !left.is_zero() {
            let secs = left.as_secs();
            tracing::info!("Syncing again in {:02}:{:02}", secs / 60, secs % 60);
        }
    }
    true
}

pub fn describe(collection: &Collection) -> String {
    format!("{} ({})", fold_text(&collection.title, false), collection.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ApiError;
    use crate::reconcile::find_watermark;
    use crate::render::FixedRenderer;
    use crate::render::tests::{highlight, sample_raindrop};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeSource {
        collections: HashMap<i64, Collection>,
        items: Mutex<HashMap<i64, Vec<Raindrop>>>,
        failing_pages: HashSet<(i64, u32)>,
        calls: Mutex<Vec<(i64, u32)>>,
    }

    impl FakeSource {
        fn with_collection(mut self, id: i64, title: &str, items: Vec<Raindrop>) -> Self {
            self.collections.insert(
                id,
                Collection {
                    id,
                    title: title.to_string(),
                },
            );
            self.items.lock().unwrap().insert(id, items);
            self
        }

        fn set_items(&self, id: i64, items: Vec<Raindrop>) {
            self.items.lock().unwrap().insert(id, items);
        }
    }

    #[async_trait]
    impl RaindropSource for FakeSource {
        async fn get_collection(&self, collection_id: i64) -> Result<Collection, ApiError> {
            self.collections
                .get(&collection_id)
                .cloned()
                .ok_or_else(|| ApiError::Status {
                    url: format!("fake://collection/{}", collection_id),
                    status: reqwest::StatusCode::NOT_FOUND,
                })
        }

        async fn list_items(
            &self,
            collection_id: i64,
            page: u32,
            page_size: u32,
        ) -> Result<Vec<Raindrop>, ApiError> {
            self.calls.lock().unwrap().push((collection_id, page));
            if self.failing_pages.contains(&(collection_id, page)) {
                return Err(ApiError::Status {
                    url: format!("fake://raindrops/{}", collection_id),
                    status: reqwest::StatusCode::TOO_MANY_REQUESTS,
                });
            }
            let items = self.items.lock().unwrap();
            let all = items.get(&collection_id).cloned().unwrap_or_default();
            let start = (page * page_size) as usize;
            Ok(all.into_iter().skip(start).take(page_size as usize).collect())
        }
    }

    fn config(dir: &std::path::Path, collections: &[i64], page_size: u32, max_threads: usize) -> Config {
        let yaml = format!(
            "target_dir: {}\naccess_token: t\ncollections: {:?}\npage_size: {}\nmax_threads: {}\n",
            dir.display(),
            collections,
            page_size,
            max_threads
        );
        Config::from_yaml(&yaml).unwrap()
    }

    fn raindrop(id: i64, title: &str, highlight_count: usize) -> Raindrop {
        let highlights = (0..highlight_count)
            .map(|i| {
                highlight(
                    &format!("{}-{}", id, i),
                    &format!("2024-03-02T09:{:02}:00.000Z", i),
                    &format!("raindrop {} highlight {}", id, i),
                    "",
                )
            })
            .collect();
        let mut raindrop = sample_raindrop(highlights);
        raindrop.id = id;
        raindrop.title = title.to_string();
        raindrop
    }

    fn syncer(cfg: &Config, source: Arc<FakeSource>) -> Syncer {
        Syncer::new(cfg, source, Arc::new(FixedRenderer)).with_replace_policy(ReplacePolicy {
            attempts: 2,
            backoff: Duration::from_millis(1),
        })
    }

    #[tokio::test]
    async fn test_cycle_creates_then_leaves_notes_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(FakeSource::default().with_collection(
            1,
            "Reading list",
            vec![raindrop(10, "First post", 2), raindrop(11, "Second post", 1)],
        ));
        let cfg = config(dir.path(), &[1], 50, 2);
        let syncer = syncer(&cfg, source.clone());

        let first = syncer.run_cycle().await;
        assert_eq!(first.created, 2);
        assert_eq!(first.highlights_appended, 3);
        let note = dir.path().join("Reading-List").join("10 - First-Post.md");
        let content = std::fs::read_to_string(&note).unwrap();

        let second = syncer.run_cycle().await;
        assert_eq!(second.unchanged, 2);
        assert_eq!(second.highlights_appended, 0);
        assert_eq!(std::fs::read_to_string(&note).unwrap(), content);
    }

    #[tokio::test]
    async fn test_cycle_appends_new_highlights() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(FakeSource::default().with_collection(
            1,
            "Inbox",
            vec![raindrop(10, "Post", 1)],
        ));
        let cfg = config(dir.path(), &[1], 50, 1);
        let syncer = syncer(&cfg, source.clone());
        syncer.run_cycle().await;

        let mut updated = raindrop(10, "Post", 1);
        updated
            .highlights
            .push(highlight("new", "2024-03-06T00:00:00.000Z", "fresh highlight", ""));
        updated.last_update = "2024-03-06T00:00:01.000Z".to_string();
        source.set_items(1, vec![updated]);

        let stats = syncer.run_cycle().await;
        assert_eq!(stats.updated, 1);
        assert_eq!(stats.highlights_appended, 1);

        let content = std::fs::read_to_string(dir.path().join("Inbox").join("10 - Post.md")).unwrap();
        assert_eq!(content.matches("fresh highlight").count(), 1);
        assert_eq!(content.matches("raindrop 10 highlight 0").count(), 1);
        assert_eq!(find_watermark(&content).unwrap().value, "2024-03-06T00:00:01.000Z");
    }

    #[tokio::test]
    async fn test_paginates_until_short_page() {
        let dir = tempfile::tempdir().unwrap();
        let items = (0..5).map(|i| raindrop(100 + i, &format!("Item {}", i), 1)).collect();
        let source = Arc::new(FakeSource::default().with_collection(3, "Paged", items));
        let cfg = config(dir.path(), &[3], 2, 4);

        let stats = syncer(&cfg, source.clone()).run_cycle().await;
        assert_eq!(stats.created, 5);
        assert_eq!(*source.calls.lock().unwrap(), vec![(3, 0), (3, 1), (3, 2)]);
    }

    #[tokio::test]
    async fn test_failures_are_isolated_per_item() {
        let dir = tempfile::tempdir().unwrap();
        let mut broken = raindrop(21, "Broken", 1);
        broken.highlights[0].created = "garbage".to_string();
        let source = Arc::new(FakeSource::default().with_collection(
            1,
            "Mixed",
            vec![raindrop(20, "Fine", 1), broken, raindrop(22, "Also fine", 1)],
        ));
        let cfg = config(dir.path(), &[1, 999], 50, 3);

        let stats = syncer(&cfg, source).run_cycle().await;
        assert_eq!(stats.created, 2);
        assert_eq!(stats.failed, 1);
        assert!(dir.path().join("Mixed").join("20 - Fine.md").exists());
        assert!(dir.path().join("Mixed").join("22 - Also-Fine.md").exists());
        assert!(!dir.path().join("Mixed").join("21 - Broken.md").exists());
    }

    #[tokio::test]
    async fn test_fetch_failure_keeps_existing_notes() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path(), &[1], 50, 1);
        let healthy = FakeSource::default().with_collection(1, "Inbox", vec![raindrop(10, "Post", 2)]);
        syncer(&cfg, Arc::new(healthy)).run_cycle().await;
        let note = dir.path().join("Inbox").join("10 - Post.md");
        let before = std::fs::read_to_string(&note).unwrap();

        let mut flaky = FakeSource::default().with_collection(1, "Inbox", vec![raindrop(10, "Post", 2)]);
        flaky.failing_pages.insert((1, 0));
        let stats = syncer(&cfg, Arc::new(flaky)).run_cycle().await;
        assert_eq!(stats, SyncStats::default());
        assert_eq!(std::fs::read_to_string(&note).unwrap(), before);
    }

    #[tokio::test]
    async fn test_duplicate_listing_is_reconciled_once() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(FakeSource::default().with_collection(
            1,
            "Inbox",
            vec![raindrop(10, "Post", 2), raindrop(10, "Post", 2)],
        ));
        let cfg = config(dir.path(), &[1], 50, 4);

        let stats = syncer(&cfg, source).run_cycle().await;
        assert_eq!(stats.created, 1);
        let content = std::fs::read_to_string(dir.path().join("Inbox").join("10 - Post.md")).unwrap();
        assert_eq!(content.matches("raindrop 10 highlight 1").count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_notes_never_interleave() {
        let dir = tempfile::tempdir().unwrap();
        let items: Vec<Raindrop> = (0..24).map(|i| raindrop(i, &format!("Note {}", i), 8)).collect();
        let source = Arc::new(FakeSource::default().with_collection(1, "Busy", items));
        let cfg = config(dir.path(), &[1], 50, 8);

        let stats = syncer(&cfg, source).run_cycle().await;
        assert_eq!(stats.created, 24);

        for id in 0..24 {
            let path = dir.path().join("Busy").join(format!("{} - Note-{}.md", id, id));
            let content = std::fs::read_to_string(&path).unwrap();
            assert_eq!(content.matches("raindrop ").count(), 8, "{}", path.display());
            for i in 0..8 {
                let own = format!("raindrop {} highlight {}\n", id, i);
                assert_eq!(content.matches(&own).count(), 1);
            }
            assert!(content.contains(&format!("raindrop_id: \"{}\"", id)));
        }
    }

    #[tokio::test]
    async fn test_wait_stops_on_cancel() {
        let token = CancellationToken::new();
        token.cancel();
        assert!(!wait(Duration::from_secs(3600), REPORT_EVERY, &token).await);

        let live = CancellationToken::new();
        assert!(wait(Duration::from_millis(5), Duration::from_millis(2), &live).await);
    }

    #[tokio::test]
    async fn test_run_exits_when_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(FakeSource::default().with_collection(1, "Inbox", vec![raindrop(10, "Post", 1)]));
        let cfg = config(dir.path(), &[1], 50, 1);
        let syncer = Arc::new(syncer(&cfg, source));
        let token = CancellationToken::new();

        let handle = {
            let syncer = Arc::clone(&syncer);
            let token = token.clone();
            tokio::spawn(async move { syncer.run(Duration::from_secs(3600), token).await })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(dir.path().join("Inbox").join("10 - Post.md").exists());
    }

    #[test]
    fn test_describe_collection() {
        let collection = Collection {
            id: 5,
            title: "Lectures à faire".to_string(),
        };
        assert_eq!(describe(&collection), "Lectures a faire (5)");
    }
}
