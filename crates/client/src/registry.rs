// Collection Registry: project id → live collections for that project view.
//
// `open` is idempotent while a project is open; `close` tears down both
// subscriptions and discards their in-memory state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::info;

use fieldsync_common::types::{Entity, TaskEvent};

use crate::backend::Backend;
use crate::collection::{Collection, CollectionOptions};
use crate::error::CollectionError;
use crate::shape::ResumePosition;

/// The collections backing one project view.
#[derive(Clone)]
pub struct ProjectCollections {
    pub project_id: i64,
    pub entities: Collection<Entity>,
    pub task_events: Collection<TaskEvent>,
}

impl ProjectCollections {
    /// Wait until both collections hold authoritative state.
    pub async fn ready(&self) -> Result<(), CollectionError> {
        self.entities.ready().await?;
        self.task_events.ready().await
    }

    pub fn resume_positions(&self) -> ResumePositions {
        ResumePositions {
            entities: self.entities.resume_position(),
            task_events: self.task_events.resume_position(),
        }
    }

    async fn close(&self) {
        self.entities.close().await;
        self.task_events.close().await;
    }
}

/// Stream positions of a project's collections from a prior session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumePositions {
    pub entities: Option<ResumePosition>,
    pub task_events: Option<ResumePosition>,
}

/// Tracks open project views.
pub struct CollectionRegistry {
    backend: Arc<dyn Backend>,
    options: CollectionOptions,
    projects: Mutex<HashMap<i64, ProjectCollections>>,
}

impl CollectionRegistry {
    pub fn new(backend: Arc<dyn Backend>, options: CollectionOptions) -> Self {
        Self { backend, options, projects: Mutex::new(HashMap::new()) }
    }

    /// Open the collections for `project_id`, starting their subscriptions.
    /// Returns the existing handles if the project is already open.
    pub fn open(&self, project_id: i64) -> ProjectCollections {
        self.open_with_resume(project_id, ResumePositions::default())
    }

    /// Like `open`, resuming each stream from a prior session's position.
    /// Positions are ignored if the project is already open.
    pub fn open_with_resume(&self, project_id: i64, resume: ResumePositions) -> ProjectCollections {
        let mut projects = self.lock();
        if let Some(existing) = projects.get(&project_id) {
            return existing.clone();
        }

        let transport = self.backend.shape_transport();
        let collections = ProjectCollections {
            project_id,
            entities: Collection::open(
                project_id,
                self.backend.entity_adapter(project_id),
                Arc::clone(&transport),
                &self.options,
                resume.entities,
            ),
            task_events: Collection::open(
                project_id,
                self.backend.task_event_adapter(project_id),
                transport,
                &self.options,
                resume.task_events,
            ),
        };
        projects.insert(project_id, collections.clone());
        info!(project_id, "project collections opened");
        collections
    }

    /// Close a project view. Returns false if it was not open.
    pub async fn close(&self, project_id: i64) -> bool {
        let Some(collections) = self.lock().remove(&project_id) else {
            return false;
        };
        collections.close().await;
        info!(project_id, "project collections closed");
        true
    }

    pub async fn close_all(&self) {
        let open: Vec<_> = self.lock().drain().map(|(_, collections)| collections).collect();
        for collections in open {
            collections.close().await;
        }
    }

    pub fn get(&self, project_id: i64) -> Option<ProjectCollections> {
        self.lock().get(&project_id).cloned()
    }

    pub fn is_open(&self, project_id: i64) -> bool {
        self.lock().contains_key(&project_id)
    }

    pub fn open_projects(&self) -> Vec<i64> {
        let mut ids: Vec<_> = self.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<i64, ProjectCollections>> {
        self.projects.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{Mutation, NetworkAdapter};
    use crate::collection::CollectionStatus;
    use crate::error::{AdapterError, ShapeError};
    use crate::shape::{ShapeBatch, ShapeRequest, ShapeResponse, ShapeTransport};
    use async_trait::async_trait;
    use fieldsync_common::protocol::mutation::Txid;
    use fieldsync_common::protocol::shape::{LogOffset, ShapeHandle, ShapeMessage};
    use fieldsync_common::types::Row;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Every request is answered with an empty, up-to-date batch; live
    /// requests hang so the driver stays parked.
    #[derive(Default)]
    struct QuietTransport {
        requests: Mutex<Vec<ShapeRequest>>,
    }

    #[async_trait]
    impl ShapeTransport for QuietTransport {
        async fn fetch(&self, request: &ShapeRequest) -> Result<ShapeResponse, ShapeError> {
            self.requests.lock().unwrap().push(request.clone());
            if request.live {
                std::future::pending::<()>().await;
            }
            Ok(ShapeResponse::Batch(ShapeBatch {
                handle: ShapeHandle(format!("{}-handle", request.table)),
                offset: LogOffset::at(1, 0),
                messages: vec![ShapeMessage::up_to_date()],
            }))
        }
    }

    struct NullAdapter;

    #[async_trait]
    impl<R: Row> NetworkAdapter<R> for NullAdapter {
        async fn submit(&self, _mutation: &Mutation<R>) -> Result<Txid, AdapterError> {
            Err(AdapterError::Transport("offline".into()))
        }

        async fn fetch_row(&self, _key: &str) -> Result<Option<R>, AdapterError> {
            Ok(None)
        }

        async fn fetch_snapshot(&self) -> Result<Vec<R>, AdapterError> {
            Ok(vec![])
        }
    }

    #[derive(Default)]
    struct FakeBackend {
        transport: Arc<QuietTransport>,
        adapters_built: AtomicUsize,
    }

    impl Backend for FakeBackend {
        fn entity_adapter(&self, _project_id: i64) -> Arc<dyn NetworkAdapter<Entity>> {
            self.adapters_built.fetch_add(1, Ordering::SeqCst);
            Arc::new(NullAdapter)
        }

        fn task_event_adapter(&self, _project_id: i64) -> Arc<dyn NetworkAdapter<TaskEvent>> {
            self.adapters_built.fetch_add(1, Ordering::SeqCst);
            Arc::new(NullAdapter)
        }

        fn shape_transport(&self) -> Arc<dyn ShapeTransport> {
            Arc::clone(&self.transport) as Arc<dyn ShapeTransport>
        }
    }

    fn registry() -> (CollectionRegistry, Arc<FakeBackend>) {
        let backend = Arc::new(FakeBackend::default());
        let options = CollectionOptions { seed_from_snapshot: false, ..CollectionOptions::default() };
        (CollectionRegistry::new(Arc::clone(&backend) as Arc<dyn Backend>, options), backend)
    }

    #[tokio::test]
    async fn reopening_returns_existing_handles() {
        let (registry, backend) = registry();

        let first = registry.open(7);
        let second = registry.open(7);
        first.ready().await.unwrap();

        assert_eq!(backend.adapters_built.load(Ordering::SeqCst), 2);
        assert!(Arc::ptr_eq(first.entities.store(), second.entities.store()));
        assert_eq!(registry.open_projects(), vec![7]);
    }

    #[tokio::test]
    async fn close_tears_down_and_allows_fresh_open() {
        let (registry, backend) = registry();
        let first = registry.open(7);
        first.ready().await.unwrap();

        assert!(registry.close(7).await);
        assert!(!registry.is_open(7));
        assert!(!registry.close(7).await, "second close is a no-op");
        assert_eq!(first.entities.status(), CollectionStatus::Closed);
        assert_eq!(first.task_events.status(), CollectionStatus::Closed);

        let reopened = registry.open(7);
        assert!(!Arc::ptr_eq(first.entities.store(), reopened.entities.store()));
        assert_eq!(backend.adapters_built.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn projects_are_independent() {
        let (registry, _backend) = registry();
        let seven = registry.open(7);
        let eight = registry.open(8);
        seven.ready().await.unwrap();
        eight.ready().await.unwrap();

        registry.close(7).await;
        assert_eq!(eight.entities.status(), CollectionStatus::Live);
        assert_eq!(registry.open_projects(), vec![8]);

        registry.close_all().await;
        assert!(registry.open_projects().is_empty());
        assert_eq!(eight.task_events.status(), CollectionStatus::Closed);
    }

    #[tokio::test]
    async fn resume_positions_are_reported_and_honored() {
        let (registry, backend) = registry();
        let collections = registry.open(7);
        collections.ready().await.unwrap();

        let mut positions = collections.resume_positions();
        let entities = positions.entities.clone().expect("entities position");
        assert_eq!(entities.handle, ShapeHandle("odk_entities-handle".into()));
        assert_eq!(entities.offset, LogOffset::at(1, 0));
        registry.close(7).await;

        positions.entities = Some(ResumePosition { offset: LogOffset::at(5, 0), ..entities });

        let _resumed = registry.open_with_resume(7, positions);
        let resumed_request = |requests: &[ShapeRequest]| {
            requests
                .iter()
                .find(|request| request.table == "odk_entities" && request.offset == LogOffset::at(5, 0))
                .cloned()
        };
        let mut found = None;
        for _ in 0..1000 {
            found = resumed_request(&backend.transport.requests.lock().unwrap()[..]);
            if found.is_some() {
                break;
            }
            tokio::task::yield_now().await;
        }
        let request = found.expect("resumed entities request");
        assert!(request.live);
        assert_eq!(request.handle, Some(ShapeHandle("odk_entities-handle".into())));
    }
}
