//! Request queue tests
//!
//! Deferred execution runs jobs strictly in enqueue order, whether a job
//! takes the sync or the async path.

use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use synchub_core::*;

type Journal = Arc<Mutex<Vec<String>>>;

fn queued_hub(queue: Arc<RequestQueue>, journal: Journal) -> Hub {
    let mut dispatcher = ServiceDispatcher::new();

    let sync_journal = journal.clone();
    dispatcher
        .register_command("log.Sync", move |param: &Param, _: &SyncContext| {
            sync_journal.lock().push(param.get::<String>()?);
            Ok(None)
        })
        .unwrap();

    let async_journal = journal.clone();
    dispatcher
        .register_async_command("log.Async", move |param, _ctx| {
            let journal = async_journal.clone();
            Box::pin(async move {
                tokio::task::yield_now().await;
                journal.lock().push(param.get::<String>()?);
                HandlerResult::Ok(None)
            })
        })
        .unwrap();

    let requeue = queue.clone();
    dispatcher
        .register_command("log.Requeue", move |param: &Param, _: &SyncContext| {
            let name: String = param.get()?;
            let request = SyncRequest::new("main", vec![SyncTask::command("log.Sync", Some(json!(name)))]);
            // completion is not awaited
            drop(requeue.enqueue(request));
            Ok(None)
        })
        .unwrap();

    let config = HubConfig::default();
    let hub = Hub::new(config.clone()).unwrap();
    let backend = Arc::new(MemoryBackend::new(&config));
    let service = DatabaseService::new(dispatcher).with_queue(queue);
    hub.add_database(Database::new("main", backend, &config).with_service(service)).unwrap();
    hub
}

fn logged(command: &str, name: &str) -> SyncRequest {
    SyncRequest::new("main", vec![SyncTask::command(command, Some(json!(name)))])
}

#[tokio::test]
async fn test_fifo_across_execution_modes() {
    let journal: Journal = Arc::default();
    let queue = Arc::new(RequestQueue::new());
    let hub = queued_hub(queue.clone(), journal.clone());

    let a = queue.enqueue(logged("log.Async", "A"));
    let b = queue.enqueue(logged("log.Sync", "B"));
    let c = queue.enqueue(logged("log.Async", "C"));
    assert_eq!(queue.pending(), 3);

    assert_eq!(queue.drain(&hub).await, 3);
    assert_eq!(*journal.lock(), vec!["A", "B", "C"], "Async jobs must not be overtaken");

    for receiver in [a, b, c] {
        let response = receiver.await.unwrap().unwrap();
        assert_eq!(response.tasks.len(), 1);
        assert!(!response.tasks[0].is_error());
    }
    assert_eq!(queue.pending(), 0);
}

#[tokio::test]
async fn test_jobs_enqueued_during_drain_wait() {
    let journal: Journal = Arc::default();
    let queue = Arc::new(RequestQueue::new());
    let hub = queued_hub(queue.clone(), journal.clone());

    let _first = queue.enqueue(logged("log.Requeue", "later"));
    let _second = queue.enqueue(logged("log.Sync", "now"));

    assert_eq!(queue.drain(&hub).await, 2);
    assert_eq!(*journal.lock(), vec!["now"]);
    assert_eq!(queue.pending(), 1);

    assert_eq!(queue.drain(&hub).await, 1);
    assert_eq!(*journal.lock(), vec!["now", "later"]);
}

#[tokio::test]
async fn test_execute_request_waits_for_drain() {
    let journal: Journal = Arc::default();
    let queue = Arc::new(RequestQueue::new());
    let hub = queued_hub(queue.clone(), journal.clone());

    let request = SyncRequest::new(
        "main",
        vec![
            SyncTask::upsert("items", vec![JsonEntity::new(1, json!({"a": 1}))]),
            SyncTask::read("items", vec![JsonKey::from(1)]),
        ],
    );
    let (response, drained) = tokio::join!(hub.execute_request(request), async {
        while queue.pending() == 0 {
            tokio::task::yield_now().await;
        }
        queue.drain(&hub).await
    });

    assert_eq!(drained, 1);
    let response = response.unwrap();
    assert_eq!(response.tasks.len(), 2);
    assert_eq!(response.tasks[1].entities().len(), 1);
}

#[tokio::test]
async fn test_execute_request_without_queue() {
    let config = HubConfig::default();
    let hub = Hub::new(config.clone()).unwrap();
    let backend = Arc::new(MemoryBackend::new(&config));
    hub.add_database(Database::new("main", backend, &config)).unwrap();

    let request = SyncRequest::new("main", vec![SyncTask::command("std.Stats", None)]);
    let response = hub.execute_request(request).await.unwrap();
    assert!(!response.tasks[0].is_error());
}

#[test]
fn test_drain_blocking() {
    let journal: Journal = Arc::default();
    let queue = Arc::new(RequestQueue::new());
    let hub = queued_hub(queue.clone(), journal.clone());

    let receiver = queue.enqueue(logged("log.Async", "blocking"));
    assert_eq!(queue.drain_blocking(&hub).unwrap(), 1);
    assert_eq!(*journal.lock(), vec!["blocking"]);

    let response = receiver.blocking_recv().unwrap().unwrap();
    assert!(!response.tasks[0].is_error());
}

#[test]
fn test_dropped_receiver_does_not_stop_drain() {
    let journal: Journal = Arc::default();
    let queue = Arc::new(RequestQueue::new());
    let hub = queued_hub(queue.clone(), journal.clone());

    drop(queue.enqueue(logged("log.Sync", "first")));
    let kept = queue.enqueue(logged("log.Sync", "second"));

    assert_eq!(queue.drain_blocking(&hub).unwrap(), 2);
    assert_eq!(*journal.lock(), vec!["first", "second"]);
    assert!(kept.blocking_recv().unwrap().is_ok());
}
