//! Request execution tests
//!
//! Exercises the task loop end to end against an in-memory database:
//! entity operations, query paging, commands, authorization and events.

use serde_json::json;
use std::sync::Arc;
use synchub_core::*;

fn memory_hub() -> Hub {
    let config = HubConfig::default();
    init_logging(&config.log_filter);
    let hub = Hub::new(config.clone()).unwrap();
    let backend = Arc::new(MemoryBackend::new(&config));
    hub.add_database(Database::new("main", backend, &config)).unwrap();
    hub
}

fn hub_with_service(service: DatabaseService) -> Hub {
    let config = HubConfig::default();
    let hub = Hub::new(config.clone()).unwrap();
    let backend = Arc::new(MemoryBackend::new(&config));
    hub.add_database(Database::new("main", backend, &config).with_service(service)).unwrap();
    hub
}

fn run(hub: &Hub, tasks: Vec<SyncTask>) -> SyncResponse {
    hub.execute_sync(&SyncRequest::new("main", tasks))
}

fn value_of(entity: &EntityValue) -> serde_json::Value {
    entity.value().expect("entity has a value").parse().unwrap()
}

fn count_value(result: &SyncTaskResult) -> f64 {
    match result {
        SyncTaskResult::Aggregate(aggregate) => aggregate.value,
        other => panic!("expected aggregate result, got {:?}", other),
    }
}

fn query_result(result: &SyncTaskResult) -> &QueryEntitiesResult {
    match result {
        SyncTaskResult::Query(query) => query,
        other => panic!("expected query result, got {:?}", other),
    }
}

// ==================== Entities ====================

#[test]
fn test_one_result_per_task() {
    let hub = memory_hub();
    let response = run(
        &hub,
        vec![
            SyncTask::upsert("items", vec![JsonEntity::new(1, json!({"a": 1}))]),
            SyncTask::command("app.Unknown", None),
            SyncTask::read("items", vec![JsonKey::from(1)]),
        ],
    );

    assert_eq!(response.tasks.len(), 3, "Every task must get a result");
    assert!(response.tasks[1].is_error());
    assert!(!response.tasks[2].is_error(), "A failed task must not affect its siblings");
}

#[test]
fn test_create_then_read() {
    let hub = memory_hub();
    let response = run(
        &hub,
        vec![
            SyncTask::create("items", vec![JsonEntity::new(1, json!({"a": 1}))]),
            SyncTask::read("items", vec![JsonKey::from(1), JsonKey::from(2)]),
        ],
    );

    assert!(response.tasks[0].entity_errors().is_empty());
    let entities = response.tasks[1].entities();
    assert_eq!(entities.len(), 2);
    assert_eq!(value_of(&entities[0]), json!({"a": 1}));
    assert_eq!(entities[1].state, EntityState::Missing);
}

#[test]
fn test_create_existing_key_fails_per_entity() {
    let hub = memory_hub();
    run(&hub, vec![SyncTask::create("items", vec![JsonEntity::new(1, json!({"a": 1}))])]);
    let response = run(
        &hub,
        vec![SyncTask::create(
            "items",
            vec![JsonEntity::new(1, json!({"a": 2})), JsonEntity::new(2, json!({"a": 3}))],
        )],
    );

    let errors = response.tasks[0].entity_errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].key, JsonKey::from(1));
    assert_eq!(errors[0].kind, EntityErrorType::WriteError);
}

#[test]
fn test_upsert_is_idempotent() {
    let hub = memory_hub();
    let entity = JsonEntity::new("x", json!({"name": "same"}));
    run(&hub, vec![SyncTask::upsert("items", vec![entity.clone()])]);
    let response = run(
        &hub,
        vec![
            SyncTask::upsert("items", vec![entity]),
            SyncTask::count("items", Filter::all()),
            SyncTask::read("items", vec![JsonKey::from("x")]),
        ],
    );

    assert!(response.tasks[0].entity_errors().is_empty());
    assert_eq!(count_value(&response.tasks[1]), 1.0);
    assert_eq!(value_of(&response.tasks[2].entities()[0]), json!({"name": "same"}));
}

#[test]
fn test_delete_missing_key_succeeds() {
    let hub = memory_hub();
    let response = run(
        &hub,
        vec![
            SyncTask::delete("items", vec![JsonKey::from(42)]),
            SyncTask::delete("items", Vec::new()),
        ],
    );

    assert!(!response.tasks[0].is_error());
    assert!(response.tasks[0].entity_errors().is_empty());
    assert!(response.tasks[1].entity_errors().is_empty());
}

#[test]
fn test_delete_all() {
    let hub = memory_hub();
    let entities = (1..=5i64).map(|i| JsonEntity::new(i, json!({"i": i}))).collect();
    let response = run(
        &hub,
        vec![
            SyncTask::upsert("items", entities),
            SyncTask::delete_all("items"),
            SyncTask::count("items", Filter::all()),
        ],
    );

    assert_eq!(count_value(&response.tasks[2]), 0.0);
}

#[test]
fn test_count_with_filter() {
    let hub = memory_hub();
    let entities = (1..=6i64)
        .map(|i| JsonEntity::new(i, json!({"even": i % 2 == 0})))
        .collect();
    let response = run(
        &hub,
        vec![
            SyncTask::upsert("items", entities),
            SyncTask::count("items", Filter::all()),
            SyncTask::count("items", Filter::field_equals("even", json!(true))),
        ],
    );

    assert_eq!(count_value(&response.tasks[1]), 6.0);
    assert_eq!(count_value(&response.tasks[2]), 3.0);
}

#[test]
fn test_filter_failure_is_filter_error() {
    let hub = memory_hub();
    let failing = Filter::new(".broken", |_| Err("cannot evaluate".to_string()));
    let response = run(
        &hub,
        vec![
            SyncTask::upsert("items", vec![JsonEntity::new(1, json!({}))]),
            SyncTask::query("items", failing),
        ],
    );

    assert_eq!(response.tasks[1].error().unwrap().kind, TaskErrorType::FilterError);
}

// ==================== Query paging ====================

fn paged_query(max_count: usize, cursor: Option<String>) -> SyncTask {
    let mut query = QueryEntities::new("items", Filter::all());
    query.max_count = Some(max_count);
    query.cursor = cursor;
    SyncTask::Query(query)
}

#[test]
fn test_query_paging_with_cursor() {
    let hub = memory_hub();
    let entities = (1..=5i64).map(|i| JsonEntity::new(i, json!({"i": i}))).collect();
    run(&hub, vec![SyncTask::upsert("items", entities)]);

    let mut keys = Vec::new();
    let mut cursor = None;
    let mut pages = 0;
    loop {
        let response = run(&hub, vec![paged_query(2, cursor.clone())]);
        let page = query_result(&response.tasks[0]);
        keys.extend(page.entities.iter().map(|e| e.key.clone()));
        pages += 1;
        cursor = page.cursor.clone();
        if cursor.is_none() {
            break;
        }
        assert!(pages < 10, "Paging must terminate");
    }

    assert_eq!(keys, (1..=5i64).map(JsonKey::from).collect::<Vec<_>>());
    assert_eq!(pages, 3);
}

#[test]
fn test_query_limit_has_no_cursor() {
    let hub = memory_hub();
    let entities = (1..=5i64).map(|i| JsonEntity::new(i, json!({"i": i}))).collect();
    let mut query = QueryEntities::new("items", Filter::all());
    query.limit = Some(2);
    let response = run(&hub, vec![SyncTask::upsert("items", entities), SyncTask::Query(query)]);

    let page = query_result(&response.tasks[1]);
    assert_eq!(page.entities.len(), 2);
    assert!(page.cursor.is_none());
}

#[test]
fn test_cursor_of_other_user_not_found() {
    let hub = memory_hub();
    let entities = (1..=4i64).map(|i| JsonEntity::new(i, json!({"i": i}))).collect();
    run(&hub, vec![SyncTask::upsert("items", entities)]);

    let alice = SyncRequest::new("main", vec![paged_query(2, None)]).with_user("alice", "t");
    let response = hub.execute_sync(&alice);
    let cursor = query_result(&response.tasks[0]).cursor.clone().unwrap();

    let bob = SyncRequest::new("main", vec![paged_query(2, Some(cursor.clone()))]).with_user("bob", "t");
    let response = hub.execute_sync(&bob);
    let error = response.tasks[0].error().unwrap();
    assert_eq!(error.kind, TaskErrorType::InvalidTask);
    assert_eq!(error.message, "cursor not found");

    let again = SyncRequest::new("main", vec![paged_query(2, Some(cursor))]).with_user("alice", "t");
    let response = hub.execute_sync(&again);
    assert_eq!(query_result(&response.tasks[0]).entities.len(), 2);
}

#[test]
fn test_close_cursors() {
    let hub = memory_hub();
    let entities = (1..=6i64).map(|i| JsonEntity::new(i, json!({"i": i}))).collect();
    run(&hub, vec![SyncTask::upsert("items", entities)]);
    let first = run(&hub, vec![paged_query(2, None)]);
    let second = run(&hub, vec![paged_query(2, None)]);
    let first_cursor = query_result(&first.tasks[0]).cursor.clone().unwrap();
    assert!(query_result(&second.tasks[0]).cursor.is_some());

    let close_one = SyncTask::CloseCursors(CloseCursors {
        container: "items".to_string(),
        cursors: Some(vec![first_cursor.clone()]),
    });
    let close_all = SyncTask::CloseCursors(CloseCursors {
        container: "items".to_string(),
        cursors: None,
    });
    let response = run(&hub, vec![close_one, close_all, paged_query(2, Some(first_cursor))]);

    match (&response.tasks[0], &response.tasks[1]) {
        (SyncTaskResult::CloseCursors(one), SyncTaskResult::CloseCursors(all)) => {
            assert_eq!(one.count, 1);
            assert_eq!(all.count, 0);
        }
        other => panic!("unexpected results {:?}", other),
    }
    assert_eq!(response.tasks[2].error().unwrap().message, "cursor not found");
}

// ==================== Merge ====================

#[test]
fn test_merge_patch() {
    let hub = memory_hub();
    let response = run(
        &hub,
        vec![
            SyncTask::upsert("items", vec![JsonEntity::new(1, json!({"a": 1, "b": 3}))]),
            SyncTask::merge(
                "items",
                vec![EntityPatch::new(1, json!({"a": 2})), EntityPatch::new(2, json!({"a": 2}))],
            ),
            SyncTask::read("items", vec![JsonKey::from(1), JsonKey::from(2)]),
        ],
    );

    let errors = response.tasks[1].entity_errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].key, JsonKey::from(2));
    assert_eq!(errors[0].kind, EntityErrorType::PatchError);

    let entities = response.tasks[2].entities();
    assert_eq!(value_of(&entities[0]), json!({"a": 2, "b": 3}));
    assert_eq!(entities[1].state, EntityState::Missing, "A failed patch must not create the entity");
}

#[test]
fn test_merge_validates_each_entity() {
    let config = HubConfig::default();
    let hub = Hub::new(config.clone()).unwrap();
    let schema = DatabaseSchema::new().with_container(
        "items",
        EntityType::new().with_field(Field::new("a", FieldType::Integer).required()),
    );
    let backend = Arc::new(MemoryBackend::new(&config));
    hub.add_database(Database::new("main", backend, &config).with_schema(schema)).unwrap();

    let response = run(
        &hub,
        vec![
            SyncTask::upsert("items", vec![JsonEntity::new(1, json!({"a": 1})), JsonEntity::new(2, json!({"a": 2}))]),
            SyncTask::merge(
                "items",
                vec![EntityPatch::new(1, json!({"a": "text"})), EntityPatch::new(2, json!({"a": 5}))],
            ),
            SyncTask::read("items", vec![JsonKey::from(1), JsonKey::from(2)]),
        ],
    );

    let errors = response.tasks[1].entity_errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].key, JsonKey::from(1));
    assert!(errors[0].message.starts_with("validation failed"));
    let entities = response.tasks[2].entities();
    assert_eq!(value_of(&entities[0]), json!({"a": 1}));
    assert_eq!(value_of(&entities[1]), json!({"a": 5}));
}

#[test]
fn test_unknown_container_with_schema() {
    let config = HubConfig::default();
    let hub = Hub::new(config.clone()).unwrap();
    let schema = DatabaseSchema::new().with_container("items", EntityType::new());
    let backend = Arc::new(MemoryBackend::new(&config));
    hub.add_database(Database::new("main", backend, &config).with_schema(schema)).unwrap();

    let response = run(&hub, vec![SyncTask::read("other", vec![JsonKey::from(1)])]);
    let error = response.tasks[0].error().unwrap();
    assert_eq!(error.message, "container not found: other");
}

// ==================== Databases ====================

#[test]
fn test_unknown_database_fails_every_task() {
    let hub = memory_hub();
    let request = SyncRequest::new(
        "missing",
        vec![SyncTask::read("items", vec![JsonKey::from(1)]), SyncTask::TransactionBegin],
    );
    let response = hub.execute_sync(&request);

    assert_eq!(response.tasks.len(), 2);
    for result in &response.tasks {
        let error = result.error().unwrap();
        assert_eq!(error.kind, TaskErrorType::InvalidTask);
        assert_eq!(error.message, "database not found: missing");
    }
}

#[test]
fn test_connection_released_after_request() {
    let hub = memory_hub();
    run(
        &hub,
        vec![
            SyncTask::upsert("items", vec![JsonEntity::new(1, json!({}))]),
            SyncTask::read("items", vec![JsonKey::from(1)]),
        ],
    );

    let database = hub.database("main").unwrap();
    let stats = database.connections().stats();
    assert_eq!(stats.active_connections, 0);
    assert_eq!(stats.idle_connections, 1, "One connection serves a whole request");
}

// ==================== Commands ====================

#[test]
fn test_std_commands() {
    let hub = memory_hub();
    run(&hub, vec![SyncTask::upsert("items", vec![JsonEntity::new(1, json!({}))])]);
    let response = run(
        &hub,
        vec![
            SyncTask::command("std.Echo", Some(json!({"ping": 1}))),
            SyncTask::command("std.Containers", None),
            SyncTask::command("std.Host", None),
        ],
    );

    let results: Vec<serde_json::Value> = response
        .tasks
        .iter()
        .map(|task| match task {
            SyncTaskResult::Command(command) => command.result.as_ref().unwrap().parse().unwrap(),
            other => panic!("expected command result, got {:?}", other),
        })
        .collect();
    assert_eq!(results[0], json!({"ping": 1}));
    assert_eq!(results[1], json!(["items"]));
    assert_eq!(results[2]["hubName"], json!("sync-hub"));
}

#[tokio::test]
async fn test_async_std_stats() {
    let hub = memory_hub();
    run(&hub, vec![SyncTask::upsert("items", vec![JsonEntity::new(1, json!({})), JsonEntity::new(2, json!({}))])]);

    let request = SyncRequest::new("main", vec![SyncTask::command("std.Stats", None)]);
    let response = hub.execute_direct(&request).await;
    match &response.tasks[0] {
        SyncTaskResult::Command(command) => {
            let result = command.result.as_ref().unwrap().parse().unwrap();
            assert_eq!(result, json!({"containers": [{"name": "items", "count": 2}]}));
        }
        other => panic!("expected command result, got {:?}", other),
    }

    let forced = hub.execute_sync(&request);
    assert_eq!(forced.tasks[0].error().unwrap().kind, TaskErrorType::NotImplemented);
}

#[test]
fn test_custom_commands() {
    let mut dispatcher = ServiceDispatcher::new();
    dispatcher
        .register_command("app.Add", |param: &Param, _ctx: &SyncContext| {
            let numbers: Vec<i64> = param.get()?;
            dispatcher::to_result(&numbers.iter().sum::<i64>())
        })
        .unwrap();
    dispatcher
        .register_command("app.Fail", |_: &Param, _: &SyncContext| Err("refused".to_string()))
        .unwrap();
    let hub = hub_with_service(DatabaseService::new(dispatcher));

    let response = run(
        &hub,
        vec![
            SyncTask::command("app.Add", Some(json!([1, 2, 3]))),
            SyncTask::command("app.Fail", None),
            SyncTask::command("app.Missing", None),
            SyncTask::message("app.Nobody", Some(json!("hello"))),
        ],
    );

    match &response.tasks[0] {
        SyncTaskResult::Command(command) => {
            assert_eq!(command.result.as_ref().unwrap().parse().unwrap(), json!(6));
        }
        other => panic!("expected command result, got {:?}", other),
    }
    let failed = response.tasks[1].error().unwrap();
    assert_eq!(failed.kind, TaskErrorType::Error);
    assert_eq!(failed.message, "refused");
    assert_eq!(response.tasks[2].error().unwrap().kind, TaskErrorType::NotImplemented);
    assert_eq!(response.tasks[3], SyncTaskResult::Message, "Messages without handler succeed");
}

#[test]
fn test_reserved_command_names() {
    let mut dispatcher = ServiceDispatcher::new();
    let reserved = dispatcher.register_command("std.Mine", |_: &Param, _: &SyncContext| Ok(None));
    assert!(matches!(reserved, Err(HubError::ReservedHandlerName(_))));

    dispatcher.register_command("app.Once", |_: &Param, _: &SyncContext| Ok(None)).unwrap();
    let duplicate = dispatcher.register_command("app.Once", |_: &Param, _: &SyncContext| Ok(None));
    assert!(matches!(duplicate, Err(HubError::DuplicateHandler(_))));
}

#[test]
fn test_panicking_handler_is_contained() {
    let mut dispatcher = ServiceDispatcher::new();
    dispatcher
        .register_command("app.Panic", |_: &Param, _: &SyncContext| panic!("handler blew up"))
        .unwrap();
    let hub = hub_with_service(DatabaseService::new(dispatcher));

    let response = run(
        &hub,
        vec![
            SyncTask::command("app.Panic", None),
            SyncTask::upsert("items", vec![JsonEntity::new(1, json!({}))]),
            SyncTask::count("items", Filter::all()),
        ],
    );

    let error = response.tasks[0].error().unwrap();
    assert_eq!(error.kind, TaskErrorType::Error);
    assert!(error.message.contains("handler blew up"));
    assert!(response.tasks[1].entity_errors().is_empty());
    assert_eq!(count_value(&response.tasks[2]), 1.0, "Tasks after a panic still run");
}

// ==================== Authorization ====================

fn hub_with_users() -> Hub {
    let users = UserAuthenticator::new();
    users.add_user("writer", "w-token", Role::ReadWrite).unwrap();
    users.add_user("reader", "r-token", Role::ReadOnly).unwrap();
    let config = HubConfig::default();
    let hub = Hub::new(config.clone()).unwrap().with_authenticator(Arc::new(users));
    let backend = Arc::new(MemoryBackend::new(&config));
    hub.add_database(Database::new("main", backend, &config)).unwrap();
    hub
}

#[test]
fn test_read_only_user_cannot_write() {
    let hub = hub_with_users();
    let tasks = vec![
        SyncTask::upsert("items", vec![JsonEntity::new(1, json!({}))]),
        SyncTask::read("items", vec![JsonKey::from(1)]),
    ];

    let writer = hub.execute_sync(&SyncRequest::new("main", tasks.clone()).with_user("writer", "w-token"));
    assert!(writer.tasks.iter().all(|t| !t.is_error()));

    let reader = hub.execute_sync(&SyncRequest::new("main", tasks).with_user("reader", "r-token"));
    let denied = reader.tasks[0].error().unwrap();
    assert_eq!(denied.kind, TaskErrorType::PermissionDenied);
    assert_eq!(denied.user_id.as_deref(), Some("reader"));
    assert_eq!(reader.tasks[1].entities().len(), 1);
}

#[test]
fn test_bad_token_denied() {
    let hub = hub_with_users();
    let request =
        SyncRequest::new("main", vec![SyncTask::read("items", vec![JsonKey::from(1)])]).with_user("writer", "wrong");
    let response = hub.execute_sync(&request);

    let error = response.tasks[0].error().unwrap();
    assert_eq!(error.kind, TaskErrorType::PermissionDenied);
    assert_eq!(error.message, "invalid credentials");
}

// ==================== Events ====================

#[test]
fn test_change_events() {
    let config = HubConfig::default();
    let log = Arc::new(EventLog::new());
    let hub = Hub::new(config.clone()).unwrap().with_events(log.clone());
    let backend = Arc::new(MemoryBackend::new(&config));
    hub.add_database(Database::new("main", backend, &config)).unwrap();

    let request = SyncRequest::new(
        "main",
        vec![
            SyncTask::create("items", vec![JsonEntity::new(1, json!({}))]),
            SyncTask::create("items", vec![JsonEntity::new(1, json!({})), JsonEntity::new(2, json!({}))]),
            SyncTask::SubscribeChanges(SubscribeChanges {
                container: "items".to_string(),
                changes: vec![ChangeKind::Create],
                filter: Filter::all(),
            }),
        ],
    )
    .with_client("client-1");
    let response = hub.execute_sync(&request);

    assert_eq!(response.tasks[2], SyncTaskResult::SubscribeChanges);
    let changes = log.changes();
    assert_eq!(changes.len(), 2);
    assert_eq!(changes[0].keys, vec![JsonKey::from(1)]);
    assert_eq!(changes[1].keys, vec![JsonKey::from(2)], "Failed keys are not reported");
    assert_eq!(changes[1].client_id.as_deref(), Some("client-1"));
    assert_eq!(log.subscriptions(), vec![(Some("client-1".to_string()), "items".to_string())]);
}

#[test]
fn test_delete_all_reports_removed_keys() {
    let config = HubConfig::default();
    let log = Arc::new(EventLog::new());
    let hub = Hub::new(config.clone()).unwrap().with_events(log.clone());
    let backend = Arc::new(MemoryBackend::new(&config));
    hub.add_database(Database::new("main", backend, &config)).unwrap();

    let response = hub.execute_sync(&SyncRequest::new(
        "main",
        vec![
            SyncTask::upsert("items", vec![JsonEntity::new(1, json!({})), JsonEntity::new(2, json!({}))]),
            SyncTask::delete_all("items"),
            SyncTask::upsert("items", vec![JsonEntity::new(3, json!({}))]),
            SyncTask::TransactionBegin,
            SyncTask::delete_all("items"),
            SyncTask::TransactionCommit,
        ],
    ));
    assert!(response.tasks.iter().all(|t| !t.is_error()));

    let deletes: Vec<Vec<JsonKey>> = log
        .changes()
        .into_iter()
        .filter(|event| event.kind == ChangeKind::Delete)
        .map(|event| event.keys)
        .collect();
    assert_eq!(
        deletes,
        vec![vec![JsonKey::from(1), JsonKey::from(2)], vec![JsonKey::from(3)]],
        "Delete-all events carry the removed keys"
    );
}

#[test]
fn test_subscribe_without_dispatcher() {
    let hub = memory_hub();
    let response = run(
        &hub,
        vec![SyncTask::SubscribeMessage(SubscribeMessage {
            name: "chat".to_string(),
            remove: false,
        })],
    );
    assert_eq!(response.tasks[0].error().unwrap().kind, TaskErrorType::NotImplemented);
}
