//! End-to-end sync over the in-memory adapter: subscriptions, broadcast
//! fan-out, and cross-replica convergence, without a network in the way.

use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tether_engine::{
    Collection, EncodedField, LiveType, Mutation, MutationKind, QueryRequest, Record, Schema,
    ServerFrame, Timestamp, WhereClause, WriteMutation,
};
use tether_server::{AppState, MemoryStorage, RawRequest, Route, Server, SubscriptionRegistry};
use tokio::sync::mpsc;

fn board_schema() -> Schema {
    Schema::new()
        .with_collection(
            Collection::new("cards")
                .field("id", LiveType::Text)
                .field("title", LiveType::Text)
                .field("done", LiveType::Boolean),
        )
        .unwrap()
        .with_collection(
            Collection::new("counters")
                .field("id", LiveType::Text)
                .field("counter", LiveType::Number),
        )
        .unwrap()
}

fn app_state() -> AppState {
    let schema = board_schema();
    let storage = Arc::new(MemoryStorage::new(schema.clone()));
    let server = Server::new(schema, storage)
        .unwrap()
        .with_route(Route::new("cards"))
        .with_route(Route::new("counters"));
    AppState::new(Arc::new(server), SubscriptionRegistry::new_shared(16))
}

fn encoded(value: serde_json::Value, stamp: &str) -> EncodedField {
    EncodedField::new(value, Timestamp::new(stamp))
}

fn insert_card(id: &str, title: &str, done: bool, stamp: &str) -> Mutation {
    let payload = [
        ("title".to_string(), encoded(json!(title), stamp)),
        ("done".to_string(), encoded(json!(done), stamp)),
    ]
    .into_iter()
    .collect();
    Mutation::Insert(WriteMutation::new("cards", id, payload, Timestamp::new(stamp)))
}

fn update_card(id: &str, field: &str, value: serde_json::Value, stamp: &str) -> Mutation {
    let payload = [(field.to_string(), encoded(value, stamp))]
        .into_iter()
        .collect();
    Mutation::Update(WriteMutation::new("cards", id, payload, Timestamp::new(stamp)))
}

#[tokio::test]
async fn subscribers_hear_commits_in_order() {
    let state = app_state();

    let (sender, mut inbox) = mpsc::unbounded_channel();
    let conn = state.registry.register(sender);
    let query = QueryRequest {
        resource: "cards".to_string(),
        filter: Some(WhereClause::eq("done", json!(false))),
        include: None,
        limit: None,
    };
    let initial = state
        .server
        .handle_query(query.clone(), RawRequest::default())
        .await
        .unwrap();
    assert!(initial.is_empty());
    state.registry.subscribe(&conn, 1, query);

    // a peer (not this connection) commits three mutations
    for mutation in [
        insert_card("c1", "first", false, "T1"),
        insert_card("c2", "second", false, "T2"),
        update_card("c1", "title", json!("renamed"), "T3"),
    ] {
        state
            .execute_mutation(mutation, RawRequest::default(), None)
            .await
            .unwrap();
    }

    let mut seen = Vec::new();
    while let Ok(frame) = inbox.try_recv() {
        let ServerFrame::Broadcast {
            resource_id,
            procedure,
            ..
        } = frame
        else {
            panic!("expected broadcast");
        };
        seen.push((resource_id.unwrap(), procedure));
    }
    assert_eq!(
        seen,
        vec![
            ("c1".to_string(), "INSERT".to_string()),
            ("c2".to_string(), "INSERT".to_string()),
            ("c1".to_string(), "UPDATE".to_string()),
        ]
    );
}

#[tokio::test]
async fn non_subscribed_resources_stay_silent() {
    let state = app_state();

    let (sender, mut inbox) = mpsc::unbounded_channel();
    let conn = state.registry.register(sender);
    state
        .registry
        .subscribe(&conn, 1, QueryRequest::resource("counters"));

    state
        .execute_mutation(
            insert_card("c1", "first", false, "T1"),
            RawRequest::default(),
            None,
        )
        .await
        .unwrap();

    assert!(inbox.try_recv().is_err());
}

#[tokio::test]
async fn stale_mutation_acks_null_and_broadcasts_nothing() {
    let state = app_state();

    let (sender, mut inbox) = mpsc::unbounded_channel();
    let conn = state.registry.register(sender);
    state
        .registry
        .subscribe(&conn, 1, QueryRequest::resource("cards"));

    state
        .execute_mutation(
            insert_card("c1", "current", false, "T5"),
            RawRequest::default(),
            None,
        )
        .await
        .unwrap();
    let _ = inbox.try_recv(); // drain the insert broadcast

    let response = state
        .execute_mutation(
            update_card("c1", "title", json!("old"), "T3"),
            RawRequest::default(),
            None,
        )
        .await
        .unwrap();

    assert!(response.accepted_values.is_none());
    assert!(inbox.try_recv().is_err());

    // the record is unchanged
    let records = state
        .server
        .handle_query(QueryRequest::resource("cards"), RawRequest::default())
        .await
        .unwrap();
    assert_eq!(records["c1"].infer()["title"], json!("current"));
}

/// Two clients race on the same counter; whatever order their mutations
/// and broadcasts are applied in, every replica lands on the T2 write.
#[tokio::test]
async fn racing_writers_converge_across_replicas() {
    let state = app_state();
    let schema = board_schema();

    let seed: BTreeMap<_, _> = [
        ("id".to_string(), encoded(json!("cnt1"), "T0")),
        ("counter".to_string(), encoded(json!(0), "T0")),
    ]
    .into_iter()
    .collect();
    state
        .execute_mutation(
            Mutation::Insert(WriteMutation::new(
                "counters",
                "cnt1",
                seed.clone(),
                Timestamp::new("T0"),
            )),
            RawRequest::default(),
            None,
        )
        .await
        .unwrap();

    let from_a = Mutation::Update(WriteMutation::new(
        "counters",
        "cnt1",
        [("counter".to_string(), encoded(json!(1), "T1#000001#clnA"))]
            .into_iter()
            .collect(),
        Timestamp::new("T1#000001#clnA"),
    ));
    let from_b = Mutation::Update(WriteMutation::new(
        "counters",
        "cnt1",
        [("counter".to_string(), encoded(json!(2), "T2#000001#clnB"))]
            .into_iter()
            .collect(),
        Timestamp::new("T2#000001#clnB"),
    ));

    let mut broadcasts = Vec::new();
    for mutation in [from_a, from_b] {
        let (_, event) = state
            .server
            .handle_mutation(mutation, RawRequest::default())
            .await
            .unwrap();
        broadcasts.push(event.unwrap());
    }

    // replicas start from the same snapshot and apply the broadcasts in
    // opposite orders
    let (base, _) = schema
        .merge_mutation("counters", MutationKind::Insert, &seed, None)
        .unwrap();
    let apply = |order: &[usize]| -> Record {
        let mut record = base.clone();
        for index in order {
            let (merged, _) = schema
                .merge_mutation(
                    "counters",
                    MutationKind::Update,
                    &broadcasts[*index].payload,
                    Some(&record),
                )
                .unwrap();
            record = merged;
        }
        record
    };

    let replica_one = apply(&[0, 1]);
    let replica_two = apply(&[1, 0]);
    assert_eq!(replica_one.infer(), replica_two.infer());
    assert_eq!(replica_one.infer()["counter"], json!(2));

    // and both agree with the authoritative store
    let records = state
        .server
        .handle_query(QueryRequest::resource("counters"), RawRequest::default())
        .await
        .unwrap();
    assert_eq!(records["cnt1"].infer()["counter"], json!(2));
}

#[tokio::test]
async fn unsubscribed_connections_stop_receiving() {
    let state = app_state();

    let (sender, mut inbox) = mpsc::unbounded_channel();
    let conn = state.registry.register(sender);
    state
        .registry
        .subscribe(&conn, 7, QueryRequest::resource("cards"));

    state
        .execute_mutation(
            insert_card("c1", "one", false, "T1"),
            RawRequest::default(),
            None,
        )
        .await
        .unwrap();
    assert!(inbox.try_recv().is_ok());

    state.registry.unsubscribe(&conn, 7);
    state
        .execute_mutation(
            insert_card("c2", "two", false, "T2"),
            RawRequest::default(),
            None,
        )
        .await
        .unwrap();
    assert!(inbox.try_recv().is_err());
}
