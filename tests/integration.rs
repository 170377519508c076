//! Integration tests for the subscription engine.

use liveset::{
    AssociationNode, Attributes, EngineConfig, HandlerContext, HandlerRef, MapLookup,
    MemoryAdapter, Mutation, NullLookup, Predicate, Query, SubscriberId, SubscriptionEngine,
    Version,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn record(pairs: &[(&str, Value)]) -> Attributes {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

fn engine_with_lookup(lookup: Arc<dyn liveset::RecordLookup>) -> SubscriptionEngine {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    SubscriptionEngine::new(
        EngineConfig {
            version: Version::new("v1"),
            ..Default::default()
        },
        Arc::new(MemoryAdapter::new()),
        lookup,
    )
}

fn engine() -> SubscriptionEngine {
    engine_with_lookup(Arc::new(NullLookup))
}

fn counting_handler(engine: &SubscriptionEngine, name: &str) -> Arc<AtomicUsize> {
    let calls = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&calls);
    engine.handlers().register(name, move |_: &HandlerContext| {
        counted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    calls
}

// --- Coverage Transitions ---

#[test]
fn test_coverage_transitions() {
    let engine = engine();
    let calls = counting_handler(&engine, "notify");

    engine
        .subscribe(
            Query::source("posts").with_predicate(Predicate::equality([("title", json!("foo"))])),
            &SubscriberId::from("conn"),
            HandlerRef::new("notify"),
        )
        .unwrap();

    // Created in scope: fires.
    let created = Mutation::create("posts", record(&[("id", json!(1)), ("title", json!("foo"))]));
    assert_eq!(engine.did_mutate(&created).unwrap(), 1);

    // Updated into scope: fires.
    let into = Mutation::update(
        "posts",
        record(&[("id", json!(2)), ("title", json!("foo"))]),
        record(&[("id", json!(2)), ("title", json!("bar"))]),
    );
    assert_eq!(engine.did_mutate(&into).unwrap(), 1);

    // Updated out of scope: fires.
    let out = Mutation::update(
        "posts",
        record(&[("id", json!(1)), ("title", json!("qux"))]),
        record(&[("id", json!(1)), ("title", json!("foo"))]),
    );
    assert_eq!(engine.did_mutate(&out).unwrap(), 1);

    // Updated between two non-matching titles: does not fire.
    let unrelated = Mutation::update(
        "posts",
        record(&[("id", json!(3)), ("title", json!("baz"))]),
        record(&[("id", json!(3)), ("title", json!("bar"))]),
    );
    assert_eq!(engine.did_mutate(&unrelated).unwrap(), 0);

    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[test]
fn test_at_most_once_delivery_per_mutation() {
    let engine = engine();
    let calls = counting_handler(&engine, "notify");

    engine
        .subscribe(
            Query::source("posts").with_predicate(Predicate::equality([("title", json!("foo"))])),
            &SubscriberId::from("conn"),
            HandlerRef::new("notify"),
        )
        .unwrap();

    // Covered in both pre- and post-state: exactly one dispatch.
    let update = Mutation::update(
        "posts",
        record(&[("id", json!(1)), ("title", json!("foo")), ("body", json!("new"))]),
        record(&[("id", json!(1)), ("title", json!("foo")), ("body", json!("old"))]),
    );
    assert_eq!(engine.did_mutate(&update).unwrap(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_compound_predicate_membership() {
    let engine = engine();
    let calls = counting_handler(&engine, "notify");

    engine
        .subscribe(
            Query::source("posts").with_predicate(Predicate::equality([("id", json!([1, 3]))])),
            &SubscriberId::from("conn"),
            HandlerRef::new("notify"),
        )
        .unwrap();

    for (id, expected) in [(1, 1), (2, 0), (3, 1)] {
        let mutation = Mutation::create("posts", record(&[("id", json!(id))]));
        assert_eq!(engine.did_mutate(&mutation).unwrap(), expected);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_delete_uses_last_known_record() {
    let engine = engine();
    let calls = counting_handler(&engine, "notify");

    engine
        .subscribe(
            Query::source("posts").with_predicate(Predicate::equality([("title", json!("foo"))])),
            &SubscriberId::from("conn"),
            HandlerRef::new("notify"),
        )
        .unwrap();

    let covered = Mutation::delete("posts", record(&[("id", json!(1)), ("title", json!("foo"))]));
    let uncovered = Mutation::delete("posts", record(&[("id", json!(2)), ("title", json!("bar"))]));

    assert_eq!(engine.did_mutate(&covered).unwrap(), 1);
    assert_eq!(engine.did_mutate(&uncovered).unwrap(), 0);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

// --- Associated Coverage ---

#[test]
fn test_associated_coverage() {
    let lookup = Arc::new(MapLookup::new());
    lookup.insert("posts", record(&[("id", json!(1)), ("title", json!("foo"))]));
    lookup.insert("posts", record(&[("id", json!(2)), ("title", json!("bar"))]));

    let engine = engine_with_lookup(Arc::clone(&lookup) as Arc<dyn liveset::RecordLookup>);
    let calls = counting_handler(&engine, "notify");

    engine
        .subscribe(
            Query::source("posts")
                .with_predicate(Predicate::equality([("title", json!("foo"))]))
                .including(AssociationNode::new("comments", "post_id")),
            &SubscriberId::from("conn"),
            HandlerRef::new("notify"),
        )
        .unwrap();

    // Comment created under the subscribed post: fires.
    let created = Mutation::create(
        "comments",
        record(&[("id", json!(10)), ("post_id", json!(1))]),
    );
    assert_eq!(engine.did_mutate(&created).unwrap(), 1);

    // Comment under an unrelated post: does not fire.
    let unrelated = Mutation::create(
        "comments",
        record(&[("id", json!(11)), ("post_id", json!(2))]),
    );
    assert_eq!(engine.did_mutate(&unrelated).unwrap(), 0);

    // Comment reassigned away from the subscribed post: fires once.
    let moved = Mutation::update(
        "comments",
        record(&[("id", json!(10)), ("post_id", json!(2))]),
        record(&[("id", json!(10)), ("post_id", json!(1))]),
    );
    assert_eq!(engine.did_mutate(&moved).unwrap(), 1);

    // Comment deleted under the subscribed post: fires.
    let deleted = Mutation::delete(
        "comments",
        record(&[("id", json!(12)), ("post_id", json!(1))]),
    );
    assert_eq!(engine.did_mutate(&deleted).unwrap(), 1);

    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[test]
fn test_nested_associated_coverage() {
    let lookup = Arc::new(MapLookup::new());
    lookup.insert("posts", record(&[("id", json!(1)), ("title", json!("foo"))]));
    lookup.insert(
        "comments",
        record(&[("id", json!(10)), ("post_id", json!(1))]),
    );

    let engine = engine_with_lookup(Arc::clone(&lookup) as Arc<dyn liveset::RecordLookup>);
    counting_handler(&engine, "notify");

    engine
        .subscribe(
            Query::source("posts")
                .with_predicate(Predicate::equality([("title", json!("foo"))]))
                .including(
                    AssociationNode::new("comments", "post_id")
                        .with_children(vec![AssociationNode::new("tags", "comment_id")]),
                ),
            &SubscriberId::from("conn"),
            HandlerRef::new("notify"),
        )
        .unwrap();

    let tag = Mutation::create(
        "tags",
        record(&[("id", json!(100)), ("comment_id", json!(10))]),
    );
    assert_eq!(engine.did_mutate(&tag).unwrap(), 1);

    let stray = Mutation::create(
        "tags",
        record(&[("id", json!(101)), ("comment_id", json!(55))]),
    );
    assert_eq!(engine.did_mutate(&stray).unwrap(), 0);
}

// --- Named Filters ---

#[test]
fn test_named_filter_shared_with_query_path() {
    let engine = engine();
    let calls = counting_handler(&engine, "notify");

    engine
        .filters()
        .register("by_title", |record: &Attributes, args: &[Value]| {
            record.get("title") == args.first()
        });

    engine
        .subscribe(
            Query::source("posts")
                .with_predicate(Predicate::named("by_title", vec![json!("foo")])),
            &SubscriberId::from("conn"),
            HandlerRef::new("notify"),
        )
        .unwrap();

    let hit = Mutation::create("posts", record(&[("title", json!("foo"))]));
    let miss = Mutation::create("posts", record(&[("title", json!("bar"))]));

    assert_eq!(engine.did_mutate(&hit).unwrap(), 1);
    assert_eq!(engine.did_mutate(&miss).unwrap(), 0);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

// --- Version Gating ---

#[test]
fn test_version_gating_across_deploys() {
    let adapter = Arc::new(MemoryAdapter::new());

    let v1 = SubscriptionEngine::new(
        EngineConfig {
            version: Version::new("v1"),
            ..Default::default()
        },
        Arc::clone(&adapter) as Arc<dyn liveset::SubscriptionAdapter>,
        Arc::new(NullLookup),
    );
    counting_handler(&v1, "notify");

    v1.subscribe(
        Query::source("posts").with_predicate(Predicate::equality([("title", json!("foo"))])),
        &SubscriberId::from("conn"),
        HandlerRef::new("notify"),
    )
    .unwrap();

    let v2 = SubscriptionEngine::new(
        EngineConfig {
            version: Version::new("v2"),
            ..Default::default()
        },
        adapter,
        Arc::new(NullLookup),
    );
    let v2_calls = counting_handler(&v2, "notify");

    let mutation = Mutation::create("posts", record(&[("title", json!("foo"))]));
    assert_eq!(v2.did_mutate(&mutation).unwrap(), 0);
    assert_eq!(v2_calls.load(Ordering::SeqCst), 0);
}

// --- Failure Isolation ---

#[test]
fn test_failing_handler_does_not_block_others() {
    let engine = engine();

    engine
        .handlers()
        .register("failing", |_: &HandlerContext| Err("boom".to_string().into()));
    let calls = counting_handler(&engine, "healthy");

    let query =
        Query::source("posts").with_predicate(Predicate::equality([("title", json!("foo"))]));
    engine
        .subscribe(
            query.clone(),
            &SubscriberId::from("conn-a"),
            HandlerRef::new("failing"),
        )
        .unwrap();
    engine
        .subscribe(query, &SubscriberId::from("conn-b"), HandlerRef::new("healthy"))
        .unwrap();

    let mutation = Mutation::create("posts", record(&[("title", json!("foo"))]));
    assert_eq!(engine.did_mutate(&mutation).unwrap(), 2);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_handler_receives_mutation_context() {
    let engine = engine();

    let (sender, receiver) = crossbeam_channel::unbounded();
    engine.handlers().register("capture", move |context: &HandlerContext| {
        sender.send(context.clone()).unwrap();
        Ok(())
    });

    engine
        .subscribe(
            Query::source("posts"),
            &SubscriberId::from("conn"),
            HandlerRef::new("capture").with_state(json!({"channel": "feed"})),
        )
        .unwrap();

    let mutation = Mutation::create("posts", record(&[("id", json!(7))]));
    engine.did_mutate(&mutation).unwrap();

    let context = receiver.try_recv().unwrap();
    assert_eq!(context.source, "posts");
    assert_eq!(context.record["id"], json!(7));
    assert_eq!(context.state["channel"], "feed");
}
