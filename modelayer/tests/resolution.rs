use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;
use modelayer::{memory::InMemoryStore, prelude::*};
use serde::Deserialize;

fn prefixed(name: &'static str, source: &'static str) -> VirtualDef {
    VirtualDef::new(name).requires([source]).get(move |doc| {
        let value = doc.get(source)?;
        Some(Bson::String(format!("{name}_{}", value.as_str()?)))
    })
}

fn track_count(mut state: HookState, _args: Option<Bson>) -> ModelResult<HookState> {
    let seen = state.meta.get_i32("trackCount").unwrap_or(0);
    state.meta.insert("trackCount", seen + 1);
    Ok(state)
}

fn recorder(name: &'static str) -> impl Fn(HookState, Option<Bson>) -> ModelResult<HookState> + Send + Sync {
    move |mut state, _args| {
        let mut order = state.meta.get_array("order").cloned().unwrap_or_default();
        order.push(Bson::String(name.to_string()));
        state.meta.insert("order", order);
        Ok(state)
    }
}

fn limit_to(mut state: HookState, args: Option<Bson>) -> ModelResult<HookState> {
    if let Some(Bson::Int32(limit)) = args {
        state.options.limit = Some(limit as usize);
    }
    Ok(state)
}

fn only_foo_x(mut state: HookState, _args: Option<Bson>) -> ModelResult<HookState> {
    state.filter = Some(Filter::eq("foo", "x"));
    Ok(state)
}

struct Stamp;

#[async_trait]
impl HookHandler for Stamp {
    async fn handle(&self, mut state: HookState, args: Option<Bson>) -> ModelResult<HookState> {
        for doc in state.docs.iter_mut() {
            doc.set("stamp", args.clone().unwrap_or(Bson::Boolean(true)))?;
        }
        Ok(state)
    }
}

fn things() -> Schema {
    Schema::builder("things")
        .field(FieldDef::new("foo", FieldType::String))
        .field(FieldDef::new("bar", FieldType::String))
        .virtual_field(prefixed("v1", "foo"))
        .virtual_field(prefixed("v2", "v1").requires_hooks(["afterFind_trackCount"]))
        .virtual_field(prefixed("v3", "v1"))
        .hook(HookDef::new(Phase::AfterFind, "trackCount", track_count))
        .hook(HookDef::new(Phase::AfterFind, "a", recorder("a")))
        .hook(HookDef::new(Phase::AfterFind, "b", recorder("b")))
        .hook(HookDef::new(Phase::AfterFind, "c", recorder("c")).required())
        .hook(HookDef::new(Phase::BeforeFind, "limitTo", limit_to))
        .hook(HookDef::new(Phase::BeforeFilter, "onlyFooX", only_foo_x))
        .hook(HookDef::new(Phase::AfterFind, "stamp", Stamp))
        .build()
        .unwrap()
}

async fn setup() -> (InMemoryStore, Model) {
    let store = InMemoryStore::new();
    let connection = Connection::new(store.clone());
    let things = connection.register(things()).await.unwrap();

    things
        .insert(
            vec![
                doc! { "_id": 1, "foo": "x", "bar": "y" },
                doc! { "_id": 2, "foo": "z", "bar": "w" },
                doc! { "_id": 3, "foo": "q", "bar": "r" },
            ],
            &[],
        )
        .await
        .unwrap();

    (store, things)
}

fn order(state: &HookState) -> Vec<&str> {
    state
        .meta
        .get_array("order")
        .map(|order| order.iter().filter_map(Bson::as_str).collect())
        .unwrap_or_default()
}

#[tokio::test]
async fn returns_only_the_requested_virtual() {
    let (_, things) = setup().await;

    let docs = things
        .find(FindRequest::new().filter(Filter::eq("_id", 1)).field("v3"))
        .await
        .unwrap();

    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].data(), &doc! { "v3": "v3_v1_x" });
}

#[tokio::test]
async fn raw_find_keeps_dependencies() {
    let (_, things) = setup().await;

    let docs = things
        .find(FindRequest::new().filter(Filter::eq("_id", 1)).field("v3").raw())
        .await
        .unwrap();

    assert_eq!(docs[0].data(), &doc! { "foo": "x", "v1": "v1_x", "v3": "v3_v1_x" });
}

#[tokio::test]
async fn plain_fields_come_back_without_primary_key() {
    let (_, things) = setup().await;

    let docs = things
        .find(FindRequest::new().filter(Filter::eq("_id", 2)).field("bar"))
        .await
        .unwrap();

    assert_eq!(docs[0].data(), &doc! { "bar": "w" });
}

#[tokio::test]
async fn computed_only_request_returns_nothing_stored() {
    let store = InMemoryStore::new();
    let connection = Connection::new(store.clone());
    let labels = connection
        .register(
            Schema::builder("labels")
                .field(FieldDef::new("foo", FieldType::String))
                .field(FieldDef::new("bar", FieldType::String))
                .virtual_field(VirtualDef::new("constant").get(|_| Some("k".into())))
                .build()
                .unwrap(),
        )
        .await
        .unwrap();
    labels
        .insert_one(doc! { "_id": 1, "foo": "x", "bar": "y" }, &[])
        .await
        .unwrap();

    let plan = labels
        .resolve_projection(&Selection::new().field("constant"))
        .unwrap();
    assert_eq!(plan.storage.included().collect::<Vec<_>>(), vec!["_id"]);

    let docs = labels.find(FindRequest::new().field("constant")).await.unwrap();
    assert_eq!(docs[0].data(), &doc! { "constant": "k" });

    let raw = labels
        .find(FindRequest::new().field("constant").raw())
        .await
        .unwrap();
    assert_eq!(raw[0].data(), &doc! { "_id": 1, "constant": "k" });
}

#[tokio::test]
async fn duplicate_requested_hooks_run_twice() {
    let (_, things) = setup().await;

    let state = things
        .find_state(
            FindRequest::new()
                .field("v2")
                .hook("afterFind_trackCount")
                .hook("afterFind_trackCount"),
        )
        .await
        .unwrap();

    assert_eq!(state.meta.get_i32("trackCount").unwrap(), 2);
}

#[tokio::test]
async fn hooks_required_by_virtuals_run_once() {
    let (_, things) = setup().await;

    let state = things
        .find_state(FindRequest::new().field("v2").field("v3"))
        .await
        .unwrap();

    assert_eq!(state.meta.get_i32("trackCount").unwrap(), 1);
    assert_eq!(state.docs[0].data().get_str("v2").unwrap(), "v2_v1_x");
}

#[tokio::test]
async fn requested_hooks_run_in_order_before_required_ones() {
    let (_, things) = setup().await;

    let state = things
        .find_state(FindRequest::new().hook("afterFind_b").hook("afterFind_a"))
        .await
        .unwrap();

    assert_eq!(order(&state), vec!["b", "a", "c"]);
}

#[tokio::test]
async fn required_hooks_run_without_being_requested() {
    let (_, things) = setup().await;

    let state = things.find_state(FindRequest::new().field("foo")).await.unwrap();

    assert_eq!(order(&state), vec!["c"]);
}

#[tokio::test]
async fn hook_args_reach_the_handler() {
    let (_, things) = setup().await;

    let docs = things
        .find(FindRequest::new().hook_with("beforeFind_limitTo", 2))
        .await
        .unwrap();

    assert_eq!(docs.len(), 2);
}

#[tokio::test]
async fn before_filter_hooks_rewrite_the_filter() {
    let (_, things) = setup().await;

    let docs = things
        .find(FindRequest::new().field("foo").hook("beforeFilter_onlyFooX"))
        .await
        .unwrap();

    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].data(), &doc! { "foo": "x" });
}

#[tokio::test]
async fn async_handlers_can_edit_documents() {
    let (_, things) = setup().await;

    let docs = things
        .find(FindRequest::new().filter(Filter::eq("_id", 1)).hook_with("afterFind_stamp", "yes"))
        .await
        .unwrap();

    assert_eq!(docs[0].data().get_str("stamp").unwrap(), "yes");
}

#[tokio::test]
async fn unknown_hook_fails_before_querying() {
    let (store, things) = setup().await;

    let err = things
        .find(FindRequest::new().hook("afterFind_nope"))
        .await
        .unwrap_err();

    assert!(matches!(err, ModelError::Configuration(_)));
    assert_eq!(store.find_count("things").await, 0);
}

#[tokio::test]
async fn failing_hook_aborts_the_chain() {
    let calls = Arc::new(AtomicUsize::new(0));
    let after = Arc::clone(&calls);

    let connection = Connection::new(InMemoryStore::new());
    let model = connection
        .register(
            Schema::builder("gated")
                .hook(HookDef::new(Phase::BeforeFind, "deny", |_state: HookState, _args: Option<Bson>| -> ModelResult<HookState> {
                    Err(ModelError::Hook("access denied".into()))
                }))
                .hook(HookDef::new(Phase::BeforeFind, "count", move |state: HookState, _args: Option<Bson>| -> ModelResult<HookState> {
                    after.fetch_add(1, Ordering::SeqCst);
                    Ok(state)
                }))
                .build()
                .unwrap(),
        )
        .await
        .unwrap();

    let err = model
        .find(FindRequest::new().hook("beforeFind_deny").hook("beforeFind_count"))
        .await
        .unwrap_err();

    assert_eq!(err, ModelError::Hook("access denied".into()));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn empty_selection_materializes_every_enumerable_virtual() {
    let (_, things) = setup().await;

    let state = things
        .find_state(FindRequest::new().filter(Filter::eq("_id", 1)))
        .await
        .unwrap();

    assert_eq!(
        state.docs[0].data(),
        &doc! {
            "_id": 1,
            "foo": "x",
            "bar": "y",
            "v1": "v1_x",
            "v2": "v2_v1_x",
            "v3": "v3_v1_x",
        }
    );
    assert_eq!(state.meta.get_i32("trackCount").unwrap(), 1);
}

#[tokio::test]
async fn circular_virtuals_fail_before_querying() {
    let store = InMemoryStore::new();
    let connection = Connection::new(store.clone());
    let loops = connection
        .register(
            Schema::builder("loops")
                .virtual_field(prefixed("a", "b"))
                .virtual_field(prefixed("b", "a"))
                .build()
                .unwrap(),
        )
        .await
        .unwrap();

    let err = loops.find(FindRequest::new().field("a")).await.unwrap_err();

    assert!(matches!(err, ModelError::Configuration(_)));
    assert_eq!(store.find_count("loops").await, 0);
}

#[tokio::test]
async fn resolves_projection_without_querying() {
    let (store, things) = setup().await;

    let plan = things
        .resolve_projection(&Selection::new().field("v3"))
        .unwrap();

    assert_eq!(plan.virtuals, vec!["v1", "v3"]);
    assert_eq!(plan.storage.included().collect::<Vec<_>>(), vec!["foo"]);
    assert_eq!(store.find_count("things").await, 0);
}

#[tokio::test]
async fn deserializes_trimmed_documents() {
    #[derive(Debug, Deserialize, PartialEq)]
    struct Thing {
        v3: String,
    }

    let (_, things) = setup().await;

    let thing = things
        .find_one(FindRequest::new().filter(Filter::eq("foo", "z")).field("v3"))
        .await
        .unwrap()
        .unwrap()
        .deserialize::<Thing>()
        .unwrap();

    assert_eq!(thing, Thing { v3: "v3_v1_z".into() });
}
