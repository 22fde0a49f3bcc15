use modelayer::{document::to_payload, memory::InMemoryStore, prelude::*};
use serde::{Deserialize, Serialize};

fn slugify(mut state: HookState, _args: Option<Bson>) -> ModelResult<HookState> {
    for doc in state.docs.iter_mut() {
        let slug = doc
            .get("title")
            .and_then(|title| title.as_str().map(|title| title.to_lowercase().replace(' ', "-")))
            .ok_or_else(|| ModelError::Hook("cannot slugify an untitled article".into()))?;
        doc.set("slug", slug)?;
    }
    Ok(state)
}

fn published_only(mut state: HookState, _args: Option<Bson>) -> ModelResult<HookState> {
    let published = Filter::eq("published", true);
    state.filter = Some(match state.filter.take() {
        Some(filter) => filter.and(published),
        None => published,
    });
    Ok(state)
}

fn stamp_update(mut state: HookState, args: Option<Bson>) -> ModelResult<HookState> {
    if let (Some(update), Some(editor)) = (state.update.as_mut(), args) {
        update.insert("editor", editor);
    }
    Ok(state)
}

fn articles() -> Schema {
    Schema::builder("articles")
        .collection("content_articles")
        .field(FieldDef::new("title", FieldType::String).required())
        .field(FieldDef::new("slug", FieldType::String))
        .field(FieldDef::new("published", FieldType::Bool).default_value(false))
        .field(FieldDef::new("views", FieldType::Int).default_value(0))
        .field(FieldDef::new("secret", FieldType::String).hidden())
        .virtual_field(
            VirtualDef::new("headline")
                .requires(["title"])
                .get(|doc| Some(doc.get("title")?.as_str()?.to_uppercase().into()))
                .set(|doc, value| doc.set("title", value)),
        )
        .hook(HookDef::new(Phase::BeforePut, "slugify", slugify).required())
        .hook(HookDef::new(Phase::BeforeFilter, "publishedOnly", published_only))
        .hook(HookDef::new(Phase::BeforeUpdate, "stamp", stamp_update))
        .build()
        .unwrap()
}

async fn setup() -> (InMemoryStore, Connection, Model) {
    let store = InMemoryStore::new();
    let connection = Connection::new(store.clone());
    let articles = connection.register(articles()).await.unwrap();

    articles
        .insert(
            vec![
                doc! { "_id": 1, "title": "Hello World", "published": true },
                doc! { "_id": 2, "title": "Draft Post" },
                doc! { "_id": 3, "headline": "Via Setter", "published": true, "secret": "s3" },
            ],
            &[],
        )
        .await
        .unwrap();

    (store, connection, articles)
}

async fn stored(store: &InMemoryStore, id: i32) -> bson::Document {
    let query = Query::builder().filter(Filter::eq("_id", id)).build();
    store
        .find_documents(query, "content_articles")
        .await
        .unwrap()
        .into_iter()
        .next()
        .unwrap()
}

#[tokio::test]
async fn insert_runs_required_put_hooks_and_applies_defaults() {
    let (store, _, _) = setup().await;

    let article = stored(&store, 1).await;
    assert_eq!(article.get_str("slug").unwrap(), "hello-world");
    assert_eq!(article.get_i32("views").unwrap(), 0);

    let draft = stored(&store, 2).await;
    assert!(!draft.get_bool("published").unwrap());
}

#[tokio::test]
async fn insert_assigns_virtuals_through_their_setter() {
    let (store, _, articles) = setup().await;

    let article = stored(&store, 3).await;
    assert_eq!(article.get_str("title").unwrap(), "Via Setter");
    assert_eq!(article.get_str("slug").unwrap(), "via-setter");
    assert!(!article.contains_key("headline"));

    let found = articles
        .find_one(FindRequest::new().filter(Filter::eq("_id", 3)).field("headline"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.data(), &doc! { "headline": "VIA SETTER" });
}

#[tokio::test]
async fn insert_generates_a_primary_key() {
    let (_, _, articles) = setup().await;

    let article = articles
        .insert_one(doc! { "title": "Fresh" }, &[])
        .await
        .unwrap();

    assert!(matches!(article.id(), Some(Bson::ObjectId(_))));
    assert_eq!(articles.count(None, &[]).await.unwrap(), 4);
}

#[tokio::test]
async fn duplicate_primary_key_is_rejected() {
    let (_, _, articles) = setup().await;

    let err = articles
        .insert_one(doc! { "_id": 1, "title": "Again" }, &[])
        .await
        .unwrap_err();

    assert!(matches!(err, ModelError::DocumentAlreadyExists(_, _)));
}

#[tokio::test]
async fn invalid_payloads_fail_validation() {
    let (_, _, articles) = setup().await;

    let missing = articles.insert_one(doc! { "views": 1 }, &[]).await.unwrap_err();
    assert!(matches!(missing, ModelError::Validation(_)));

    let mistyped = articles
        .insert_one(doc! { "title": "t", "views": "many" }, &[])
        .await
        .unwrap_err();
    assert!(matches!(mistyped, ModelError::Validation(_)));
}

#[tokio::test]
async fn failing_put_hook_aborts_the_insert() {
    let connection = Connection::new(InMemoryStore::new());
    let notes = connection
        .register(
            Schema::builder("notes")
                .field(FieldDef::new("title", FieldType::String))
                .hook(HookDef::new(Phase::BeforePut, "slugify", slugify).required())
                .build()
                .unwrap(),
        )
        .await
        .unwrap();

    let err = notes.insert_one(doc! { "body": "no title" }, &[]).await.unwrap_err();

    assert!(matches!(err, ModelError::Hook(_)));
    assert_eq!(notes.count(None, &[]).await.unwrap(), 0);
}

#[tokio::test]
async fn count_runs_filter_hooks() {
    let (_, _, articles) = setup().await;

    assert_eq!(articles.count(None, &[]).await.unwrap(), 3);
    assert_eq!(
        articles
            .count(None, &[HookRequest::new("beforeFilter_publishedOnly")])
            .await
            .unwrap(),
        2
    );
    assert_eq!(
        articles
            .count(
                Some(Filter::eq("_id", 2)),
                &[HookRequest::new("beforeFilter_publishedOnly")]
            )
            .await
            .unwrap(),
        0
    );
}

#[tokio::test]
async fn unknown_hook_on_count_is_a_configuration_error() {
    let (_, _, articles) = setup().await;

    let err = articles
        .count(None, &[HookRequest::new("afterCount_nope")])
        .await
        .unwrap_err();

    assert!(matches!(err, ModelError::Configuration(_)));
}

#[tokio::test]
async fn update_merges_fields_and_runs_update_hooks() {
    let (store, _, articles) = setup().await;

    let matched = articles
        .update(
            Some(Filter::eq("published", true)),
            doc! { "views": 10 },
            &[HookRequest::with_args("beforeUpdate_stamp", "ada")],
        )
        .await
        .unwrap();

    assert_eq!(matched, 2);
    let article = stored(&store, 1).await;
    assert_eq!(article.get_i32("views").unwrap(), 10);
    assert_eq!(article.get_str("editor").unwrap(), "ada");
    assert_eq!(stored(&store, 2).await.get_i32("views").unwrap(), 0);
}

#[tokio::test]
async fn update_rejects_computed_keys() {
    let (_, _, articles) = setup().await;

    let err = articles
        .update(None, doc! { "headline": "NOPE" }, &[])
        .await
        .unwrap_err();

    assert!(matches!(err, ModelError::Validation(_)));
}

#[tokio::test]
async fn save_writes_changes_back() {
    let (store, _, articles) = setup().await;

    let mut article = articles
        .find_one(FindRequest::new().filter(Filter::eq("_id", 2)))
        .await
        .unwrap()
        .unwrap();
    article.set("title", "Now Public").unwrap();
    article.set("published", true).unwrap();

    let saved = articles.save(article, &[]).await.unwrap();
    assert_eq!(saved.data().get_str("slug").unwrap(), "now-public");

    let row = stored(&store, 2).await;
    assert_eq!(row.get_str("title").unwrap(), "Now Public");
    assert_eq!(row.get_str("slug").unwrap(), "now-public");
    assert!(!row.contains_key("headline"));
}

#[tokio::test]
async fn saving_a_missing_document_fails() {
    let (_, _, articles) = setup().await;

    let ghost = articles.hydrate(doc! { "_id": 99, "title": "Ghost" });
    let err = articles.save(ghost, &[]).await.unwrap_err();

    assert!(matches!(err, ModelError::DocumentNotFound(_, _)));
}

#[tokio::test]
async fn remove_deletes_matching_documents() {
    let (_, _, articles) = setup().await;

    let removed = articles
        .remove(None, &[HookRequest::new("beforeFilter_publishedOnly")])
        .await
        .unwrap();

    assert_eq!(removed, 2);
    assert_eq!(articles.count(None, &[]).await.unwrap(), 1);
}

#[tokio::test]
async fn runs_hooks_of_one_phase_on_demand() {
    let (_, _, articles) = setup().await;

    let state = articles
        .run_hooks(
            Phase::BeforeFilter,
            &[HookRequest::new("beforeFilter_publishedOnly")],
            HookState::new(),
        )
        .await
        .unwrap();

    assert_eq!(state.filter, Some(Filter::eq("published", true)));
}

#[tokio::test]
async fn hidden_fields_are_left_out_of_the_output() {
    #[derive(Debug, Deserialize)]
    struct Article {
        title: String,
        secret: Option<String>,
    }

    let (_, _, articles) = setup().await;

    let article = articles
        .find_one(FindRequest::new().filter(Filter::eq("_id", 3)))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(article.data().get_str("secret").unwrap(), "s3");
    assert!(!article.to_output().contains_key("secret"));

    let typed = article.deserialize::<Article>().unwrap();
    assert_eq!(typed.title, "Via Setter");
    assert_eq!(typed.secret, None);
    assert_eq!(article.to_json().unwrap()["headline"], "VIA SETTER");
}

#[tokio::test]
async fn inserts_typed_payloads() {
    #[derive(Serialize)]
    struct NewArticle<'a> {
        title: &'a str,
        views: i32,
    }

    let (store, _, articles) = setup().await;

    let mut payload = to_payload(&NewArticle { title: "Typed Entry", views: 7 }).unwrap();
    payload.insert("_id", 4);
    let article = articles.insert_one(payload, &[]).await.unwrap();

    assert_eq!(article.id(), Some(&Bson::Int32(4)));
    assert_eq!(stored(&store, 4).await.get_str("slug").unwrap(), "typed-entry");
}

#[tokio::test]
async fn registry_rejects_duplicates_and_reports_missing_models() {
    let (_, connection, _) = setup().await;

    let duplicate = connection.register(articles()).await.unwrap_err();
    assert!(matches!(duplicate, ModelError::Configuration(_)));

    let missing = connection.lookup_model("comments").await.unwrap_err();
    assert!(matches!(missing, ModelError::Resolution(_)));

    let found = connection.lookup_model("articles").await.unwrap();
    assert_eq!(found.schema().collection(), "content_articles");
    assert_eq!(connection.model_names().await, vec!["articles"]);
}

#[tokio::test]
async fn connects_through_a_seeded_backend_builder() {
    let connection = Connection::builder()
        .populate_concurrency(2)
        .connect(InMemoryStore::builder().seed("articles", vec![doc! { "_id": 1, "title": "Seeded" }]))
        .await
        .unwrap();
    let articles = connection
        .register(Schema::builder("articles").field(FieldDef::new("title", FieldType::String)).build().unwrap())
        .await
        .unwrap();

    assert_eq!(connection.config().populate_concurrency, 2);
    assert_eq!(articles.count(None, &[]).await.unwrap(), 1);
    assert!(connection.backend().downcast_ref::<InMemoryStore>().is_some());
}

#[tokio::test]
async fn close_waits_for_every_handle_to_be_dropped() {
    let connection = Connection::new(InMemoryStore::new());
    let articles = connection.register(articles()).await.unwrap();

    let err = connection.clone().close().await.unwrap_err();
    assert!(matches!(err, ModelError::Initialization(_)));

    drop(articles);
    connection.close().await.unwrap();
}

#[tokio::test]
async fn seeded_builder_is_a_backend_builder() {
    let store = InMemoryStore::builder()
        .seed("content_articles", vec![doc! { "_id": 1, "title": "Seeded" }])
        .build()
        .await
        .unwrap();

    assert_eq!(store.count_documents(None, "content_articles").await.unwrap(), 1);
}
