//! Tag invalidation driven by direct dispatch and by mutations.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use quarry::cache::{
    Api, ApiConfig, FetchError, InitiateOptions, MutationEndpoint, QueryEndpoint, QueryError,
    QueryStatus, Tag, TagsSpec, invalidate_tags, select_invalidated_by,
};
use serde_json::{Value, json};

/// `getPost` provides `Post:<id>` plus `PostList`; every fetch bumps `calls`.
fn posts_api(calls: Arc<AtomicUsize>, mutation: MutationEndpoint) -> Api {
    let get_post = QueryEndpoint::new(move |args, _ctx| {
        let calls = Arc::clone(&calls);
        async move {
            let version = calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!({"id": args, "version": version}))
        }
    })
    .provides_tags(TagsSpec::computed(|_outcome, args| {
        vec![Tag::with_id("Post", args), Tag::new("PostList")]
    }));

    Api::builder(ApiConfig::default())
        .query("getPost", get_post)
        .mutation("updatePost", mutation)
        .build()
}

fn echo_mutation(invalidates: TagsSpec) -> MutationEndpoint {
    MutationEndpoint::new(|args, _ctx| async move { Ok(args) }).invalidates_tags(invalidates)
}

fn post_id_tags() -> TagsSpec {
    TagsSpec::computed(|_outcome, args: &Value| vec![Tag::with_id("Post", args)])
}

#[tokio::test]
async fn invalidation_without_subscribers_defers_refetch() {
    let calls = Arc::new(AtomicUsize::new(0));
    let api = posts_api(Arc::clone(&calls), echo_mutation(TagsSpec::None));

    api.prefetch("getPost", &1, None)
        .expect("prefetch")
        .result()
        .await
        .expect("fulfilled");

    api.dispatch(invalidate_tags([Tag::with_id("Post", 1)]));
    let key = api.query_key("getPost", &1).expect("key");
    let state = api.get_state();
    let entry = state.query(&key).expect("entry kept");
    assert!(entry.is_stale);
    assert_eq!(entry.status, QueryStatus::Fulfilled);
    assert!(api.running_query("getPost", &1).expect("key").is_none());
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let handle = api
        .initiate("getPost", &1, InitiateOptions::default())
        .expect("initiate");
    assert_eq!(handle.result().await, Ok(json!({"id": 1, "version": 1})));
    let again = api
        .initiate("getPost", &1, InitiateOptions::default())
        .expect("initiate");
    assert_eq!(again.result().await, Ok(json!({"id": 1, "version": 1})));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(!api.get_state().query(&key).expect("entry").is_stale);
}

#[tokio::test]
async fn subscribed_entries_refetch_on_invalidation() {
    let calls = Arc::new(AtomicUsize::new(0));
    let api = posts_api(Arc::clone(&calls), echo_mutation(TagsSpec::None));

    let one = api
        .initiate("getPost", &1, InitiateOptions::default())
        .expect("initiate");
    let two = api
        .initiate("getPost", &2, InitiateOptions::default())
        .expect("initiate");
    one.result().await.expect("fulfilled");
    two.result().await.expect("fulfilled");

    api.dispatch(invalidate_tags([Tag::new("PostList")]));
    let first = api.running_query("getPost", &1).expect("key").expect("refetching");
    let second = api.running_query("getPost", &2).expect("key").expect("refetching");
    first.result().await.expect("refetched");
    second.result().await.expect("refetched");

    assert_eq!(calls.load(Ordering::SeqCst), 4);
    let state = api.get_state();
    let entry = state.query(one.key()).expect("entry");
    assert!(!entry.is_stale);
    assert_eq!(entry.status, QueryStatus::Fulfilled);
}

#[tokio::test]
async fn invalidation_with_unknown_tag_is_a_noop() {
    let calls = Arc::new(AtomicUsize::new(0));
    let api = posts_api(Arc::clone(&calls), echo_mutation(TagsSpec::None));

    let handle = api
        .initiate("getPost", &1, InitiateOptions::default())
        .expect("initiate");
    handle.result().await.expect("fulfilled");
    let before = api.get_state();

    let after = api.dispatch(invalidate_tags([Tag::new("Comment")]));

    assert_eq!(*before, *after);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn mutation_invalidates_only_matching_ids() {
    let calls = Arc::new(AtomicUsize::new(0));
    let api = posts_api(Arc::clone(&calls), echo_mutation(post_id_tags()));

    let one = api
        .initiate("getPost", &1, InitiateOptions::default())
        .expect("initiate");
    let two = api
        .initiate("getPost", &2, InitiateOptions::default())
        .expect("initiate");
    one.result().await.expect("fulfilled");
    two.result().await.expect("fulfilled");

    let mutation = api.initiate_mutation("updatePost", &1).expect("mutation");
    assert_eq!(mutation.result().await, Ok(json!(1)));

    // The refetch starts before the mutation settles and may already be done.
    if let Some(refetch) = api.running_query("getPost", &1).expect("key") {
        refetch.result().await.expect("refetched");
    }
    assert!(api.running_query("getPost", &2).expect("key").is_none());
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let state = api.get_state();
    let refetched = state.query(one.key()).expect("post 1");
    assert_eq!(refetched.data, Some(json!({"id": 1, "version": 2})));
    assert!(!refetched.is_stale);
    let untouched = state.query(two.key()).expect("post 2");
    assert_eq!(untouched.data, Some(json!({"id": 2, "version": 1})));
    assert!(!untouched.is_stale);

    let entry = api
        .select_mutation(&mutation.request_id())
        .expect("mutation entry");
    assert_eq!(entry.status, QueryStatus::Fulfilled);
    assert_eq!(entry.data, Some(json!(1)));
    mutation.reset();
    assert!(api.select_mutation(&mutation.request_id()).is_none());
}

#[tokio::test]
async fn rejected_mutation_still_invalidates() {
    let calls = Arc::new(AtomicUsize::new(0));
    let failing = MutationEndpoint::new(|_args, _ctx| async {
        Err::<Value, _>(FetchError::new("conflict"))
    })
    .invalidates_tags(TagsSpec::fixed([Tag::new("Post")]));
    let api = posts_api(Arc::clone(&calls), failing);

    api.prefetch("getPost", &1, None)
        .expect("prefetch")
        .result()
        .await
        .expect("fulfilled");

    let mutation = api.initiate_mutation("updatePost", &1).expect("mutation");
    assert!(matches!(mutation.result().await, Err(QueryError::Fetch(_))));

    let key = api.query_key("getPost", &1).expect("key");
    assert!(api.get_state().query(&key).expect("entry").is_stale);
}

#[tokio::test]
async fn aborted_mutation_does_not_invalidate() {
    let calls = Arc::new(AtomicUsize::new(0));
    let stuck = MutationEndpoint::new(|_args, _ctx| {
        std::future::pending::<Result<Value, FetchError>>()
    })
    .invalidates_tags(TagsSpec::fixed([Tag::new("Post")]));
    let api = posts_api(Arc::clone(&calls), stuck);

    api.prefetch("getPost", &1, None)
        .expect("prefetch")
        .result()
        .await
        .expect("fulfilled");

    let mutation = api.initiate_mutation("updatePost", &1).expect("mutation");
    mutation.abort();
    assert_eq!(mutation.result().await, Err(QueryError::Aborted));

    let key = api.query_key("getPost", &1).expect("key");
    assert!(!api.get_state().query(&key).expect("entry").is_stale);
    let entry = api
        .select_mutation(&mutation.request_id())
        .expect("mutation entry");
    assert_eq!(entry.status, QueryStatus::Rejected);
    assert_eq!(entry.error, Some(QueryError::Aborted));
}

#[tokio::test]
async fn selector_reports_entries_hit_by_tags() {
    let calls = Arc::new(AtomicUsize::new(0));
    let api = posts_api(calls, echo_mutation(TagsSpec::None));

    for id in [3, 1, 2] {
        api.prefetch("getPost", &id, None)
            .expect("prefetch")
            .result()
            .await
            .expect("fulfilled");
    }

    let state = api.get_state();
    let hits = select_invalidated_by(&state, &[Tag::with_id("Post", 2)]);
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].original_args, json!(2));

    let all = select_invalidated_by(&state, &[Tag::new("Post")]);
    let args: Vec<Value> = all.iter().map(|hit| hit.original_args.clone()).collect();
    assert_eq!(args, vec![json!(1), json!(2), json!(3)]);
}

#[tokio::test]
async fn optimistic_update_can_be_undone() {
    let calls = Arc::new(AtomicUsize::new(0));
    let api = posts_api(calls, echo_mutation(TagsSpec::None));

    api.upsert_query_data("getPost", &1, json!({"id": 1, "title": "draft"}))
        .expect("upsert");

    let patch = api
        .update_query_data("getPost", &1, |draft| {
            draft["title"] = json!("published");
        })
        .expect("update");
    assert!(!patch.is_empty());

    let selector = api.select("getPost", &1).expect("selector");
    assert_eq!(
        selector(&api.get_state()).data,
        Some(json!({"id": 1, "title": "published"}))
    );

    patch.undo();
    assert_eq!(
        selector(&api.get_state()).data,
        Some(json!({"id": 1, "title": "draft"}))
    );

    let missing = api
        .update_query_data("getPost", &9, |draft| draft["title"] = json!("x"))
        .expect("update");
    assert!(missing.is_empty());
    assert_eq!(selector(&api.get_state()).status, QueryStatus::Fulfilled);
    let absent = api.select("getPost", &9).expect("selector");
    assert_eq!(absent(&api.get_state()).status, QueryStatus::Uninitialized);
}
