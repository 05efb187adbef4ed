//! Smart HTTP endpoints served in-process over a repository on disk.

mod common;

use std::{io::Write, path::Path, sync::Arc};

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
};
use common::{commit_objects, init_bare, next_frame, request, text, unpack_ids, until_flush};
use flate2::{Compression, write::GzEncoder};
use git_gateway::{
    Gateway,
    hash::{HashKind, ObjectId},
    internal::pack::encode::encode_pack,
    protocol::{access::ReadOnly, http::router},
    resolve::Resolver,
    store::{RepositoryStore, fs::FsStore},
};
use http_body_util::BodyExt;
use tower::ServiceExt;

const HASH: HashKind = HashKind::Sha1;

/// `<root>/demo.git` with `main` at one commit.
async fn demo_repo(root: &Path) -> ObjectId {
    let git_dir = root.join("demo.git");
    init_bare(&git_dir);
    let store = FsStore::open(&git_dir).await.unwrap();
    let (commit, objects) = commit_objects(HASH, "hello", &[], 1);
    store.write_objects(objects).await.unwrap();
    store
        .update_ref("refs/heads/main", None, Some(commit))
        .await
        .unwrap();
    commit
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, String, Vec<u8>) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, content_type, body.to_vec())
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post(uri: &str, body: Vec<u8>) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .body(Body::from(body))
        .unwrap()
}

#[tokio::test]
async fn info_refs_advertises_with_service_preamble() {
    let root = tempfile::tempdir().unwrap();
    let commit = demo_repo(root.path()).await;
    let app = router(Gateway::new(Resolver::new(root.path())));

    let (status, content_type, body) =
        send(app, get("/demo/info/refs?service=git-upload-pack")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(content_type, "application/x-git-upload-pack-advertisement");
    assert!(body.starts_with(b"001e# service=git-upload-pack\n0000"));

    let mut rest = &body[34..];
    let refs = until_flush(&mut rest);
    assert!(text(&refs[0]).starts_with(&format!("{commit} HEAD\0")));
    assert!(text(&refs[0]).contains("symref=HEAD:refs/heads/main"));
    assert_eq!(text(&refs[1]), format!("{commit} refs/heads/main"));
}

#[tokio::test]
async fn unknown_service_and_missing_repository() {
    let root = tempfile::tempdir().unwrap();
    demo_repo(root.path()).await;
    let app = router(Gateway::new(Resolver::new(root.path())));

    let (status, _, _) = send(
        app.clone(),
        get("/demo.git/info/refs?service=git-upload-archive"),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _, _) = send(app.clone(), get("/demo.git/info/refs")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _, _) = send(
        app.clone(),
        get("/nothing-here/info/refs?service=git-upload-pack"),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, _) = send(app, get("/demo.git/objects/info/packs")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn upload_pack_serves_a_clone() {
    let root = tempfile::tempdir().unwrap();
    let commit = demo_repo(root.path()).await;
    let app = router(Gateway::new(Resolver::new(root.path())));

    let body = request(&[Some(&format!("want {commit}")), None, Some("done")]);
    let (status, content_type, body) = send(app, post("/demo.git/git-upload-pack", body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(content_type, "application/x-git-upload-pack-result");

    let mut rest = &body[..];
    assert_eq!(text(&next_frame(&mut rest)), "NAK");
    assert_eq!(unpack_ids(HASH, rest).len(), 3);
}

#[tokio::test]
async fn upload_pack_request_without_wants_is_a_client_error() {
    let root = tempfile::tempdir().unwrap();
    demo_repo(root.path()).await;
    let app = router(Gateway::new(Resolver::new(root.path())));

    let body = request(&[Some("deepen 1"), None, Some("done")]);
    let (status, _, body) = send(app, post("/demo.git/git-upload-pack", body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(!body.starts_with(b"0008NAK"));
}

fn push_body(old: ObjectId) -> (ObjectId, Vec<u8>) {
    let (commit, objects) = commit_objects(HASH, "pushed", &[old], 2);
    let mut body = request(&[
        Some(&format!("{old} {commit} refs/heads/main\0report-status")),
        None,
    ]);
    body.extend(encode_pack(HASH, &objects).unwrap());
    (commit, body)
}

#[tokio::test]
async fn gzipped_push_updates_the_ref() {
    let root = tempfile::tempdir().unwrap();
    let old = demo_repo(root.path()).await;
    let app = router(Gateway::new(Resolver::new(root.path())));

    let (new, body) = push_body(old);
    let mut gzip = GzEncoder::new(Vec::new(), Compression::default());
    gzip.write_all(&body).unwrap();
    let request = Request::builder()
        .method("POST")
        .uri("/demo.git/git-receive-pack")
        .header(header::CONTENT_ENCODING, "gzip")
        .body(Body::from(gzip.finish().unwrap()))
        .unwrap();

    let (status, content_type, body) = send(app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(content_type, "application/x-git-receive-pack-result");
    let mut rest = &body[..];
    let lines: Vec<String> = until_flush(&mut rest)
        .iter()
        .filter_map(|pkt| pkt.as_text().map(|t| String::from_utf8_lossy(t).into_owned()))
        .collect();
    assert_eq!(lines, vec!["unpack ok", "ok refs/heads/main"]);

    let store = FsStore::open(root.path().join("demo.git")).await.unwrap();
    assert_eq!(
        store.refs().await.unwrap(),
        vec![("refs/heads/main".to_string(), new)]
    );
}

#[tokio::test]
async fn read_only_gateway_refuses_push() {
    let root = tempfile::tempdir().unwrap();
    let old = demo_repo(root.path()).await;
    let app =
        router(Gateway::new(Resolver::new(root.path())).with_access(Arc::new(ReadOnly)));

    let (status, _, _) = send(
        app.clone(),
        get("/demo.git/info/refs?service=git-receive-pack"),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (_, body) = push_body(old);
    let (status, _, _) = send(app, post("/demo.git/git-receive-pack", body)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let store = FsStore::open(root.path().join("demo.git")).await.unwrap();
    assert_eq!(
        store.refs().await.unwrap(),
        vec![("refs/heads/main".to_string(), old)]
    );
}
