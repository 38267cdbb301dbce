//! Integration tests for the three-tier flake registry
//!
//! The global tier is served by a mock HTTP server; user and system tiers
//! are plain files in a temporary directory.

mod common;

use std::path::PathBuf;

use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use renix::core::registry::{Registry, RegistrySource};

use common::TestProject;

fn global_body() -> serde_json::Value {
    json!({
        "version": 2,
        "flakes": [
            {
                "from": {"type": "indirect", "id": "nixpkgs"},
                "to": {"type": "github", "owner": "NixOS", "repo": "nixpkgs",
                       "ref": "nixos-unstable"}
            },
            {
                "from": {"type": "indirect", "id": "home-manager"},
                "to": {"type": "github", "owner": "nix-community", "repo": "home-manager"}
            }
        ]
    })
}

async fn serve_global(body: serde_json::Value) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/flake-registry.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(&server)
        .await;
    server
}

fn registry_at(project: &TestProject, global_url: String) -> Registry {
    Registry::with_locations(
        project.path().join("user-registry.json"),
        project.path().join("system-registry.json"),
        global_url,
    )
}

#[tokio::test]
async fn global_registry_resolves_names() {
    let project = TestProject::new();
    let server = serve_global(global_body()).await;
    let registry = registry_at(&project, format!("{}/flake-registry.json", server.uri()));

    let target = registry.resolve("nixpkgs").await.unwrap();
    assert_eq!(target.kind, "github");
    assert_eq!(target.to_flake_ref(), "github:NixOS/nixpkgs/nixos-unstable");

    assert!(registry.resolve("no-such-flake").await.is_none());
}

#[tokio::test]
async fn user_entries_take_precedence() {
    let project = TestProject::new();
    project.create_file(
        "user-registry.json",
        &json!({
            "version": 2,
            "flakes": [{
                "from": {"type": "indirect", "id": "nixpkgs"},
                "to": {"type": "path", "path": "/home/dev/nixpkgs"}
            }]
        })
        .to_string(),
    );
    project.create_file(
        "system-registry.json",
        &json!({
            "version": 2,
            "flakes": [{
                "from": {"type": "indirect", "id": "nixpkgs"},
                "to": {"type": "github", "owner": "corp", "repo": "nixpkgs"}
            }]
        })
        .to_string(),
    );
    let server = serve_global(global_body()).await;
    let registry = registry_at(&project, format!("{}/flake-registry.json", server.uri()));

    let target = registry.resolve("nixpkgs").await.unwrap();
    assert_eq!(target.kind, "path");
    assert_eq!(target.path.as_deref(), Some("/home/dev/nixpkgs"));
}

#[tokio::test]
async fn system_tier_is_consulted_before_global() {
    let project = TestProject::new();
    project.create_file(
        "system-registry.json",
        &json!({
            "version": 2,
            "flakes": [{
                "from": {"type": "indirect", "id": "nixpkgs"},
                "to": {"type": "github", "owner": "corp", "repo": "nixpkgs"}
            }]
        })
        .to_string(),
    );
    let server = serve_global(global_body()).await;
    let registry = registry_at(&project, format!("{}/flake-registry.json", server.uri()));

    let target = registry.resolve("nixpkgs").await.unwrap();
    assert_eq!(target.owner.as_deref(), Some("corp"));
}

#[tokio::test]
async fn unreachable_global_registry_degrades_gracefully() {
    let project = TestProject::new();
    project.create_file(
        "user-registry.json",
        &json!({
            "version": 2,
            "flakes": [{
                "from": {"type": "indirect", "id": "mine"},
                "to": {"type": "github", "owner": "me", "repo": "mine"}
            }]
        })
        .to_string(),
    );
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    let registry = registry_at(&project, format!("{}/flake-registry.json", server.uri()));

    // User entries still resolve; unknown names come back empty, not as an
    // error.
    assert!(registry.resolve("mine").await.is_some());
    assert!(registry.resolve("nixpkgs").await.is_none());

    let entries = registry.list().await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].0, "mine");
}

#[tokio::test]
async fn list_orders_tiers_by_precedence() {
    let project = TestProject::new();
    project.create_file(
        "user-registry.json",
        &json!({
            "version": 2,
            "flakes": [{
                "from": {"type": "indirect", "id": "mine"},
                "to": {"type": "github", "owner": "me", "repo": "mine"}
            }]
        })
        .to_string(),
    );
    let server = serve_global(global_body()).await;
    let registry = registry_at(&project, format!("{}/flake-registry.json", server.uri()));

    let entries = registry.list().await;
    let sources: Vec<RegistrySource> = entries.iter().map(|(_, source, _)| *source).collect();
    assert_eq!(
        sources,
        [
            RegistrySource::User,
            RegistrySource::Global,
            RegistrySource::Global
        ]
    );
    assert_eq!(entries[0].0, "mine");
}

#[tokio::test]
async fn added_entries_resolve_without_the_network() {
    let project = TestProject::new();
    // Port 1 is never listening; resolution must not reach the global tier
    let registry = registry_at(&project, "http://127.0.0.1:1/flake-registry.json".into());

    registry.add("mine", "github:me/mine/main").unwrap();
    let target = registry.resolve("mine").await.unwrap();
    assert_eq!(target.to_flake_ref(), "github:me/mine/main");

    assert!(registry.remove("mine").unwrap());
    assert!(registry.resolve("mine").await.is_none());
}

#[tokio::test]
async fn add_targets_paths_are_stored_absolute() {
    let project = TestProject::new();
    let registry = registry_at(&project, "http://127.0.0.1:1/flake-registry.json".into());

    registry.add("local", "./my-flake").unwrap();
    let target = registry.resolve("local").await.unwrap();
    assert_eq!(target.kind, "path");
    assert!(PathBuf::from(target.path.unwrap()).is_absolute());
}
