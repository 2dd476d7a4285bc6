// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Integration tests for automatic updates.

mod common;

use std::sync::Arc;

use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use cloudron_box::app::InstallationState;
use cloudron_box::apps::InstallRequest;
use cloudron_box::config::Config;
use cloudron_box::updatechecker::UpdateChecker;
use cloudron_box::updater::Updater;

use common::{TestContext, manifest};

fn manifest_json(id: &str, version: &str, tcp_ports: serde_json::Value) -> serde_json::Value {
    json!({
        "id": id,
        "title": "Blog",
        "version": version,
        "manifestVersion": 1,
        "dockerImage": format!("example/blog:{}", version),
        "healthCheckPath": "/healthz",
        "httpPort": 8000,
        "tcpPorts": tcp_ports,
        "addons": { "localstorage": {}, "sendmail": {}, "oauth": {} }
    })
}

async fn serve_update(server: &MockServer, store_id: &str, update: serde_json::Value) {
    Mock::given(method("GET"))
        .and(path(format!(
            "/api/v1/apps/{}/versions/1.0.0/update",
            store_id
        )))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "update": update })))
        .mount(server)
        .await;
}

fn checker(ctx: &TestContext, server: &MockServer) -> UpdateChecker {
    let mut config: Config = (*ctx.config).clone();
    config.api_server_origin = server.uri();
    config.box_versions_url = format!("{}/release.json", server.uri());
    UpdateChecker::new(
        Arc::new(config),
        ctx.registry.clone(),
        ctx.settings.clone(),
        ctx.mailer.clone(),
    )
    .unwrap()
}

#[tokio::test]
async fn test_autoupdate_applies_updates_without_new_ports() {
    let ctx = TestContext::new().await;
    let server = MockServer::start().await;

    ctx.install_and_wait("blog", "blog").await;

    let mut game = manifest("1.0.0");
    game.id = "io.example.game".to_string();
    ctx.apps
        .install(InstallRequest {
            app_id: Some("game".to_string()),
            app_store_id: Some("io.example.game".to_string()),
            manifest: game,
            location: "game".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    ctx.settle("game").await;

    serve_update(
        &server,
        "io.example.blog",
        json!({ "manifest": manifest_json("io.example.blog", "1.1.0", json!({})) }),
    )
    .await;
    serve_update(
        &server,
        "io.example.game",
        json!({ "manifest": manifest_json(
            "io.example.game",
            "1.1.0",
            json!({ "GAME_PORT": { "title": "Game", "containerPort": 7777 } })
        ) }),
    )
    .await;

    let checker = checker(&ctx, &server);
    let updates = checker.check_app_updates().await.unwrap();
    assert_eq!(updates.len(), 2);

    let updater = Updater::new(ctx.apps.clone(), checker.clone());
    assert_eq!(updater.autoupdate().await.unwrap(), 1);

    let blog = ctx.settle("blog").await;
    assert_eq!(blog.installation_state, InstallationState::Installed);
    assert_eq!(blog.manifest.version, "1.1.0");

    let game = ctx.settle("game").await;
    assert_eq!(game.manifest.version, "1.0.0");

    // applied updates leave the cache, skipped ones stay
    let info = checker.update_info().await;
    assert!(!info.apps.contains_key("blog"));
    assert!(info.apps.contains_key("game"));

    assert_eq!(updater.autoupdate().await.unwrap(), 0);
}

#[tokio::test]
async fn test_autoupdate_skips_busy_apps() {
    let ctx = TestContext::new().await;
    let server = MockServer::start().await;

    ctx.install_and_wait("blog", "blog").await;
    serve_update(
        &server,
        "io.example.blog",
        json!({ "manifest": manifest_json("io.example.blog", "2.0.0", json!({})) }),
    )
    .await;

    let checker = checker(&ctx, &server);
    checker.check_app_updates().await.unwrap();

    ctx.fail_on("pull_image").await;
    ctx.apps.update("blog", manifest("1.0.1")).await.unwrap();
    let app = ctx.settle("blog").await;
    assert_eq!(app.installation_state, InstallationState::Error);

    let updater = Updater::new(ctx.apps.clone(), checker.clone());
    assert_eq!(updater.autoupdate().await.unwrap(), 0);
    assert!(checker.update_info().await.apps.contains_key("blog"));
}
