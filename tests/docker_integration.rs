//! Integration tests against a real Docker daemon.
//!
//! These tests pull public images and run containers.
//! Run with: cargo test --test docker_integration -- --ignored

use std::sync::Arc;

use code_sandbox::config::Settings;
use code_sandbox::execution::{ContainerProvider, DockerClient};
use code_sandbox::sandbox::SandboxFactory;
use code_sandbox::server::tool::{execute_request, ExecuteArgs};
use tokio_util::sync::CancellationToken;

async fn create_test_factory() -> (DockerClient, SandboxFactory) {
    let client = DockerClient::connect()
        .await
        .expect("Docker daemon must be reachable for integration tests");
    let provider = ContainerProvider::new(Arc::new(client.clone()));
    (client, SandboxFactory::new().with_provider(Arc::new(provider)))
}

fn request(language: &str, code: &str) -> ExecuteArgs {
    ExecuteArgs {
        language: language.to_string(),
        code: code.to_string(),
        version: None,
    }
}

#[tokio::test]
#[ignore] // Run with: cargo test --test docker_integration -- --ignored
async fn test_python_prints_sum() {
    let (_client, factory) = create_test_factory().await;
    let settings = Settings::default();

    let result = execute_request(
        &settings,
        &factory,
        &request("python", "print(1+1)"),
        &CancellationToken::new(),
    )
    .await
    .expect("python run should succeed");

    assert_eq!(result.stdout, "2\n");
    assert_eq!(result.exit_code, 0);
}

#[tokio::test]
#[ignore]
async fn test_bash_exit_code_is_reported() {
    let (_client, factory) = create_test_factory().await;
    let settings = Settings::default();

    let result = execute_request(
        &settings,
        &factory,
        &request("bash", "echo oops >&2; exit 7"),
        &CancellationToken::new(),
    )
    .await
    .expect("bash run should produce a result");

    assert_eq!(result.exit_code, 7);
    assert_eq!(result.stderr, "oops\n");
}

#[tokio::test]
#[ignore]
async fn test_cpu_timeout_stops_busy_loop() {
    let (_client, factory) = create_test_factory().await;
    let mut settings = Settings::default();
    settings.runtimes.resources.cpu_timeout = Some(std::time::Duration::from_secs(2));

    let result = execute_request(
        &settings,
        &factory,
        &request("python", "while True:\n    pass\n"),
        &CancellationToken::new(),
    )
    .await
    .expect("timeout is reported as a result");

    assert!(result.is_timeout(), "unexpected result: {result:?}");
}

#[tokio::test]
#[ignore]
async fn test_network_is_disabled_by_default() {
    let (_client, factory) = create_test_factory().await;
    let settings = Settings::default();

    let code = "import socket\ntry:\n    socket.create_connection(('1.1.1.1', 53), timeout=2)\n    print('online')\nexcept OSError:\n    print('offline')\n";
    let result = execute_request(
        &settings,
        &factory,
        &request("python", code),
        &CancellationToken::new(),
    )
    .await
    .expect("python run should succeed");

    assert_eq!(result.stdout.trim(), "offline");
}
