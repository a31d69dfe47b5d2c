//! End-to-end tests: a client and an engine sharing one process over a
//! pipe hub, exercising the full job protocol.

use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

use strand_client::{Client, ClientError, JobStatus};
use strand_engine::{Connector, Db, Engine, Env, HandlerFn, PipeHub, Streams};

/// Spawn `engine` serving on a fresh pipe hub; returns the hub and the
/// serving loop's shutdown token.
fn spawn_engine(engine: Engine) -> (Arc<PipeHub>, CancellationToken) {
    let hub = Arc::new(PipeHub::new());
    let shutdown = CancellationToken::new();
    let connector: Arc<dyn Connector> = hub.clone();
    let token = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = Arc::new(engine).serve(connector, token).await {
            panic!("engine stopped serving: {e}");
        }
    });
    (hub, shutdown)
}

#[tokio::test]
async fn exec_echo_reaches_the_stdout_drain() {
    let (hub, shutdown) = spawn_engine(Engine::new("."));
    let client = Client::new(hub);

    let mut job = client.new_job("exec", vec!["echo".into(), "hello".into()]);
    let (sink, mut capture) = tokio::io::duplex(64 * 1024);
    job.streams().write_to(sink, "stdout").unwrap();

    job.start().await.unwrap();
    job.wait().await.unwrap();
    assert_eq!(job.status(), JobStatus::Succeeded);

    // Shutdown returns only after the drain has observed closure, so the
    // capture side must already hold every byte.
    job.streams().shutdown().await.unwrap();

    let mut out = Vec::new();
    capture.read_to_end(&mut out).await.unwrap();
    assert_eq!(out, b"hello\n");

    shutdown.cancel();
}

#[tokio::test]
async fn exec_feeds_stdin_through_the_wire() {
    let (hub, _shutdown) = spawn_engine(Engine::new("."));
    let client = Client::new(hub);

    let mut job = client.new_job("exec", vec!["cat".into()]);
    let (sink, mut capture) = tokio::io::duplex(64 * 1024);
    job.streams().write_to(sink, "stdout").unwrap();
    job.streams()
        .read_from(std::io::Cursor::new(b"round trip".to_vec()), "stdin")
        .unwrap();

    job.start().await.unwrap();
    job.wait().await.unwrap();
    job.streams().shutdown().await.unwrap();

    let mut out = Vec::new();
    capture.read_to_end(&mut out).await.unwrap();
    assert_eq!(out, b"round trip");
}

#[tokio::test]
async fn exec_without_arguments_fails() {
    let (hub, _shutdown) = spawn_engine(Engine::new("."));
    let client = Client::new(hub);

    let mut job = client.new_job("exec", Vec::new());
    job.start().await.unwrap();
    let err = job.wait().await.unwrap_err();
    assert!(err.to_string().contains("not enough arguments"));
    assert_eq!(job.status(), JobStatus::Failed);
}

#[tokio::test]
async fn unimplemented_default_names_the_job() {
    let (hub, _shutdown) = spawn_engine(Engine::new("."));
    let client = Client::new(hub);

    for name in ["clone", "ls", "ps"] {
        let mut job = client.new_job(name, Vec::new());
        job.start().await.unwrap();
        let err = job.wait().await.unwrap_err();
        assert!(
            err.to_string().contains(&format!("not yet implemented: {name}")),
            "unexpected error for {name}: {err}"
        );
    }
}

#[tokio::test]
async fn unknown_job_is_reported() {
    let (hub, _shutdown) = spawn_engine(Engine::new("."));
    let client = Client::new(hub);

    let mut job = client.new_job("frobnicate", Vec::new());
    job.start().await.unwrap();
    let err = job.wait().await.unwrap_err();
    assert!(err.to_string().contains("unknown job: frobnicate"));
}

#[tokio::test]
async fn second_registration_wins() {
    let mut engine = Engine::new(".");
    engine.register_job(
        "exec",
        Arc::new(HandlerFn(
            |_name: String,
             _args: Vec<String>,
             _env: Env,
             streams: Streams,
             _db: Arc<dyn Db>| async move {
                use tokio::io::AsyncWriteExt;
                let mut stdout = streams.open_write("stdout")?;
                stdout.write_all(b"custom handler\n").await?;
                Ok(())
            },
        )),
    );
    let (hub, _shutdown) = spawn_engine(engine);
    let client = Client::new(hub);

    let mut job = client.new_job("exec", vec!["ignored".into()]);
    let (sink, mut capture) = tokio::io::duplex(4096);
    job.streams().write_to(sink, "stdout").unwrap();

    job.start().await.unwrap();
    job.wait().await.unwrap();
    job.streams().shutdown().await.unwrap();

    let mut out = Vec::new();
    capture.read_to_end(&mut out).await.unwrap();
    assert_eq!(out, b"custom handler\n");
}

#[tokio::test]
async fn start_twice_is_an_error() {
    let (hub, _shutdown) = spawn_engine(Engine::new("."));
    let client = Client::new(hub);

    let mut job = client.new_job("exec", vec!["true".into()]);
    job.start().await.unwrap();
    assert!(matches!(
        job.start().await,
        Err(ClientError::AlreadyStarted)
    ));
    job.wait().await.unwrap();
}

#[tokio::test]
async fn wait_after_terminal_returns_the_recorded_result() {
    let (hub, _shutdown) = spawn_engine(Engine::new("."));
    let client = Client::new(hub);

    let mut job = client.new_job("ps", Vec::new());
    job.start().await.unwrap();
    assert!(job.wait().await.is_err());
    assert_eq!(job.status(), JobStatus::Failed);

    // Still Failed; the recorded message comes back.
    let err = job.wait().await.unwrap_err();
    assert!(err.to_string().contains("not yet implemented: ps"));
    assert_eq!(job.status(), JobStatus::Failed);
}

#[tokio::test]
async fn job_env_reaches_the_child_process() {
    let (hub, _shutdown) = spawn_engine(Engine::new("."));
    let client = Client::new(hub);

    let mut job = client.new_job(
        "exec",
        vec!["sh".into(), "-c".into(), "printf '%s' \"$STRAND_TEST_VALUE\"".into()],
    );
    job.set_env("STRAND_TEST_VALUE", "propagated");
    let (sink, mut capture) = tokio::io::duplex(4096);
    job.streams().write_to(sink, "stdout").unwrap();

    job.start().await.unwrap();
    job.wait().await.unwrap();
    job.streams().shutdown().await.unwrap();

    let mut out = Vec::new();
    capture.read_to_end(&mut out).await.unwrap();
    assert_eq!(out, b"propagated");
}
