//! End-to-end tests over loopback: a server with real services, clients
//! resolving them through a temporary namespace database.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use svcmsg_core::server::permissions::UidAllowList;
use svcmsg_core::server::LifecycleState;
use svcmsg_core::services::echo::STREAM_PULSE;
use svcmsg_core::services::queue::QUEUE_FULL;
use svcmsg_core::services::{EchoService, QueueService};
use svcmsg_core::{
    status, CloseReason, ConnectOptions, Connection, IpcConfig, Namespace, NamespacePath,
    NotifyKind, NotifyOutcome, OpenContext, ReleasePolicy, ReplyOutcome, ReplyToken, Request,
    Server, ServerConfig, ServerFlags, ServerHandle, ServiceConfig, ServiceFlags, ServiceHandler,
    SvcError, TimeoutPolicy,
};
use tempfile::TempDir;

struct TestEnv {
    dir: TempDir,
}

impl TestEnv {
    fn new() -> Self {
        Self {
            dir: TempDir::new().expect("Failed to create temp dir"),
        }
    }

    fn namespace(&self) -> NamespacePath {
        NamespacePath::Absolute(self.dir.path().join("namespace.db"))
    }

    fn server_config(&self) -> ServerConfig {
        ServerConfig::default()
            .namespace(self.namespace())
            .dispatch_threads(4)
    }

    fn options(&self) -> ConnectOptions {
        ConnectOptions::default().namespace(self.namespace())
    }

    async fn open(&self, name: &str) -> Connection {
        Connection::open(name, None, self.options())
            .await
            .expect("open failed")
    }
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..300 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

/// Defers every GET and keeps the token for the test to answer.
#[derive(Clone, Default)]
struct Holder {
    tokens: Arc<Mutex<Vec<ReplyToken>>>,
    closes: Arc<Mutex<Vec<CloseReason>>>,
}

impl Holder {
    fn held(&self) -> usize {
        self.tokens.lock().unwrap().len()
    }

    fn take(&self) -> ReplyToken {
        self.tokens.lock().unwrap().remove(0)
    }

    fn closes(&self) -> Vec<CloseReason> {
        self.closes.lock().unwrap().clone()
    }
}

#[async_trait]
impl ServiceHandler for Holder {
    type Session = ();

    async fn open(&self, _ctx: &OpenContext) -> Result<(), i32> {
        Ok(())
    }

    async fn worker(&self, _session: Arc<()>, request: Request) {
        if request.kind() == svcmsg_core::MsgType::Get {
            self.tokens.lock().unwrap().push(request.defer());
        }
    }

    async fn close(&self, _session: Arc<()>, reason: CloseReason) {
        self.closes.lock().unwrap().push(reason);
    }
}

async fn start_echo(env: &TestEnv) -> ServerHandle {
    let mut server = Server::new(env.server_config());
    server
        .register(ServiceConfig::new("echo"), EchoService)
        .unwrap();
    server.start().await.unwrap()
}

async fn start_queue(env: &TestEnv, queue: QueueService) -> ServerHandle {
    let mut server = Server::new(env.server_config());
    server
        .register(
            ServiceConfig::new("queue")
                .min_len(1)
                .release(ReleasePolicy::Immediate),
            queue,
        )
        .unwrap();
    server.start().await.unwrap()
}

async fn start_holder(env: &TestEnv, holder: Holder, release: ReleasePolicy) -> ServerHandle {
    let mut server = Server::new(env.server_config());
    server
        .register(ServiceConfig::new("holder").release(release), holder)
        .unwrap();
    server.start().await.unwrap()
}

#[tokio::test]
async fn test_echo_ping_pong() {
    let env = TestEnv::new();
    let _server = start_echo(&env).await;

    let conn = env.open("echo").await;
    let reply = conn.putget("ping", 16).await.unwrap();
    assert_eq!(reply.payload.as_ref(), b"pong");
    assert!(!reply.truncated);

    conn.close().await.unwrap();
}

#[tokio::test]
async fn test_echo_put_then_get() {
    let env = TestEnv::new();
    let _server = start_echo(&env).await;

    let conn = env.open("echo").await;
    conn.put_acked("stored").await.unwrap();
    let reply = conn.get(0, 64).await.unwrap();
    assert_eq!(reply.payload.as_ref(), b"stored");
}

#[tokio::test]
async fn test_reply_truncated_to_capacity() {
    let env = TestEnv::new();
    let _server = start_echo(&env).await;

    let conn = env.open("echo").await;
    let reply = conn.putget("hello world", 5).await.unwrap();
    assert_eq!(reply.payload.as_ref(), b"hello");
    assert!(reply.truncated);
}

#[tokio::test]
async fn test_streamed_get_sends_tagged_pulses_then_reply() {
    let env = TestEnv::new();
    let _server = start_echo(&env).await;

    let conn = env.open("echo").await;
    conn.put_acked("tail").await.unwrap();
    let reply = conn.get(3, 64).await.unwrap();
    assert_eq!(reply.payload.as_ref(), b"tail");

    let mut values = Vec::new();
    let mut tags = Vec::new();
    while let Some(pulse) = conn.try_next_pulse() {
        assert_eq!(pulse.code, STREAM_PULSE);
        values.push(pulse.value);
        tags.push(pulse.msg_id);
    }
    assert_eq!(values, vec![1, 2, 3]);
    assert!(tags[0].is_some());
    assert!(tags.iter().all(|t| *t == tags[0]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_replies_never_cross_connections() {
    let env = TestEnv::new();
    let _server = start_echo(&env).await;

    let a = Arc::new(env.open("echo").await);
    let b = Arc::new(env.open("echo").await);

    let mut tasks = Vec::new();
    for i in 0..20 {
        for (tag, conn) in [("a", a.clone()), ("b", b.clone())] {
            tasks.push(tokio::spawn(async move {
                let payload = format!("{}-{}", tag, i);
                let reply = conn.putget(payload.clone(), 64).await.unwrap();
                assert_eq!(reply.payload, Bytes::from(payload));
            }));
        }
    }
    for task in tasks {
        task.await.unwrap();
    }
}

#[tokio::test]
async fn test_open_close_reuses_slot() {
    let env = TestEnv::new();
    let server = start_echo(&env).await;

    let first = env.open("echo").await;
    let first_obj = first.object();
    assert_eq!(
        server.osb(first_obj).map(|s| s.lifecycle),
        Some(LifecycleState::Open)
    );
    first.close().await.unwrap();
    assert!(server.osb(first_obj).is_none());

    let second = env.open("echo").await;
    assert_eq!(second.object().slot, first_obj.slot);
    assert_eq!(second.object().generation, first_obj.generation + 1);
    assert_eq!(server.stats().active_osbs, 1);
}

#[tokio::test]
async fn test_operations_after_close_fail() {
    let env = TestEnv::new();
    let _server = start_echo(&env).await;

    let conn = env.open("echo").await;
    conn.close().await.unwrap();
    conn.close().await.unwrap();

    assert!(conn.is_closed());
    assert!(matches!(conn.put("x"), Err(SvcError::ConnectionClosed)));
    assert!(matches!(
        conn.putget("x", 4).await,
        Err(SvcError::ConnectionClosed)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_queue_gets_unblock_in_push_order() {
    let env = TestEnv::new();
    let queue = QueueService::new(16);
    let _server = start_queue(&env, queue.clone()).await;

    let consumer = Arc::new(env.open("queue").await);
    let producer = env.open("queue").await;

    // One GET at a time so the server sees them in a known order.
    let mut gets = Vec::new();
    for n in 1..=3 {
        let consumer = consumer.clone();
        gets.push(tokio::spawn(async move { consumer.get(0, 64).await }));
        wait_until(|| queue.waiting() == n).await;
    }

    for item in ["a", "b", "c"] {
        producer.put_acked(item).await.unwrap();
    }

    let mut got = Vec::new();
    for get in gets {
        got.push(get.await.unwrap().unwrap().payload);
    }
    assert_eq!(got[0].as_ref(), b"a");
    assert_eq!(got[1].as_ref(), b"b");
    assert_eq!(got[2].as_ref(), b"c");
    assert!(queue.is_empty());
}

/// Answers every GET with more bytes than a frame can carry.
struct Huge;

#[async_trait]
impl ServiceHandler for Huge {
    type Session = ();

    async fn open(&self, _ctx: &OpenContext) -> Result<(), i32> {
        Ok(())
    }

    async fn worker(&self, _session: Arc<()>, request: Request) {
        request.reply(vec![7u8; 17 * 1024 * 1024]);
    }
}

#[tokio::test]
async fn test_oversized_reply_is_cut_to_frame_limit() {
    let env = TestEnv::new();
    let mut server = Server::new(env.server_config());
    server.register(ServiceConfig::new("huge"), Huge).unwrap();
    let _server = server.start().await.unwrap();

    let conn = env.open("huge").await;
    let reply = conn.get(0, usize::MAX).await.unwrap();
    assert!(reply.truncated);
    assert_eq!(reply.payload.len(), IpcConfig::MAX_PAYLOAD_SIZE);
    assert!(reply.payload.iter().all(|b| *b == 7));

    // The connection survives and later calls still get answers.
    let reply = conn.get(0, 16).await.unwrap();
    assert!(reply.truncated);
    assert_eq!(reply.payload.len(), 16);
    conn.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_timed_out_get_discards_late_reply() {
    let env = TestEnv::new();
    let queue = QueueService::new(16);
    let _server = start_queue(&env, queue.clone()).await;

    let options = env
        .options()
        .timeout(TimeoutPolicy::new(Duration::from_millis(50)));
    let consumer = Arc::new(Connection::open("queue", None, options).await.unwrap());
    let producer = env.open("queue").await;

    let started = Instant::now();
    let err = consumer.get(0, 64).await.unwrap_err();
    assert!(matches!(err, SvcError::Timeout(_)));
    assert!(started.elapsed() >= Duration::from_millis(50));
    assert!(started.elapsed() < Duration::from_secs(2));

    // The server still tracks the timed-out GET; this PUT answers it and
    // the client drops the reply.
    producer.put_acked("late").await.unwrap();
    assert!(queue.is_empty());

    consumer.set_timeout(TimeoutPolicy::new(Duration::from_secs(5)));
    let next = {
        let consumer = consumer.clone();
        tokio::spawn(async move { consumer.get(0, 64).await })
    };
    wait_until(|| queue.waiting() == 1).await;
    producer.put_acked("fresh").await.unwrap();

    let reply = next.await.unwrap().unwrap();
    assert_eq!(reply.payload.as_ref(), b"fresh");
}

#[tokio::test]
async fn test_message_ids_increase() {
    let env = TestEnv::new();
    let _server = start_echo(&env).await;

    let conn = env.open("echo").await;
    let first = conn.put("one").unwrap();
    let second = conn.put("two").unwrap();
    let third = conn.put("three").unwrap();
    assert!(first < second && second < third);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_immediate_release_discards_deferred_reply() {
    let env = TestEnv::new();
    let holder = Holder::default();
    let server = start_holder(&env, holder.clone(), ReleasePolicy::Immediate).await;

    let conn = Arc::new(env.open("holder").await);
    let obj = conn.object();
    let waiting = {
        let conn = conn.clone();
        tokio::spawn(async move { conn.get(0, 16).await })
    };
    wait_until(|| holder.held() == 1).await;

    conn.close().await.unwrap();
    assert!(matches!(
        waiting.await.unwrap(),
        Err(SvcError::Interrupted)
    ));
    assert!(server.osb(obj).is_none());
    assert_eq!(holder.closes(), vec![CloseReason::ClientClose]);

    let stale = holder.take();
    assert!(!stale.is_pending());

    // A new OSB takes the slot; the stale reply must not reach it.
    let next = Arc::new(env.open("holder").await);
    assert_eq!(next.object().slot, obj.slot);
    assert_eq!(stale.reply("stale"), ReplyOutcome::Discarded);

    let pending = {
        let next = next.clone();
        tokio::spawn(async move { next.get(0, 16).await })
    };
    wait_until(|| holder.held() == 1).await;
    assert_eq!(holder.take().reply("fresh"), ReplyOutcome::Delivered);
    assert_eq!(pending.await.unwrap().unwrap().payload.as_ref(), b"fresh");
    assert!(server.stats().discarded_replies >= 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_deferred_release_waits_for_outstanding_reply() {
    let env = TestEnv::new();
    let holder = Holder::default();
    let server = start_holder(&env, holder.clone(), ReleasePolicy::Deferred).await;

    let conn = Arc::new(env.open("holder").await);
    let obj = conn.object();
    let waiting = {
        let conn = conn.clone();
        tokio::spawn(async move { conn.get(0, 16).await })
    };
    wait_until(|| holder.held() == 1).await;

    conn.close().await.unwrap();
    let _ = waiting.await.unwrap();

    let snap = server.osb(obj).expect("OSB released too early");
    assert_eq!(snap.lifecycle, LifecycleState::Closing);
    assert!(snap.close_requested);
    assert_eq!(snap.awaiting, 1);
    assert_eq!(server.stats().active_osbs, 1);

    holder.take().reply("done");
    assert!(server.osb(obj).is_none());
    assert_eq!(server.stats().active_osbs, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_deferred_reply_reaches_waiting_client() {
    let env = TestEnv::new();
    let holder = Holder::default();
    let _server = start_holder(&env, holder.clone(), ReleasePolicy::Deferred).await;

    let conn = Arc::new(env.open("holder").await);
    let waiting = {
        let conn = conn.clone();
        tokio::spawn(async move { conn.get(0, 16).await })
    };
    wait_until(|| holder.held() == 1).await;

    // Answer from a plain OS thread.
    let token = holder.take();
    let outcome = std::thread::spawn(move || token.reply("from thread"))
        .join()
        .unwrap();
    assert_eq!(outcome, ReplyOutcome::Delivered);
    assert_eq!(waiting.await.unwrap().unwrap().payload.as_ref(), b"from thread");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_dropped_token_sends_broken_reply() {
    let env = TestEnv::new();
    let holder = Holder::default();
    let _server = start_holder(&env, holder.clone(), ReleasePolicy::Deferred).await;

    let conn = Arc::new(env.open("holder").await);
    let waiting = {
        let conn = conn.clone();
        tokio::spawn(async move { conn.get(0, 16).await })
    };
    wait_until(|| holder.held() == 1).await;
    drop(holder.take());

    match waiting.await.unwrap() {
        Err(SvcError::Protocol { code, .. }) => assert_eq!(code, status::BROKEN_REPLY),
        other => panic!("expected broken reply, got {:?}", other),
    }
}

#[tokio::test]
async fn test_disconnect_runs_close_callback() {
    let env = TestEnv::new();
    let holder = Holder::default();
    let server = start_holder(&env, holder.clone(), ReleasePolicy::Deferred).await;

    let conn = env.open("holder").await;
    assert_eq!(server.stats().active_osbs, 1);
    drop(conn);

    wait_until(|| server.stats().active_osbs == 0).await;
    assert_eq!(holder.closes(), vec![CloseReason::Disconnect]);
}

#[tokio::test]
async fn test_disconnect_without_watcher_task() {
    let env = TestEnv::new();
    let holder = Holder::default();
    let mut server = Server::new(
        env.server_config()
            .flags(ServerFlags::NO_DISCONNECT_WATCHER),
    );
    server
        .register(ServiceConfig::new("holder"), holder.clone())
        .unwrap();
    let server = server.start().await.unwrap();

    let conn = env.open("holder").await;
    drop(conn);

    wait_until(|| server.stats().active_osbs == 0).await;
    assert_eq!(holder.closes(), vec![CloseReason::Disconnect]);
}

#[tokio::test]
async fn test_queue_notify_pulses_when_data_arrives() {
    let env = TestEnv::new();
    let queue = QueueService::new(16);
    let _server = start_queue(&env, queue.clone()).await;

    let consumer = env.open("queue").await;
    let producer = env.open("queue").await;

    assert_eq!(
        consumer.arm_notify(NotifyKind::Input, 42).await.unwrap(),
        NotifyOutcome::Armed
    );
    producer.put_acked("item").await.unwrap();

    let pulse = tokio::time::timeout(Duration::from_secs(2), consumer.next_pulse())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(pulse.code, 42);
    assert_eq!(pulse.value, 1);
    assert_eq!(pulse.msg_id, None);

    assert_eq!(
        consumer.arm_notify(NotifyKind::Input, 42).await.unwrap(),
        NotifyOutcome::Ready
    );
}

#[tokio::test]
async fn test_notify_not_supported_by_echo() {
    let env = TestEnv::new();
    let _server = start_echo(&env).await;

    let conn = env.open("echo").await;
    match conn.arm_notify(NotifyKind::Input, 1).await {
        Err(SvcError::Protocol { code, .. }) => assert_eq!(code, status::NOT_SUPPORTED),
        other => panic!("expected NOT_SUPPORTED, got {:?}", other),
    }
}

#[tokio::test]
async fn test_undersized_put_rejected() {
    let env = TestEnv::new();
    let queue = QueueService::new(16);
    let _server = start_queue(&env, queue.clone()).await;

    let conn = env.open("queue").await;
    match conn.put_acked(Bytes::new()).await {
        Err(SvcError::Protocol { code, .. }) => assert_eq!(code, status::BAD_MESSAGE),
        other => panic!("expected BAD_MESSAGE, got {:?}", other),
    }
    assert!(queue.is_empty());
}

#[tokio::test]
async fn test_application_status_is_not_transport_error() {
    let env = TestEnv::new();
    let queue = QueueService::new(1);
    let _server = start_queue(&env, queue).await;

    let conn = env.open("queue").await;
    conn.put_acked("first").await.unwrap();
    let err = conn.put_acked("second").await.unwrap_err();
    assert!(matches!(err, SvcError::Application { code: QUEUE_FULL, .. }));
    assert!(!err.is_transport());
}

#[tokio::test]
async fn test_open_unknown_service() {
    let env = TestEnv::new();
    let _server = start_echo(&env).await;

    let err = Connection::open("echo", Some("other"), env.options())
        .await
        .unwrap_err();
    assert!(matches!(err, SvcError::ServiceNotFound { .. }));
}

#[tokio::test]
async fn test_external_permission_manager_denies() {
    let env = TestEnv::new();
    let mut server = Server::new(env.server_config()).with_permissions(UidAllowList::new());
    server
        .register(
            ServiceConfig::new("guarded").flags(ServiceFlags::EXTERNAL_PERMISSIONS),
            EchoService,
        )
        .unwrap();
    let server = server.start().await.unwrap();

    let err = Connection::open("guarded", None, env.options())
        .await
        .unwrap_err();
    assert!(matches!(err, SvcError::PermissionDenied { .. }));
    assert_eq!(server.stats().active_osbs, 0);
}

struct Picky;

#[async_trait]
impl ServiceHandler for Picky {
    type Session = ();

    fn authorize(&self, _peer: &svcmsg_core::PeerCredentials, flags: svcmsg_core::OpenFlags) -> bool {
        !flags.contains(svcmsg_core::OpenFlags::EXCLUSIVE)
    }

    async fn open(&self, ctx: &OpenContext) -> Result<(), i32> {
        if ctx.data.as_ref() == b"refuse" {
            Err(7)
        } else {
            Ok(())
        }
    }

    async fn worker(&self, _session: Arc<()>, _request: Request) {}
}

#[tokio::test]
async fn test_open_refusals() {
    let env = TestEnv::new();
    let mut server = Server::new(env.server_config());
    server
        .register(ServiceConfig::new("picky").max_osbs(1), Picky)
        .unwrap();
    let server = server.start().await.unwrap();

    let exclusive = env
        .options()
        .flags(svcmsg_core::OpenFlags::READ | svcmsg_core::OpenFlags::EXCLUSIVE);
    assert!(matches!(
        Connection::open("picky", None, exclusive).await,
        Err(SvcError::PermissionDenied { .. })
    ));

    let refused = env.options().open_data(b"refuse".to_vec());
    assert!(matches!(
        Connection::open("picky", None, refused).await,
        Err(SvcError::Application { code: 7, .. })
    ));
    assert_eq!(server.stats().active_osbs, 0);

    let _first = env.open("picky").await;
    match Connection::open("picky", None, env.options()).await {
        Err(SvcError::Protocol { code, .. }) => assert_eq!(code, status::BUSY),
        other => panic!("expected BUSY, got {:?}", other),
    }
}

#[tokio::test]
async fn test_live_owner_blocks_publication() {
    let env = TestEnv::new();
    let NamespacePath::Absolute(path) = env.namespace() else {
        unreachable!()
    };
    let ns = Namespace::open_at(&path).unwrap();
    let mut entry = Namespace::entry(
        "echo",
        "default",
        "127.0.0.1:9".parse().unwrap(),
        0,
        "",
        0,
    );
    // PID 1 always exists.
    entry.pid = 1;
    ns.publish(&entry).unwrap();

    let mut server = Server::new(env.server_config());
    server
        .register(ServiceConfig::new("echo"), EchoService)
        .unwrap();
    assert!(matches!(
        server.start().await,
        Err(SvcError::DuplicateService { .. })
    ));
}

#[tokio::test]
async fn test_relative_service_name() {
    let env = TestEnv::new();
    let mut server = Server::new(env.server_config().domain("acme"));
    server
        .register(
            ServiceConfig::new("echo").flags(ServiceFlags::RELATIVE_PATH),
            EchoService,
        )
        .unwrap();
    let _server = server.start().await.unwrap();

    let conn = env.open("acme/echo").await;
    assert_eq!(conn.putget("ping", 8).await.unwrap().payload.as_ref(), b"pong");
}

#[tokio::test]
async fn test_shutdown_withdraws_and_interrupts() {
    let env = TestEnv::new();
    let holder = Holder::default();
    let mut server = start_holder(&env, holder.clone(), ReleasePolicy::Deferred).await;

    let conn = Arc::new(env.open("holder").await);
    let waiting = {
        let conn = conn.clone();
        tokio::spawn(async move { conn.get(0, 16).await })
    };
    wait_until(|| holder.held() == 1).await;

    server.shutdown();
    let err = tokio::time::timeout(Duration::from_secs(2), waiting)
        .await
        .unwrap()
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, SvcError::PeerGone { .. }));

    let NamespacePath::Absolute(path) = env.namespace() else {
        unreachable!()
    };
    let ns = Namespace::open_at(&path).unwrap();
    assert!(ns.resolve("holder", "default").unwrap().is_none());
}

#[tokio::test]
async fn test_noop_never_reaches_worker() {
    let env = TestEnv::new();
    let holder = Holder::default();
    let _server = start_holder(&env, holder.clone(), ReleasePolicy::Deferred).await;

    let conn = env.open("holder").await;
    conn.noop().unwrap();
    conn.put_acked("x").await.unwrap();
    assert_eq!(holder.held(), 0);
}
