use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use tpar::client::Connection;
use tpar::protocol::codec::{self, FrameCodec};
use tpar::protocol::{ClientReply, ClientRequest, Hello, SinkSpec, WorkerReply, WorkerRequest};
use tpar::pubsub::SubPub;
use tpar::scheduler::job::{ExitCode, Job, JobRequest, JobState, OutputSink};
use tpar::scheduler::matcher::JobMatch;
use tpar::scheduler::queue::JobQueue;
use tpar::server::{self, connection, ServerIface};
use tpar::worker;

const WAIT: Duration = Duration::from_secs(10);

fn shell(name: &str, priority: i64, script: &str) -> JobRequest {
    JobRequest {
        name: name.to_string(),
        priority,
        command: "sh".to_string(),
        args: vec!["-c".to_string(), script.to_string()],
        ..Default::default()
    }
}

fn start_server() -> ServerIface {
    let queue = Arc::new(JobQueue::new());
    let (iface, _handle) = server::spawn(queue);
    iface
}

fn start_server_with_workers(count: usize) -> ServerIface {
    let iface = start_server();
    for _ in 0..count {
        let worker_id = iface.next_worker_id();
        tokio::spawn(worker::run_local(iface.clone(), worker_id));
    }
    iface
}

async fn wait_for_job(iface: &ServerIface, id: u64, pred: impl Fn(&JobState) -> bool) -> Job {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let jobs = iface.status.call(JobMatch::Id(id)).await.unwrap();
        if let Some(job) = jobs.into_iter().find(|j| j.id == id) {
            if pred(&job.state) {
                return job;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting on job {id}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_enqueue_against_workerless_server() {
    let iface = start_server();

    let request = JobRequest {
        name: "a".to_string(),
        command: "echo".to_string(),
        args: vec!["hi".to_string()],
        ..Default::default()
    };
    let id = iface
        .enqueue
        .call((request, OutputSink::Discard))
        .await
        .unwrap();
    assert_eq!(id, 0);

    let jobs = iface.status.call(JobMatch::All).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert!(matches!(jobs[0].state, JobState::Queued { .. }));
}

#[tokio::test]
async fn test_job_runs_and_shared_output_file_gets_both_streams() {
    let iface = start_server_with_workers(1);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.txt").display().to_string();

    let sink = OutputSink::Files {
        stdout: path.clone(),
        stderr: path.clone(),
    };
    let id = iface
        .enqueue
        .call((shell("a", 0, "echo hi"), sink))
        .await
        .unwrap();

    let job = wait_for_job(&iface, id, JobState::is_terminal).await;
    assert!(matches!(
        job.state,
        JobState::Finished { exit: ExitCode::Success, .. }
    ));
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "hi\n");
}

#[tokio::test]
async fn test_single_worker_drains_in_priority_order() {
    let iface = start_server();
    let dir = tempfile::tempdir().unwrap();
    let order = dir.path().join("order.txt").display().to_string();

    // Priorities 5, 0, 3 against ids 0, 1, 2: execution order is b, c, a.
    for (name, priority) in [("a", 5), ("b", 0), ("c", 3)] {
        let script = format!("echo {name} >> {order}");
        iface
            .enqueue
            .call((shell(name, priority, &script), OutputSink::Discard))
            .await
            .unwrap();
    }

    // Only now let a worker at the queue.
    let worker_id = iface.next_worker_id();
    tokio::spawn(worker::run_local(iface.clone(), worker_id));

    for id in 0..3 {
        wait_for_job(&iface, id, JobState::is_terminal).await;
    }
    assert_eq!(std::fs::read_to_string(&order).unwrap(), "b\nc\na\n");
}

#[tokio::test]
async fn test_kill_running_job() {
    let iface = start_server_with_workers(1);

    let id = iface
        .enqueue
        .call((shell("sleeper", 0, "sleep 60"), OutputSink::Discard))
        .await
        .unwrap();
    wait_for_job(&iface, id, |state| {
        matches!(state, JobState::Running { .. })
    })
    .await;

    let killed = iface.kill.call(JobMatch::Id(id)).await.unwrap();
    assert_eq!(killed.len(), 1);
    assert_eq!(killed[0].id, id);
    assert!(matches!(killed[0].state, JobState::Killed { .. }));

    // The late signal exit from the killed child must not resurrect it.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let job = wait_for_job(&iface, id, JobState::is_terminal).await;
    assert!(matches!(job.state, JobState::Killed { .. }));
}

#[tokio::test]
async fn test_kill_queued_job_never_runs() {
    let iface = start_server();

    let id = iface
        .enqueue
        .call((shell("queued", 0, "echo never"), OutputSink::Discard))
        .await
        .unwrap();
    let killed = iface.kill.call(JobMatch::Id(id)).await.unwrap();
    assert_eq!(killed.len(), 1);

    // A worker attached afterwards finds only later work.
    let worker_id = iface.next_worker_id();
    tokio::spawn(worker::run_local(iface.clone(), worker_id));
    let second = iface
        .enqueue
        .call((shell("later", 0, "echo later"), OutputSink::Discard))
        .await
        .unwrap();
    let job = wait_for_job(&iface, second, JobState::is_terminal).await;
    assert!(matches!(job.state, JobState::Finished { .. }));

    let first = wait_for_job(&iface, id, JobState::is_terminal).await;
    assert!(matches!(first.state, JobState::Killed { .. }));
}

#[tokio::test]
async fn test_kill_with_no_match_returns_nothing() {
    let iface = start_server();
    let killed = iface.kill.call(JobMatch::Id(99)).await.unwrap();
    assert!(killed.is_empty());
}

#[tokio::test]
async fn test_rerun_copies_request_under_fresh_id() {
    let iface = start_server_with_workers(1);

    let id = iface
        .enqueue
        .call((shell("flaky", 4, "exit 2"), OutputSink::Discard))
        .await
        .unwrap();
    let original = wait_for_job(&iface, id, JobState::is_terminal).await;
    assert!(matches!(
        original.state,
        JobState::Finished { exit: ExitCode::Failure(2), .. }
    ));

    let created = iface.rerun.call(JobMatch::Id(id)).await.unwrap();
    assert_eq!(created.len(), 1);
    let new_id = created[0].id;
    assert_ne!(new_id, id);
    assert_eq!(created[0].request, original.request);

    let rerun = wait_for_job(&iface, new_id, JobState::is_terminal).await;
    assert!(matches!(
        rerun.state,
        JobState::Finished { exit: ExitCode::Failure(2), .. }
    ));

    // Both generations stay visible.
    let all = iface.status.call(JobMatch::All).await.unwrap();
    assert_eq!(all.len(), 2);
    assert!(matches!(
        iface.status.call(JobMatch::Id(id)).await.unwrap()[0].state,
        JobState::Finished { exit: ExitCode::Failure(2), .. }
    ));
}

#[tokio::test]
async fn test_rerun_ignores_non_terminal_jobs() {
    let iface = start_server();
    iface
        .enqueue
        .call((shell("pending", 0, "echo hi"), OutputSink::Discard))
        .await
        .unwrap();

    let created = iface.rerun.call(JobMatch::All).await.unwrap();
    assert!(created.is_empty());
}

#[tokio::test]
async fn test_rerun_of_streamed_job_discards_output() {
    let iface = start_server_with_workers(1);

    let stream: SubPub<_, _> = SubPub::new();
    let mut subscription = stream.subscribe().await.unwrap();
    let id = iface
        .enqueue
        .call((shell("streamed", 0, "echo hi"), OutputSink::Stream(stream)))
        .await
        .unwrap();
    wait_for_job(&iface, id, JobState::is_terminal).await;
    // Drain the watcher so the stream side is exercised too.
    while subscription.next().await.is_some() {}

    let created = iface.rerun.call(JobMatch::Id(id)).await.unwrap();
    assert_eq!(created.len(), 1);
    assert!(matches!(created[0].sink, OutputSink::Discard));
}

async fn start_tcp_server(local_workers: usize) -> (ServerIface, u16, CancellationToken) {
    let iface = start_server_with_workers(local_workers);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let shutdown = CancellationToken::new();
    tokio::spawn(connection::serve(listener, iface.clone(), shutdown.clone()));
    (iface, port, shutdown)
}

#[tokio::test]
async fn test_client_round_trip_over_tcp() {
    let (_iface, port, _shutdown) = start_tcp_server(1).await;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.txt").display().to_string();

    let mut conn = Connection::connect("127.0.0.1", port).await.unwrap();
    let id = conn
        .enqueue(
            shell("tcp-job", 0, "echo over tcp"),
            SinkSpec::Files {
                stdout: path.clone(),
                stderr: path.clone(),
            },
        )
        .await
        .unwrap();
    assert_eq!(id, 0);

    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let jobs = conn.status(JobMatch::Id(id)).await.unwrap();
        if jobs.len() == 1 && jobs[0].state.is_terminal() {
            assert!(matches!(
                jobs[0].state,
                JobState::Finished { exit: ExitCode::Success, .. }
            ));
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "job never finished");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "over tcp\n");
}

#[tokio::test]
async fn test_watch_streams_output_and_exit() {
    let (_iface, port, _shutdown) = start_tcp_server(1).await;

    let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let mut framed = Framed::new(stream, FrameCodec::new());
    codec::send(&mut framed, &Hello::Client).await.unwrap();
    let welcome: ClientReply = codec::recv(&mut framed).await.unwrap().unwrap();
    assert_eq!(welcome, ClientReply::Welcome);

    codec::send(
        &mut framed,
        &ClientRequest::Enqueue {
            request: shell("watched", 0, "echo hi; exit 3"),
            sink: SinkSpec::Stream,
        },
    )
    .await
    .unwrap();
    let reply: ClientReply = codec::recv(&mut framed).await.unwrap().unwrap();
    assert!(matches!(reply, ClientReply::Enqueued { .. }));

    let mut output = Vec::new();
    let exit = loop {
        match codec::recv::<_, ClientReply>(&mut framed).await.unwrap() {
            Some(ClientReply::Output(chunk)) => output.extend_from_slice(chunk.data()),
            Some(ClientReply::Done { exit }) => break exit,
            other => panic!("unexpected reply: {other:?}"),
        }
    };
    assert_eq!(output, b"hi\n");
    assert_eq!(exit, ExitCode::Failure(3));
}

#[tokio::test]
async fn test_remote_worker_executes_jobs() {
    let (iface, port, _shutdown) = start_tcp_server(0).await;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("remote.txt").display().to_string();

    let config = tpar::config::WorkerConfig {
        host: "127.0.0.1".to_string(),
        port,
        reconnect: None,
    };
    tokio::spawn(worker::run_remote(config));

    let id = iface
        .enqueue
        .call((
            shell("remote", 0, "echo from remote"),
            OutputSink::Files {
                stdout: path.clone(),
                stderr: path.clone(),
            },
        ))
        .await
        .unwrap();

    let job = wait_for_job(&iface, id, JobState::is_terminal).await;
    assert!(matches!(
        job.state,
        JobState::Finished { exit: ExitCode::Success, .. }
    ));
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "from remote\n");
}

#[tokio::test]
async fn test_worker_death_fails_the_running_job() {
    let (iface, port, _shutdown) = start_tcp_server(0).await;

    // A hand-rolled worker that accepts a job and then vanishes.
    let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let mut framed = Framed::new(stream, FrameCodec::new());
    codec::send(&mut framed, &Hello::Worker).await.unwrap();
    let welcome: WorkerReply = codec::recv(&mut framed).await.unwrap().unwrap();
    assert!(matches!(welcome, WorkerReply::Welcome { .. }));
    codec::send(&mut framed, &WorkerRequest::RequestJob)
        .await
        .unwrap();

    let id = iface
        .enqueue
        .call((shell("doomed", 0, "echo hi"), OutputSink::Discard))
        .await
        .unwrap();
    let assigned: WorkerReply = codec::recv(&mut framed).await.unwrap().unwrap();
    assert!(matches!(assigned, WorkerReply::Assigned { .. }));

    drop(framed);

    let job = wait_for_job(&iface, id, JobState::is_terminal).await;
    match job.state {
        JobState::Failed { reason, .. } => assert!(reason.contains("worker died")),
        state => panic!("expected failed, got {state:?}"),
    }
}

#[tokio::test]
async fn test_kill_reaches_a_remote_worker() {
    let (iface, port, _shutdown) = start_tcp_server(0).await;

    let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let mut framed = Framed::new(stream, FrameCodec::new());
    codec::send(&mut framed, &Hello::Worker).await.unwrap();
    let _welcome: WorkerReply = codec::recv(&mut framed).await.unwrap().unwrap();
    codec::send(&mut framed, &WorkerRequest::RequestJob)
        .await
        .unwrap();

    let id = iface
        .enqueue
        .call((shell("victim", 0, "sleep 60"), OutputSink::Discard))
        .await
        .unwrap();
    let assigned: WorkerReply = codec::recv(&mut framed).await.unwrap().unwrap();
    assert!(matches!(assigned, WorkerReply::Assigned { .. }));

    let killed = iface.kill.call(JobMatch::Id(id)).await.unwrap();
    assert_eq!(killed.len(), 1);

    // The terminate signal is forwarded to the worker running the child.
    let kill: WorkerReply = codec::recv(&mut framed).await.unwrap().unwrap();
    assert_eq!(kill, WorkerReply::Kill { id });

    // The worker's late exit report does not disturb the killed state.
    codec::send(
        &mut framed,
        &WorkerRequest::Exited {
            id,
            outcome: Ok(ExitCode::Failure(137)),
        },
    )
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let job = wait_for_job(&iface, id, JobState::is_terminal).await;
    assert!(matches!(job.state, JobState::Killed { .. }));
}
