use std::time::Duration;
use tokio::time::timeout;
use weircomponents::{IpSource, Sink};
use weircore::{FilePort, Process, WeirError};
use weirruntime::{ShellProcess, Workflow};

const WORKFLOW_DEADLINE: Duration = Duration::from_secs(60);

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

fn scratch_path(dir: &tempfile::TempDir, name: &str) -> String {
    dir.path().join(name).to_string_lossy().to_string()
}

async fn run_workflow(wf: &mut Workflow) -> Result<(), WeirError> {
    timeout(WORKFLOW_DEADLINE, wf.run())
        .await
        .expect("workflow deadlocked")
}

/// Drain a collector port wired alongside the sink, returning packet paths
/// in arrival order.
async fn drain(mut collector: FilePort) -> Vec<String> {
    collector.start_merger();
    let mut paths = Vec::new();
    while let Some(ip) = collector.recv().await {
        paths.push(ip.path().to_string());
    }
    paths
}

#[tokio::test]
async fn linear_copy_commits_output_atomically() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let src = scratch_path(&dir, "a.txt");
    tokio::fs::write(&src, "hello").await.unwrap();

    let mut source = IpSource::new("gen", [src.clone()]);
    let mut copy = ShellProcess::new("copy", "cat {i:in} > {o:out}");
    copy.set_path_extend("out", "in", ".copy");
    copy.in_port("in").unwrap().connect(&mut source.out);
    let mut sink = Sink::new("sink");
    sink.in_port.connect(copy.out_port("out").unwrap());

    let mut wf = Workflow::new("linear-copy");
    wf.add_process(Box::new(source));
    wf.add_process(Box::new(copy));
    wf.set_sink(Box::new(sink));
    run_workflow(&mut wf).await.unwrap();

    let out = format!("{src}.copy");
    assert_eq!(tokio::fs::read_to_string(&out).await.unwrap(), "hello");
    assert!(
        tokio::fs::metadata(format!("{out}.tmp")).await.is_err(),
        "temp file must not survive atomize"
    );
}

#[tokio::test]
async fn parameter_sweep_creates_one_task_per_value() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let out = scratch_path(&dir, "out.txt");

    let mut echo = ShellProcess::new("echo", "echo {p:msg} > {o:out}");
    echo.param_port("msg")
        .unwrap()
        .connect_literals(["one", "two", "three"]);
    echo.set_path_static("out", &out);

    let mut collector = FilePort::new();
    collector.connect(echo.out_port("out").unwrap());
    let mut sink = Sink::new("sink");
    sink.in_port.connect(echo.out_port("out").unwrap());

    let mut wf = Workflow::new("sweep");
    wf.add_process(Box::new(echo));
    wf.set_sink(Box::new(sink));
    run_workflow(&mut wf).await.unwrap();

    let received = drain(collector).await;
    assert_eq!(received.len(), 3, "one packet per swept value");
    assert!(received.iter().all(|p| p == &out));

    let content = tokio::fs::read_to_string(&out).await.unwrap();
    assert!(
        ["one\n", "two\n", "three\n"].contains(&content.as_str()),
        "file must hold one swept value, got {content:?}"
    );
}

#[tokio::test]
async fn streaming_consumer_reads_through_a_fifo() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let stream = scratch_path(&dir, "numbers.txt");

    let mut producer = ShellProcess::new("produce", "seq 1 3 > {os:s}");
    producer.set_path_static("s", &stream);
    let mut consumer = ShellProcess::new("count", "wc -l < {i:x} > {o:out}");
    consumer.set_path_extend("out", "x", ".count");
    consumer.in_port("x").unwrap().connect(producer.out_port("s").unwrap());
    let mut sink = Sink::new("sink");
    sink.in_port.connect(consumer.out_port("out").unwrap());

    let mut wf = Workflow::new("streaming");
    wf.add_process(Box::new(producer));
    wf.add_process(Box::new(consumer));
    wf.set_sink(Box::new(sink));
    run_workflow(&mut wf).await.unwrap();

    let counted = tokio::fs::read_to_string(format!("{stream}.count"))
        .await
        .unwrap();
    assert_eq!(counted.trim(), "3");
    assert!(
        tokio::fs::metadata(format!("{stream}.fifo")).await.is_err(),
        "FIFO must be removed after use"
    );
    assert!(
        tokio::fs::metadata(&stream).await.is_err(),
        "streaming output never materializes at the final path"
    );
}

#[tokio::test]
async fn fan_in_merges_two_producers_in_round_robin_order() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let mut paths = Vec::new();
    for name in ["p1-a.txt", "p1-b.txt", "p2-a.txt", "p2-b.txt"] {
        let path = scratch_path(&dir, name);
        tokio::fs::write(&path, name).await.unwrap();
        paths.push(path);
    }

    let mut first = IpSource::new("first", [paths[0].clone(), paths[1].clone()]);
    let mut second = IpSource::new("second", [paths[2].clone(), paths[3].clone()]);
    let mut copy = ShellProcess::new("copy", "cat {i:in} > {o:out}");
    copy.set_path_extend("out", "in", ".copy");
    copy.in_port("in").unwrap().connect(&mut first.out);
    copy.in_port("in").unwrap().connect(&mut second.out);

    let mut collector = FilePort::new();
    collector.connect(copy.out_port("out").unwrap());
    let mut sink = Sink::new("sink");
    sink.in_port.connect(copy.out_port("out").unwrap());

    let mut wf = Workflow::new("fan-in");
    wf.add_process(Box::new(first));
    wf.add_process(Box::new(second));
    wf.add_process(Box::new(copy));
    wf.set_sink(Box::new(sink));
    run_workflow(&mut wf).await.unwrap();

    let received = drain(collector).await;
    let expected: Vec<String> = [0, 2, 1, 3]
        .iter()
        .map(|&i| format!("{}.copy", paths[i]))
        .collect();
    assert_eq!(
        received, expected,
        "round-robin between producers, per-producer order preserved"
    );
    for path in &expected {
        assert!(tokio::fs::metadata(path).await.is_ok(), "missing {path}");
    }
}

#[tokio::test]
async fn rerun_with_existing_output_skips_execution_but_still_emits() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let src = scratch_path(&dir, "a.txt");
    tokio::fs::write(&src, "hello").await.unwrap();
    let out = format!("{src}.copy");
    // Pre-existing output with sentinel content: if the command ran again
    // it would overwrite this with "hello".
    tokio::fs::write(&out, "stale").await.unwrap();

    let mut source = IpSource::new("gen", [src.clone()]);
    let mut copy = ShellProcess::new("copy", "cat {i:in} > {o:out}");
    copy.set_path_extend("out", "in", ".copy");
    copy.in_port("in").unwrap().connect(&mut source.out);

    let mut collector = FilePort::new();
    collector.connect(copy.out_port("out").unwrap());
    let mut sink = Sink::new("sink");
    sink.in_port.connect(copy.out_port("out").unwrap());

    let mut wf = Workflow::new("resume");
    wf.add_process(Box::new(source));
    wf.add_process(Box::new(copy));
    wf.set_sink(Box::new(sink));
    run_workflow(&mut wf).await.unwrap();

    assert_eq!(
        tokio::fs::read_to_string(&out).await.unwrap(),
        "stale",
        "the command must not have run again"
    );
    let received = drain(collector).await;
    assert_eq!(received, vec![out], "the packet is still emitted downstream");
}

#[tokio::test]
async fn process_without_ports_runs_exactly_once() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let out = scratch_path(&dir, "hi.txt");

    let mut hello = ShellProcess::new("hello", "echo hi > {o:out}");
    hello.set_path_static("out", &out);
    let mut collector = FilePort::new();
    collector.connect(hello.out_port("out").unwrap());
    let mut sink = Sink::new("sink");
    sink.in_port.connect(hello.out_port("out").unwrap());

    let mut wf = Workflow::new("single-shot");
    wf.add_process(Box::new(hello));
    wf.set_sink(Box::new(sink));
    run_workflow(&mut wf).await.unwrap();

    assert_eq!(tokio::fs::read_to_string(&out).await.unwrap(), "hi\n");
    assert_eq!(drain(collector).await.len(), 1, "exactly one gather iteration");
}

#[tokio::test]
async fn literal_params_are_expanded_at_construction() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let out = scratch_path(&dir, "greeting.txt");

    let mut params = std::collections::HashMap::new();
    params.insert("greeting".to_string(), "ahoy".to_string());
    let mut echo = ShellProcess::with_literal_params("echo", "echo {p:greeting} > {o:out}", &params);
    assert!(
        echo.param_port("greeting").is_err(),
        "a literal parameter declares no port"
    );
    echo.set_path_static("out", &out);
    let mut sink = Sink::new("sink");
    sink.in_port.connect(echo.out_port("out").unwrap());

    let mut wf = Workflow::new("literal-params");
    wf.add_process(Box::new(echo));
    wf.set_sink(Box::new(sink));
    run_workflow(&mut wf).await.unwrap();

    assert_eq!(tokio::fs::read_to_string(&out).await.unwrap(), "ahoy\n");
}

#[tokio::test]
async fn custom_executor_replaces_the_shell_command() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let src = scratch_path(&dir, "lower.txt");
    tokio::fs::write(&src, "shout").await.unwrap();

    let mut source = IpSource::new("gen", [src.clone()]);
    let mut upper = ShellProcess::new("upper", "uppercase {i:in} {o:out}");
    upper.set_path_extend("out", "in", ".upper");
    upper.set_custom_execute(|task| {
        let input = std::fs::read_to_string(task.in_path("in")?).map_err(|e| {
            weircore::TaskError::Command {
                command: task.command.clone(),
                status: "read failed".to_string(),
                stderr: e.to_string(),
            }
        })?;
        let out = &task.out_ips["out"];
        std::fs::write(out.temp_path(), input.to_uppercase()).map_err(|e| {
            weircore::TaskError::Command {
                command: task.command.clone(),
                status: "write failed".to_string(),
                stderr: e.to_string(),
            }
        })
    });
    upper.in_port("in").unwrap().connect(&mut source.out);
    let mut sink = Sink::new("sink");
    sink.in_port.connect(upper.out_port("out").unwrap());

    let mut wf = Workflow::new("custom-execute");
    wf.add_process(Box::new(source));
    wf.add_process(Box::new(upper));
    wf.set_sink(Box::new(sink));
    run_workflow(&mut wf).await.unwrap();

    assert_eq!(
        tokio::fs::read_to_string(format!("{src}.upper")).await.unwrap(),
        "SHOUT",
        "custom executor output must still be atomized"
    );
}

#[tokio::test]
async fn failing_command_fails_the_workflow() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let out = scratch_path(&dir, "never.txt");

    let mut bad = ShellProcess::new("bad", "false > {o:out}");
    bad.set_path_static("out", &out);
    let mut sink = Sink::new("sink");
    sink.in_port.connect(bad.out_port("out").unwrap());

    let mut wf = Workflow::new("failing");
    wf.add_process(Box::new(bad));
    wf.set_sink(Box::new(sink));
    let err = run_workflow(&mut wf).await.unwrap_err();
    assert!(matches!(err, WeirError::Task(_)), "got {err:?}");
}

#[tokio::test]
async fn workflow_rejects_unconnected_processes() {
    init_logging();
    let copy = ShellProcess::new("copy", "cat {i:in} > {o:out}");
    let mut producer_port = FilePort::new();
    let mut sink = Sink::new("sink");
    sink.in_port.connect(&mut producer_port);

    let mut wf = Workflow::new("unwired");
    wf.add_process(Box::new(copy));
    wf.set_sink(Box::new(sink));
    let err = wf.run().await.unwrap_err();
    assert!(matches!(err, WeirError::Workflow(_)), "got {err:?}");
}

#[tokio::test]
async fn workflow_without_a_sink_fails() {
    let mut wf = Workflow::new("sinkless");
    let err = wf.run().await.unwrap_err();
    assert!(matches!(err, WeirError::Workflow(_)), "got {err:?}");
}

#[tokio::test]
async fn shell_process_emits_outputs_in_task_creation_order() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let mut paths = Vec::new();
    for i in 0..5 {
        let path = scratch_path(&dir, &format!("in-{i}.txt"));
        tokio::fs::write(&path, format!("{i}")).await.unwrap();
        paths.push(path);
    }

    let mut source = IpSource::new("gen", paths.clone());
    // Later inputs sleep less, so tasks finish in reverse order; emission
    // order must still follow creation order.
    let mut copy = ShellProcess::new(
        "staggered",
        "sleep $(basename {i:in} | tr -dc 0-9 | awk '{print (5-$0)*0.1}') && cat {i:in} > {o:out}",
    );
    copy.set_path_extend("out", "in", ".copy");
    copy.in_port("in").unwrap().connect(&mut source.out);

    let mut collector = FilePort::new();
    collector.connect(copy.out_port("out").unwrap());
    let mut sink = Sink::new("sink");
    sink.in_port.connect(copy.out_port("out").unwrap());

    let mut wf = Workflow::new("ordered-emission");
    wf.add_process(Box::new(source));
    wf.add_process(Box::new(copy));
    wf.set_sink(Box::new(sink));
    run_workflow(&mut wf).await.unwrap();

    let received = drain(collector).await;
    let expected: Vec<String> = paths.iter().map(|p| format!("{p}.copy")).collect();
    assert_eq!(received, expected, "creation order, not completion order");
}

#[tokio::test]
async fn shell_process_runs_standalone_against_a_bare_port() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let src = scratch_path(&dir, "solo.txt");
    tokio::fs::write(&src, "solo").await.unwrap();

    let mut source = IpSource::new("gen", [src.clone()]);
    let mut copy = ShellProcess::new("copy", "cat {i:in} > {o:out}");
    copy.set_path_extend("out", "in", ".copy");
    copy.in_port("in").unwrap().connect(&mut source.out);
    let mut collector = FilePort::new();
    collector.connect(copy.out_port("out").unwrap());

    let producer = tokio::spawn(async move { source.run().await });
    let consumer = tokio::spawn(async move { copy.run().await });

    let received = timeout(WORKFLOW_DEADLINE, drain(collector))
        .await
        .expect("drain deadlocked");
    producer.await.unwrap().unwrap();
    consumer.await.unwrap().unwrap();

    assert_eq!(received, vec![format!("{src}.copy")]);
}
