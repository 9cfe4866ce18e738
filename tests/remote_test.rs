use std::{collections::HashMap, sync::Arc};

use bytes::Bytes;

use grid_dispatch::{
    channel::ConnectionStatus,
    communication::{LoopbackConnection, RecordingManagementClient},
    job::{
        ClientSla, JobSla, JobStatus, JobSubmission, SubmissionStatus, Task, TaskBody,
        TaskContext, TaskError, TaskOutcome, TaskState,
    },
    ChannelId, ConnectionOptions, DispatchManager, Uuid,
};

mod utils;

/// A body that can only run in the client process.
struct ClientOnly;

impl TaskBody for ClientOnly {
    fn run(&self, _ctx: &TaskContext) -> Result<Bytes, TaskError> {
        Ok(Bytes::from_static(b"local"))
    }

    fn is_serializable(&self) -> bool {
        false
    }
}

fn connect(
    manager: &DispatchManager,
    name: &str,
    options: ConnectionOptions,
) -> (Arc<LoopbackConnection>, ChannelId) {
    connect_to_driver(manager, name, Uuid::new_v4(), options)
}

fn connect_to_driver(
    manager: &DispatchManager,
    name: &str,
    driver: Uuid,
    options: ConnectionOptions,
) -> (Arc<LoopbackConnection>, ChannelId) {
    let connection = Arc::new(LoopbackConnection::new(name, driver));
    let id = manager.add_connection(connection.clone(), options);
    assert!(
        utils::wait_until(|| manager.is_channel_working(id), utils::TIMEOUT),
        "The channel should connect."
    );
    (connection, id)
}

/// Number of times each position of job `job_uuid` reached the server.
fn send_counts(connection: &LoopbackConnection, job_uuid: Uuid) -> Vec<usize> {
    let mut counts: HashMap<usize, usize> = HashMap::new();
    for header in connection.sent_bundles() {
        if header.job_uuid != job_uuid {
            continue;
        }
        for position in header.positions {
            *counts.entry(position).or_insert(0) += 1;
        }
    }
    let mut positions: Vec<usize> = counts.keys().copied().collect();
    positions.sort_unstable();
    positions.iter().map(|position| counts[position]).collect()
}

fn echo_submission(name: &str, num_tasks: usize) -> JobSubmission {
    let mut submission = JobSubmission::new(name);
    for _ in 0..num_tasks {
        submission.add_task(utils::echo_task());
    }
    submission
}

/// Test that a synchronous channel executes a job in bundles of the configured size.
#[test]
fn test_sync_round_trips() {
    let config = utils::make_default_config().with_bundle_size(2);
    let manager = DispatchManager::new(config).unwrap();
    let (connection, _) = connect(&manager, "sync", ConnectionOptions::new());

    let handle = manager.submit_job(echo_submission("sync-job", 4)).unwrap();
    let results = handle.await_results(Some(utils::TIMEOUT)).unwrap();
    assert_eq!(results.len(), 4);
    assert_eq!(results[3].data(), Some(&Bytes::from("3")));
    assert_eq!(handle.status(), SubmissionStatus::Complete);

    let sent: Vec<Vec<usize>> = connection
        .sent_bundles()
        .into_iter()
        .map(|header| header.positions)
        .collect();
    assert_eq!(sent, vec![vec![0, 1], vec![2, 3]]);
}

/// Test that a broken send is resubmitted and the job still ends once with every
/// result.
#[test]
fn test_sync_send_failure_is_resubmitted() {
    let config = utils::make_default_config().with_bundle_size(3);
    let manager = DispatchManager::new(config).unwrap();
    let (connection, id) = connect(&manager, "flaky", ConnectionOptions::new());
    connection.fail_next_sends(1);

    let listener = utils::CountingListener::new();
    let submission = echo_submission("flaky-job", 3).with_listener(listener.clone());
    let handle = manager.submit_job(submission).unwrap();
    let results = handle.await_results(Some(utils::TIMEOUT)).unwrap();

    assert_eq!(results.len(), 3);
    assert!(results
        .iter()
        .all(|result| result.state() == TaskState::Result));
    assert_eq!(handle.status(), SubmissionStatus::Complete);
    assert_eq!(listener.ended(), 1);
    assert_eq!(
        connection.sent_bundles().len(),
        1,
        "Only the second send reaches the server."
    );
    assert!(utils::wait_until(
        || manager.is_channel_working(id),
        utils::TIMEOUT
    ));
}

/// Test that a channel which cannot connect ends up failed.
#[test]
fn test_connection_failure() {
    let manager = DispatchManager::new(utils::make_default_config()).unwrap();
    let connection = Arc::new(LoopbackConnection::new("unreachable", Uuid::new_v4()));
    connection.fail_next_connects(100);
    let id = manager.add_connection(connection, ConnectionOptions::new());
    assert!(utils::wait_until(
        || manager.channel_status(id) == Some(ConnectionStatus::Failed),
        utils::TIMEOUT
    ));
    assert_eq!(manager.highest_priority(), None);
}

/// Test that a client-side graph traversal only dispatches tasks whose predecessors
/// are done.
#[test]
fn test_graph_traversal_in_client() {
    let manager = DispatchManager::new(utils::make_default_config()).unwrap();
    let (connection, _) = connect(&manager, "graph", ConnectionOptions::new().asynchronous(3));

    let mut submission = echo_submission("chain", 3)
        .with_client_sla(ClientSla::default().with_graph_traversal_in_client(true));
    submission.add_dependency(0, 1);
    submission.add_dependency(1, 2);
    let handle = manager.submit_job(submission).unwrap();
    let results = handle.await_results(Some(utils::TIMEOUT)).unwrap();
    assert_eq!(results.len(), 3);

    let sent = connection.sent_bundles();
    let positions: Vec<Vec<usize>> = sent.iter().map(|header| header.positions.clone()).collect();
    assert_eq!(positions, vec![vec![0], vec![1], vec![2]]);
    assert!(sent.iter().all(|header| header.dependencies.is_empty()));
}

/// Test that a server-side graph traversal ships every task with its dependencies.
#[test]
fn test_graph_traversal_in_server() {
    let manager = DispatchManager::new(utils::make_default_config()).unwrap();
    let (connection, _) = connect(&manager, "graph-server", ConnectionOptions::new());

    let mut submission = echo_submission("reverse-chain", 3);
    submission.add_dependency(2, 1);
    submission.add_dependency(1, 0);
    let handle = manager.submit_job(submission).unwrap();
    let results = handle.await_results(Some(utils::TIMEOUT)).unwrap();
    assert_eq!(results.len(), 3);
    assert_eq!(handle.status(), SubmissionStatus::Complete);

    let sent = connection.sent_bundles();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].positions, vec![0, 1, 2]);
    let mut dependencies = sent[0].dependencies.clone();
    dependencies.sort();
    assert_eq!(dependencies, vec![(1, 0), (2, 1)]);
}

/// Test that a transport failure resubmits every bundle waiting for results exactly
/// once.
#[test]
fn test_async_transport_failure() {
    let manager = DispatchManager::new(utils::make_default_config()).unwrap();
    let (connection, _) = connect(&manager, "async", ConnectionOptions::new().asynchronous(3));
    connection.hold_results();

    let handle = manager.submit_job(echo_submission("pipelined", 3)).unwrap();
    assert!(
        utils::wait_until(|| connection.held_count() == 3, utils::TIMEOUT),
        "Every unit should be sent."
    );
    connection.break_connection();
    connection.release_held();

    let results = handle.await_results(Some(utils::TIMEOUT)).unwrap();
    assert_eq!(results.len(), 3);
    assert_eq!(handle.status(), SubmissionStatus::Complete);

    let mut sends: HashMap<usize, usize> = HashMap::new();
    for header in connection.sent_bundles() {
        for position in header.positions {
            *sends.entry(position).or_insert(0) += 1;
        }
    }
    for position in 0..3 {
        assert_eq!(
            sends.get(&position),
            Some(&2),
            "Task {} should be sent twice.",
            position
        );
    }
}

/// Test that a transport failure resubmits the pending bundles, the bundle whose send
/// is still in progress and the queued unit, and that the channel keeps working once
/// the late send failure of the old connection comes in.
#[test]
fn test_async_failure_with_queued_and_stalled_sends() {
    let manager = DispatchManager::new(utils::make_default_config()).unwrap();
    let options = ConnectionOptions::new().asynchronous(4);
    let (connection, id) = connect(&manager, "stalling", options);
    connection.hold_results();

    let first = manager.submit_job(echo_submission("pending", 2)).unwrap();
    assert!(
        utils::wait_until(|| connection.held_count() == 2, utils::TIMEOUT),
        "Both units of the first job should be waiting for results."
    );
    connection.stall_next_sends(1);
    let second = manager.submit_job(echo_submission("stalled", 2)).unwrap();
    assert!(
        utils::wait_until(
            || connection.stalled_count() == 1 && second.job().in_flight_units().len() == 2,
            utils::TIMEOUT
        ),
        "One unit should hang in its send while the other is queued."
    );

    connection.break_connection();
    assert!(
        utils::wait_until(|| connection.held_count() == 4, utils::TIMEOUT),
        "Every unit should be sent again on the new connection."
    );
    assert_eq!(connection.stalled_count(), 0);
    for handle in [&first, &second] {
        assert!(
            !handle.is_done(),
            "A job is not done before its retry returns."
        );
        assert_ne!(handle.job_status(), JobStatus::Done);
    }
    assert!(manager.is_channel_working(id));

    connection.release_held();
    for handle in [&first, &second] {
        let results = handle.await_results(Some(utils::TIMEOUT)).unwrap();
        assert_eq!(results.len(), 2);
        assert!(results
            .iter()
            .all(|result| result.state() == TaskState::Result));
        assert_eq!(handle.status(), SubmissionStatus::Complete);
    }
    assert_eq!(send_counts(&connection, first.uuid()), vec![2, 2]);
    assert_eq!(
        send_counts(&connection, second.uuid()),
        vec![1, 1],
        "The stalled send never reached the server."
    );

    assert!(utils::wait_until(
        || manager.channel_status(id) == Some(ConnectionStatus::Active),
        utils::TIMEOUT
    ));
    let third = manager.submit_job(echo_submission("after-failure", 2)).unwrap();
    assert_eq!(third.await_results(Some(utils::TIMEOUT)).unwrap().len(), 2);
}

/// Test that a broadcast job runs on every driver and ends after all of them.
#[test]
fn test_broadcast_job() {
    let manager = DispatchManager::new(utils::make_default_config()).unwrap();
    let (first, _) = connect(&manager, "driver-1", ConnectionOptions::new());
    let (second, _) = connect(&manager, "driver-2", ConnectionOptions::new());

    let submission = echo_submission("everywhere", 3)
        .with_sla(JobSla::default().with_broadcast(true));
    let handle = manager.submit_job(submission).unwrap();
    let results = handle.await_results(Some(utils::TIMEOUT)).unwrap();
    assert_eq!(results.len(), 3);
    assert_eq!(handle.status(), SubmissionStatus::Complete);

    for connection in [first, second] {
        let mut positions: Vec<usize> = connection
            .sent_bundles()
            .into_iter()
            .flat_map(|header| header.positions)
            .collect();
        positions.sort_unstable();
        assert_eq!(positions, vec![0, 1, 2], "Every driver runs every task.");
    }
    assert!(handle.job().children().is_empty());
}

/// Test that cancelling a job spread over several units asks the driver to cancel it
/// only once.
#[test]
fn test_cancel_remote_job() {
    let manager = DispatchManager::new(utils::make_default_config()).unwrap();
    let management = Arc::new(RecordingManagementClient::new());
    let options = ConnectionOptions::new()
        .asynchronous(3)
        .with_management(management.clone());
    let (connection, _) = connect(&manager, "cancellable", options);
    connection.hold_results();

    let handle = manager.submit_job(echo_submission("to-cancel", 3)).unwrap();
    assert!(utils::wait_until(
        || connection.held_count() == 3,
        utils::TIMEOUT
    ));
    let units = handle.job().in_flight_units();
    assert_eq!(units.len(), 3);
    assert!(manager.cancel_job(handle.uuid()));
    assert!(units.iter().all(|unit| unit.is_cancelled()));

    let results = handle.await_results(Some(utils::TIMEOUT)).unwrap();
    assert_eq!(results.len(), 3);
    assert!(results
        .iter()
        .all(|result| result.outcome == TaskOutcome::Empty));
    assert_eq!(handle.status(), SubmissionStatus::Cancelled);
    assert_eq!(management.cancelled_jobs(), vec![handle.uuid()]);
    assert!(handle.job().in_flight_units().is_empty());
    assert!(
        !manager.cancel_job(handle.uuid()),
        "A done job cannot be cancelled."
    );
}

/// Test that cancelling a job spread over channels of several drivers cancels every
/// unit and asks each driver to cancel the job exactly once.
#[test]
fn test_cancel_across_drivers() {
    let config = utils::make_default_config();
    let manager = DispatchManager::new(config).unwrap();
    let shared_driver = Uuid::new_v4();
    let shared_management = Arc::new(RecordingManagementClient::new());
    let other_management = Arc::new(RecordingManagementClient::new());
    let (first, _) = connect_to_driver(
        &manager,
        "shared-1",
        shared_driver,
        ConnectionOptions::new()
            .asynchronous(2)
            .with_management(shared_management.clone()),
    );
    let (second, _) = connect_to_driver(
        &manager,
        "shared-2",
        shared_driver,
        ConnectionOptions::new()
            .asynchronous(2)
            .with_management(shared_management.clone()),
    );
    let (third, _) = connect(
        &manager,
        "other",
        ConnectionOptions::new()
            .asynchronous(2)
            .with_management(other_management.clone()),
    );
    let connections = [first, second, third];
    for connection in connections.iter() {
        connection.hold_results();
    }

    let handle = manager.submit_job(echo_submission("spread", 6)).unwrap();
    assert!(
        utils::wait_until(
            || connections
                .iter()
                .all(|connection| connection.held_count() == 2),
            utils::TIMEOUT
        ),
        "Every channel should hold two units."
    );
    let units = handle.job().in_flight_units();
    assert_eq!(units.len(), 6);

    assert!(handle.cancel());
    assert!(units.iter().all(|unit| unit.is_cancelled()));
    let results = handle.await_results(Some(utils::TIMEOUT)).unwrap();
    assert_eq!(results.len(), 6);
    assert!(results
        .iter()
        .all(|result| result.outcome == TaskOutcome::Empty));
    assert_eq!(handle.status(), SubmissionStatus::Cancelled);
    assert_eq!(shared_management.cancelled_jobs(), vec![handle.uuid()]);
    assert_eq!(other_management.cancelled_jobs(), vec![handle.uuid()]);
}

/// Test that a task which cannot be serialized fails alone while the rest is sent.
#[test]
fn test_task_not_serializable() {
    let config = utils::make_default_config().with_bundle_size(3);
    let manager = DispatchManager::new(config).unwrap();
    let (connection, _) = connect(&manager, "serialization", ConnectionOptions::new());

    let mut submission = JobSubmission::new("mixed");
    submission.add_task(utils::echo_task());
    submission.add_task(Task::new(ClientOnly));
    submission.add_task(utils::echo_task());
    let handle = manager.submit_job(submission).unwrap();
    let results = handle.await_results(Some(utils::TIMEOUT)).unwrap();

    assert_eq!(results.len(), 3);
    assert_eq!(results[0].state(), TaskState::Result);
    assert!(matches!(
        results[1].error(),
        Some(TaskError::NotSerializable(_))
    ));
    assert_eq!(results[2].state(), TaskState::Result);
    assert_eq!(handle.status(), SubmissionStatus::Complete);
    assert_eq!(connection.sent_bundles()[0].positions, vec![0, 2]);
}

/// Test that a reset connection comes back and keeps executing jobs.
#[test]
fn test_reset_reconnects() {
    let manager = DispatchManager::new(utils::make_default_config()).unwrap();
    let (connection, id) = connect(&manager, "resettable", ConnectionOptions::new());
    manager.reset();
    assert!(utils::wait_until(
        || manager.channel_status(id) == Some(ConnectionStatus::Active)
            && connection.is_connected(),
        utils::TIMEOUT
    ));

    let handle = manager.submit_job(echo_submission("after-reset", 2)).unwrap();
    let results = handle.await_results(Some(utils::TIMEOUT)).unwrap();
    assert_eq!(results.len(), 2);
}
