use commonkit_messaging_core::{
    declare_queue, BrokerConnection, DeviceUpdateTopic, JsonTopic, Listener, ListenerState,
    MemoryBroker, MemorySession, MessagingError, Publisher, QueueOptions, RawTopic, Session,
    DEVICE_UPDATE_TOPIC, TEXT_PLAIN,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

#[derive(Debug, Deserialize, PartialEq)]
struct Hello {
    hello: String,
}

#[derive(Debug, Deserialize)]
struct Step {
    seq: u32,
}

async fn eventually(cond: impl Fn() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !cond() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

fn spawn_listen<B>(listener: &Arc<Listener<MemorySession, B>>) -> JoinHandle<Result<(), MessagingError>>
where
    B: serde::de::DeserializeOwned + Send + Sync + 'static,
{
    let listener = Arc::clone(listener);
    tokio::spawn(async move { listener.listen().await })
}

async fn join(task: JoinHandle<Result<(), MessagingError>>) -> Result<(), MessagingError> {
    timeout(Duration::from_secs(5), task)
        .await
        .expect("listen did not return in time")
        .expect("listen task panicked")
}

fn step(seq: u32) -> JsonTopic<serde_json::Value> {
    JsonTopic::new("steps", json!({ "seq": seq }))
}

fn recording_steps(
    listener: &Listener<MemorySession, Step>,
    fail_on: Option<u32>,
) -> Arc<Mutex<Vec<u32>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    listener
        .assign_handler(move |msg: &Step| -> Result<(), MessagingError> {
            sink.lock().unwrap().push(msg.seq);
            if Some(msg.seq) == fail_on {
                return Err(MessagingError::Handler(format!("rejecting {}", msg.seq)));
            }
            Ok(())
        })
        .unwrap();
    seen
}

#[tokio::test]
async fn connection_opens_sessions() {
    let broker = MemoryBroker::new();
    let connection = broker.connect();
    let session = connection.open_session().await.unwrap();
    session.close().await.unwrap();
    connection.close().await.unwrap();
}

#[tokio::test]
async fn declaring_the_same_queue_twice_is_idempotent() {
    let broker = MemoryBroker::new();
    let connection = broker.connect();

    declare_queue(&connection, "t1").await.unwrap();
    declare_queue(&connection, "t1").await.unwrap();
    assert!(broker.has_queue("t1"));
}

#[tokio::test]
async fn empty_topic_name_is_rejected() {
    let connection = MemoryBroker::new().connect();
    let err = declare_queue(&connection, "").await.err().unwrap();
    assert!(matches!(err, MessagingError::QueueDeclare(_)));
}

#[tokio::test]
async fn conflicting_queue_parameters_fail_declaration() {
    let broker = MemoryBroker::new();
    let connection = broker.connect();
    let session = connection.open_session().await.unwrap();
    let exclusive = QueueOptions {
        exclusive: true,
        ..QueueOptions::durable()
    };
    session.declare_queue("t1", exclusive).await.unwrap();

    let err = declare_queue(&connection, "t1").await.err().unwrap();
    assert!(matches!(err, MessagingError::QueueDeclare(_)));

    let err = Publisher::new(&connection, "t1").await.err().unwrap();
    assert!(matches!(err, MessagingError::PublisherInit(_)));
    assert!(matches!(err.root(), MessagingError::QueueDeclare(_)));
}

#[tokio::test]
async fn construction_fails_on_closed_connection() {
    let connection = MemoryBroker::new().connect();
    connection.close().await.unwrap();

    let err = Publisher::new(&connection, "t1").await.err().unwrap();
    assert!(matches!(err.root(), MessagingError::QueueDeclare(_)));

    let err = Listener::<_, Hello>::new(&connection, "t1").await.err().unwrap();
    assert!(matches!(err, MessagingError::ListenerInit(_)));
    assert!(matches!(err.root(), MessagingError::QueueDeclare(_)));
}

#[tokio::test]
async fn published_json_is_decoded_by_listener() {
    let broker = MemoryBroker::new();
    let connection = broker.connect();
    let publisher = Publisher::new(&connection, "t1").await.unwrap();
    let listener = Arc::new(Listener::<_, Hello>::new(&connection, "t1").await.unwrap());

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    listener
        .assign_handler(move |msg: &Hello| -> Result<(), MessagingError> {
            sink.lock().unwrap().push(msg.hello.clone());
            Ok(())
        })
        .unwrap();
    let task = spawn_listen(&listener);

    publisher
        .publish(&JsonTopic::new("t1", json!({"hello": "world"})))
        .await
        .unwrap();

    eventually(|| seen.lock().unwrap().len() == 1).await;
    assert_eq!(seen.lock().unwrap().as_slice(), ["world".to_string()]);

    listener.close().await.unwrap();
    join(task).await.unwrap();
    publisher.close().await.unwrap();
}

#[tokio::test]
async fn published_messages_are_persistent_text() {
    let broker = MemoryBroker::new();
    let connection = broker.connect();
    let publisher = Publisher::new(&connection, "raw").await.unwrap();

    publisher.publish(&RawTopic::new("raw", "payload")).await.unwrap();

    let messages = broker.drain("raw");
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].body, b"payload".to_vec());
    assert_eq!(messages[0].content_type, TEXT_PLAIN);
    assert!(messages[0].persistent);
}

#[tokio::test]
async fn handler_sees_messages_in_publish_order() {
    let broker = MemoryBroker::new();
    let connection = broker.connect();
    let publisher = Publisher::new(&connection, "steps").await.unwrap();
    for seq in 1..=3 {
        publisher.publish(&step(seq)).await.unwrap();
    }

    let listener = Arc::new(Listener::<_, Step>::new(&connection, "steps").await.unwrap());
    let seen = recording_steps(&listener, None);
    let task = spawn_listen(&listener);

    eventually(|| seen.lock().unwrap().len() == 3).await;
    assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);

    listener.close().await.unwrap();
    join(task).await.unwrap();
}

#[tokio::test]
async fn handler_error_does_not_halt_processing() {
    let broker = MemoryBroker::new();
    let connection = broker.connect();
    let publisher = Publisher::new(&connection, "steps").await.unwrap();
    let listener = Arc::new(Listener::<_, Step>::new(&connection, "steps").await.unwrap());
    let seen = recording_steps(&listener, Some(2));
    let task = spawn_listen(&listener);

    for seq in 1..=3 {
        publisher.publish(&step(seq)).await.unwrap();
    }

    eventually(|| seen.lock().unwrap().len() == 3).await;
    assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);

    listener.close().await.unwrap();
    join(task).await.unwrap();
}

#[tokio::test]
async fn undecodable_message_is_skipped() {
    let broker = MemoryBroker::new();
    let connection = broker.connect();
    let publisher = Publisher::new(&connection, "steps").await.unwrap();
    publisher.publish(&RawTopic::new("steps", "not json")).await.unwrap();
    publisher.publish(&RawTopic::new("steps", r#"{"other":1}"#)).await.unwrap();
    publisher.publish(&step(7)).await.unwrap();

    let listener = Arc::new(Listener::<_, Step>::new(&connection, "steps").await.unwrap());
    let seen = recording_steps(&listener, None);
    let task = spawn_listen(&listener);

    eventually(|| !seen.lock().unwrap().is_empty()).await;
    assert_eq!(*seen.lock().unwrap(), vec![7]);

    listener.close().await.unwrap();
    join(task).await.unwrap();
}

#[tokio::test]
async fn publisher_close_is_idempotent() {
    let connection = MemoryBroker::new().connect();
    let publisher = Publisher::new(&connection, "t1").await.unwrap();

    assert!(publisher.close().await.is_ok());
    assert!(publisher.close().await.is_ok());
}

#[tokio::test]
async fn publish_on_closed_publisher_is_an_error() {
    let connection = MemoryBroker::new().connect();
    let publisher = Publisher::new(&connection, "t1").await.unwrap();
    publisher.close().await.unwrap();

    let err = publisher.publish(&RawTopic::new("t1", "x")).await.unwrap_err();
    assert!(matches!(err, MessagingError::Publish(_)));
}

#[tokio::test]
async fn publish_after_connection_close_is_an_error() {
    let connection = MemoryBroker::new().connect();
    let publisher = Publisher::new(&connection, "t1").await.unwrap();
    connection.close().await.unwrap();

    let err = publisher.publish(&RawTopic::new("t1", "x")).await.unwrap_err();
    assert!(matches!(err, MessagingError::Publish(_)));
}

#[tokio::test]
async fn nacked_publish_still_returns_ok() {
    let broker = MemoryBroker::new();
    broker.set_nack_publishes(true);
    let connection = broker.connect();
    let publisher = Publisher::new(&connection, "t1").await.unwrap();

    publisher.publish(&RawTopic::new("t1", "x")).await.unwrap();
    assert_eq!(broker.drain("t1").len(), 1);
    publisher.close().await.unwrap();
}

#[tokio::test]
async fn close_unblocks_listen() {
    let connection = MemoryBroker::new().connect();
    let listener = Arc::new(Listener::<_, Hello>::new(&connection, "t1").await.unwrap());
    listener
        .assign_handler(|_: &Hello| -> Result<(), MessagingError> { Ok(()) })
        .unwrap();

    let task = spawn_listen(&listener);
    eventually(|| listener.state() == ListenerState::Receiving).await;

    let closer = Arc::clone(&listener);
    tokio::spawn(async move { closer.close().await }).await.unwrap().unwrap();

    assert!(join(task).await.is_ok());
    assert_eq!(listener.state(), ListenerState::Closed);
}

#[tokio::test]
async fn close_stops_the_receive_task() {
    let broker = MemoryBroker::new();
    let connection = broker.connect();
    let publisher = Publisher::new(&connection, "steps").await.unwrap();
    let listener = Arc::new(Listener::<_, Step>::new(&connection, "steps").await.unwrap());
    let seen = recording_steps(&listener, None);
    let task = spawn_listen(&listener);

    publisher.publish(&step(1)).await.unwrap();
    eventually(|| seen.lock().unwrap().len() == 1).await;

    listener.close().await.unwrap();
    join(task).await.unwrap();

    publisher.publish(&step(2)).await.unwrap();
    sleep(Duration::from_millis(50)).await;
    assert_eq!(*seen.lock().unwrap(), vec![1]);
}

#[tokio::test]
async fn queue_is_handed_to_the_next_listener() {
    let broker = MemoryBroker::new();
    let connection = broker.connect();
    let publisher = Publisher::new(&connection, "steps").await.unwrap();

    let first = Arc::new(Listener::<_, Step>::new(&connection, "steps").await.unwrap());
    let first_seen = recording_steps(&first, None);
    let task = spawn_listen(&first);
    publisher.publish(&step(1)).await.unwrap();
    eventually(|| first_seen.lock().unwrap().len() == 1).await;
    first.close().await.unwrap();
    join(task).await.unwrap();

    // Nobody is consuming, the queue keeps it
    publisher.publish(&step(2)).await.unwrap();

    let second = Arc::new(Listener::<_, Step>::new(&connection, "steps").await.unwrap());
    let second_seen = recording_steps(&second, None);
    let task = spawn_listen(&second);
    eventually(|| second_seen.lock().unwrap().as_slice() == [2]).await;

    second.close().await.unwrap();
    join(task).await.unwrap();
    assert_eq!(*first_seen.lock().unwrap(), vec![1]);
    publisher.close().await.unwrap();
}

#[tokio::test]
async fn closing_the_connection_stops_its_listeners() {
    let broker = MemoryBroker::new();
    let listening = broker.connect();
    let publishing = broker.connect();
    let publisher = Publisher::new(&publishing, "steps").await.unwrap();

    let listener = Arc::new(Listener::<_, Step>::new(&listening, "steps").await.unwrap());
    let seen = recording_steps(&listener, None);
    let task = spawn_listen(&listener);
    publisher.publish(&step(1)).await.unwrap();
    eventually(|| seen.lock().unwrap().len() == 1).await;

    listening.close().await.unwrap();
    publisher.publish(&step(5)).await.unwrap();

    assert!(join(task).await.is_ok());
    assert_eq!(listener.state(), ListenerState::Closed);
    assert_eq!(*seen.lock().unwrap(), vec![1]);
    assert_eq!(broker.drain("steps").len(), 1);
    publisher.close().await.unwrap();
}

#[tokio::test]
async fn handler_cannot_be_assigned_after_start() {
    let connection = MemoryBroker::new().connect();
    let listener = Arc::new(Listener::<_, Hello>::new(&connection, "t1").await.unwrap());
    listener
        .assign_handler(|_: &Hello| -> Result<(), MessagingError> { Ok(()) })
        .unwrap();

    let task = spawn_listen(&listener);
    eventually(|| listener.state() == ListenerState::Receiving).await;

    let err = listener
        .assign_handler(|_: &Hello| -> Result<(), MessagingError> { Ok(()) })
        .unwrap_err();
    assert!(matches!(err, MessagingError::HandlerAfterStart));
    assert!(matches!(
        listener.listen().await,
        Err(MessagingError::AlreadyListening)
    ));

    listener.close().await.unwrap();
    join(task).await.unwrap();
}

#[tokio::test]
async fn listen_without_handler_is_rejected() {
    let connection = MemoryBroker::new().connect();
    let listener = Listener::<_, Hello>::new(&connection, "t1").await.unwrap();

    assert!(matches!(
        listener.listen().await,
        Err(MessagingError::MissingHandler)
    ));
    assert_eq!(listener.state(), ListenerState::Idle);
}

#[tokio::test]
async fn close_before_listen_closes_the_listener() {
    let connection = MemoryBroker::new().connect();
    let listener = Listener::<_, Hello>::new(&connection, "t1").await.unwrap();
    listener
        .assign_handler(|_: &Hello| -> Result<(), MessagingError> { Ok(()) })
        .unwrap();

    listener.close().await.unwrap();
    listener.close().await.unwrap();

    assert_eq!(listener.state(), ListenerState::Closed);
    assert!(matches!(
        listener.listen().await,
        Err(MessagingError::ListenerClosed)
    ));
}

#[tokio::test]
async fn device_updates_flow_end_to_end() {
    let connection = MemoryBroker::new().connect();
    let publisher = Publisher::new(&connection, DEVICE_UPDATE_TOPIC).await.unwrap();
    let listener = Arc::new(
        Listener::<_, DeviceUpdateTopic>::new(&connection, DEVICE_UPDATE_TOPIC)
            .await
            .unwrap(),
    );

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    listener
        .assign_handler(move |update: &DeviceUpdateTopic| -> Result<(), MessagingError> {
            sink.lock().unwrap().push(update.external_device_id.clone());
            Ok(())
        })
        .unwrap();
    let task = spawn_listen(&listener);

    let update = DeviceUpdateTopic {
        external_device_id: "thermostat-9".into(),
        home_id: "home-1".into(),
        metadata: json!({"battery": 81}),
        ..Default::default()
    };
    publisher.publish(&update).await.unwrap();

    eventually(|| seen.lock().unwrap().len() == 1).await;
    assert_eq!(seen.lock().unwrap()[0], "thermostat-9");

    listener.close().await.unwrap();
    join(task).await.unwrap();
}
