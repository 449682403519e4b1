//! End-to-end interaction tests over the in-process transport (and one over
//! `maltcp`).

use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use anyhow::Context as _;
use mal_core::{
    codes, domain, Body, EntityKey, EntityRequest, Identifier, InteractionType, MalError, Message,
    OperationKey, Subscription, UpdateHeader, UpdateType,
};

use crate::{
    Broker, ClientContext, Context, ContextConfig, EngineError, InvokeOperation, LocalBroker,
    Operation, OperationStatus, ProgressOperation, PublisherOperation, RequestOperation,
    SendOperation, SubmitOperation, SubscriberOperation, Transaction, TransportRegistry,
    UpdateOrigin,
};

const ECHO: OperationKey = OperationKey::new(100, 1, 1, 1);
const STORE: OperationKey = OperationKey::new(100, 1, 1, 2);
const COMPUTE: OperationKey = OperationKey::new(100, 1, 1, 3);
const DOWNLOAD: OperationKey = OperationKey::new(100, 1, 1, 4);
const NOTE: OperationKey = OperationKey::new(100, 1, 1, 5);
const MONITOR: OperationKey = OperationKey::new(200, 1, 1, 1);

async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("timed out")
}

struct Fixture {
    consumer: ClientContext,
    provider: ClientContext,
}

async fn fixture(config: ContextConfig) -> Fixture {
    let transports = TransportRegistry::with_defaults();
    let consumer = Context::new("invm://consumer", &transports, config.clone())
        .await
        .unwrap();
    let provider = Context::new("invm://provider", &transports, config)
        .await
        .unwrap();
    Fixture {
        consumer: ClientContext::new(&consumer, "client").unwrap(),
        provider: ClientContext::new(&provider, "service").unwrap(),
    }
}

fn register_echo(provider: &ClientContext) {
    provider
        .register_handler(InteractionType::Request, ECHO, |message: Message, tx: Transaction| async move {
            let mut body = message.body;
            body.reset(false);
            let text: String = body.decode_required()?;
            let tx = tx.into_request().context("not a request")?;
            tx.reply(Body::single(&format!("echo: {text}"))?, false).await?;
            anyhow::Ok(())
        })
        .unwrap();
}

// ---------------------------------------------------------------------------
// Request / response patterns
// ---------------------------------------------------------------------------

#[tokio::test]
async fn concurrent_transaction_ids_are_distinct() {
    let f = fixture(ContextConfig::default()).await;
    let handles: Vec<_> = (0..32)
        .map(|_| {
            let ctx = f.consumer.clone();
            tokio::spawn(async move { (0..100).map(|_| ctx.transaction_id()).collect::<Vec<_>>() })
        })
        .collect();

    let mut seen = HashSet::new();
    for handle in handles {
        for tid in handle.await.unwrap() {
            assert!(seen.insert(tid), "duplicate transaction id {tid}");
        }
    }
    assert_eq!(seen.len(), 3200);
}

#[tokio::test]
async fn request_returns_the_handler_body() {
    let f = fixture(ContextConfig::default()).await;
    register_echo(&f.provider);

    let mut op = RequestOperation::new(&f.consumer, f.provider.uri().clone(), ECHO).unwrap();
    let mut response = within(op.request(Body::single("ping").unwrap()))
        .await
        .unwrap();
    assert_eq!(response.decode_required::<String>().unwrap(), "echo: ping");
    assert_eq!(op.status(), OperationStatus::Final);
}

#[tokio::test]
async fn submit_completes_on_ack() {
    let f = fixture(ContextConfig::default()).await;
    f.provider
        .register_handler(InteractionType::Submit, STORE, |_: Message, tx: Transaction| async move {
            tx.into_submit()
                .context("not a submit")?
                .ack(Body::new(), false)
                .await?;
            anyhow::Ok(())
        })
        .unwrap();

    let mut op = SubmitOperation::new(&f.consumer, f.provider.uri().clone(), STORE).unwrap();
    within(op.submit(Body::single(&7u32).unwrap())).await.unwrap();
    assert_eq!(op.status(), OperationStatus::Final);
}

#[tokio::test]
async fn send_reaches_the_handler() {
    let f = fixture(ContextConfig::default()).await;
    let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();
    f.provider
        .register_handler(InteractionType::Send, NOTE, move |message: Message, _: Transaction| {
            let seen_tx = seen_tx.clone();
            async move {
                let mut body = message.body;
                body.reset(false);
                let _ = seen_tx.send(body.decode_required::<String>()?);
                anyhow::Ok(())
            }
        })
        .unwrap();

    let mut op = SendOperation::new(&f.consumer, f.provider.uri().clone(), NOTE).unwrap();
    op.send(Body::single("hello").unwrap()).await.unwrap();
    assert_eq!(op.status(), OperationStatus::Final);
    assert_eq!(within(seen_rx.recv()).await.unwrap(), "hello");
}

#[tokio::test]
async fn reset_requires_final_and_allocates_new_tid() {
    let f = fixture(ContextConfig::default()).await;
    register_echo(&f.provider);

    let mut op = RequestOperation::new(&f.consumer, f.provider.uri().clone(), ECHO).unwrap();
    assert!(matches!(op.reset(), Err(EngineError::InvalidState { .. })));

    let first_tid = op.transaction_id();
    within(op.request(Body::single("one").unwrap())).await.unwrap();
    op.reset().unwrap();
    assert_eq!(op.status(), OperationStatus::Created);
    assert_ne!(op.transaction_id(), first_tid);

    let mut response = within(op.request(Body::single("two").unwrap()))
        .await
        .unwrap();
    assert_eq!(response.decode_required::<String>().unwrap(), "echo: two");
}

#[tokio::test]
async fn invoke_waits_for_ack_then_response() {
    let f = fixture(ContextConfig::default()).await;
    f.provider
        .register_handler(InteractionType::Invoke, COMPUTE, |_: Message, tx: Transaction| async move {
            let tx = tx.into_invoke().context("not an invoke")?;
            tx.ack(Body::single("accepted")?, false).await?;
            tx.reply(Body::single(&42u32)?, false).await?;
            anyhow::Ok(())
        })
        .unwrap();

    let mut op = InvokeOperation::new(&f.consumer, f.provider.uri().clone(), COMPUTE).unwrap();
    let mut ack = within(op.invoke(Body::new())).await.unwrap();
    assert_eq!(ack.decode_required::<String>().unwrap(), "accepted");
    assert_eq!(op.status(), OperationStatus::Acknowledged);

    let mut response = within(op.get_response()).await.unwrap();
    assert_eq!(response.decode_required::<u32>().unwrap(), 42);
    assert_eq!(op.status(), OperationStatus::Final);
}

#[tokio::test]
async fn invoke_error_ack_surfaces_from_invoke_and_get_response() {
    let f = fixture(ContextConfig::default()).await;
    f.provider
        .register_handler(InteractionType::Invoke, COMPUTE, |_: Message, _: Transaction| async move {
            let error = MalError::with_info(codes::INVALID, &vec![0u32, 2])?;
            Err::<(), _>(anyhow::Error::new(error))
        })
        .unwrap();

    let mut op = InvokeOperation::new(&f.consumer, f.provider.uri().clone(), COMPUTE).unwrap();
    let error = within(op.invoke(Body::new())).await.unwrap_err();
    let mal = error.as_protocol().cloned().unwrap();
    assert_eq!(mal.code, codes::INVALID);
    assert_eq!(mal.extra_info_as::<Vec<u32>>().unwrap(), Some(vec![0, 2]));
    assert_eq!(op.status(), OperationStatus::Final);

    let again = op.get_response().await.unwrap_err();
    assert_eq!(again.as_protocol(), Some(&mal));
}

#[tokio::test]
async fn progress_yields_every_update_then_the_response() {
    let f = fixture(ContextConfig::default()).await;
    f.provider
        .register_handler(InteractionType::Progress, DOWNLOAD, |_: Message, tx: Transaction| async move {
            let tx = tx.into_progress().context("not a progress")?;
            tx.ack(Body::new(), false).await?;
            for chunk in 0..3u32 {
                tx.update(Body::single(&chunk)?, false).await?;
            }
            tx.reply(Body::single("done")?, false).await?;
            anyhow::Ok(())
        })
        .unwrap();

    let mut op = ProgressOperation::new(&f.consumer, f.provider.uri().clone(), DOWNLOAD).unwrap();
    within(op.progress(Body::new())).await.unwrap();

    let mut updates = Vec::new();
    while let Some(mut update) = within(op.get_update()).await.unwrap() {
        updates.push(update.decode_required::<u32>().unwrap());
    }
    assert_eq!(updates, vec![0, 1, 2]);

    let mut response = within(op.get_response()).await.unwrap();
    assert_eq!(response.decode_required::<String>().unwrap(), "done");
}

#[tokio::test]
async fn handler_failure_becomes_unknown_error() {
    let f = fixture(ContextConfig::default()).await;
    f.provider
        .register_handler(InteractionType::Request, ECHO, |_: Message, _: Transaction| async move {
            Err::<(), _>(anyhow::anyhow!("storage offline"))
        })
        .unwrap();

    let mut op = RequestOperation::new(&f.consumer, f.provider.uri().clone(), ECHO).unwrap();
    let error = within(op.request(Body::new())).await.unwrap_err();
    let mal = error.as_protocol().unwrap();
    assert_eq!(mal.code, codes::UNKNOWN);
    assert_eq!(mal.message(), Some("storage offline"));
}

#[tokio::test]
async fn unknown_service_is_destination_unknown() {
    let f = fixture(ContextConfig::default()).await;
    let missing = f.provider.context().new_uri("missing");
    let mut op = RequestOperation::new(&f.consumer, missing, ECHO).unwrap();
    let error = within(op.request(Body::new())).await.unwrap_err();
    assert_eq!(error.as_protocol().unwrap().code, codes::DESTINATION_UNKNOWN);
}

#[tokio::test]
async fn unregistered_operation_is_unsupported() {
    let f = fixture(ContextConfig::default()).await;
    let mut op = SubmitOperation::new(&f.consumer, f.provider.uri().clone(), STORE).unwrap();
    let error = within(op.submit(Body::new())).await.unwrap_err();
    assert_eq!(error.as_protocol().unwrap().code, codes::UNSUPPORTED_OPERATION);
}

#[tokio::test]
async fn nested_call_from_handler_with_concurrent_dispatch() {
    let f = fixture(ContextConfig::concurrent(4)).await;
    register_echo(&f.provider);

    let provider = f.provider.clone();
    f.provider
        .register_handler(InteractionType::Submit, STORE, move |_: Message, tx: Transaction| {
            let provider = provider.clone();
            async move {
                let mut inner = RequestOperation::new(&provider, provider.uri().clone(), ECHO)?;
                let mut reply = inner.request(Body::single("nested")?).await?;
                let text: String = reply.decode_required()?;
                anyhow::ensure!(text == "echo: nested", "unexpected nested reply {text}");
                tx.into_submit()
                    .context("not a submit")?
                    .ack(Body::new(), false)
                    .await?;
                anyhow::Ok(())
            }
        })
        .unwrap();

    let mut op = SubmitOperation::new(&f.consumer, f.provider.uri().clone(), STORE).unwrap();
    within(op.submit(Body::new())).await.unwrap();
}

#[tokio::test]
async fn nested_calls_from_every_concurrent_handler_complete() {
    let f = fixture(ContextConfig::concurrent(2)).await;
    register_echo(&f.provider);

    let provider = f.provider.clone();
    f.provider
        .register_handler(InteractionType::Submit, STORE, move |_: Message, tx: Transaction| {
            let provider = provider.clone();
            async move {
                // Keep both outer handlers in flight before either calls out.
                tokio::time::sleep(Duration::from_millis(50)).await;
                let mut inner = RequestOperation::new(&provider, provider.uri().clone(), ECHO)?;
                inner.request(Body::single("nested")?).await?;
                tx.into_submit()
                    .context("not a submit")?
                    .ack(Body::new(), false)
                    .await?;
                anyhow::Ok(())
            }
        })
        .unwrap();

    let outer: Vec<_> = (0..2)
        .map(|_| {
            let mut op = SubmitOperation::new(&f.consumer, f.provider.uri().clone(), STORE).unwrap();
            tokio::spawn(async move { op.submit(Body::new()).await })
        })
        .collect();
    for handle in outer {
        within(handle).await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn submit_invoke_and_progress_can_be_reused_after_reset() {
    let f = fixture(ContextConfig::default()).await;
    f.provider
        .register_handler(InteractionType::Submit, STORE, |_: Message, tx: Transaction| async move {
            tx.into_submit()
                .context("not a submit")?
                .ack(Body::new(), false)
                .await?;
            anyhow::Ok(())
        })
        .unwrap();
    f.provider
        .register_handler(InteractionType::Invoke, COMPUTE, |message: Message, tx: Transaction| async move {
            let mut body = message.body;
            body.reset(false);
            let n: u32 = body.decode_required()?;
            let tx = tx.into_invoke().context("not an invoke")?;
            tx.ack(Body::new(), false).await?;
            tx.reply(Body::single(&(n * 2))?, false).await?;
            anyhow::Ok(())
        })
        .unwrap();
    f.provider
        .register_handler(InteractionType::Progress, DOWNLOAD, |_: Message, tx: Transaction| async move {
            let tx = tx.into_progress().context("not a progress")?;
            tx.ack(Body::new(), false).await?;
            tx.update(Body::single(&1u32)?, false).await?;
            tx.reply(Body::single("done")?, false).await?;
            anyhow::Ok(())
        })
        .unwrap();

    let mut submit = SubmitOperation::new(&f.consumer, f.provider.uri().clone(), STORE).unwrap();
    within(submit.submit(Body::new())).await.unwrap();
    let first = submit.transaction_id();
    submit.reset().unwrap();
    assert_ne!(submit.transaction_id(), first);
    within(submit.submit(Body::new())).await.unwrap();
    assert_eq!(submit.status(), OperationStatus::Final);

    let mut invoke = InvokeOperation::new(&f.consumer, f.provider.uri().clone(), COMPUTE).unwrap();
    for n in [3u32, 5] {
        within(invoke.invoke(Body::single(&n).unwrap())).await.unwrap();
        let mut response = within(invoke.get_response()).await.unwrap();
        assert_eq!(response.decode_required::<u32>().unwrap(), n * 2);
        invoke.reset().unwrap();
    }

    let mut progress = ProgressOperation::new(&f.consumer, f.provider.uri().clone(), DOWNLOAD).unwrap();
    for _ in 0..2 {
        within(progress.progress(Body::new())).await.unwrap();
        let mut update = within(progress.get_update()).await.unwrap().unwrap();
        assert_eq!(update.decode_required::<u32>().unwrap(), 1);
        assert!(within(progress.get_update()).await.unwrap().is_none());
        let mut response = within(progress.get_response()).await.unwrap();
        assert_eq!(response.decode_required::<String>().unwrap(), "done");
        progress.reset().unwrap();
    }
}

#[tokio::test]
async fn progress_error_update_ends_the_operation() {
    let f = fixture(ContextConfig::default()).await;
    f.provider
        .register_handler(InteractionType::Progress, DOWNLOAD, |_: Message, tx: Transaction| async move {
            let tx = tx.into_progress().context("not a progress")?;
            tx.ack(Body::new(), false).await?;
            tx.update(Body::single(&0u32)?, false).await?;
            let error = MalError::with_message(codes::INVALID, "bad chunk");
            tx.update(error.to_body(), true).await?;
            anyhow::ensure!(tx.reply(Body::new(), false).await.is_err(), "reply after error update");
            anyhow::Ok(())
        })
        .unwrap();

    let mut op = ProgressOperation::new(&f.consumer, f.provider.uri().clone(), DOWNLOAD).unwrap();
    within(op.progress(Body::new())).await.unwrap();
    assert!(within(op.get_update()).await.unwrap().is_some());
    assert_eq!(op.status(), OperationStatus::Progressing);

    let error = within(op.get_update()).await.unwrap_err();
    let mal = error.as_protocol().cloned().unwrap();
    assert_eq!(mal.code, codes::INVALID);
    assert_eq!(mal.message(), Some("bad chunk"));
    assert_eq!(op.status(), OperationStatus::Final);
    assert_eq!(within(op.get_response()).await.unwrap_err().as_protocol(), Some(&mal));
}

#[tokio::test]
async fn progress_error_response_is_returned_by_get_response() {
    let f = fixture(ContextConfig::default()).await;
    f.provider
        .register_handler(InteractionType::Progress, DOWNLOAD, |_: Message, tx: Transaction| async move {
            let tx = tx.into_progress().context("not a progress")?;
            tx.ack(Body::new(), false).await?;
            tx.update(Body::single(&0u32)?, false).await?;
            tx.reply(MalError::new(codes::INTERNAL).to_body(), true).await?;
            anyhow::Ok(())
        })
        .unwrap();

    let mut op = ProgressOperation::new(&f.consumer, f.provider.uri().clone(), DOWNLOAD).unwrap();
    within(op.progress(Body::new())).await.unwrap();
    let error = within(op.get_response()).await.unwrap_err();
    assert_eq!(error.as_protocol().unwrap().code, codes::INTERNAL);
    assert_eq!(op.status(), OperationStatus::Final);
}

#[tokio::test]
async fn get_response_before_invoke_is_invalid() {
    let f = fixture(ContextConfig::default()).await;
    let mut op = InvokeOperation::new(&f.consumer, f.provider.uri().clone(), COMPUTE).unwrap();
    assert!(matches!(
        op.get_response().await,
        Err(EngineError::InvalidState { operation: "get_response", .. })
    ));
    assert_eq!(op.status(), OperationStatus::Created);
}

#[tokio::test]
async fn interrupt_without_a_waiting_call_is_dropped() {
    let f = fixture(ContextConfig::default()).await;
    register_echo(&f.provider);

    let mut op = RequestOperation::new(&f.consumer, f.provider.uri().clone(), ECHO).unwrap();
    op.interrupter().interrupt();
    let mut response = within(op.request(Body::single("after").unwrap()))
        .await
        .unwrap();
    assert_eq!(response.decode_required::<String>().unwrap(), "echo: after");
}

#[tokio::test]
async fn close_is_idempotent_on_operations_and_transactions() {
    let f = fixture(ContextConfig::default()).await;
    f.provider
        .register_handler(InteractionType::Submit, STORE, |_: Message, tx: Transaction| async move {
            let submit = tx.into_submit().context("not a submit")?;
            submit.ack(Body::new(), false).await?;
            submit.close();
            submit.close();
            anyhow::Ok(())
        })
        .unwrap();

    let mut op = SubmitOperation::new(&f.consumer, f.provider.uri().clone(), STORE).unwrap();
    within(op.submit(Body::new())).await.unwrap();
    op.close();
    op.close();
    assert_eq!(op.status(), OperationStatus::Closed);

    let mut pending = RequestOperation::new(&f.consumer, f.provider.uri().clone(), ECHO).unwrap();
    pending.close();
    pending.close();
    assert_eq!(pending.status(), OperationStatus::Closed);
}

#[tokio::test]
async fn closing_the_client_context_ends_pending_calls() {
    let f = fixture(ContextConfig::default()).await;
    // Never replies.
    f.provider
        .register_handler(InteractionType::Request, ECHO, |_: Message, _: Transaction| async move {
            anyhow::Ok(())
        })
        .unwrap();

    let mut op = RequestOperation::new(&f.consumer, f.provider.uri().clone(), ECHO).unwrap();
    let pending = tokio::spawn(async move { op.request(Body::single("x").unwrap()).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    f.consumer.close();
    let result = within(pending).await.unwrap();
    assert!(matches!(result, Err(EngineError::Shutdown)));
}

#[tokio::test]
async fn request_over_maltcp() {
    let transports = TransportRegistry::with_defaults();
    let consumer_ctx = Context::new("maltcp://127.0.0.1:0", &transports, ContextConfig::default())
        .await
        .unwrap();
    let provider_ctx = Context::new("maltcp://127.0.0.1:0", &transports, ContextConfig::default())
        .await
        .unwrap();
    let consumer = ClientContext::new(&consumer_ctx, "client").unwrap();
    let provider = ClientContext::new(&provider_ctx, "service").unwrap();
    register_echo(&provider);

    let mut op = RequestOperation::new(&consumer, provider.uri().clone(), ECHO).unwrap();
    let mut response = within(op.request(Body::single("over tcp").unwrap()))
        .await
        .unwrap();
    assert_eq!(response.decode_required::<String>().unwrap(), "echo: over tcp");

    consumer_ctx.close().await;
    provider_ctx.close().await;
}

// ---------------------------------------------------------------------------
// Publish / subscribe
// ---------------------------------------------------------------------------

struct PubSubFixture {
    broker: Broker,
    broker_uri: mal_core::Uri,
    clients: ClientContext,
    _broker_endpoint: ClientContext,
}

async fn pubsub_fixture() -> PubSubFixture {
    pubsub_fixture_with(ContextConfig::default()).await
}

async fn pubsub_fixture_with(config: ContextConfig) -> PubSubFixture {
    let f = fixture(config).await;
    let broker = Broker::with_value_list();
    broker.attach(&f.provider, MONITOR).unwrap();
    f.consumer.set_domain(domain(&["spacecraft1", "payload"]));
    PubSubFixture {
        broker,
        broker_uri: f.provider.uri().clone(),
        clients: f.consumer,
        _broker_endpoint: f.provider,
    }
}

fn subscription(id: &str, sub_domain: Option<&[&str]>, pattern: EntityKey) -> Subscription {
    Subscription {
        subscription_id: Identifier::from(id),
        entities: vec![EntityRequest {
            sub_domain: sub_domain.map(domain),
            entity_keys: vec![pattern],
            ..EntityRequest::default()
        }],
    }
}

fn headers(keys: &[&str]) -> Vec<UpdateHeader> {
    keys.iter()
        .map(|key| UpdateHeader::new(EntityKey::new(key, 1, 1, 1), UpdateType::Update))
        .collect()
}

fn values(items: &[&str]) -> Vec<String> {
    items.iter().map(ToString::to_string).collect()
}

impl PubSubFixture {
    async fn subscriber(&self, sub: &Subscription) -> SubscriberOperation {
        let mut op = SubscriberOperation::new(&self.clients, self.broker_uri.clone(), MONITOR).unwrap();
        within(op.register_subscription(sub)).await.unwrap();
        op
    }

    async fn publisher(&self, keys: &[EntityKey]) -> PublisherOperation {
        let mut op = PublisherOperation::new(&self.clients, self.broker_uri.clone(), MONITOR).unwrap();
        within(op.register_keys(keys)).await.unwrap();
        op
    }
}

#[tokio::test]
async fn fan_out_gives_each_subscriber_only_its_updates() {
    let p = pubsub_fixture().await;
    let mut sub_a = p.subscriber(&subscription("a", None, EntityKey::new("a", 0, 0, 0))).await;
    let mut sub_b = p.subscriber(&subscription("b", None, EntityKey::new("b", 0, 0, 0))).await;
    let mut publisher = p.publisher(&[EntityKey::wildcard()]).await;
    assert_eq!(p.broker.subscription_count(), 2);

    publisher
        .publish_list(
            &headers(&["a", "b", "c", "a"]),
            values(&["va1", "vb1", "vc1", "va2"]),
        )
        .await
        .unwrap();

    let mut notify_a = within(sub_a.get_notify()).await.unwrap();
    assert_eq!(notify_a.subscription_id, Identifier::from("a"));
    assert_eq!(notify_a.headers.len(), 2);
    assert_eq!(notify_a.next_values::<String>().unwrap(), values(&["va1", "va2"]));

    let mut notify_b = within(sub_b.get_notify()).await.unwrap();
    assert_eq!(notify_b.headers.len(), 1);
    assert_eq!(notify_b.headers[0].key, EntityKey::new("b", 1, 1, 1));
    assert_eq!(notify_b.next_values::<String>().unwrap(), values(&["vb1"]));
}

#[tokio::test]
async fn sub_domain_wildcard_selects_deeper_domains() {
    let p = pubsub_fixture().await;
    let mut sub = p
        .subscriber(&subscription("deep", Some(&["*"]), EntityKey::wildcard()))
        .await;
    let mut publisher = p.publisher(&[EntityKey::wildcard()]).await;

    // Same domain as the subscriber: matches.
    publisher
        .publish_list(&headers(&["k1"]), values(&["v1"]))
        .await
        .unwrap();
    let mut notify = within(sub.get_notify()).await.unwrap();
    assert_eq!(notify.next_values::<String>().unwrap(), values(&["v1"]));

    let local = LocalBroker::new(
        p.broker.clone(),
        UpdateOrigin {
            domain: domain(&["spacecraft1", "payload", "camera1"]),
            operation: MONITOR,
            ..UpdateOrigin::default()
        },
    );
    assert_eq!(local.publish_list(&headers(&["k2"]), values(&["v2"])).await.unwrap(), 1);
    let mut notify = within(sub.get_notify()).await.unwrap();
    assert_eq!(notify.next_values::<String>().unwrap(), values(&["v2"]));

    let elsewhere = LocalBroker::new(
        p.broker.clone(),
        UpdateOrigin {
            domain: domain(&["spacecraft1", "otherpayload"]),
            operation: MONITOR,
            ..UpdateOrigin::default()
        },
    );
    assert_eq!(elsewhere.publish_list(&headers(&["k3"]), values(&["v3"])).await.unwrap(), 0);
}

#[tokio::test]
async fn mismatched_publish_is_reported_and_not_delivered() {
    let p = pubsub_fixture().await;
    let mut sub = p
        .subscriber(&subscription("all", None, EntityKey::wildcard()))
        .await;
    let mut publisher = p.publisher(&[EntityKey::wildcard()]).await;

    let mut malformed = Body::new();
    malformed.encode_parameter(&headers(&["x", "y"])).unwrap();
    malformed
        .encode_last_parameter(Some(&values(&["only one"])), true)
        .unwrap();
    publisher.publish(malformed).await.unwrap();

    let error = within(publisher.publish_error()).await.unwrap();
    assert_eq!(error.code, codes::UNKNOWN);
    assert!(error.message().unwrap().starts_with("bad header/value list lengths"));

    publisher
        .publish_list(&headers(&["ok"]), values(&["fine"]))
        .await
        .unwrap();
    let notify = within(sub.get_notify()).await.unwrap();
    assert_eq!(notify.headers.len(), 1);
    assert_eq!(notify.headers[0].key, EntityKey::new("ok", 1, 1, 1));
}

#[tokio::test]
async fn undeclared_keys_are_rejected() {
    let p = pubsub_fixture().await;
    let mut publisher = p.publisher(&[EntityKey::new("allowed", 0, 0, 0)]).await;
    publisher
        .publish_list(&headers(&["forbidden"]), values(&["v"]))
        .await
        .unwrap();
    let error = within(publisher.publish_error()).await.unwrap();
    assert_eq!(error.code, codes::UNKNOWN);
    assert!(error.message().unwrap().contains("forbidden"));
}

#[tokio::test]
async fn deregistration_removes_subscriptions_and_publishers() {
    let p = pubsub_fixture().await;
    let mut sub = p
        .subscriber(&subscription("gone", None, EntityKey::wildcard()))
        .await;
    let mut publisher = p.publisher(&[EntityKey::wildcard()]).await;
    assert_eq!(p.broker.publisher_count(), 1);

    within(sub.deregister_ids(&[Identifier::from("gone")])).await.unwrap();
    assert_eq!(sub.status(), OperationStatus::Final);
    assert_eq!(p.broker.subscription_count(), 0);

    within(publisher.deregister()).await.unwrap();
    assert_eq!(p.broker.publisher_count(), 0);
}

#[tokio::test]
async fn local_publish_validates_lengths() {
    let p = pubsub_fixture().await;
    let local = LocalBroker::new(p.broker.clone(), UpdateOrigin::default());
    let error = local
        .publish_list(&headers(&["a", "b"]), values(&["one"]))
        .await
        .unwrap_err();
    assert_eq!(error.as_protocol().unwrap().code, codes::UNKNOWN);
}

#[tokio::test]
async fn interrupt_wakes_a_blocked_subscriber() {
    let p = pubsub_fixture().await;
    let mut sub = p
        .subscriber(&subscription("idle", None, EntityKey::wildcard()))
        .await;
    let interrupter = sub.interrupter();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        interrupter.interrupt();
    });
    let result = within(sub.get_notify()).await;
    assert!(matches!(result, Err(EngineError::Interrupted)));
    assert_eq!(sub.status(), OperationStatus::Registered);

    let mut publisher = p.publisher(&[EntityKey::wildcard()]).await;
    publisher
        .publish_list(&headers(&["k"]), values(&["still here"]))
        .await
        .unwrap();
    let mut notify = within(sub.get_notify()).await.unwrap();
    assert_eq!(notify.next_values::<String>().unwrap(), values(&["still here"]));
}

#[tokio::test]
async fn publish_error_after_shutdown_fails_instead_of_blocking() {
    let p = pubsub_fixture().await;
    let mut publisher = p.publisher(&[EntityKey::wildcard()]).await;
    p.clients.close();

    assert!(publisher.take_publish_errors().is_empty());
    assert!(matches!(within(publisher.publish_error()).await, Err(EngineError::Shutdown)));
    assert!(matches!(
        within(publisher.publish_list(&headers(&["k"]), values(&["v"]))).await,
        Err(EngineError::Shutdown)
    ));
}

#[tokio::test]
async fn concurrent_broker_keeps_publish_order() {
    let p = pubsub_fixture_with(ContextConfig::concurrent(4)).await;
    let mut sub = p
        .subscriber(&subscription("ordered", None, EntityKey::wildcard()))
        .await;
    let mut publisher = p.publisher(&[EntityKey::wildcard()]).await;

    let sent: Vec<String> = (0..50).map(|i| format!("v{i}")).collect();
    for value in &sent {
        publisher
            .publish_list(&headers(&["k"]), vec![value.clone()])
            .await
            .unwrap();
    }
    let mut received = Vec::new();
    for _ in 0..sent.len() {
        let mut notify = within(sub.get_notify()).await.unwrap();
        received.extend(notify.next_values::<String>().unwrap());
    }
    assert_eq!(received, sent);
}

#[tokio::test]
async fn broker_over_maltcp_fans_out_parallel_value_lists() {
    let transports = TransportRegistry::with_defaults();
    let broker_ctx = Context::new("maltcp://127.0.0.1:0", &transports, ContextConfig::default())
        .await
        .unwrap();
    let client_ctx = Context::new("maltcp://127.0.0.1:0", &transports, ContextConfig::default())
        .await
        .unwrap();
    let broker_endpoint = ClientContext::new(&broker_ctx, "broker").unwrap();
    let clients = ClientContext::new(&client_ctx, "client").unwrap();
    clients.set_domain(domain(&["spacecraft1"]));
    let broker = Broker::with_value_lists(2);
    broker.attach(&broker_endpoint, MONITOR).unwrap();

    let mut sub = SubscriberOperation::new(&clients, broker_endpoint.uri().clone(), MONITOR).unwrap();
    let temps = Subscription {
        subscription_id: Identifier::from("temps"),
        entities: vec![EntityRequest {
            entity_keys: vec![EntityKey::new("t1", 0, 0, 0), EntityKey::new("t2", 0, 0, 0)],
            ..EntityRequest::default()
        }],
    };
    within(sub.register_subscription(&temps)).await.unwrap();
    let mut publisher = PublisherOperation::new(&clients, broker_endpoint.uri().clone(), MONITOR).unwrap();
    within(publisher.register_keys(&[EntityKey::wildcard()])).await.unwrap();

    let mut body = Body::new();
    body.encode_parameter(&headers(&["t1", "p1", "t2"])).unwrap();
    body.encode_last_parameter(Some(&values(&["10", "20", "30"])), true)
        .unwrap();
    body.encode_last_parameter(Some(&values(&["C", "hPa", "K"])), true)
        .unwrap();
    within(publisher.publish(body)).await.unwrap();

    let mut notify = within(sub.get_notify()).await.unwrap();
    assert_eq!(notify.subscription_id, Identifier::from("temps"));
    assert_eq!(notify.headers.len(), 2);
    assert_eq!(notify.next_values::<String>().unwrap(), values(&["10", "30"]));
    assert_eq!(notify.next_values::<String>().unwrap(), values(&["C", "K"]));
    assert!(publisher.take_publish_errors().is_empty());

    client_ctx.close().await;
    broker_ctx.close().await;
}
