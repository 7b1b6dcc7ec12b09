use async_trait::async_trait;
use prompting_protocol::{
    server, Client, ClientConfig, Dispatch, Envelope, Forwarded, Handler, Pipeline, Prompting,
    ServerConfig, Status, StreamPrompting, Target, TokenStream, Verdict,
};
use std::sync::Arc;
use tokio::sync::oneshot;

struct Shouter;

#[async_trait]
impl Handler<Prompting> for Shouter {
    async fn forward(&self, mut envelope: Envelope<Prompting>) -> anyhow::Result<Forwarded<Prompting>> {
        let last = envelope.payload.messages().last().cloned().unwrap_or_default();
        envelope.payload.completion = last.to_uppercase();
        Ok(Forwarded::Complete(envelope))
    }

    fn blacklist(&self, envelope: &Envelope<Prompting>) -> Verdict {
        if envelope.sender.identity.as_deref() == Some("mallory") {
            Verdict::reject("not you")
        } else {
            Verdict::allow()
        }
    }
}

#[async_trait]
impl Handler<StreamPrompting> for Shouter {
    async fn forward(&self, envelope: Envelope<StreamPrompting>) -> anyhow::Result<Forwarded<StreamPrompting>> {
        let last = envelope.payload.messages().last().cloned().unwrap_or_default();
        let (tx, stream) = TokenStream::channel(4);
        tokio::spawn(async move {
            for c in last.to_uppercase().chars() {
                if tx.send(c.to_string()).await.is_err() {
                    return;
                }
            }
        });
        Ok(Forwarded::Stream(stream))
    }
}

/// Start a miner on an ephemeral port; dropping the sender stops it.
async fn start_miner() -> (String, oneshot::Sender<()>) {
    let cfg = ServerConfig {
        identity: "miner-1".into(),
        ..ServerConfig::default()
    };
    let handler = Arc::new(Shouter);
    let routes: Vec<Arc<dyn Dispatch>> = vec![
        Arc::new(Pipeline::<Prompting, _>::new(handler.clone(), cfg.clone())),
        Arc::new(Pipeline::<StreamPrompting, _>::new(handler, cfg.clone())),
    ];
    let router = server::create_router(routes, cfg.body_limit);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    tokio::spawn(server::serve(listener, router, async move {
        let _ = stop_rx.await;
    }));
    (address, stop_tx)
}

fn client(identity: &str) -> Client {
    Client::http(ClientConfig {
        identity: identity.into(),
        ..ClientConfig::default()
    })
}

#[tokio::test]
async fn test_complete_response_over_http() {
    let (address, _stop) = start_miner().await;
    let envelope = Envelope::new(Prompting::new(vec!["user".into()], vec!["hello there".into()]).unwrap());

    let out = client("validator")
        .call(&Target::new("miner-1", address), &envelope, 5.0)
        .await;
    assert_eq!(out.status, Some(Status::Success), "{}", out.status_message);
    assert_eq!(out.deserialize(), "HELLO THERE");
}

#[tokio::test]
async fn test_streamed_response_over_http() {
    let (address, _stop) = start_miner().await;
    let envelope =
        Envelope::new(StreamPrompting::new(vec!["user".into()], vec!["abcdefghij".into()]).unwrap());

    let mut chunks = Vec::new();
    let out = client("validator")
        .stream(&Target::new("miner-1", address), &envelope, 5.0, |chunk| {
            chunks.push(chunk.to_string())
        })
        .await;
    assert_eq!(out.status, Some(Status::Success), "{}", out.status_message);
    assert_eq!(out.deserialize(), "ABCDEFGHIJ");
    assert_eq!(chunks, vec!["ABCD", "EFGH", "IJ"]);
}

#[tokio::test]
async fn test_blacklist_reason_travels_back() {
    let (address, _stop) = start_miner().await;
    let envelope = Envelope::new(Prompting::new(vec!["user".into()], vec!["hi".into()]).unwrap());

    let out = client("mallory")
        .call(&Target::new("miner-1", address), &envelope, 5.0)
        .await;
    assert_eq!(out.status, Some(Status::Forbidden));
    assert!(out.status_message.contains("not you"), "{}", out.status_message);
    assert!(out.deserialize().is_empty());
}

#[tokio::test]
async fn test_stopped_miner_is_unavailable() {
    let (address, stop) = start_miner().await;
    drop(stop);
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let envelope = Envelope::new(Prompting::new(vec!["user".into()], vec!["hi".into()]).unwrap());
    let out = client("validator")
        .call(&Target::new("miner-1", address), &envelope, 2.0)
        .await;
    assert_eq!(out.status, Some(Status::Unavailable));
}
