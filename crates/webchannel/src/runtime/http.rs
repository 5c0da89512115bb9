use std::collections::HashMap;
use std::time::Duration;

use futures::StreamExt;
use reqwest::Client;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use url::Url;

use super::DriverInput;
use crate::transport::{Completion, HttpRequest, Method, RequestId, Transport, TransportEvent};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const NETWORK_TEST_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) fn default_client() -> Client {
    Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
        .unwrap_or_else(|_| Client::new())
}

/// [`Transport`] over reqwest. Each exchange runs in its own task and streams
/// its response back to the actor as [`TransportEvent`]s.
pub struct ReqwestTransport {
    client: Client,
    inputs: mpsc::UnboundedSender<DriverInput>,
    in_flight: HashMap<RequestId, JoinHandle<()>>,
}

impl ReqwestTransport {
    pub(crate) fn new(client: Client, inputs: mpsc::UnboundedSender<DriverInput>) -> Self {
        Self {
            client,
            inputs,
            in_flight: HashMap::new(),
        }
    }
}

fn classify(err: &reqwest::Error) -> Completion {
    if err.is_timeout() {
        Completion::TimedOut
    } else {
        Completion::Failed(err.to_string())
    }
}

async fn exchange(
    client: Client,
    id: RequestId,
    request: HttpRequest,
    inputs: mpsc::UnboundedSender<DriverInput>,
) {
    let emit = |event: TransportEvent| {
        let _ = inputs.send(DriverInput::Transport { id, event });
    };

    let method = match request.method {
        Method::Get => reqwest::Method::GET,
        Method::Post => reqwest::Method::POST,
    };
    let mut builder = client.request(method, request.url);
    for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = request.body {
        builder = builder.body(body);
    }

    let response = match builder.send().await {
        Ok(response) => response,
        Err(err) => {
            debug!(target = "webchannel.runtime", id = %id, error = %err, "request failed before a response");
            emit(TransportEvent::Complete(classify(&err)));
            return;
        }
    };

    let headers = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();
    emit(TransportEvent::Head {
        status: response.status().as_u16(),
        headers,
    });

    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        match chunk {
            Ok(bytes) => {
                trace!(target = "webchannel.runtime", id = %id, len = bytes.len(), "response bytes");
                emit(TransportEvent::Data(bytes));
            }
            Err(err) => {
                debug!(target = "webchannel.runtime", id = %id, error = %err, "response stream broke");
                emit(TransportEvent::Complete(classify(&err)));
                return;
            }
        }
    }
    emit(TransportEvent::Complete(Completion::Finished));
}

impl Transport for ReqwestTransport {
    fn send(&mut self, id: RequestId, request: HttpRequest) {
        self.in_flight.retain(|_, task| !task.is_finished());
        debug!(
            target = "webchannel.runtime",
            id = %id,
            method = request.method.as_str(),
            url = %request.url,
            "sending request"
        );
        let task = tokio::spawn(exchange(self.client.clone(), id, request, self.inputs.clone()));
        self.in_flight.insert(id, task);
    }

    fn abort(&mut self, id: RequestId) {
        if let Some(task) = self.in_flight.remove(&id) {
            trace!(target = "webchannel.runtime", id = %id, "aborting request");
            task.abort();
        }
    }

    fn send_beacon(&mut self, url: Url) {
        let client = self.client.clone();
        tokio::spawn(async move {
            if let Err(err) = client.get(url).send().await {
                warn!(target = "webchannel.runtime", error = %err, "close beacon failed");
            }
        });
    }

    fn test_network(&mut self, url: Option<Url>) {
        let Some(url) = url else {
            debug!(target = "webchannel.runtime", "no network test url configured");
            return;
        };
        let client = self.client.clone();
        let inputs = self.inputs.clone();
        tokio::spawn(async move {
            let up = matches!(
                client.get(url).timeout(NETWORK_TEST_TIMEOUT).send().await,
                Ok(response) if response.status().is_success()
            );
            let _ = inputs.send(DriverInput::NetworkTest { up });
        });
    }
}
