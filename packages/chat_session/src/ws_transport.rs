//! WebSocket implementation of [`Transport`].
//!
//! One reader task parses text frames into [`ServerEvent`]s and one writer
//! task drains the outbound queue; both stop when the connection's
//! cancellation token fires.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::connection::{Transport, TransportEvent, TransportSink};
use crate::error::{Result, SessionError};
use crate::protocol::{ClientEvent, ServerEvent};
use crate::types::Credential;

pub struct WsTransport {
    url: String,
    writer: Option<mpsc::UnboundedSender<String>>,
    cancel: Option<CancellationToken>,
}

impl WsTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            writer: None,
            cancel: None,
        }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn open(&mut self, credential: &Credential, sink: TransportSink) -> Result<()> {
        self.close();

        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(SessionError::from_tungstenite)?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", credential.access_token))
            .map_err(|e| SessionError::Transport(format!("invalid credential header: {e}")))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(SessionError::from_tungstenite)?;
        let (mut write, mut read) = stream.split();

        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let generation = sink.generation();

        // Writer task: drain queue → websocket
        let writer_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_cancel.cancelled() => {
                        let _ = write.send(Message::Close(None)).await;
                        break;
                    }
                    frame = rx.recv() => {
                        match frame {
                            Some(text) => {
                                if let Err(e) = write.send(Message::Text(text.into())).await {
                                    error!(generation, "websocket write error: {}", e);
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                }
            }
        });

        // Reader task: websocket → sink
        let reader_cancel = cancel.clone();
        tokio::spawn(async move {
            let reason = loop {
                tokio::select! {
                    _ = reader_cancel.cancelled() => return,
                    frame = read.next() => {
                        match frame {
                            Some(Ok(Message::Text(text))) => match ServerEvent::parse(text.as_str()) {
                                Ok(event) => {
                                    if !sink.deliver(TransportEvent::Event(event)) {
                                        return;
                                    }
                                }
                                Err(e) => warn!(generation, error = %e, "ignoring malformed frame"),
                            },
                            Some(Ok(Message::Close(frame))) => {
                                break frame
                                    .map(|f| f.reason.as_str().to_string())
                                    .filter(|r| !r.is_empty())
                                    .unwrap_or_else(|| "closed by server".to_string());
                            }
                            Some(Ok(_)) => continue,
                            Some(Err(e)) => break e.to_string(),
                            None => break "stream ended".to_string(),
                        }
                    }
                }
            };
            debug!(generation, reason = %reason, "websocket closed");
            sink.deliver(TransportEvent::Closed { reason });
        });

        self.writer = Some(tx);
        self.cancel = Some(cancel);
        Ok(())
    }

    fn send(&mut self, event: &ClientEvent) -> Result<()> {
        let writer = self
            .writer
            .as_ref()
            .ok_or_else(|| SessionError::Transport("connection is not open".to_string()))?;
        let json = serde_json::to_string(event)?;
        writer
            .send(json)
            .map_err(|_| SessionError::Transport("writer task is gone".to_string()))
    }

    fn close(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        self.writer = None;
    }
}
