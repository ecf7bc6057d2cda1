//! Binance user-data stream client
//!
//! Owns the WebSocket lifecycle: listen-key creation, the 30-minute
//! keepalive, and reconnection with a doubling back-off (1 s up to 30 s,
//! reset on success). A keepalive failure tears the connection down and
//! goes through the same reconnect path.
//!
//! Connection state transitions are published on a watch channel (the
//! reconciler keys its cadence off it) and recorded as events by the
//! message handler.

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use super::stream::WsMessageHandler;
use super::ExchangeApi;
use crate::state_machine::{websocket_machine, WebSocketState};

const RECONNECT_MIN_DELAY: Duration = Duration::from_secs(1);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30 * 60);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct BinanceWsClient {
    ws_base_url: String,
    rest: Arc<dyn ExchangeApi>,
    handler: Arc<WsMessageHandler>,
    state_tx: watch::Sender<WebSocketState>,
}

impl BinanceWsClient {
    /// Returns the client and a receiver observing its connection state.
    pub fn new(
        ws_base_url: impl Into<String>,
        rest: Arc<dyn ExchangeApi>,
        handler: Arc<WsMessageHandler>,
    ) -> (Self, watch::Receiver<WebSocketState>) {
        let (state_tx, state_rx) = watch::channel(WebSocketState::Disconnected);
        (
            Self {
                ws_base_url: ws_base_url.into().trim_end_matches('/').to_string(),
                rest,
                handler,
                state_tx,
            },
            state_rx,
        )
    }

    async fn set_state(
        &self,
        machine: &mut crate::state_machine::StateMachine<WebSocketState>,
        to: WebSocketState,
    ) {
        if machine.state() == to {
            return;
        }
        if machine.transition(to).is_err() {
            // transitions outside the table are forced on the recovery path
            machine.force_state(to);
        }
        let _ = self.state_tx.send(to);
        if let Err(err) = self.handler.on_state_change(to).await {
            tracing::error!(error = %err, "failed to record websocket state event");
        }
    }

    /// Run until `shutdown` flips to true. On shutdown the socket is
    /// closed and the listen-key disposed.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut machine = websocket_machine();
        let mut delay = RECONNECT_MIN_DELAY;

        loop {
            if *shutdown.borrow() {
                break;
            }

            self.set_state(&mut machine, WebSocketState::Connecting).await;

            let listen_key = match self.rest.create_listen_key().await {
                Ok(key) => key,
                Err(err) => {
                    tracing::error!(error = %err, "listen key creation failed");
                    self.set_state(&mut machine, WebSocketState::Disconnected).await;
                    if Self::wait_or_shutdown(&mut shutdown, delay).await {
                        break;
                    }
                    delay = (delay * 2).min(RECONNECT_MAX_DELAY);
                    continue;
                }
            };

            let url = format!("{}/ws/{}", self.ws_base_url, listen_key);
            let connect = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(url.as_str())).await;
            let stream = match connect {
                Ok(Ok((stream, _))) => stream,
                Ok(Err(err)) => {
                    tracing::error!(error = %err, "websocket connect failed");
                    self.set_state(&mut machine, WebSocketState::Disconnected).await;
                    if Self::wait_or_shutdown(&mut shutdown, delay).await {
                        break;
                    }
                    delay = (delay * 2).min(RECONNECT_MAX_DELAY);
                    continue;
                }
                Err(_) => {
                    tracing::error!("websocket connect timed out");
                    self.set_state(&mut machine, WebSocketState::Disconnected).await;
                    if Self::wait_or_shutdown(&mut shutdown, delay).await {
                        break;
                    }
                    delay = (delay * 2).min(RECONNECT_MAX_DELAY);
                    continue;
                }
            };

            tracing::info!("websocket connected");
            self.set_state(&mut machine, WebSocketState::Connected).await;
            delay = RECONNECT_MIN_DELAY;

            let (mut write, mut read) = stream.split();
            let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
            keepalive.tick().await; // first tick fires immediately; skip it

            let mut clean_shutdown = false;
            loop {
                tokio::select! {
                    message = read.next() => {
                        match message {
                            Some(Ok(Message::Text(text))) => {
                                match serde_json::from_str::<Value>(&text) {
                                    Ok(value) => {
                                        if let Err(err) = self.handler.handle(&value).await {
                                            tracing::error!(error = %err, "stream message handling failed");
                                        }
                                    }
                                    Err(err) => {
                                        tracing::warn!(error = %err, "stream message parse failed");
                                    }
                                }
                            }
                            Some(Ok(Message::Ping(payload))) => {
                                if write.send(Message::Pong(payload)).await.is_err() {
                                    tracing::warn!("pong send failed, reconnecting");
                                    break;
                                }
                            }
                            Some(Ok(Message::Close(frame))) => {
                                tracing::warn!(?frame, "websocket closed by server");
                                break;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(err)) => {
                                tracing::warn!(error = %err, "websocket read error");
                                break;
                            }
                            None => {
                                tracing::warn!("websocket stream ended");
                                break;
                            }
                        }
                    }
                    _ = keepalive.tick() => {
                        if let Err(err) = self.rest.extend_listen_key().await {
                            tracing::error!(error = %err, "listen key refresh failed, reconnecting");
                            break;
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            clean_shutdown = true;
                            break;
                        }
                    }
                }
            }

            let _ = write.send(Message::Close(None)).await;
            if let Err(err) = self.rest.delete_listen_key().await {
                tracing::debug!(error = %err, "listen key delete failed");
            }

            if clean_shutdown {
                break;
            }

            self.set_state(&mut machine, WebSocketState::Reconnecting).await;
            if Self::wait_or_shutdown(&mut shutdown, delay).await {
                break;
            }
            delay = (delay * 2).min(RECONNECT_MAX_DELAY);
        }

        self.set_state(&mut machine, WebSocketState::Disconnected).await;
        tracing::info!("websocket client stopped");
    }

    /// Sleep `delay`, returning true if shutdown was requested meanwhile.
    async fn wait_or_shutdown(shutdown: &mut watch::Receiver<bool>, delay: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => false,
            _ = shutdown.changed() => *shutdown.borrow(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_to_cap() {
        let mut delay = RECONNECT_MIN_DELAY;
        let mut observed = Vec::new();
        for _ in 0..7 {
            observed.push(delay.as_secs());
            delay = (delay * 2).min(RECONNECT_MAX_DELAY);
        }
        assert_eq!(observed, vec![1, 2, 4, 8, 16, 30, 30]);
    }
}
