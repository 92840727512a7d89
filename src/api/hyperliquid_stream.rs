//! Hyperliquid WebSocket subscription (streaming mode).
//!
//! Live fills arrive on the `userFills` channel. Before a batch of fills is
//! handed to the engine the account snapshot is pulled over REST, so the
//! engine never classifies a fill against a snapshot older than the fill.
//! Snapshot reads are served from a local cache and only hit the network
//! when the cache is empty.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{Sink, SinkExt, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::models::{AccountState, Fill, Venue};

use super::hyperliquid_client::{convert_fill, HyperliquidClient};
use super::source::{FeedEvent, LeaderDataSource, ProviderError, StreamingSource};
use super::types::{HlUserFills, HlWsMessage};

const HL_WS_URL: &str = "wss://api.hyperliquid.xyz/ws";

/// Streaming data source backed by the Hyperliquid WebSocket.
#[derive(Clone)]
pub struct HyperliquidStream {
    inner: Arc<StreamInner>,
}

struct StreamInner {
    rest: HyperliquidClient,
    ws_url: String,
    cache: RwLock<HashMap<String, AccountState>>,
    reconnect_delay: Duration,
    keepalive_every: Duration,
}

impl HyperliquidStream {
    /// `HYPERLIQUID_WS_URL` overrides the WebSocket endpoint.
    pub fn new(rest: HyperliquidClient, reconnect_delay: Duration, keepalive_every: Duration) -> Self {
        let ws_url = std::env::var("HYPERLIQUID_WS_URL").unwrap_or_else(|_| HL_WS_URL.to_string());
        Self::with_ws_url(rest, ws_url, reconnect_delay, keepalive_every)
    }

    pub fn with_ws_url(
        rest: HyperliquidClient,
        ws_url: String,
        reconnect_delay: Duration,
        keepalive_every: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(StreamInner {
                rest,
                ws_url,
                cache: RwLock::new(HashMap::new()),
                reconnect_delay,
                keepalive_every,
            }),
        }
    }
}

impl StreamInner {
    /// Pull a fresh snapshot and store it in the cache.
    async fn refresh(&self, leader_id: &str) -> Result<AccountState, ProviderError> {
        let state = self.rest.fetch_state(leader_id).await?;
        self.cache
            .write()
            .await
            .insert(leader_id.to_string(), state.clone());
        Ok(state)
    }

    /// Reconnect loop; runs until cancelled.
    async fn run(self: Arc<Self>, leader_id: String, events: mpsc::Sender<FeedEvent>, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                break;
            }

            match self.run_session(&leader_id, &events, &cancel).await {
                Ok(()) => debug!(leader = %leader_id, "Stream session ended"),
                Err(e) => {
                    warn!(leader = %leader_id, error = %e, "Stream session failed");
                    if events.send(FeedEvent::Disconnected(e.to_string())).await.is_err() {
                        break;
                    }
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(self.reconnect_delay) => {}
            }
            info!(leader = %leader_id, "Reconnecting stream");
        }

        info!(leader = %leader_id, "Stream stopped");
    }

    async fn run_session(
        &self,
        leader_id: &str,
        events: &mpsc::Sender<FeedEvent>,
        cancel: &CancellationToken,
    ) -> Result<(), ProviderError> {
        let (ws, _) = connect_async(self.ws_url.as_str())
            .await
            .map_err(|e| ProviderError::Stream(e.to_string()))?;
        let (mut write, mut read) = ws.split();

        let subscribe = serde_json::json!({
            "method": "subscribe",
            "subscription": { "type": "userFills", "user": leader_id }
        });
        write
            .send(Message::Text(subscribe.to_string()))
            .await
            .map_err(|e| ProviderError::Stream(e.to_string()))?;

        info!(leader = %leader_id, url = %self.ws_url, "Stream connected");
        let _ = events.send(FeedEvent::Connected).await;

        let session = cancel.child_token();
        let keepalive = tokio::spawn(keepalive_loop(write, self.keepalive_every, session.clone()));

        let result = loop {
            tokio::select! {
                _ = session.cancelled() => {
                    break if cancel.is_cancelled() {
                        Ok(())
                    } else {
                        Err(ProviderError::Stream("keepalive failed".to_string()))
                    };
                }
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => match self.handle_text(leader_id, &text, events).await {
                        Ok(()) => {}
                        Err(ProviderError::Parse(e)) => warn!(error = %e, "Ignoring malformed stream message"),
                        Err(e) => break Err(e),
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        break Err(ProviderError::Stream("connection closed by server".to_string()));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break Err(ProviderError::Stream(e.to_string())),
                }
            }
        };

        session.cancel();
        let _ = keepalive.await;
        result
    }

    async fn handle_text(
        &self,
        leader_id: &str,
        text: &str,
        events: &mpsc::Sender<FeedEvent>,
    ) -> Result<(), ProviderError> {
        let message: HlWsMessage = serde_json::from_str(text)?;

        match message.channel.as_str() {
            "userFills" => {
                let payload: HlUserFills = serde_json::from_value(message.data)?;
                if payload.is_snapshot {
                    debug!(count = payload.fills.len(), "Ignoring historical fill snapshot");
                    return Ok(());
                }

                let mut fills: Vec<Fill> = payload.fills.into_iter().flat_map(convert_fill).collect();
                if fills.is_empty() {
                    return Ok(());
                }
                fills.sort_by_key(|f| f.timestamp);

                if let Err(e) = self.refresh(leader_id).await {
                    warn!(leader = %leader_id, error = %e, "Snapshot pull before fill failed, using cached state");
                }

                for fill in fills {
                    events
                        .send(FeedEvent::Fill(fill))
                        .await
                        .map_err(|_| ProviderError::Stream("engine input closed".to_string()))?;
                }
            }
            "pong" | "subscriptionResponse" => {}
            other => debug!(channel = %other, "Unhandled stream channel"),
        }

        Ok(())
    }
}

/// Send an application-level ping on a fixed schedule until the session ends.
async fn keepalive_loop<S>(mut write: S, every: Duration, session: CancellationToken)
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let mut ticker = interval(every);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = session.cancelled() => break,
            _ = ticker.tick() => {
                let ping = serde_json::json!({ "method": "ping" }).to_string();
                if let Err(e) = write.send(Message::Text(ping)).await {
                    warn!(error = %e, "Keepalive failed, tearing down connection");
                    session.cancel();
                    break;
                }
            }
        }
    }

    let _ = write.close().await;
}

#[async_trait]
impl LeaderDataSource for HyperliquidStream {
    fn venue(&self) -> Venue {
        Venue::Hyperliquid
    }

    async fn get_fills(&self, leader_id: &str, since: DateTime<Utc>) -> Result<Vec<Fill>, ProviderError> {
        self.inner.rest.get_fills(leader_id, since).await
    }

    async fn get_account_state(&self, leader_id: &str) -> Result<AccountState, ProviderError> {
        if let Some(state) = self.inner.cache.read().await.get(leader_id) {
            return Ok(state.clone());
        }
        self.inner.refresh(leader_id).await
    }
}

impl StreamingSource for HyperliquidStream {
    fn subscribe(
        &self,
        leader_id: &str,
        events: mpsc::Sender<FeedEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(self.inner.clone().run(leader_id.to_string(), events, cancel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn mock_state_server(account_value: &str) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/info"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "marginSummary": { "accountValue": account_value, "totalNtlPos": "0" },
                "withdrawable": account_value,
                "assetPositions": []
            })))
            .mount(&server)
            .await;
        server
    }

    fn stream_for(server: &MockServer) -> HyperliquidStream {
        let rest = HyperliquidClient::with_base_url(server.uri()).unwrap();
        HyperliquidStream::with_ws_url(
            rest,
            "ws://127.0.0.1:1".to_string(),
            Duration::from_secs(5),
            Duration::from_secs(50),
        )
    }

    fn fills_message(is_snapshot: bool) -> String {
        serde_json::json!({
            "channel": "userFills",
            "data": {
                "isSnapshot": is_snapshot,
                "user": "0xleader",
                "fills": [{
                    "coin": "BTC", "px": "60000", "sz": "0.1", "side": "B",
                    "time": 1700000000000i64, "startPosition": "0", "dir": "Open Long",
                    "closedPnl": "0", "hash": "0x1", "tid": 7
                }]
            }
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_state_read_falls_back_to_fetch_when_cache_empty() {
        let server = mock_state_server("5000").await;
        let stream = stream_for(&server);

        let state = stream.get_account_state("0xleader").await.unwrap();
        assert_eq!(state.total_equity, dec!(5000));
        assert!(stream.inner.cache.read().await.contains_key("0xleader"));
    }

    #[tokio::test]
    async fn test_live_fill_refreshes_snapshot_before_delivery() {
        let server = mock_state_server("8000").await;
        let stream = stream_for(&server);
        let (tx, mut rx) = mpsc::channel(8);

        stream
            .inner
            .handle_text("0xleader", &fills_message(false), &tx)
            .await
            .unwrap();

        let cached = stream.inner.cache.read().await.get("0xleader").cloned();
        assert_eq!(cached.unwrap().total_equity, dec!(8000));

        match rx.try_recv().unwrap() {
            FeedEvent::Fill(fill) => {
                assert_eq!(fill.id, "7");
                assert_eq!(fill.symbol, "BTCUSDT");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_snapshot_replay_ignored() {
        let server = mock_state_server("8000").await;
        let stream = stream_for(&server);
        let (tx, mut rx) = mpsc::channel(8);

        stream
            .inner
            .handle_text("0xleader", &fills_message(true), &tx)
            .await
            .unwrap();

        assert!(rx.try_recv().is_err());
        assert!(stream.inner.cache.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_message_is_parse_error() {
        let server = mock_state_server("1").await;
        let stream = stream_for(&server);
        let (tx, _rx) = mpsc::channel(8);

        let err = stream.inner.handle_text("0xleader", "not json", &tx).await.unwrap_err();
        assert!(matches!(err, ProviderError::Parse(_)));
    }

    #[tokio::test]
    async fn test_reconnects_after_server_closes() {
        let rest = mock_state_server("9000").await;
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let ws_url = format!("ws://{}", listener.local_addr().unwrap());

        // First session is closed right after subscribing; the second delivers a fill
        let server = tokio::spawn(async move {
            for session in 0..2 {
                let (tcp, _) = listener.accept().await.unwrap();
                let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
                let subscribe = ws.next().await.unwrap().unwrap();
                assert!(subscribe.to_text().unwrap().contains("userFills"));

                if session == 0 {
                    ws.close(None).await.unwrap();
                } else {
                    ws.send(Message::Text(fills_message(false))).await.unwrap();
                    // Hold the connection open until the client goes away
                    while let Some(Ok(_)) = ws.next().await {}
                }
            }
        });

        let stream = HyperliquidStream::with_ws_url(
            HyperliquidClient::with_base_url(rest.uri()).unwrap(),
            ws_url,
            Duration::from_millis(50),
            Duration::from_secs(50),
        );
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let handle = stream.subscribe("0xleader", tx, cancel.clone());

        let mut events = Vec::new();
        while events.len() < 4 {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            events.push(event);
        }

        assert!(matches!(events[0], FeedEvent::Connected));
        assert!(matches!(events[1], FeedEvent::Disconnected(_)));
        assert!(matches!(events[2], FeedEvent::Connected));
        assert!(matches!(events[3], FeedEvent::Fill(ref fill) if fill.id == "7"));

        cancel.cancel();
        handle.await.unwrap();
        server.await.unwrap();
    }
}
