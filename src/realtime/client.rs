use super::events::{
    Envelope, SendFailValue, EVENT_ACK, EVENT_MSG_END, EVENT_MSG_START, EVENT_PARA_CHUNK,
    EVENT_PARA_END, EVENT_PARA_START, EVENT_SEND_FAIL, MAX_ACTIVE_MESSAGES, MAX_CHUNK_SIZE,
    MAX_MESSAGE_SIZE, MAX_PARAGRAPHS,
};
use super::hub::{Hub, PeerHandle, OUTBOUND_QUEUE_SIZE};
use crate::limit::ConnLimiter;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use hyper::upgrade::Upgraded;
use hyper_tungstenite::tungstenite::Message;
use hyper_tungstenite::WebSocketStream;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Notify};
use tokio::time::{interval_at, timeout, Duration, Instant};

const WRITE_WAIT: Duration = Duration::from_secs(10);
const PONG_WAIT: Duration = Duration::from_secs(60);
const PING_PERIOD: Duration = Duration::from_secs(54);
const EVENTS_PER_SEC: f64 = 20.0;
const EVENT_BURST: f64 = 20.0;

/// Outcome of running one inbound frame through the message ledger.
#[derive(Debug, PartialEq, Eq)]
pub enum Disposition {
    /// Forward the raw frame to the peer.
    Forward,
    /// Discard the state and tell the sender (and only the sender) why.
    Fail(&'static str),
    /// Drop the frame silently.
    Ignore,
}

#[derive(Debug)]
struct MessageState {
    para_count: i64,
    total_bytes: usize,
    current_para: i64,
}

/// Per-connection bookkeeping that enforces the streaming bounds while the
/// chunk text itself flows through untouched. One ledger per connection,
/// touched only by that connection's read task.
#[derive(Debug, Default)]
pub struct MessageLedger {
    active: HashMap<String, MessageState>,
}

impl MessageLedger {
    /// Allocate state for a new message. Duplicate ids and ids beyond the
    /// per-connection cap are rejected without feedback.
    pub fn start(&mut self, msg_id: &str) -> Disposition {
        if self.active.contains_key(msg_id) || self.active.len() >= MAX_ACTIVE_MESSAGES {
            return Disposition::Ignore;
        }
        self.active.insert(
            msg_id.to_string(),
            MessageState {
                para_count: 0,
                total_bytes: 0,
                current_para: -1,
            },
        );
        Disposition::Forward
    }

    pub fn para_start(&mut self, msg_id: &str, index: i64) -> Disposition {
        let Some(state) = self.active.get_mut(msg_id) else {
            return Disposition::Ignore;
        };
        if index >= MAX_PARAGRAPHS {
            self.active.remove(msg_id);
            return Disposition::Fail("max_paragraphs_exceeded");
        }
        state.current_para = index;
        state.para_count += 1;
        Disposition::Forward
    }

    pub fn para_chunk(&mut self, msg_id: &str, chunk_len: usize) -> Disposition {
        let Some(state) = self.active.get_mut(msg_id) else {
            return Disposition::Ignore;
        };
        if chunk_len > MAX_CHUNK_SIZE {
            debug!(
                "chunk of {} bytes rejected in paragraph {}",
                chunk_len, state.current_para
            );
            self.active.remove(msg_id);
            return Disposition::Fail("chunk_too_large");
        }
        state.total_bytes += chunk_len;
        if state.total_bytes > MAX_MESSAGE_SIZE {
            self.active.remove(msg_id);
            return Disposition::Fail("message_too_large");
        }
        Disposition::Forward
    }

    pub fn para_end(&mut self, msg_id: &str) -> Disposition {
        let Some(state) = self.active.get_mut(msg_id) else {
            return Disposition::Ignore;
        };
        state.current_para = -1;
        Disposition::Forward
    }

    pub fn end(&mut self, msg_id: &str) -> Disposition {
        match self.active.remove(msg_id) {
            Some(state) => {
                debug!(
                    "message relayed: {} paragraphs, {} bytes",
                    state.para_count, state.total_bytes
                );
                Disposition::Forward
            }
            None => Disposition::Ignore,
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}

#[derive(Debug)]
struct EventBucket {
    tokens: f64,
    last_refill: Instant,
}

impl EventBucket {
    fn new() -> Self {
        Self {
            tokens: EVENT_BURST,
            last_refill: Instant::now(),
        }
    }

    fn allow(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * EVENTS_PER_SEC).min(EVENT_BURST);
        self.last_refill = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

struct Client {
    hub: Arc<Hub>,
    conn_id: u64,
    client_id: String,
    outbound: mpsc::Sender<String>,
    ledger: Mutex<MessageLedger>,
    events: Mutex<EventBucket>,
}

impl Client {
    async fn handle_frame(&self, raw: &str) {
        let Ok(event) = Envelope::parse(raw) else {
            debug!("dropping unparseable frame from {}", self.client_id);
            return;
        };

        match event.t.as_str() {
            EVENT_MSG_START => {
                let Some(msg_id) = event.msg_id() else {
                    return;
                };
                if !self.hub.has_peer(self.conn_id).await {
                    self.send_fail(msg_id, "peer_offline");
                    return;
                }
                let disposition = self.ledger.lock().unwrap().start(msg_id);
                self.apply(disposition, msg_id, raw).await;
            }
            EVENT_PARA_START => {
                let Some(msg_id) = event.msg_id() else {
                    return;
                };
                let disposition = self
                    .ledger
                    .lock()
                    .unwrap()
                    .para_start(msg_id, event.para_index());
                self.apply(disposition, msg_id, raw).await;
            }
            EVENT_PARA_CHUNK => {
                let Some(msg_id) = event.msg_id() else {
                    return;
                };
                let disposition = self
                    .ledger
                    .lock()
                    .unwrap()
                    .para_chunk(msg_id, event.chunk_text().len());
                self.apply(disposition, msg_id, raw).await;
            }
            EVENT_PARA_END => {
                let Some(msg_id) = event.msg_id() else {
                    return;
                };
                let disposition = self.ledger.lock().unwrap().para_end(msg_id);
                self.apply(disposition, msg_id, raw).await;
            }
            EVENT_MSG_END => {
                let Some(msg_id) = event.msg_id() else {
                    return;
                };
                let disposition = self.ledger.lock().unwrap().end(msg_id);
                self.apply(disposition, msg_id, raw).await;
            }
            EVENT_ACK => {
                // Receiver-to-sender receipt, forwarded without validation.
                self.hub.send_to_peer(self.conn_id, raw).await;
            }
            _ => {}
        }
    }

    async fn apply(&self, disposition: Disposition, msg_id: &str, raw: &str) {
        match disposition {
            Disposition::Forward => {
                self.hub.send_to_peer(self.conn_id, raw).await;
            }
            Disposition::Fail(reason) => self.send_fail(msg_id, reason),
            Disposition::Ignore => {}
        }
    }

    /// Violations are reported to the offending sender only; the peer never
    /// hears about them.
    fn send_fail(&self, msg_id: &str, reason: &str) {
        let event = Envelope::new(
            EVENT_SEND_FAIL,
            SendFailValue {
                msg_id: msg_id.to_string(),
                reason: reason.to_string(),
            },
        );
        if let Ok(frame) = event.marshal() {
            let _ = self.outbound.try_send(frame);
        }
    }
}

/// Drive one upgraded connection to completion: register with the hub, run
/// the write pump on its own task, loop reads until the socket closes or a
/// limit trips, then unwind membership and the connection slot.
pub async fn run_connection(
    ws: WebSocketStream<Upgraded>,
    hub: Arc<Hub>,
    client_id: String,
    ip: String,
    conn_limiter: Arc<ConnLimiter>,
) {
    let conn_id = hub.next_conn_id();
    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_SIZE);
    let closed = Arc::new(Notify::new());

    let (ws_sink, mut ws_stream) = ws.split();
    let client = Client {
        hub: Arc::clone(&hub),
        conn_id,
        client_id: client_id.clone(),
        outbound: outbound_tx.clone(),
        ledger: Mutex::new(MessageLedger::default()),
        events: Mutex::new(EventBucket::new()),
    };

    hub.register(PeerHandle::new(
        conn_id,
        client_id.clone(),
        outbound_tx,
        Arc::clone(&closed),
    ))
    .await;

    let mut write_task = tokio::spawn(write_pump(ws_sink, outbound_rx, closed));

    loop {
        tokio::select! {
            next = timeout(PONG_WAIT, ws_stream.next()) => {
                match next {
                    // Read deadline: no frame (not even a pong) in time.
                    Err(_) => break,
                    Ok(None) => break,
                    Ok(Some(Err(e))) => {
                        debug!("socket error from {}: {}", client_id, e);
                        break;
                    }
                    Ok(Some(Ok(Message::Text(text)))) => {
                        if !client.events.lock().unwrap().allow() {
                            info!("event rate limit exceeded for {}", client_id);
                            break;
                        }
                        client.handle_frame(&text).await;
                    }
                    Ok(Some(Ok(Message::Close(_)))) => break,
                    // Pings are answered by the protocol layer; pongs renew
                    // the deadline simply by arriving.
                    Ok(Some(Ok(_))) => {}
                }
            }
            _ = &mut write_task => break,
        }
    }

    conn_limiter.release(&ip);
    hub.unregister(conn_id).await;
    write_task.abort();
}

async fn write_pump(
    mut sink: SplitSink<WebSocketStream<Upgraded>, Message>,
    mut outbound: mpsc::Receiver<String>,
    closed: Arc<Notify>,
) {
    let mut ping = interval_at(Instant::now() + PING_PERIOD, PING_PERIOD);

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                match frame {
                    Some(frame) => {
                        // Coalesce whatever is immediately queueable into one
                        // frame; the browser splits on '\n'.
                        let mut payload = frame;
                        while let Ok(extra) = outbound.try_recv() {
                            payload.push('\n');
                            payload.push_str(&extra);
                        }
                        if write_frame(&mut sink, Message::Text(payload)).await.is_err() {
                            return;
                        }
                    }
                    None => {
                        let _ = write_frame(&mut sink, Message::Close(None)).await;
                        return;
                    }
                }
            }
            _ = ping.tick() => {
                if write_frame(&mut sink, Message::Ping(Vec::new())).await.is_err() {
                    warn!("ping failed, closing writer");
                    return;
                }
            }
            _ = closed.notified() => {
                // The hub closed this queue: drain what was already accepted,
                // then say goodbye.
                while let Ok(extra) = outbound.try_recv() {
                    if write_frame(&mut sink, Message::Text(extra)).await.is_err() {
                        return;
                    }
                }
                let _ = write_frame(&mut sink, Message::Close(None)).await;
                return;
            }
        }
    }
}

async fn write_frame(
    sink: &mut SplitSink<WebSocketStream<Upgraded>, Message>,
    message: Message,
) -> Result<(), ()> {
    match timeout(WRITE_WAIT, sink.send(message)).await {
        Ok(Ok(())) => Ok(()),
        _ => Err(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_boundaries() {
        let mut ledger = MessageLedger::default();
        assert_eq!(ledger.start("m1"), Disposition::Forward);
        assert_eq!(ledger.para_start("m1", 0), Disposition::Forward);

        assert_eq!(ledger.para_chunk("m1", MAX_CHUNK_SIZE), Disposition::Forward);
        assert_eq!(
            ledger.para_chunk("m1", MAX_CHUNK_SIZE + 1),
            Disposition::Fail("chunk_too_large")
        );
        // State was discarded: further frames for m1 are ignored.
        assert_eq!(ledger.para_chunk("m1", 1), Disposition::Ignore);
        assert_eq!(ledger.end("m1"), Disposition::Ignore);
        // A fresh message still works on the same connection.
        assert_eq!(ledger.start("m2"), Disposition::Forward);
    }

    #[test]
    fn total_byte_boundary() {
        let mut ledger = MessageLedger::default();
        ledger.start("m1");
        ledger.para_start("m1", 0);

        // 64 chunks of 4 KiB land exactly on the 256 KiB cap.
        for _ in 0..MAX_MESSAGE_SIZE / MAX_CHUNK_SIZE {
            assert_eq!(ledger.para_chunk("m1", MAX_CHUNK_SIZE), Disposition::Forward);
        }
        assert_eq!(
            ledger.para_chunk("m1", 1),
            Disposition::Fail("message_too_large")
        );
        assert_eq!(ledger.active_count(), 0);
    }

    #[test]
    fn paragraph_index_boundary() {
        let mut ledger = MessageLedger::default();
        ledger.start("m1");
        assert_eq!(
            ledger.para_start("m1", MAX_PARAGRAPHS - 1),
            Disposition::Forward
        );
        assert_eq!(
            ledger.para_start("m1", MAX_PARAGRAPHS),
            Disposition::Fail("max_paragraphs_exceeded")
        );
        assert_eq!(ledger.active_count(), 0);
    }

    #[test]
    fn duplicate_and_capped_starts_are_silent() {
        let mut ledger = MessageLedger::default();
        assert_eq!(ledger.start("m1"), Disposition::Forward);
        assert_eq!(ledger.start("m1"), Disposition::Ignore);

        for i in 1..MAX_ACTIVE_MESSAGES {
            assert_eq!(ledger.start(&format!("extra-{i}")), Disposition::Forward);
        }
        assert_eq!(ledger.active_count(), MAX_ACTIVE_MESSAGES);
        assert_eq!(ledger.start("one-too-many"), Disposition::Ignore);

        // Ending one frees a slot.
        assert_eq!(ledger.end("m1"), Disposition::Forward);
        assert_eq!(ledger.start("one-too-many"), Disposition::Forward);
    }

    #[test]
    fn frames_for_unknown_ids_are_ignored() {
        let mut ledger = MessageLedger::default();
        assert_eq!(ledger.para_start("ghost", 0), Disposition::Ignore);
        assert_eq!(ledger.para_chunk("ghost", 10), Disposition::Ignore);
        assert_eq!(ledger.para_end("ghost"), Disposition::Ignore);
        assert_eq!(ledger.end("ghost"), Disposition::Ignore);
    }

    #[test]
    fn full_stream_sequence() {
        let mut ledger = MessageLedger::default();
        assert_eq!(ledger.start("m1"), Disposition::Forward);
        assert_eq!(ledger.para_start("m1", 0), Disposition::Forward);
        assert_eq!(ledger.para_chunk("m1", 6), Disposition::Forward);
        assert_eq!(ledger.para_chunk("m1", 5), Disposition::Forward);
        assert_eq!(ledger.para_end("m1"), Disposition::Forward);
        assert_eq!(ledger.para_start("m1", 1), Disposition::Forward);
        assert_eq!(ledger.para_end("m1"), Disposition::Forward);
        assert_eq!(ledger.end("m1"), Disposition::Forward);
        assert_eq!(ledger.active_count(), 0);
    }

    #[test]
    fn event_bucket_allows_burst_then_blocks() {
        let mut bucket = EventBucket::new();
        for _ in 0..EVENT_BURST as usize {
            assert!(bucket.allow());
        }
        assert!(!bucket.allow());
    }
}
