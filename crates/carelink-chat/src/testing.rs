//! In-process fakes for coordinator and session tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};

use carelink_common::models::ChannelSnapshot;

use crate::error::{ChatError, Result};
use crate::protocol::{OutboundEvent, TransportEvent};
use crate::rest::{ChatApi, FileUpload, MessagePage, SavedFile};
use crate::transport::ChatTransport;

/// Records emitted events; tests inject inbound events through `inject`.
pub struct FakeTransport {
    connected: AtomicBool,
    destroyed: AtomicBool,
    connects: AtomicUsize,
    emitted: Mutex<Vec<(OutboundEvent, Value)>>,
    feed: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
    events: broadcast::Sender<TransportEvent>,
}

impl FakeTransport {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            connected: AtomicBool::new(true),
            destroyed: AtomicBool::new(false),
            connects: AtomicUsize::new(0),
            emitted: Mutex::new(Vec::new()),
            feed: Mutex::new(None),
            events,
        }
    }

    pub fn inject(&self, event: TransportEvent) {
        if let Some(feed) = self.feed.lock().unwrap().as_ref() {
            let _ = feed.send(event.clone());
        }
        let _ = self.events.send(event);
    }

    pub fn emitted(&self) -> Vec<(OutboundEvent, Value)> {
        self.emitted.lock().unwrap().clone()
    }

    pub fn emitted_of(&self, event: OutboundEvent) -> Vec<Value> {
        self.emitted()
            .into_iter()
            .filter(|(e, _)| *e == event)
            .map(|(_, payload)| payload)
            .collect()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatTransport for FakeTransport {
    async fn connect(&self) -> Result<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn emit_event(&self, event: OutboundEvent, payload: Value) {
        if self.is_connected() {
            self.emitted.lock().unwrap().push((event, payload));
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    fn feed(&self) -> mpsc::UnboundedReceiver<TransportEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.feed.lock().unwrap() = Some(tx);
        rx
    }

    fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
    }
}

/// Canned REST responses keyed by channel id.
#[derive(Default)]
pub struct FakeApi {
    pub snapshots: Mutex<HashMap<String, ChannelSnapshot>>,
    pub pages: Mutex<HashMap<(String, u32), MessagePage>>,
    pub upload_seq: Mutex<Option<u64>>,
    pub uploads: Mutex<Vec<FileUpload>>,
}

impl FakeApi {
    pub fn with_snapshot(self, channel_id: &str, snapshot: ChannelSnapshot) -> Self {
        self.snapshots.lock().unwrap().insert(channel_id.to_owned(), snapshot);
        self
    }

    pub fn with_page(self, channel_id: &str, paging_key: u32, page: MessagePage) -> Self {
        self.pages
            .lock()
            .unwrap()
            .insert((channel_id.to_owned(), paging_key), page);
        self
    }

    pub fn with_upload_seq(self, seq: u64) -> Self {
        *self.upload_seq.lock().unwrap() = Some(seq);
        self
    }
}

#[async_trait]
impl ChatApi for FakeApi {
    async fn channel_info(&self, channel_id: &str) -> Result<ChannelSnapshot> {
        self.snapshots
            .lock()
            .unwrap()
            .get(channel_id)
            .cloned()
            .ok_or(ChatError::Api {
                code: 404,
                message: "NOT_FOUND_CHANNEL".into(),
            })
    }

    async fn message_page(
        &self,
        channel_id: &str,
        paging_key: u32,
        _page_size: u32,
    ) -> Result<MessagePage> {
        Ok(self
            .pages
            .lock()
            .unwrap()
            .get(&(channel_id.to_owned(), paging_key))
            .cloned()
            .unwrap_or_default())
    }

    async fn save_message_file(&self, upload: FileUpload) -> Result<SavedFile> {
        self.uploads.lock().unwrap().push(upload);
        match *self.upload_seq.lock().unwrap() {
            Some(message_seq) => Ok(SavedFile {
                attach_file_idx: Some("f-1".into()),
                message_seq,
            }),
            None => Err(ChatError::NotConnected),
        }
    }
}
