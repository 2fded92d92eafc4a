//! Shared fixtures for integration tests: an in-memory fake of the REST API,
//! a realtime WebSocket server, and a canned HTTP responder.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use futures_util::{SinkExt, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration, Instant};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

use nakupak_sync::{
    ActiveSession, Category, CheckState, EntityId, GatewayError, Item, ListItem, ListStore,
    LocalStore, MutationEngine, NewListEntry, QueueStore, RemoteGateway, SessionItem,
    SessionStore, SnapshotCache, StoreConfig,
};

/// Timestamp the fake server stamps on every check.
pub fn server_time() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 6, 15)
        .and_then(|d| d.and_hms_opt(12, 0, 0))
        .unwrap()
}

pub fn item(id: EntityId, name: &str) -> Item {
    Item {
        id,
        name: name.to_string(),
        category_id: None,
        category: None,
        created_at: None,
    }
}

pub fn category(id: EntityId, name: &str) -> Category {
    Category {
        id,
        name: name.to_string(),
        sort_order: 0,
        color: "#22c55e".to_string(),
    }
}

pub fn list_entry(id: EntityId, item_id: EntityId, quantity: f64) -> ListItem {
    ListItem {
        id,
        item_id,
        quantity,
        unit: "x".to_string(),
        checked: false,
        added_at: Some(server_time()),
        from_recipe_id: None,
        item: item(item_id, &format!("item-{item_id}")),
    }
}

pub fn session_item(id: EntityId, checked: bool) -> SessionItem {
    SessionItem {
        id,
        item_id: Some(id + 100),
        item_name: format!("line-{id}"),
        quantity: 1.0,
        unit: "x".to_string(),
        checked,
        checked_at: checked.then(server_time),
        item: None,
    }
}

pub fn session_with(ids: &[EntityId]) -> ActiveSession {
    ActiveSession {
        id: 1,
        started_at: server_time(),
        completed_at: None,
        session_items: ids.iter().map(|&id| session_item(id, false)).collect(),
    }
}

#[derive(Default)]
struct FakeState {
    offline: bool,
    list: Vec<ListItem>,
    items: Vec<Item>,
    categories: Vec<Category>,
    session: Option<ActiveSession>,
    /// Session item id -> status the toggle fails with
    failing_toggles: HashMap<EntityId, u16>,
    failing_methods: HashSet<String>,
    calls: Vec<String>,
    next_list_id: EntityId,
}

/// Holds one gateway call in flight until the test releases it.
#[derive(Default)]
pub struct Gate {
    entered: Notify,
    release: Notify,
}

impl Gate {
    /// Wait until the held call has started.
    pub async fn entered(&self) {
        tokio::time::timeout(Duration::from_secs(2), self.entered.notified())
            .await
            .expect("gated call never started");
    }

    /// Let the held call continue.
    pub fn release(&self) {
        self.release.notify_one();
    }
}

/// In-memory stand-in for the REST API with server-side semantics.
pub struct FakeGateway {
    state: Mutex<FakeState>,
    gates: Mutex<HashMap<String, Arc<Gate>>>,
}

impl FakeGateway {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                next_list_id: 1000,
                ..FakeState::default()
            }),
            gates: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_session(self, session: ActiveSession) -> Self {
        self.state.lock().unwrap().session = Some(session);
        self
    }

    pub fn with_list(self, list: Vec<ListItem>) -> Self {
        self.state.lock().unwrap().list = list;
        self
    }

    pub fn with_items(self, items: Vec<Item>) -> Self {
        self.state.lock().unwrap().items = items;
        self
    }

    pub fn with_categories(self, categories: Vec<Category>) -> Self {
        self.state.lock().unwrap().categories = categories;
        self
    }

    /// Every call fails with a transport error while offline.
    pub fn set_offline(&self, offline: bool) {
        self.state.lock().unwrap().offline = offline;
    }

    /// Toggles of this session item fail with a 500.
    pub fn fail_toggle(&self, session_item_id: EntityId) {
        self.fail_toggle_with(session_item_id, 500);
    }

    pub fn fail_toggle_with(&self, session_item_id: EntityId, status: u16) {
        self.state.lock().unwrap().failing_toggles.insert(session_item_id, status);
    }

    pub fn allow_toggle(&self, session_item_id: EntityId) {
        self.state.lock().unwrap().failing_toggles.remove(&session_item_id);
    }

    /// Every call of `method` fails with a 500.
    pub fn fail_method(&self, method: &str) {
        self.state.lock().unwrap().failing_methods.insert(method.to_string());
    }

    /// Hold the next call of `method` until the returned gate is released.
    pub fn hold(&self, method: &str) -> Arc<Gate> {
        let gate = Arc::new(Gate::default());
        self.gates
            .lock()
            .unwrap()
            .insert(method.to_string(), gate.clone());
        gate
    }

    async fn pass_gate(&self, method: &str) {
        let gate = self.gates.lock().unwrap().remove(method);
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
    }

    /// Change the server's catalogue behind the client's back.
    pub fn server_set_items(&self, items: Vec<Item>) {
        self.state.lock().unwrap().items = items;
    }

    /// Change the server's list behind the client's back.
    pub fn server_set_list(&self, list: Vec<ListItem>) {
        self.state.lock().unwrap().list = list;
    }

    /// Another device toggles a session line on the server.
    pub fn server_flip(&self, session_item_id: EntityId) {
        let mut state = self.state.lock().unwrap();
        if let Some(line) = state
            .session
            .as_mut()
            .and_then(|s| s.session_items.iter_mut().find(|i| i.id == session_item_id))
        {
            line.checked = !line.checked;
            line.checked_at = line.checked.then(server_time);
        }
    }

    /// Server-side check state of a session line.
    pub fn server_check(&self, session_item_id: EntityId) -> Option<CheckState> {
        self.state
            .lock()
            .unwrap()
            .session
            .as_ref()
            .and_then(|s| s.session_items.iter().find(|i| i.id == session_item_id))
            .map(|i| i.check_state())
    }

    pub fn server_list(&self) -> Vec<ListItem> {
        self.state.lock().unwrap().list.clone()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn call_count(&self, name: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| c.as_str() == name || c.starts_with(&format!("{name}:")))
            .count()
    }

    /// Session item ids of toggle calls, in order.
    pub fn toggle_calls(&self) -> Vec<EntityId> {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter_map(|c| c.strip_prefix("toggle_session_check:"))
            .filter_map(|id| id.parse().ok())
            .collect()
    }

    fn begin(&self, call: String) -> Result<std::sync::MutexGuard<'_, FakeState>, GatewayError> {
        let mut state = self.state.lock().unwrap();
        let method = call.split(':').next().unwrap_or_default().to_string();
        state.calls.push(call);
        if state.offline {
            return Err(GatewayError::Transport("network unreachable".into()));
        }
        if state.failing_methods.contains(&method) {
            return Err(GatewayError::Status {
                status: 500,
                message: format!("{method} rejected"),
            });
        }
        Ok(state)
    }
}

fn not_found(what: &str) -> GatewayError {
    GatewayError::Status {
        status: 404,
        message: format!("{what} not found"),
    }
}

#[async_trait]
impl RemoteGateway for FakeGateway {
    async fn fetch_list(&self) -> Result<Vec<ListItem>, GatewayError> {
        self.pass_gate("fetch_list").await;
        Ok(self.begin("fetch_list".into())?.list.clone())
    }

    async fn add_list_entries(
        &self,
        entries: &[NewListEntry],
    ) -> Result<Vec<ListItem>, GatewayError> {
        self.pass_gate("add_list_entries").await;
        let mut state = self.begin("add_list_entries".into())?;
        let mut returned = Vec::new();
        for entry in entries {
            let existing = state.list.iter().position(|e| e.item_id == entry.item_id);
            match existing {
                Some(pos) => {
                    state.list[pos].quantity += entry.quantity;
                    returned.push(state.list[pos].clone());
                }
                None => {
                    state.next_list_id += 1;
                    let mut created = list_entry(state.next_list_id, entry.item_id, entry.quantity);
                    created.unit = entry.unit.clone();
                    state.list.push(created.clone());
                    returned.push(created);
                }
            }
        }
        Ok(returned)
    }

    async fn update_list_entry(
        &self,
        id: EntityId,
        quantity: f64,
        unit: Option<&str>,
    ) -> Result<ListItem, GatewayError> {
        self.pass_gate("update_list_entry").await;
        let mut state = self.begin(format!("update_list_entry:{id}"))?;
        let entry = state
            .list
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| not_found("list entry"))?;
        entry.quantity = quantity;
        if let Some(unit) = unit {
            entry.unit = unit.to_string();
        }
        Ok(entry.clone())
    }

    async fn remove_list_entry(&self, id: EntityId) -> Result<(), GatewayError> {
        self.pass_gate("remove_list_entry").await;
        let mut state = self.begin(format!("remove_list_entry:{id}"))?;
        state.list.retain(|e| e.id != id);
        Ok(())
    }

    async fn bulk_remove_list_entries(&self, ids: &[EntityId]) -> Result<(), GatewayError> {
        self.pass_gate("bulk_remove_list_entries").await;
        let mut state = self.begin("bulk_remove_list_entries".into())?;
        state.list.retain(|e| !ids.contains(&e.id));
        Ok(())
    }

    async fn clear_list(&self) -> Result<(), GatewayError> {
        self.pass_gate("clear_list").await;
        self.begin("clear_list".into())?.list.clear();
        Ok(())
    }

    async fn purchase(&self) -> Result<(), GatewayError> {
        self.pass_gate("purchase").await;
        self.begin("purchase".into())?.list.retain(|e| !e.checked);
        Ok(())
    }

    async fn fetch_items(&self) -> Result<Vec<Item>, GatewayError> {
        self.pass_gate("fetch_items").await;
        Ok(self.begin("fetch_items".into())?.items.clone())
    }

    async fn fetch_categories(&self) -> Result<Vec<Category>, GatewayError> {
        self.pass_gate("fetch_categories").await;
        Ok(self.begin("fetch_categories".into())?.categories.clone())
    }

    async fn merge_items(
        &self,
        target: EntityId,
        sources: &[EntityId],
    ) -> Result<Item, GatewayError> {
        self.pass_gate("merge_items").await;
        let mut state = self.begin(format!("merge_items:{target}"))?;
        state.items.retain(|i| i.id == target || !sources.contains(&i.id));
        let merged = state
            .items
            .iter_mut()
            .find(|i| i.id == target)
            .ok_or_else(|| not_found("item"))?;
        merged.name = format!("{} (merged)", merged.name);
        Ok(merged.clone())
    }

    async fn bulk_delete_items(&self, ids: &[EntityId]) -> Result<(), GatewayError> {
        self.pass_gate("bulk_delete_items").await;
        let mut state = self.begin("bulk_delete_items".into())?;
        state.items.retain(|i| !ids.contains(&i.id));
        Ok(())
    }

    async fn bulk_set_category(
        &self,
        ids: &[EntityId],
        category_id: Option<EntityId>,
    ) -> Result<(), GatewayError> {
        self.pass_gate("bulk_set_category").await;
        let mut state = self.begin("bulk_set_category".into())?;
        for item in state.items.iter_mut().filter(|i| ids.contains(&i.id)) {
            item.category_id = category_id;
        }
        Ok(())
    }

    async fn fetch_active_session(&self) -> Result<Option<ActiveSession>, GatewayError> {
        self.pass_gate("fetch_active_session").await;
        Ok(self.begin("fetch_active_session".into())?.session.clone())
    }

    async fn start_session(&self) -> Result<ActiveSession, GatewayError> {
        self.pass_gate("start_session").await;
        let mut state = self.begin("start_session".into())?;
        if let Some(active) = &state.session {
            return Ok(active.clone());
        }
        let session = ActiveSession {
            id: 1,
            started_at: server_time(),
            completed_at: None,
            session_items: state
                .list
                .iter()
                .map(|e| SessionItem {
                    id: e.id,
                    item_id: Some(e.item_id),
                    item_name: e.item.name.clone(),
                    quantity: e.quantity,
                    unit: e.unit.clone(),
                    checked: false,
                    checked_at: None,
                    item: Some(e.item.clone()),
                })
                .collect(),
        };
        state.session = Some(session.clone());
        Ok(session)
    }

    async fn toggle_session_check(
        &self,
        session_item_id: EntityId,
    ) -> Result<CheckState, GatewayError> {
        self.pass_gate("toggle_session_check").await;
        let mut state = self.begin(format!("toggle_session_check:{session_item_id}"))?;
        if let Some(&status) = state.failing_toggles.get(&session_item_id) {
            return Err(GatewayError::Status {
                status,
                message: "toggle rejected".into(),
            });
        }
        let line = state
            .session
            .as_mut()
            .and_then(|s| s.session_items.iter_mut().find(|i| i.id == session_item_id))
            .ok_or_else(|| not_found("session item"))?;
        line.checked = !line.checked;
        line.checked_at = line.checked.then(server_time);
        Ok(line.check_state())
    }

    async fn complete_session(&self) -> Result<(), GatewayError> {
        self.pass_gate("complete_session").await;
        self.begin("complete_session".into())?.session = None;
        Ok(())
    }

    async fn abort_session(&self) -> Result<(), GatewayError> {
        self.pass_gate("abort_session").await;
        self.begin("abort_session".into())?.session = None;
        Ok(())
    }
}

/// Engine components wired over a fake gateway and a temp RocksDB.
pub struct Harness {
    pub gateway: Arc<FakeGateway>,
    pub queue: Arc<QueueStore>,
    pub session: Arc<SessionStore>,
    pub list: Arc<ListStore>,
    pub mutations: MutationEngine,
    pub dir: TempDir,
}

impl Harness {
    /// Wire the components and load the fake server's state.
    pub async fn new(gateway: FakeGateway) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LocalStore::new(StoreConfig::for_testing(dir.path().join("db"))));
        let queue = Arc::new(QueueStore::new(store.clone()));
        let session = Arc::new(SessionStore::with_snapshots(Arc::new(SnapshotCache::new(
            store,
        ))));
        let list = Arc::new(ListStore::new());
        let gateway = Arc::new(gateway);

        let mutations = MutationEngine::new(
            gateway.clone(),
            queue.clone(),
            session.clone(),
            list.clone(),
        );
        session.refresh(gateway.as_ref()).await.unwrap();
        list.refresh_all(gateway.as_ref()).await.unwrap();

        Self {
            gateway,
            queue,
            session,
            list,
            mutations,
            dir,
        }
    }
}

/// Find a free port for testing.
pub async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Poll a synchronous condition until it holds or `within` elapses.
pub async fn wait_for(within: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + within;
    while !check() {
        if Instant::now() >= deadline {
            return false;
        }
        sleep(Duration::from_millis(10)).await;
    }
    true
}

/// Poll an async condition until it holds or `within` elapses.
pub async fn eventually<F, Fut>(within: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = Instant::now() + within;
    loop {
        if check().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(Duration::from_millis(10)).await;
    }
}

#[derive(Debug, Clone)]
enum Push {
    Text(String),
    Close,
}

/// Realtime endpoint that records handshakes and pushes frames on demand.
pub struct TestWsServer {
    pub port: u16,
    handshakes: Arc<AtomicUsize>,
    tokens: Arc<Mutex<Vec<String>>>,
    push: broadcast::Sender<Push>,
    accept_task: JoinHandle<()>,
}

impl TestWsServer {
    pub async fn start() -> Self {
        Self::start_on(0).await
    }

    /// Start on a specific port (0 picks a free one).
    pub async fn start_on(port: u16) -> Self {
        let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handshakes = Arc::new(AtomicUsize::new(0));
        let tokens = Arc::new(Mutex::new(Vec::new()));
        let (push, _) = broadcast::channel(16);

        let accept_task = {
            let handshakes = handshakes.clone();
            let tokens = tokens.clone();
            let push = push.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let handshakes = handshakes.clone();
                    let tokens = tokens.clone();
                    let mut push_rx = push.subscribe();
                    tokio::spawn(async move {
                        let callback = |req: &Request, resp: Response| {
                            let token = req
                                .uri()
                                .query()
                                .and_then(|q| q.strip_prefix("token="))
                                .unwrap_or_default()
                                .to_string();
                            tokens.lock().unwrap().push(token);
                            Ok::<Response, ErrorResponse>(resp)
                        };
                        let Ok(mut ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await
                        else {
                            return;
                        };
                        handshakes.fetch_add(1, Ordering::SeqCst);
                        loop {
                            tokio::select! {
                                msg = ws.next() => match msg {
                                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                                    _ => {}
                                },
                                push = push_rx.recv() => match push {
                                    Ok(Push::Text(text)) => {
                                        if ws.send(Message::text(text)).await.is_err() {
                                            break;
                                        }
                                    }
                                    Ok(Push::Close) | Err(_) => {
                                        let _ = ws.close(None).await;
                                        break;
                                    }
                                },
                            }
                        }
                    });
                }
            })
        };

        Self {
            port,
            handshakes,
            tokens,
            push,
            accept_task,
        }
    }

    pub fn api_base(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    pub fn handshakes(&self) -> usize {
        self.handshakes.load(Ordering::SeqCst)
    }

    pub fn tokens(&self) -> Vec<String> {
        self.tokens.lock().unwrap().clone()
    }

    /// Send a text frame to every open connection.
    pub fn push_text(&self, text: &str) {
        let _ = self.push.send(Push::Text(text.to_string()));
    }

    /// Close every open connection from the server side.
    pub fn close_all(&self) {
        let _ = self.push.send(Push::Close);
    }

    /// Stop accepting new connections.
    pub fn stop_accepting(&self) {
        self.accept_task.abort();
    }
}

impl Drop for TestWsServer {
    fn drop(&mut self) {
        self.accept_task.abort();
        let _ = self.push.send(Push::Close);
    }
}

/// A request captured by [`serve_http`].
#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub head: String,
    pub body: String,
}

impl CapturedRequest {
    pub fn request_line(&self) -> &str {
        self.head.lines().next().unwrap_or_default()
    }

    pub fn header(&self, name: &str) -> Option<String> {
        self.head.lines().skip(1).find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.trim()
                .eq_ignore_ascii_case(name)
                .then(|| value.trim().to_string())
        })
    }
}

/// HTTP server answering each connection with the next canned response.
pub async fn serve_http(
    responses: Vec<(u16, &'static str)>,
) -> (String, Arc<Mutex<Vec<CapturedRequest>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let captured = Arc::new(Mutex::new(Vec::new()));

    let log = captured.clone();
    tokio::spawn(async move {
        for (status, body) in responses {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };

            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            let head_end = loop {
                let n = stream.read(&mut chunk).await.unwrap_or(0);
                if n == 0 {
                    break None;
                }
                buf.extend_from_slice(&chunk[..n]);
                if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                    break Some(pos);
                }
            };
            let Some(head_end) = head_end else {
                continue;
            };
            let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
            let content_length = CapturedRequest {
                head: head.clone(),
                body: String::new(),
            }
                .header("content-length")
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(0);
            while buf.len() < head_end + 4 + content_length {
                let n = stream.read(&mut chunk).await.unwrap_or(0);
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
            }
            let body_end = buf.len().min(head_end + 4 + content_length);
            let request_body = String::from_utf8_lossy(&buf[head_end + 4..body_end]).to_string();
            log.lock().unwrap().push(CapturedRequest {
                head,
                body: request_body,
            });

            let reason = match status {
                200 => "OK",
                401 => "Unauthorized",
                404 => "Not Found",
                _ => "Error",
            };
            let response = format!(
                "HTTP/1.1 {status} {reason}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.shutdown().await;
        }
    });

    (format!("http://127.0.0.1:{port}"), captured)
}
