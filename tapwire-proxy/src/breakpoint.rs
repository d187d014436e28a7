use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use serde::Deserialize;
use tapwire_net::{HeaderList, ResponseHead, parse_request_head, parse_response_head};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::context::ExchangeContext;
use crate::exchange::{Body, Exchange};
use crate::rules::FilterScope;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BreakPointLocation {
    ConnectionSetup,
    RequestHeader,
    ResponseHeader,
    EndPoint,
}

impl BreakPointLocation {
    pub const ALL: [BreakPointLocation; 4] = [
        BreakPointLocation::ConnectionSetup,
        BreakPointLocation::RequestHeader,
        BreakPointLocation::ResponseHeader,
        BreakPointLocation::EndPoint,
    ];

    fn index(self) -> usize {
        match self {
            BreakPointLocation::ConnectionSetup => 0,
            BreakPointLocation::RequestHeader => 1,
            BreakPointLocation::ResponseHeader => 2,
            BreakPointLocation::EndPoint => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakPointStatus {
    NotRun,
    Running,
    Finished,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionSetupModel {
    pub ip: Option<String>,
    pub port: Option<u16>,
    pub skip_remote_certificate_validation: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyEdit {
    Unchanged,
    Text(String),
    File(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestEditModel {
    pub flat_header: String,
    pub body: BodyEdit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseEditModel {
    pub flat_header: String,
    pub body: BodyEdit,
}

/// Editable view of an exchange at one suspension point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakPointModel {
    ConnectionSetup(ConnectionSetupModel),
    Request(RequestEditModel),
    Response(ResponseEditModel),
    EndPoint,
}

impl BreakPointModel {
    pub fn location(&self) -> BreakPointLocation {
        match self {
            BreakPointModel::ConnectionSetup(_) => BreakPointLocation::ConnectionSetup,
            BreakPointModel::Request(_) => BreakPointLocation::RequestHeader,
            BreakPointModel::Response(_) => BreakPointLocation::ResponseHeader,
            BreakPointModel::EndPoint => BreakPointLocation::EndPoint,
        }
    }

    /// Normalizes line endings and checks the model can be applied.
    pub fn validate(&mut self) -> Result<(), EditError> {
        let mut messages = Vec::new();
        match self {
            BreakPointModel::ConnectionSetup(model) => {
                if let Some(ip) = model.ip.as_deref() {
                    if ip.parse::<IpAddr>().is_err() {
                        messages.push(format!("{ip:?} is not an IP address"));
                    }
                }
                if model.port == Some(0) {
                    messages.push("port must be between 1 and 65535".to_string());
                }
            }
            BreakPointModel::Request(model) => {
                model.flat_header = normalize_header(&model.flat_header);
                if let Err(err) = parse_request_head(model.flat_header.as_bytes()) {
                    messages.push(format!("invalid request header: {err}"));
                }
                check_body(&model.body, &mut messages);
            }
            BreakPointModel::Response(model) => {
                model.flat_header = normalize_header(&model.flat_header);
                if let Err(err) = parse_response_head(model.flat_header.as_bytes()) {
                    messages.push(format!("invalid response header: {err}"));
                }
                check_body(&model.body, &mut messages);
            }
            BreakPointModel::EndPoint => {}
        }
        if messages.is_empty() {
            Ok(())
        } else {
            Err(EditError { messages })
        }
    }
}

fn normalize_header(flat: &str) -> String {
    let unified = flat.replace("\r\n", "\n");
    let trimmed = unified.trim_end_matches('\n');
    format!("{}\r\n\r\n", trimmed.replace('\n', "\r\n"))
}

fn check_body(body: &BodyEdit, messages: &mut Vec<String>) {
    if let BodyEdit::File(path) = body {
        if !path.is_file() {
            messages.push(format!("body file {} does not exist", path.display()));
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid breakpoint edit: {}", messages.join("; "))]
pub struct EditError {
    pub messages: Vec<String>,
}

impl EditError {
    fn single(message: impl Into<String>) -> Self {
        Self {
            messages: vec![message.into()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakPointEvent {
    pub exchange_id: u64,
    pub location: BreakPointLocation,
    pub status: BreakPointStatus,
    pub snapshot: Option<BreakPointModel>,
}

type Resolution = Option<BreakPointModel>;

#[derive(Debug)]
struct SuspensionPoint {
    status: Mutex<BreakPointStatus>,
    sender: Mutex<Option<oneshot::Sender<Resolution>>>,
    receiver: Mutex<Option<oneshot::Receiver<Resolution>>>,
}

impl SuspensionPoint {
    fn new() -> Self {
        let (sender, receiver) = oneshot::channel();
        Self {
            status: Mutex::new(BreakPointStatus::NotRun),
            sender: Mutex::new(Some(sender)),
            receiver: Mutex::new(Some(receiver)),
        }
    }

    fn resolve(&self, resolution: Resolution) -> bool {
        let Some(sender) = lock(&self.sender).take() else {
            return false;
        };
        let _ = sender.send(resolution);
        true
    }
}

/// Suspension points of one exchange. Created the first time a breakpoint
/// action fires and kept for the rest of the exchange.
#[derive(Debug)]
pub struct BreakPointContext {
    exchange_id: u64,
    skip: HashSet<BreakPointLocation>,
    current_scope: Mutex<FilterScope>,
    points: [SuspensionPoint; 4],
    events: Option<mpsc::Sender<BreakPointEvent>>,
    token: CancellationToken,
}

impl BreakPointContext {
    fn new(
        exchange_id: u64,
        scope: FilterScope,
        skip: &[BreakPointLocation],
        events: Option<mpsc::Sender<BreakPointEvent>>,
        token: CancellationToken,
    ) -> Self {
        Self {
            exchange_id,
            skip: skip.iter().copied().collect(),
            current_scope: Mutex::new(scope),
            points: [
                SuspensionPoint::new(),
                SuspensionPoint::new(),
                SuspensionPoint::new(),
                SuspensionPoint::new(),
            ],
            events,
            token,
        }
    }

    pub fn exchange_id(&self) -> u64 {
        self.exchange_id
    }

    pub fn current_scope(&self) -> FilterScope {
        *lock(&self.current_scope)
    }

    pub fn is_armed(&self, location: BreakPointLocation) -> bool {
        !self.skip.contains(&location)
    }

    pub fn status(&self, location: BreakPointLocation) -> BreakPointStatus {
        *lock(&self.point(location).status)
    }

    /// Resolves one point. Only the first resolution counts. Edits must
    /// already be validated; controllers go through
    /// [`BreakPointManager::resolve`].
    pub(crate) fn resolve(
        &self,
        location: BreakPointLocation,
        resolution: Option<BreakPointModel>,
    ) -> bool {
        self.point(location).resolve(resolution)
    }

    pub fn continue_all(&self) {
        for location in BreakPointLocation::ALL {
            self.resolve(location, None);
        }
    }

    /// Suspends until the point is resolved, then hands `apply` either the
    /// edited model or the original snapshot. The point ends `Finished` on
    /// every path, cancellation included.
    pub async fn wait_for_edit<F>(
        &self,
        snapshot: BreakPointModel,
        apply: F,
    ) -> Result<(), EditError>
    where
        F: FnOnce(BreakPointModel) -> Result<(), EditError>,
    {
        let location = snapshot.location();
        if !self.is_armed(location) {
            return Ok(());
        }
        let Some(receiver) = lock(&self.point(location).receiver).take() else {
            return Ok(());
        };

        *lock(&self.point(location).status) = BreakPointStatus::Running;
        let _finish = FinishGuard {
            context: self,
            location,
        };
        if !self.announce(location, snapshot.clone()).await {
            return apply(snapshot);
        }

        let edited = tokio::select! {
            resolution = receiver => resolution.ok().flatten(),
            _ = self.token.cancelled() => None,
        };
        apply(edited.unwrap_or(snapshot))
    }

    fn point(&self, location: BreakPointLocation) -> &SuspensionPoint {
        &self.points[location.index()]
    }

    /// Delivers the `Running` event, waiting for room in the channel. Returns
    /// `false` when no controller can ever see the point: the listener is
    /// gone or shutdown started.
    async fn announce(&self, location: BreakPointLocation, snapshot: BreakPointModel) -> bool {
        let Some(events) = &self.events else {
            return true;
        };
        let event = BreakPointEvent {
            exchange_id: self.exchange_id,
            location,
            status: BreakPointStatus::Running,
            snapshot: Some(snapshot),
        };
        let delivered = tokio::select! {
            sent = events.send(event) => sent.is_ok(),
            _ = self.token.cancelled() => false,
        };
        if !delivered {
            tracing::debug!(
                exchange_id = self.exchange_id,
                ?location,
                "no breakpoint listener, continuing"
            );
        }
        delivered
    }

    /// Status notification that never blocks; the point is already settled.
    fn notify_finished(&self, location: BreakPointLocation) {
        let Some(events) = &self.events else {
            return;
        };
        let event = BreakPointEvent {
            exchange_id: self.exchange_id,
            location,
            status: BreakPointStatus::Finished,
            snapshot: None,
        };
        if events.try_send(event).is_err() {
            tracing::debug!(
                exchange_id = self.exchange_id,
                ?location,
                "breakpoint listener not keeping up, finish event dropped"
            );
        }
    }
}

struct FinishGuard<'a> {
    context: &'a BreakPointContext,
    location: BreakPointLocation,
}

impl Drop for FinishGuard<'_> {
    fn drop(&mut self) {
        *lock(&self.context.point(self.location).status) = BreakPointStatus::Finished;
        self.context.notify_finished(self.location);
    }
}

/// Registry of live breakpoint contexts keyed by exchange id.
#[derive(Debug)]
pub struct BreakPointManager {
    contexts: Mutex<HashMap<u64, Arc<BreakPointContext>>>,
    events: Option<mpsc::Sender<BreakPointEvent>>,
    token: CancellationToken,
}

impl BreakPointManager {
    pub fn new(token: CancellationToken, events: Option<mpsc::Sender<BreakPointEvent>>) -> Self {
        Self {
            contexts: Mutex::new(HashMap::new()),
            events,
            token,
        }
    }

    /// Returns the exchange's context, creating it on first use. The scope is
    /// overwritten on every call.
    pub fn get_or_create(
        &self,
        exchange_id: u64,
        scope: FilterScope,
        skip: &[BreakPointLocation],
    ) -> Arc<BreakPointContext> {
        let mut contexts = lock(&self.contexts);
        let context = contexts.entry(exchange_id).or_insert_with(|| {
            Arc::new(BreakPointContext::new(
                exchange_id,
                scope,
                skip,
                self.events.clone(),
                self.token.child_token(),
            ))
        });
        *lock(&context.current_scope) = scope;
        Arc::clone(context)
    }

    pub fn get(&self, exchange_id: u64) -> Option<Arc<BreakPointContext>> {
        lock(&self.contexts).get(&exchange_id).cloned()
    }

    /// Validates and delivers an edit. `Ok(false)` when the exchange is
    /// unknown or the point was already resolved; invalid edits leave the
    /// point pending.
    pub fn resolve(
        &self,
        exchange_id: u64,
        location: BreakPointLocation,
        edit: Option<BreakPointModel>,
    ) -> Result<bool, EditError> {
        let edit = match edit {
            Some(mut model) => {
                if model.location() != location {
                    return Err(EditError::single(format!(
                        "edit for {:?} sent to {location:?}",
                        model.location()
                    )));
                }
                model.validate()?;
                Some(model)
            }
            None => None,
        };
        let Some(context) = self.get(exchange_id) else {
            return Ok(false);
        };
        Ok(context.resolve(location, edit))
    }

    /// Points currently waiting for a controller.
    pub fn pending(&self) -> Vec<(u64, BreakPointLocation)> {
        let contexts = lock(&self.contexts);
        let mut pending: Vec<(u64, BreakPointLocation)> = contexts
            .values()
            .flat_map(|context| {
                BreakPointLocation::ALL
                    .into_iter()
                    .filter(move |location| context.status(*location) == BreakPointStatus::Running)
                    .map(move |location| (context.exchange_id, location))
            })
            .collect();
        pending.sort_by_key(|(id, location)| (*id, location.index()));
        pending
    }

    pub fn release(&self, exchange_id: u64) {
        if let Some(context) = lock(&self.contexts).remove(&exchange_id) {
            context.continue_all();
        }
    }

    pub fn continue_all(&self) {
        for context in lock(&self.contexts).values() {
            context.continue_all();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub fn connection_setup_snapshot(context: &ExchangeContext) -> BreakPointModel {
    BreakPointModel::ConnectionSetup(ConnectionSetupModel {
        ip: context.remote_host_override.clone(),
        port: context.remote_port_override,
        skip_remote_certificate_validation: context.skip_remote_certificate_validation,
    })
}

pub fn apply_connection_setup(context: &mut ExchangeContext, model: BreakPointModel) -> Result<(), EditError> {
    let BreakPointModel::ConnectionSetup(model) = model else {
        return Err(EditError::single("expected a connection setup edit"));
    };
    context.remote_host_override = model.ip;
    context.remote_port_override = model.port;
    context.skip_remote_certificate_validation = model.skip_remote_certificate_validation;
    Ok(())
}

pub fn request_snapshot(exchange: &Exchange) -> BreakPointModel {
    BreakPointModel::Request(RequestEditModel {
        flat_header: String::from_utf8_lossy(&exchange.request.head.to_bytes()).to_string(),
        body: BodyEdit::Unchanged,
    })
}

/// Replaces the request head. A body edit is stored in the context and
/// substituted once the client body has been read.
pub fn apply_request_edit(
    exchange: &mut Exchange,
    context: &mut ExchangeContext,
    model: BreakPointModel,
) -> Result<(), EditError> {
    let BreakPointModel::Request(model) = model else {
        return Err(EditError::single("expected a request edit"));
    };
    let mut head = parse_request_head(normalize_header(&model.flat_header).as_bytes())
        .map_err(|err| EditError::single(format!("invalid request header: {err}")))?;
    if let Some(body) = load_body(&model.body)? {
        reframe(&mut head, body.len());
        context.request_body_override = Some(body);
    }
    exchange.request.head = head;
    Ok(())
}

pub fn response_snapshot(exchange: &Exchange) -> Option<BreakPointModel> {
    let head = exchange.response.head.as_ref()?;
    Some(BreakPointModel::Response(ResponseEditModel {
        flat_header: String::from_utf8_lossy(&head.to_bytes()).to_string(),
        body: BodyEdit::Unchanged,
    }))
}

pub fn apply_response_edit(exchange: &mut Exchange, model: BreakPointModel) -> Result<(), EditError> {
    let BreakPointModel::Response(model) = model else {
        return Err(EditError::single("expected a response edit"));
    };
    let mut head: ResponseHead = parse_response_head(normalize_header(&model.flat_header).as_bytes())
        .map_err(|err| EditError::single(format!("invalid response header: {err}")))?;
    if let Some(body) = load_body(&model.body)? {
        reframe(&mut head, body.len());
        exchange.response.body = Some(Body::Full(body));
    } else if let Some(length) = exchange.response.body.as_ref().and_then(Body::full_len) {
        reframe(&mut head, length);
    }
    exchange.response.head = Some(head);
    Ok(())
}

fn load_body(edit: &BodyEdit) -> Result<Option<Bytes>, EditError> {
    match edit {
        BodyEdit::Unchanged => Ok(None),
        BodyEdit::Text(text) => Ok(Some(Bytes::from(text.clone()))),
        BodyEdit::File(path) => std::fs::read(path)
            .map(|bytes| Some(Bytes::from(bytes)))
            .map_err(|err| EditError::single(format!("{}: {err}", path.display()))),
    }
}

fn reframe<H: HeaderList>(head: &mut H, length: usize) {
    head.remove_header("transfer-encoding");
    head.set_header("Content-Length", &length.to_string());
}
