//! In-process page: elements addressed by id, owned by a single UI loop.
//!
//! Every read and write of element state happens on the loop task. Listeners
//! run synchronously on the loop when an event is dispatched; anything that
//! has to wait goes through [`PageHandle::spawn`], and its writes travel back
//! to the loop as messages. A spawned task that fails lands on the page's
//! unhandled-failure channel, the same way an uncaught rejection would.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::config::PageConfig;
use crate::error::{GreetError, Result};

const CHANGE_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    Click,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Element {
    Input { value: String },
    Button { label: String },
    Text { inner_text: String },
}

impl Element {
    pub fn input() -> Self {
        Element::Input {
            value: String::new(),
        }
    }

    pub fn button(label: impl Into<String>) -> Self {
        Element::Button {
            label: label.into(),
        }
    }

    pub fn text() -> Self {
        Element::Text {
            inner_text: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Document {
    elements: HashMap<String, Element>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    /// An input, a button and an output text, with the configured ids.
    pub fn standard(config: &PageConfig) -> Self {
        Self::new()
            .with(&config.input_id, Element::input())
            .with(&config.trigger_id, Element::button("Click Me!"))
            .with(&config.output_id, Element::text())
    }

    pub fn with(mut self, id: &str, element: Element) -> Self {
        self.elements.insert(id.to_string(), element);
        self
    }

    pub fn get_element_by_id(&self, id: &str) -> Option<&Element> {
        self.elements.get(id)
    }

    /// Current `value` of an input, exactly as typed.
    pub fn value(&self, id: &str) -> Result<String> {
        match self.elements.get(id) {
            Some(Element::Input { value }) => Ok(value.clone()),
            Some(_) => Err(GreetError::NotAnInput(id.to_string())),
            None => Err(GreetError::MissingElement(id.to_string())),
        }
    }

    /// Displayed text of an element. Inputs have none.
    pub fn inner_text(&self, id: &str) -> Option<&str> {
        match self.elements.get(id)? {
            Element::Text { inner_text } => Some(inner_text),
            Element::Button { label } => Some(label),
            Element::Input { .. } => None,
        }
    }

    fn set_value(&mut self, id: &str, new_value: String) -> Result<()> {
        match self.elements.get_mut(id) {
            Some(Element::Input { value }) => {
                *value = new_value;
                Ok(())
            }
            Some(_) => Err(GreetError::NotAnInput(id.to_string())),
            None => Err(GreetError::MissingElement(id.to_string())),
        }
    }

    /// Returns whether the displayed text changed. Setting it on an input is
    /// accepted and has no visible effect.
    fn set_inner_text(&mut self, id: &str, text: String) -> Result<bool> {
        match self.elements.get_mut(id) {
            Some(Element::Text { inner_text }) => {
                *inner_text = text;
                Ok(true)
            }
            Some(Element::Button { label }) => {
                *label = text;
                Ok(true)
            }
            Some(Element::Input { .. }) => Ok(false),
            None => Err(GreetError::MissingElement(id.to_string())),
        }
    }
}

/// Called on the UI loop with the document as it is at dispatch time.
pub type Listener = Arc<dyn Fn(&Document, &PageHandle) + Send + Sync>;

/// Emitted whenever an element's displayed text is assigned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChange {
    pub id: String,
    pub text: String,
}

enum PageMsg {
    AddListener {
        id: String,
        event: Event,
        listener: Listener,
        reply: oneshot::Sender<Result<()>>,
    },
    Dispatch {
        id: String,
        event: Event,
        reply: oneshot::Sender<Result<()>>,
    },
    SetValue {
        id: String,
        value: String,
        reply: oneshot::Sender<Result<()>>,
    },
    SetInnerText {
        id: String,
        text: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Snapshot {
        reply: oneshot::Sender<Document>,
    },
    Unhandled(GreetError),
    TakeUnhandled {
        reply: oneshot::Sender<Vec<String>>,
    },
}

/// Number of spawned continuations still running.
type InFlight = Arc<watch::Sender<usize>>;

/// Decrements the in-flight count when a continuation ends, even by panic.
struct InFlightGuard(InFlight);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.send_modify(|n| *n -= 1);
    }
}

/// Cloneable access to a running page.
#[derive(Clone)]
pub struct PageHandle {
    tx: mpsc::UnboundedSender<PageMsg>,
    in_flight: InFlight,
    changes: broadcast::Sender<TextChange>,
}

impl PageHandle {
    async fn ask<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> PageMsg) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .map_err(|_| GreetError::Disconnected("page"))?;
        rx.await.map_err(|_| GreetError::Disconnected("page"))
    }

    /// Fails if no element has this id.
    pub async fn add_event_listener(&self, id: &str, event: Event, listener: Listener) -> Result<()> {
        let id = id.to_string();
        self.ask(|reply| PageMsg::AddListener {
            id,
            event,
            listener,
            reply,
        })
        .await?
    }

    /// Dispatch a click on the element. Returns once every listener has run
    /// its synchronous part.
    pub async fn click(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.ask(|reply| PageMsg::Dispatch {
            id,
            event: Event::Click,
            reply,
        })
        .await?
    }

    /// Type into an input.
    pub async fn set_value(&self, id: &str, value: impl Into<String>) -> Result<()> {
        let id = id.to_string();
        let value = value.into();
        self.ask(|reply| PageMsg::SetValue { id, value, reply })
            .await?
    }

    pub async fn set_inner_text(&self, id: &str, text: impl Into<String>) -> Result<()> {
        let id = id.to_string();
        let text = text.into();
        self.ask(|reply| PageMsg::SetInnerText { id, text, reply })
            .await?
    }

    pub async fn snapshot(&self) -> Result<Document> {
        self.ask(|reply| PageMsg::Snapshot { reply }).await
    }

    /// Failures that escaped spawned tasks since the last call.
    pub async fn take_unhandled(&self) -> Result<Vec<String>> {
        self.ask(|reply| PageMsg::TakeUnhandled { reply }).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TextChange> {
        self.changes.subscribe()
    }

    /// Run the continuation of a listener. An `Err` is not returned to anyone;
    /// it is reported on the unhandled-failure channel.
    pub fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let tx = self.tx.clone();
        self.in_flight.send_modify(|n| *n += 1);
        let guard = InFlightGuard(self.in_flight.clone());
        tokio::spawn(async move {
            let _guard = guard;
            if let Err(err) = fut.await {
                let _ = tx.send(PageMsg::Unhandled(err));
            }
        });
    }

    /// Wait until no spawned continuation is running. Any number of handles
    /// may wait at once.
    pub async fn settle(&self) {
        let mut rx = self.in_flight.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

pub struct Page {
    document: Document,
    listeners: HashMap<(String, Event), Vec<Listener>>,
    unhandled: Vec<String>,
    rx: mpsc::UnboundedReceiver<PageMsg>,
    tx: mpsc::WeakUnboundedSender<PageMsg>,
    in_flight: InFlight,
    changes: broadcast::Sender<TextChange>,
}

impl Page {
    pub fn new(document: Document) -> (Self, PageHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        let in_flight: InFlight = Arc::new(watch::channel(0).0);

        let page = Self {
            document,
            listeners: HashMap::new(),
            unhandled: Vec::new(),
            rx,
            tx: tx.downgrade(),
            in_flight: in_flight.clone(),
            changes: changes.clone(),
        };
        let handle = PageHandle {
            tx,
            in_flight,
            changes,
        };
        (page, handle)
    }

    /// Start the UI loop on its own task.
    pub fn spawn(document: Document) -> PageHandle {
        let (page, handle) = Self::new(document);
        tokio::spawn(page.run());
        handle
    }

    /// Process messages until every handle is gone.
    pub async fn run(mut self) {
        while let Some(msg) = self.rx.recv().await {
            self.handle(msg);
        }
        log::debug!("Page loop ended");
    }

    fn handle(&mut self, msg: PageMsg) {
        match msg {
            PageMsg::AddListener {
                id,
                event,
                listener,
                reply,
            } => {
                let res = if self.document.get_element_by_id(&id).is_some() {
                    self.listeners.entry((id, event)).or_default().push(listener);
                    Ok(())
                } else {
                    Err(GreetError::MissingElement(id))
                };
                let _ = reply.send(res);
            }
            PageMsg::Dispatch { id, event, reply } => {
                let _ = reply.send(self.dispatch(id, event));
            }
            PageMsg::SetValue { id, value, reply } => {
                let _ = reply.send(self.document.set_value(&id, value));
            }
            PageMsg::SetInnerText { id, text, reply } => {
                let res = match self.document.set_inner_text(&id, text.clone()) {
                    Ok(true) => {
                        log::info!("#{id} = {text:?}");
                        let _ = self.changes.send(TextChange { id, text });
                        Ok(())
                    }
                    Ok(false) => Ok(()),
                    Err(e) => Err(e),
                };
                let _ = reply.send(res);
            }
            PageMsg::Snapshot { reply } => {
                let _ = reply.send(self.document.clone());
            }
            PageMsg::Unhandled(err) => {
                log::error!("Uncaught failure in event handler: {err}");
                self.unhandled.push(err.to_string());
            }
            PageMsg::TakeUnhandled { reply } => {
                let _ = reply.send(std::mem::take(&mut self.unhandled));
            }
        }
    }

    fn dispatch(&mut self, id: String, event: Event) -> Result<()> {
        if self.document.get_element_by_id(&id).is_none() {
            return Err(GreetError::MissingElement(id));
        }
        let Some(tx) = self.tx.upgrade() else {
            return Err(GreetError::Disconnected("page"));
        };
        let handle = PageHandle {
            tx,
            in_flight: self.in_flight.clone(),
            changes: self.changes.clone(),
        };

        let listeners = self.listeners.get(&(id, event)).cloned().unwrap_or_default();
        for listener in listeners {
            listener(&self.document, &handle);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;

    fn document() -> Document {
        Document::standard(&PageConfig::default())
    }

    #[test]
    fn value_is_read_verbatim() {
        let mut doc = document();
        doc.set_value("name", "  Ada \n".into()).unwrap();
        assert_eq!(doc.value("name").unwrap(), "  Ada \n");
    }

    #[test]
    fn value_of_wrong_or_missing_element_fails() {
        let doc = document();
        assert!(matches!(doc.value("greeting"), Err(GreetError::NotAnInput(_))));
        assert!(matches!(doc.value("nope"), Err(GreetError::MissingElement(_))));
    }

    #[tokio::test]
    async fn listener_needs_an_existing_element() {
        let page = Page::spawn(document());
        let err = page
            .add_event_listener("missing", Event::Click, Arc::new(|_: &Document, _: &PageHandle| {}))
            .await
            .unwrap_err();
        assert!(matches!(err, GreetError::MissingElement(id) if id == "missing"));
    }

    #[tokio::test]
    async fn click_runs_listeners_with_current_document() {
        let page = Page::spawn(document());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let listener: Listener = {
            let seen = seen.clone();
            Arc::new(move |doc: &Document, _: &PageHandle| {
                seen.lock().unwrap().push(doc.value("name").unwrap());
            })
        };
        page.add_event_listener("clickMeBtn", Event::Click, listener)
            .await
            .unwrap();

        page.set_value("name", "one").await.unwrap();
        page.click("clickMeBtn").await.unwrap();
        page.set_value("name", "two").await.unwrap();
        page.click("clickMeBtn").await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["one", "two"]);
    }

    #[tokio::test]
    async fn failed_continuation_lands_on_unhandled_channel() {
        let page = Page::spawn(document());
        page.spawn(async { Err(GreetError::remote("boom")) });
        page.settle().await;

        let unhandled = page.take_unhandled().await.unwrap();
        assert_eq!(unhandled, vec!["remote call failed: boom".to_string()]);
        assert!(page.take_unhandled().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn several_handles_can_settle_together() {
        let page = Page::spawn(document());
        let (release, gate) = oneshot::channel::<()>();
        page.spawn(async move {
            let _ = gate.await;
            Ok(())
        });

        let first = tokio::spawn({
            let page = page.clone();
            async move { page.settle().await }
        });
        let second = tokio::spawn({
            let page = page.clone();
            async move { page.settle().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        page.spawn(async { Ok(()) });
        release.send(()).unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            first.await.unwrap();
            second.await.unwrap();
        })
        .await
        .unwrap();
        page.settle().await;
    }

    #[tokio::test]
    async fn text_changes_are_broadcast() {
        let page = Page::spawn(document());
        let mut changes = page.subscribe();
        page.set_inner_text("greeting", "hi").await.unwrap();

        let change = changes.recv().await.unwrap();
        assert_eq!(
            change,
            TextChange {
                id: "greeting".into(),
                text: "hi".into()
            }
        );
        let doc = page.snapshot().await.unwrap();
        assert_eq!(doc.inner_text("greeting"), Some("hi"));
    }
}
