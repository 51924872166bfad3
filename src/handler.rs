use std::sync::Arc;

use crate::config::PageConfig;
use crate::error::Result;
use crate::greeter::Greeter;
use crate::page::{Document, Event, PageHandle};

/// Reads the name input on click, asks the greeter, writes the answer into
/// the output element.
///
/// Nothing is caught: a missing element or a failed `greet` fails the
/// invocation, which then surfaces on the page's unhandled-failure channel
/// and leaves the output as it was. Clicks are independent; when several are
/// in flight the one that resolves last owns the output.
pub struct ClickHandler {
    greeter: Arc<dyn Greeter>,
    input_id: String,
    trigger_id: String,
    output_id: String,
}

impl ClickHandler {
    pub fn new<G>(greeter: G, config: &PageConfig) -> Self
    where
        G: Greeter + 'static,
    {
        Self {
            greeter: Arc::new(greeter),
            input_id: config.input_id.clone(),
            trigger_id: config.trigger_id.clone(),
            output_id: config.output_id.clone(),
        }
    }

    /// Bind to the trigger's click event. Fails right away when the trigger
    /// is not on the page.
    pub async fn register(self, page: &PageHandle) -> Result<()> {
        let trigger_id = self.trigger_id.clone();
        let handler = Arc::new(self);
        page.add_event_listener(
            &trigger_id,
            Event::Click,
            Arc::new(move |doc: &Document, page: &PageHandle| handler.on_click(doc, page)),
        )
        .await
    }

    fn on_click(&self, doc: &Document, page: &PageHandle) {
        // Read at click time, before anything is awaited.
        let name = doc.value(&self.input_id);
        let greeter = self.greeter.clone();
        let output_id = self.output_id.clone();
        let out = page.clone();

        page.spawn(async move {
            let name = name?;
            let greeting = greeter.greet(&name).await?;
            out.set_inner_text(&output_id, greeting).await
        });
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::oneshot;

    use super::*;
    use crate::error::GreetError;
    use crate::page::{Element, Page};

    /// Answers `Hello, {name}!`, or fails for names in `reject`.
    #[derive(Default)]
    struct Recording {
        calls: Arc<Mutex<Vec<String>>>,
        reject: Vec<String>,
    }

    #[async_trait]
    impl Greeter for Recording {
        async fn greet(&self, name: &str) -> Result<String> {
            self.calls.lock().unwrap().push(name.to_string());
            if self.reject.iter().any(|r| r == name) {
                return Err(GreetError::remote(format!("rejected {name}")));
            }
            Ok(format!("Hello, {name}!"))
        }
    }

    /// Each name blocks until the test releases it.
    struct Gated {
        gates: Mutex<HashMap<String, oneshot::Receiver<String>>>,
    }

    #[async_trait]
    impl Greeter for Gated {
        async fn greet(&self, name: &str) -> Result<String> {
            let gate = self.gates.lock().unwrap().remove(name);
            match gate {
                Some(rx) => rx.await.map_err(|_| GreetError::remote("gate dropped")),
                None => Err(GreetError::remote(format!("no gate for {name}"))),
            }
        }
    }

    async fn page_with(greeter: impl Greeter + 'static) -> PageHandle {
        let config = PageConfig::default();
        let page = Page::spawn(Document::standard(&config));
        ClickHandler::new(greeter, &config)
            .register(&page)
            .await
            .unwrap();
        page
    }

    async fn output(page: &PageHandle) -> String {
        let doc = page.snapshot().await.unwrap();
        doc.inner_text("greeting").unwrap().to_string()
    }

    #[tokio::test]
    async fn greets_the_typed_name() {
        let greeter = Recording::default();
        let calls = greeter.calls.clone();
        let page = page_with(greeter).await;

        page.set_value("name", "Ada").await.unwrap();
        page.click("clickMeBtn").await.unwrap();
        page.settle().await;

        assert_eq!(*calls.lock().unwrap(), vec!["Ada"]);
        assert_eq!(output(&page).await, "Hello, Ada!");
    }

    #[tokio::test]
    async fn name_is_passed_without_trimming() {
        let greeter = Recording::default();
        let calls = greeter.calls.clone();
        let page = page_with(greeter).await;

        page.set_value("name", "  <b>Ada</b> \t").await.unwrap();
        page.click("clickMeBtn").await.unwrap();
        page.settle().await;

        assert_eq!(*calls.lock().unwrap(), vec!["  <b>Ada</b> \t"]);
        assert_eq!(output(&page).await, "Hello,   <b>Ada</b> \t!");
    }

    #[tokio::test]
    async fn empty_input_greets_empty_string() {
        let greeter = Recording::default();
        let calls = greeter.calls.clone();
        let page = page_with(greeter).await;

        page.click("clickMeBtn").await.unwrap();
        page.settle().await;

        assert_eq!(*calls.lock().unwrap(), vec![""]);
        assert_eq!(output(&page).await, "Hello, !");
    }

    #[tokio::test]
    async fn rejection_leaves_output_and_goes_unhandled() {
        let greeter = Recording {
            reject: vec!["Bob".into()],
            ..Default::default()
        };
        let page = page_with(greeter).await;

        page.set_value("name", "Ada").await.unwrap();
        page.click("clickMeBtn").await.unwrap();
        page.settle().await;

        page.set_value("name", "Bob").await.unwrap();
        page.click("clickMeBtn").await.unwrap();
        page.settle().await;

        assert_eq!(output(&page).await, "Hello, Ada!");
        assert_eq!(
            page.take_unhandled().await.unwrap(),
            vec!["remote call failed: rejected Bob".to_string()]
        );
    }

    #[tokio::test]
    async fn last_resolved_click_wins() {
        let (first_tx, first_rx) = oneshot::channel();
        let (second_tx, second_rx) = oneshot::channel();
        let greeter = Gated {
            gates: Mutex::new(HashMap::from([
                ("first".to_string(), first_rx),
                ("second".to_string(), second_rx),
            ])),
        };
        let page = page_with(greeter).await;
        let mut changes = page.subscribe();

        page.set_value("name", "first").await.unwrap();
        page.click("clickMeBtn").await.unwrap();
        page.set_value("name", "second").await.unwrap();
        page.click("clickMeBtn").await.unwrap();

        second_tx.send("Hello, second!".to_string()).unwrap();
        let change = tokio::time::timeout(Duration::from_secs(5), changes.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(change.text, "Hello, second!");

        first_tx.send("Hello, first!".to_string()).unwrap();
        page.settle().await;

        assert_eq!(output(&page).await, "Hello, first!");
        assert!(page.take_unhandled().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn registration_fails_without_trigger() {
        let config = PageConfig::default();
        let page = Page::spawn(Document::new().with("name", Element::input()));

        let err = ClickHandler::new(Recording::default(), &config)
            .register(&page)
            .await
            .unwrap_err();
        assert!(matches!(err, GreetError::MissingElement(id) if id == "clickMeBtn"));
    }

    #[tokio::test]
    async fn missing_output_surfaces_at_click_time() {
        let config = PageConfig::default();
        let page = Page::spawn(
            Document::new()
                .with("name", Element::input())
                .with("clickMeBtn", Element::button("Click Me!")),
        );
        ClickHandler::new(Recording::default(), &config)
            .register(&page)
            .await
            .unwrap();

        page.click("clickMeBtn").await.unwrap();
        page.settle().await;

        assert_eq!(
            page.take_unhandled().await.unwrap(),
            vec!["element #greeting not found".to_string()]
        );
    }
}
