//! Delivery Dispatcher: sends a validated brief to its module's destination.
//!
//! The destination is verified against the module definition before any
//! send. Transient provider failures (rate limit, timeout, 5xx) are retried
//! with backoff up to the configured ceiling; each attempt is one complete
//! `sendMessage` call, so a message is either delivered whole or not at all.

mod telegram;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, instrument};

use briefengine_shared::{
    BriefError, Destination, ModuleDefinition, ProviderError, Result, RetryPolicy, retry, with_timeout,
};

pub use telegram::TelegramBot;

/// A chat delivery backend.
#[async_trait]
pub trait DeliveryProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Send one message. Returns the provider's confirmation id.
    async fn send(&self, destination: &Destination, text: &str) -> std::result::Result<String, ProviderError>;
}

/// Confirmation of a completed delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub message_id: String,
    pub attempts: u32,
}

/// Retrying, destination-checking wrapper around a [`DeliveryProvider`].
pub struct Dispatcher {
    provider: Arc<dyn DeliveryProvider>,
    policy: RetryPolicy,
    timeout: Duration,
}

impl Dispatcher {
    pub fn new(provider: Arc<dyn DeliveryProvider>, policy: RetryPolicy, timeout: Duration) -> Self {
        Self {
            provider,
            policy,
            timeout,
        }
    }

    /// Deliver `text` to `destination` on behalf of `module`.
    #[instrument(skip_all, fields(module = %module.name, destination = %destination))]
    pub async fn dispatch(&self, module: &ModuleDefinition, destination: &Destination, text: &str) -> Result<Delivery> {
        verify_destination(module, destination).map_err(|message| BriefError::DeliveryFailed {
            attempts: 0,
            message,
        })?;

        let mut attempts = 0;
        let sent = retry(&self.policy, "delivery", |attempt| {
            attempts = attempt;
            with_timeout(self.timeout, self.provider.send(destination, text))
        })
        .await;

        match sent {
            Ok(message_id) => {
                info!(provider = self.provider.name(), %message_id, attempts, "brief delivered");
                Ok(Delivery { message_id, attempts })
            }
            Err(exhausted) => Err(BriefError::DeliveryFailed {
                attempts: exhausted.attempts,
                message: exhausted.last_error.to_string(),
            }),
        }
    }
}

/// Check that `destination` is exactly the module's configured destination
/// and is well-formed.
pub fn verify_destination(module: &ModuleDefinition, destination: &Destination) -> std::result::Result<(), String> {
    if *destination != module.destination {
        return Err(format!(
            "destination {destination} does not match module '{}' destination {}",
            module.name, module.destination
        ));
    }

    if !valid_chat_id(&destination.chat_id) {
        return Err(format!("chat id '{}' is neither numeric nor an @username", destination.chat_id));
    }

    if let Some(thread) = destination.thread_id {
        if thread <= 0 {
            return Err(format!("thread id {thread} is not a valid topic"));
        }
    }

    Ok(())
}

fn valid_chat_id(chat_id: &str) -> bool {
    if let Some(username) = chat_id.strip_prefix('@') {
        return username.len() >= 4 && username.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    }
    let digits = chat_id.strip_prefix('-').unwrap_or(chat_id);
    !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    struct ScriptedProvider {
        calls: AtomicU32,
        /// Responses consumed in order; the last one repeats.
        script: Mutex<Vec<std::result::Result<String, ProviderError>>>,
        sent_to: Mutex<Vec<Destination>>,
    }

    impl ScriptedProvider {
        fn new(script: Vec<std::result::Result<String, ProviderError>>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                script: Mutex::new(script),
                sent_to: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl DeliveryProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn send(&self, destination: &Destination, _text: &str) -> std::result::Result<String, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.sent_to.lock().unwrap().push(destination.clone());
            let mut script = self.script.lock().unwrap();
            if script.len() > 1 { script.remove(0) } else { script[0].clone() }
        }
    }

    fn module() -> ModuleDefinition {
        ModuleDefinition {
            name: "stone-news".into(),
            destination: Destination {
                chat_id: "-1001234".into(),
                thread_id: Some(42),
            },
            model: None,
            max_tokens: None,
            variants: BTreeMap::new(),
        }
    }

    fn dispatcher(provider: Arc<ScriptedProvider>) -> Dispatcher {
        Dispatcher::new(provider, RetryPolicy::immediate(3), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn delivers_to_module_destination() {
        let provider = ScriptedProvider::new(vec![Ok("981".into())]);
        let module = module();

        let delivery = dispatcher(provider.clone())
            .dispatch(&module, &module.destination, "<b>x</b>")
            .await
            .unwrap();

        assert_eq!(delivery.message_id, "981");
        assert_eq!(delivery.attempts, 1);
        assert_eq!(provider.sent_to.lock().unwrap()[0], module.destination);
    }

    #[tokio::test]
    async fn wrong_topic_is_refused_before_sending() {
        let provider = ScriptedProvider::new(vec![Ok("1".into())]);
        let module = module();
        let other_topic = Destination {
            thread_id: Some(7),
            ..module.destination.clone()
        };

        let err = dispatcher(provider.clone())
            .dispatch(&module, &other_topic, "x")
            .await
            .unwrap_err();

        assert!(matches!(err, BriefError::DeliveryFailed { attempts: 0, .. }));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn transient_failure_is_retried() {
        let provider = ScriptedProvider::new(vec![
            Err(ProviderError::transient("HTTP 429: Too Many Requests")),
            Ok("77".into()),
        ]);
        let module = module();

        let delivery = dispatcher(provider.clone())
            .dispatch(&module, &module.destination, "x")
            .await
            .unwrap();

        assert_eq!(delivery.attempts, 2);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn retry_ceiling_is_exact() {
        let provider = ScriptedProvider::new(vec![Err(ProviderError::transient("HTTP 503: busy"))]);
        let module = module();

        let err = dispatcher(provider.clone())
            .dispatch(&module, &module.destination, "x")
            .await
            .unwrap_err();

        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
        match err {
            BriefError::DeliveryFailed { attempts, message } => {
                assert_eq!(attempts, 3);
                assert!(message.contains("503"));
            }
            other => panic!("expected DeliveryFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let provider = ScriptedProvider::new(vec![Err(ProviderError::permanent("HTTP 400: chat not found"))]);
        let module = module();

        let err = dispatcher(provider.clone())
            .dispatch(&module, &module.destination, "x")
            .await
            .unwrap_err();

        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.kind(), "DeliveryFailed");
    }

    #[test]
    fn chat_id_forms() {
        assert!(valid_chat_id("-1001234567890"));
        assert!(valid_chat_id("12345"));
        assert!(valid_chat_id("@stone_board"));
        assert!(!valid_chat_id("@ab"));
        assert!(!valid_chat_id("board"));
        assert!(!valid_chat_id("-"));
    }

    #[test]
    fn non_positive_thread_is_rejected() {
        let mut module = module();
        module.destination.thread_id = Some(0);
        let dest = module.destination.clone();
        assert!(verify_destination(&module, &dest).is_err());
    }
}
