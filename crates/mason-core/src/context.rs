use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use crate::message::Message;

type MessageHandler = Box<dyn Fn(&Message) + Send + Sync>;

struct ContextInner {
    handler: RwLock<Option<MessageHandler>>,
    silent: AtomicBool,
}

/// The message bus.
///
/// A `Context` is a cheap cloneable handle shared by everything that emits or
/// routes [`Message`]s. The installed handler differs per process: the parent
/// installs one that feeds the front-end, a worker installs one that writes
/// the action log file and forwards messages over its envelope channel.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    /// Create a context with no handler installed; messages are dropped until
    /// [`set_message_handler`](Context::set_message_handler) is called.
    pub fn new() -> Self {
        Context {
            inner: Arc::new(ContextInner {
                handler: RwLock::new(None),
                silent: AtomicBool::new(false),
            }),
        }
    }

    /// Emit a message to the installed handler.
    pub fn emit(&self, message: Message) {
        if let Ok(guard) = self.inner.handler.read() {
            if let Some(handler) = guard.as_ref() {
                handler(&message);
            }
        }
    }

    /// Replace the message handler.
    pub fn set_message_handler<F>(&self, handler: F)
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        if let Ok(mut guard) = self.inner.handler.write() {
            *guard = Some(Box::new(handler));
        }
    }

    /// Whether non-unconditional messages should be withheld from the user.
    pub fn silent_messages(&self) -> bool {
        self.inner.silent.load(Ordering::Relaxed)
    }

    /// Flip the silent-messages switch.
    pub fn set_silent(&self, silent: bool) {
        self.inner.silent.store(silent, Ordering::Relaxed);
    }
}

impl Default for Context {
    fn default() -> Self {
        Context::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::Mutex;

    use super::Context;
    use crate::message::{Message, MessageKind};

    #[test]
    fn emit_reaches_installed_handler() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let ctx = Context::new();

        // No handler yet: emitting must not panic.
        ctx.emit(Message::new(MessageKind::Info, "dropped"));

        let sink = seen.clone();
        ctx.set_message_handler(move |msg| {
            sink.lock().unwrap().push(msg.text.clone());
        });
        ctx.emit(Message::new(MessageKind::Info, "hello"));

        // Clones share the handler and the silent flag.
        let clone = ctx.clone();
        clone.emit(Message::new(MessageKind::Status, "from clone"));
        clone.set_silent(true);
        assert!(ctx.silent_messages());

        assert_eq!(&*seen.lock().unwrap(), &["hello", "from clone"]);
    }
}
