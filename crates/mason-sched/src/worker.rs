//! The worker-process side of the scheduler.
//!
//! A worker is a freshly spawned process (the `mason worker` hidden
//! subcommand) that runs exactly one action on one element and exits. It
//! reads a single [`WorkerRequest`] frame from stdin, detaches into its own
//! session, and streams [`Envelope`]s back on stdout. The parent never shares
//! memory with it.

use std::any::Any;
use std::backtrace::Backtrace;
use std::fs::{self, File};
use std::io::{self, Write};
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::process;
use std::sync::Mutex;

use serde_json::Value;

use mason_core::context::Context;
use mason_core::error::DomainError;
use mason_core::message::{Message, MessageKind};

use crate::envelope::{Envelope, WorkerRequest, read_frame, write_frame};
use crate::signals::SuspendClock;

/// The domain half of a worker: runs the named action on a serialized
/// element copy. Implemented by the embedding binary; this is the only code
/// that executes inside the worker besides the plumbing in this module.
pub trait ActionRunner {
    /// Run `action` against `payload`. Messages emitted through `context`
    /// are logged and forwarded to the parent.
    fn run(
        &self,
        action: &str,
        payload: &Value,
        context: &Context,
    ) -> Result<Option<Value>, DomainError>;

    /// Snapshot the element's workspace descriptor after the action ran.
    /// Called on success and on domain failure alike, so changes recorded
    /// during a failed build still reach the parent.
    fn workspace(&self, payload: &Value) -> Option<Value>;
}

/// Entrypoint for the worker process. Never returns.
pub fn worker_main(runner: &dyn ActionRunner) -> ! {
    let code = match run_worker(runner) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("mason worker: {err}");
            1
        }
    };
    // The suspendable scope was torn down inside run_worker; nothing can
    // stop us between here and the actual exit.
    process::exit(code);
}

fn run_worker(runner: &dyn ActionRunner) -> io::Result<i32> {
    let request: WorkerRequest = read_frame(&mut io::stdin().lock())?.ok_or_else(|| {
        io::Error::new(io::ErrorKind::UnexpectedEof, "no request frame on stdin")
    })?;

    // Detach into a new session: TTY signals no longer reach us, grandchildren
    // share our process group, and the parent can kill the whole group.
    let _ = nix::unistd::setsid();

    // SIGINT stays blocked (inherited from the parent's spawn-time mask); the
    // suspendable clock takes over SIGTSTP/SIGCONT so reported elapsed time
    // excludes stopped intervals.
    let clock = SuspendClock::install()?;

    let emitter = Emitter::new(&request);
    let context = Context::new();
    context.set_silent(request.silent);
    {
        let emitter = emitter.clone();
        context.set_message_handler(move |message| emitter.handle(message));
    }

    let mut start = Message::new(MessageKind::Start, action_title(&request.action));
    start.logfile = emitter.logfile_path();
    context.emit(start);

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        runner.run(&request.action, &request.payload, &context)
    }));
    let elapsed = clock.active_elapsed();

    let code = match outcome {
        Ok(Ok(result)) => {
            emitter.send_workspace(runner.workspace(&request.payload));
            if let Some(value) = result {
                emitter.send(&Envelope::Result { value });
            }
            context.emit(
                Message::new(MessageKind::Success, action_title(&request.action))
                    .with_elapsed(elapsed),
            );
            0
        }
        Ok(Err(err)) => {
            let mut fail = if request.tries <= request.max_retries {
                Message::new(
                    MessageKind::Fail,
                    format!("Try #{} failed, retrying", request.tries),
                )
            } else {
                let mut msg = Message::new(MessageKind::Fail, err.message.clone());
                msg.detail = err.detail.clone();
                msg
            };
            fail.elapsed = Some(elapsed);
            context.emit(fail);

            // Report workspace changes even on a handled failure.
            emitter.send_workspace(runner.workspace(&request.payload));
            emitter.send(&Envelope::Error {
                domain: err.domain,
                reason: err.reason.clone(),
            });
            1
        }
        Err(payload) => {
            // Not a DomainError: that's a bug. No Error envelope, no retry.
            let detail = format!(
                "An unhandled exception occurred:\n\n{}\n\n{}",
                panic_text(payload.as_ref()),
                Backtrace::force_capture()
            );
            context.emit(
                Message::new(MessageKind::Bug, action_title(&request.action))
                    .with_detail(detail)
                    .with_elapsed(elapsed),
            );
            1
        }
    };

    emitter.close();
    drop(clock);
    Ok(code)
}

fn action_title(action: &str) -> String {
    let mut chars = action.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

fn panic_text(payload: &(dyn Any + Send)) -> &str {
    if let Some(text) = payload.downcast_ref::<&str>() {
        text
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.as_str()
    } else {
        "unknown panic payload"
    }
}

/// Tags, logs and forwards everything the worker emits.
struct EmitterInner {
    action: String,
    item_id: u64,
    item_name: String,
    tries: u32,
    max_retries: u32,
    silent: bool,
    logfile: Option<(PathBuf, Mutex<File>)>,
    out: Mutex<Box<dyn Write + Send>>,
}

#[derive(Clone)]
struct Emitter {
    inner: std::sync::Arc<EmitterInner>,
}

impl Emitter {
    fn new(request: &WorkerRequest) -> Emitter {
        Emitter::with_output(request, Box::new(io::stdout()))
    }

    fn with_output(request: &WorkerRequest, out: Box<dyn Write + Send>) -> Emitter {
        let logfile = request.log_dir.as_ref().and_then(|dir| {
            let dir = dir.join(&request.item_name);
            if let Err(err) = fs::create_dir_all(&dir) {
                eprintln!("mason worker: cannot create log directory: {err}");
                return None;
            }
            let path = dir.join(format!("{}.{}.log", request.action, process::id()));
            match File::options().create(true).append(true).open(&path) {
                Ok(mut file) => {
                    let _ = writeln!(
                        file,
                        "{} started at {}",
                        request.action,
                        chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
                    );
                    Some((path, Mutex::new(file)))
                }
                Err(err) => {
                    eprintln!("mason worker: cannot open log file: {err}");
                    None
                }
            }
        });

        Emitter {
            inner: std::sync::Arc::new(EmitterInner {
                action: request.action.clone(),
                item_id: request.item_id,
                item_name: request.item_name.clone(),
                tries: request.tries,
                max_retries: request.max_retries,
                silent: request.silent,
                logfile,
                out: Mutex::new(out),
            }),
        }
    }

    fn logfile_path(&self) -> Option<PathBuf> {
        self.inner.logfile.as_ref().map(|(path, _)| path.clone())
    }

    /// The worker-side message handler: tag, log, forward.
    fn handle(&self, message: &Message) {
        let mut message = message.clone();
        message.task_id = Some(self.inner.item_id);
        message.task_name = Some(self.inner.item_name.clone());
        message.action = Some(self.inner.action.clone());

        self.log(&message);

        if message.kind == MessageKind::Fail && self.inner.tries <= self.inner.max_retries {
            // The job will be retried; display the failure as a warning.
            message.kind = MessageKind::Warn;
        }
        if message.kind == MessageKind::Log {
            return;
        }
        if self.inner.silent && !message.kind.is_unconditional() {
            return;
        }
        self.send(&Envelope::Message { message });
    }

    fn log(&self, message: &Message) {
        let Some((_, file)) = &self.inner.logfile else {
            return;
        };
        let timecode = match message.elapsed {
            Some(elapsed) => {
                let total = elapsed.as_secs();
                format!("{:02}:{:02}:{:02}", total / 3600, (total % 3600) / 60, total % 60)
            }
            None => "--:--:--".to_string(),
        };
        let mut line = format!(
            "[{timecode}] {:<7} [{}]: {}",
            message.kind.label(),
            self.inner.item_name,
            message.text
        );
        if let Some(detail) = &message.detail {
            for detail_line in detail.lines() {
                line.push_str("\n    ");
                line.push_str(detail_line);
            }
        }
        if let Ok(mut file) = file.lock() {
            let _ = writeln!(file, "{line}");
            let _ = file.flush();
        }
    }

    /// One envelope per OS write.
    fn send(&self, envelope: &Envelope) {
        if let Ok(mut out) = self.inner.out.lock() {
            let _ = write_frame(&mut *out, envelope);
        }
    }

    fn send_workspace(&self, workspace: Option<Value>) {
        if let Some(value) = workspace {
            self.send(&Envelope::Workspace { value });
        }
    }

    fn close(&self) {
        if let Ok(mut out) = self.inner.out.lock() {
            let _ = out.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{self, Write};
    use std::sync::{Arc, Mutex};

    use serde_json::json;

    use mason_core::message::{Message, MessageKind};

    use super::{Emitter, action_title};
    use crate::envelope::{Envelope, WorkerRequest, read_frame};

    #[derive(Clone)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn request(tries: u32, max_retries: u32, silent: bool) -> WorkerRequest {
        WorkerRequest {
            action: "build".into(),
            item_id: 7,
            item_name: "core.bst".into(),
            tries,
            max_retries,
            silent,
            log_dir: None,
            payload: json!({}),
        }
    }

    fn drain(buf: &Arc<Mutex<Vec<u8>>>) -> Vec<Envelope> {
        let wire = buf.lock().unwrap().clone();
        let mut reader = wire.as_slice();
        let mut seen = Vec::new();
        while let Some(envelope) = read_frame::<_, Envelope>(&mut reader).unwrap() {
            seen.push(envelope);
        }
        seen
    }

    #[test]
    fn messages_are_tagged_with_action_and_item() {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let emitter = Emitter::with_output(&request(1, 0, false), Box::new(SharedBuf(buf.clone())));

        emitter.handle(&Message::new(MessageKind::Info, "staging sources"));

        let seen = drain(&buf);
        assert_eq!(seen.len(), 1);
        let Envelope::Message { message } = &seen[0] else {
            panic!("expected a message envelope");
        };
        assert_eq!(message.task_id, Some(7));
        assert_eq!(message.action.as_deref(), Some("build"));
    }

    #[test]
    fn retried_failures_are_downgraded_to_warnings() {
        let buf = Arc::new(Mutex::new(Vec::new()));
        // tries <= max_retries: another attempt follows.
        let emitter = Emitter::with_output(&request(1, 2, false), Box::new(SharedBuf(buf.clone())));
        emitter.handle(&Message::new(MessageKind::Fail, "Try #1 failed, retrying"));

        match &drain(&buf)[0] {
            Envelope::Message { message } => assert_eq!(message.kind, MessageKind::Warn),
            other => panic!("unexpected envelope: {other:?}"),
        }

        // Final attempt: the failure stays a failure.
        let buf = Arc::new(Mutex::new(Vec::new()));
        let emitter = Emitter::with_output(&request(3, 2, false), Box::new(SharedBuf(buf.clone())));
        emitter.handle(&Message::new(MessageKind::Fail, "no such ref"));
        match &drain(&buf)[0] {
            Envelope::Message { message } => assert_eq!(message.kind, MessageKind::Fail),
            other => panic!("unexpected envelope: {other:?}"),
        }
    }

    #[test]
    fn silent_sessions_drop_conditional_messages_only() {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let emitter = Emitter::with_output(&request(1, 0, true), Box::new(SharedBuf(buf.clone())));

        emitter.handle(&Message::new(MessageKind::Status, "staging"));
        emitter.handle(&Message::new(MessageKind::Log, "raw output"));
        emitter.handle(&Message::new(MessageKind::Warn, "retrying fetch"));

        let seen = drain(&buf);
        assert_eq!(seen.len(), 1);
        match &seen[0] {
            Envelope::Message { message } => assert_eq!(message.kind, MessageKind::Warn),
            other => panic!("unexpected envelope: {other:?}"),
        }
    }

    #[test]
    fn log_messages_never_leave_the_worker() {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let emitter = Emitter::with_output(&request(1, 0, false), Box::new(SharedBuf(buf.clone())));
        emitter.handle(&Message::new(MessageKind::Log, "compiler output"));
        assert!(drain(&buf).is_empty());
    }

    #[test]
    fn log_file_records_every_message() {
        let dir = tempfile::tempdir().unwrap();
        let mut req = request(1, 0, false);
        req.log_dir = Some(dir.path().to_path_buf());

        let buf = Arc::new(Mutex::new(Vec::new()));
        let emitter = Emitter::with_output(&req, Box::new(SharedBuf(buf)));
        let path = emitter.logfile_path().expect("log file should be open");

        emitter.handle(&Message::new(MessageKind::Log, "cc -o hello hello.c"));
        emitter.handle(
            &Message::new(MessageKind::Fail, "command failed").with_detail("exit 2\nno output"),
        );

        let contents = std::fs::read_to_string(path).unwrap();
        assert!(contents.contains("cc -o hello hello.c"));
        assert!(contents.contains("FAIL"));
        assert!(contents.contains("    exit 2"));
    }

    #[test]
    fn action_titles_are_capitalized() {
        assert_eq!(action_title("build"), "Build");
        assert_eq!(action_title(""), "");
    }
}
