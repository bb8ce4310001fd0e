//! Plain-text front-end: prints the message stream and session summaries.

use mason_core::context::Context;
use mason_core::message::{Message, MessageKind};
use mason_sched::RunOutcome;

/// Install the printing handler on the context.
pub fn install(context: &Context, silent: bool) {
    context.set_message_handler(move |message| {
        if message.kind == MessageKind::Log {
            return;
        }
        if silent && !message.kind.is_unconditional() {
            return;
        }
        eprintln!("{}", format_message(message));
    });
}

/// `[HH:MM:SS] KIND    name: text`, detail indented underneath.
pub fn format_message(message: &Message) -> String {
    let timecode = match message.elapsed {
        Some(elapsed) => {
            let total = elapsed.as_secs();
            format!("{:02}:{:02}:{:02}", total / 3600, (total % 3600) / 60, total % 60)
        }
        None => "--:--:--".to_string(),
    };
    let name = message.task_name.as_deref().unwrap_or("");
    let mut line = format!(
        "[{timecode}] {:<7} {:<20} {}",
        message.kind.label(),
        name,
        message.text
    );
    if let Some(logfile) = &message.logfile {
        line.push_str(&format!(" [{}]", logfile.display()));
    }
    if let Some(detail) = &message.detail {
        for detail_line in detail.lines() {
            line.push_str("\n    ");
            line.push_str(detail_line);
        }
    }
    line
}

/// Print the per-stage counters and total elapsed time.
pub fn print_summary(outcome: &RunOutcome) {
    for queue in &outcome.queues {
        eprintln!(
            "{}: {} processed, {} skipped, {} failed",
            queue.complete,
            queue.processed,
            queue.skipped,
            queue.failed.len()
        );
        for name in &queue.failed {
            eprintln!("    failed: {name}");
        }
    }
    let secs = outcome.elapsed.as_secs_f64();
    eprintln!("Session elapsed: {secs:.1}s");
}
