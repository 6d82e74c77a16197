use std::env;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing_subscriber::fmt::time::UtcTime;

static TRACING_INIT: OnceLock<()> = OnceLock::new();

pub fn trace_log_path() -> PathBuf {
    env::var("ULTRAMARK_TRACE_LOG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| env::temp_dir().join("ultramark_trace.jsonl"))
}

/// Install the process-wide tracing subscriber once.
///
/// With `to_file` set, events go to a JSONL trace file (path overridable via
/// `ULTRAMARK_TRACE_LOG`); otherwise compact fmt output goes to stderr so the
/// CLI stays readable.
pub fn init_tracing(to_file: bool) {
    let _ = TRACING_INIT.get_or_init(|| {
        if to_file {
            let path = trace_log_path();
            let file = match OpenOptions::new().create(true).append(true).open(&path) {
                Ok(file) => file,
                Err(_) => return,
            };
            let subscriber = tracing_subscriber::fmt()
                .json()
                .with_timer(UtcTime::rfc_3339())
                .with_writer(file)
                .with_current_span(false)
                .with_span_list(false)
                .finish();
            let _ = tracing::subscriber::set_global_default(subscriber);
        } else {
            let subscriber = tracing_subscriber::fmt()
                .compact()
                .with_writer(std::io::stderr)
                .finish();
            let _ = tracing::subscriber::set_global_default(subscriber);
        }
    });
}
