use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

use dirmux_client::{ReaderState, UnsolicitedNotice};
use tracing::{debug, info};

use crate::cmd::{Session, WatchArgs};
use crate::exit::{result_exit_code, CliError, CliResult, FAILURE, INTERNAL, SUCCESS};
use crate::output::{print_notice, OutputFormat};

const POLL: Duration = Duration::from_millis(200);
/// Grace period for listener threads still delivering after the reader died.
const DRAIN: Duration = Duration::from_millis(500);

pub fn run(args: WatchArgs, format: OutputFormat) -> CliResult<i32> {
    let session = Session::open(&args.server)?;
    if args.credentials.dn.is_some() {
        let (_, result) = session.bind(&args.credentials)?;
        if !result.is_success() {
            return Err(CliError::new(
                result_exit_code(result.result_code),
                format!(
                    "bind failed with result {}: {}",
                    result.result_code, result.diagnostic_message
                ),
            ));
        }
    }

    let (tx, notices) = mpsc::channel();
    let listener = session
        .connection
        .add_listener(Arc::new(move |notice: &UnsolicitedNotice| {
            let _ = tx.send(notice.clone());
        }));

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;
    info!(conn = session.connection.name(), "watching for unsolicited notifications");

    let mut watcher = Watcher {
        name: session.connection.name().to_string(),
        format,
        limit: args.count,
        printed: 0,
    };
    let outcome = loop {
        if !running.load(Ordering::SeqCst) {
            debug!("interrupted");
            break Ok(SUCCESS);
        }
        match notices.recv_timeout(POLL) {
            Ok(notice) => {
                if watcher.show(&notice) {
                    break Ok(SUCCESS);
                }
            }
            Err(RecvTimeoutError::Timeout) if session.connection.is_connected() => {}
            Err(_) => break watcher.finish(&session, &notices),
        }
    };

    session.connection.remove_listener(listener);
    session.connection.disconnect();
    outcome
}

struct Watcher {
    name: String,
    format: OutputFormat,
    limit: Option<usize>,
    printed: usize,
}

impl Watcher {
    /// Print one notice. Returns true once watching should stop.
    fn show(&mut self, notice: &UnsolicitedNotice) -> bool {
        print_notice(notice, &self.name, self.format);
        self.printed = self.printed.saturating_add(1);
        notice.is_notice_of_disconnection() || self.limit.is_some_and(|limit| self.printed >= limit)
    }

    /// The connection is gone: print what is still in flight, then decide
    /// whether the server said goodbye first.
    fn finish(&mut self, session: &Session, notices: &Receiver<UnsolicitedNotice>) -> CliResult<i32> {
        while let Ok(notice) = notices.recv_timeout(DRAIN) {
            if self.show(&notice) {
                return Ok(SUCCESS);
            }
        }
        if session.connection.server_shutdown_noticed() {
            return Ok(SUCCESS);
        }
        let reason = match session.connection.reader_state() {
            ReaderState::Failed(reason) => reason,
            other => format!("reader {other:?}"),
        };
        Err(CliError::new(FAILURE, format!("connection lost: {reason}")))
    }
}

fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}
