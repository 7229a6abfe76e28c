//! Session event observer
//!
//! One observer is armed per spec execution. It runs as its own task,
//! consuming the session's broadcast stream and feeding the network matcher
//! and the console collector while steps execute.
//!
//! ```text
//!   session ──broadcast──▶ observer task ──▶ RuleMatcher / ConsoleErrors
//!                              ▲
//!   dispatcher ──control───────┘  (Flush before each step, Finish at end)
//! ```

use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::console::ConsoleErrors;
use crate::context::ContextSource;
use crate::error::{ReplayError, ReplayResult};
use crate::network::RuleMatcher;
use crate::session::SessionEvent;

enum Control {
    /// Process every event already emitted, then acknowledge
    Flush(oneshot::Sender<()>),
    /// Process every event already emitted, then stop
    Finish,
}

/// What the observer collected over its lifetime
#[derive(Debug)]
pub struct Observations {
    pub network: RuleMatcher,
    pub console: ConsoleErrors,
}

struct State {
    network: RuleMatcher,
    console: ConsoleErrors,
    source: ContextSource,
}

impl State {
    fn handle(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Response(response) => self.network.observe(&response, &self.source),
            SessionEvent::Console(message) => self.console.observe(&message),
        }
    }

    /// Consume everything currently buffered without waiting for more.
    fn drain(&mut self, events: &mut broadcast::Receiver<SessionEvent>, open: &mut bool) {
        while *open {
            match events.try_recv() {
                Ok(event) => self.handle(event),
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!("observer fell behind, {} session events dropped", skipped)
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Closed) => *open = false,
            }
        }
    }
}

pub struct SessionObserver {
    control: mpsc::UnboundedSender<Control>,
    task: JoinHandle<Observations>,
}

impl SessionObserver {
    /// Spawn the observer task. `events` must be subscribed before the first
    /// operation whose responses should count.
    pub fn arm(
        events: broadcast::Receiver<SessionEvent>,
        network: RuleMatcher,
        source: ContextSource,
    ) -> Self {
        let (control, commands) = mpsc::unbounded_channel();
        let state = State {
            network,
            console: ConsoleErrors::new(),
            source,
        };
        debug!(rules = state.network.rules().len(), "session observer armed");
        let task = tokio::spawn(observe(events, commands, state));
        Self { control, task }
    }

    /// Wait until every event emitted so far has been processed.
    pub async fn sync(&self) {
        let (ack, done) = oneshot::channel();
        if self.control.send(Control::Flush(ack)).is_err() {
            warn!("session observer is gone, skipping sync");
            return;
        }
        if done.await.is_err() {
            warn!("session observer stopped before acknowledging sync");
        }
    }

    /// Drain outstanding events, stop the task and hand back its state.
    pub async fn finish(self) -> ReplayResult<Observations> {
        let _ = self.control.send(Control::Finish);
        self.task
            .await
            .map_err(|e| ReplayError::Browser(format!("session observer failed: {}", e)))
    }
}

async fn observe(
    mut events: broadcast::Receiver<SessionEvent>,
    mut commands: mpsc::UnboundedReceiver<Control>,
    mut state: State,
) -> Observations {
    let mut open = true;
    loop {
        tokio::select! {
            biased;

            command = commands.recv() => match command {
                Some(Control::Flush(ack)) => {
                    state.drain(&mut events, &mut open);
                    let _ = ack.send(());
                }
                Some(Control::Finish) | None => {
                    state.drain(&mut events, &mut open);
                    break;
                }
            },

            event = events.recv(), if open => match event {
                Ok(event) => state.handle(event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("observer fell behind, {} session events dropped", skipped)
                }
                Err(RecvError::Closed) => open = false,
            },
        }
    }

    Observations {
        network: state.network,
        console: state.console,
    }
}
