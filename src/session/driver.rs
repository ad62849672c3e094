use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::keepalive::{Keepalive, PING};
use super::{Request, Shared, SessionState};
use crate::control::{CommandEngine, CommandError, Completion, Settled};
use crate::diagnostic::{Diagnostic, TerminationReason};
use crate::protocol::{
    parse_line, Inbound, LineDialect, MessageSeverity, ProtocolViolation, RadioMessage,
};
use crate::registry::SubscriptionRegistry;
use crate::stream::StreamLane;
use crate::transport::{Connection, TransportEvent};

pub(super) struct DriverSettings {
    pub dialect: LineDialect,
    pub command_timeout: Duration,
    pub keepalive_interval: Duration,
    pub keepalive_timeout: Duration,
    pub max_protocol_violations: u32,
    pub sweep_interval: Duration,
}

enum Exit {
    Terminate(TerminationReason),
    Close(oneshot::Sender<()>),
}

/// Session task: sole owner of the connection, pending commands, listeners
/// and the stream lane.
pub(super) struct Driver {
    settings: DriverSettings,
    connection: Connection,
    engine: CommandEngine,
    registry: SubscriptionRegistry,
    lane: Option<StreamLane>,
    keepalive: Option<Keepalive>,
    requests: mpsc::UnboundedReceiver<Request>,
    shared: Arc<Shared>,
    diagnostics: mpsc::UnboundedSender<Diagnostic>,
    violations: u32,
}

impl Driver {
    pub(super) fn new(
        settings: DriverSettings,
        connection: Connection,
        requests: mpsc::UnboundedReceiver<Request>,
        shared: Arc<Shared>,
        diagnostics: mpsc::UnboundedSender<Diagnostic>,
    ) -> Self {
        Self {
            engine: CommandEngine::new(settings.dialect, settings.command_timeout),
            settings,
            connection,
            registry: SubscriptionRegistry::new(),
            lane: None,
            keepalive: None,
            requests,
            shared,
            diagnostics,
            violations: 0,
        }
    }

    pub(super) async fn run(mut self) {
        let peer = self.connection.peer();
        debug!(%peer, "session task started");
        let mut sweep = tokio::time::interval(self.settings.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let exit = loop {
            let step = tokio::select! {
                event = self.connection.next_event() => self.on_transport(event),
                request = self.requests.recv() => match request {
                    Some(request) => self.on_request(request).await,
                    None => Some(Exit::Terminate(TerminationReason::ClosedByHost)),
                },
                _ = sweep.tick() => self.on_tick().await,
            };
            if let Some(exit) = step {
                break exit;
            }
        };

        match exit {
            Exit::Terminate(reason) => self.teardown(reason).await,
            Exit::Close(ack) => {
                self.teardown(TerminationReason::ClosedByHost).await;
                let _ = ack.send(());
            }
        }
        debug!(%peer, "session task finished");
    }

    fn on_transport(&mut self, event: Option<TransportEvent>) -> Option<Exit> {
        match event {
            Some(TransportEvent::Line(line)) => self.on_line(line),
            Some(TransportEvent::Undecodable(reason)) => {
                self.on_violation(String::new(), ProtocolViolation::Undecodable(reason))
            }
            Some(TransportEvent::Error(err)) => {
                Some(Exit::Terminate(TerminationReason::Transport(err)))
            }
            Some(TransportEvent::Closed) | None => {
                Some(Exit::Terminate(TerminationReason::PeerClosed))
            }
        }
    }

    fn on_line(&mut self, line: String) -> Option<Exit> {
        let inbound = match parse_line(&line, self.settings.dialect) {
            Ok(inbound) => inbound,
            Err(violation) => return self.on_violation(line, violation),
        };

        match inbound {
            Inbound::Reply(reply) => {
                if let Some(settled) = self.engine.resolve(reply) {
                    self.settle(settled, Instant::now());
                }
            }
            Inbound::Status(event) => {
                for failure in self.registry.dispatch(&event) {
                    warn!(
                        category = %failure.category,
                        subscription = failure.handle.id(),
                        error = %failure.error,
                        "status listener failed"
                    );
                    self.report(Diagnostic::ListenerFailed {
                        subscription: failure.handle,
                        category: failure.category,
                        error: failure.error,
                    });
                }
            }
            Inbound::Handle(handle) => {
                debug!(%handle, "client handle assigned");
                self.shared.identity.lock().handle = Some(handle);
            }
            Inbound::Version(version) => {
                debug!(%version, "radio version");
                self.shared.identity.lock().version = Some(version);
            }
            Inbound::Message(message) => {
                log_radio_message(&message);
                self.report(Diagnostic::RadioMessage(message));
            }
        }
        None
    }

    fn on_violation(&mut self, line: String, violation: ProtocolViolation) -> Option<Exit> {
        self.violations += 1;
        warn!(%line, %violation, count = self.violations, "protocol violation");
        self.report(Diagnostic::ProtocolViolation { line, violation });
        if self.violations > self.settings.max_protocol_violations {
            return Some(Exit::Terminate(TerminationReason::ProtocolViolations(
                self.violations,
            )));
        }
        None
    }

    async fn on_request(&mut self, request: Request) -> Option<Exit> {
        match request {
            Request::Command {
                text,
                diagnostic,
                completion,
            } => self.issue(&text, diagnostic, completion).await,
            Request::Subscribe {
                category,
                listener,
                reply,
            } => {
                let handle = self.registry.subscribe(category, listener);
                let _ = reply.send(handle);
                None
            }
            Request::Unsubscribe { handle, reply } => {
                let _ = reply.send(self.registry.unsubscribe(handle));
                None
            }
            Request::AttachLane(lane) => {
                self.lane = Some(lane);
                None
            }
            Request::StartKeepalive => {
                self.keepalive = Some(Keepalive::new(
                    self.settings.keepalive_interval,
                    self.settings.keepalive_timeout,
                    Instant::now(),
                ));
                None
            }
            Request::Close { reply } => Some(Exit::Close(reply)),
        }
    }

    async fn on_tick(&mut self) -> Option<Exit> {
        let now = Instant::now();
        for settled in self.engine.expire(now) {
            self.settle(settled, now);
        }

        let (expired, due) = match &self.keepalive {
            Some(keepalive) => (keepalive.expired(now), keepalive.ping_due(now)),
            None => return None,
        };
        if expired {
            error!(peer = %self.connection.peer(), "no keepalive reply, giving up");
            return Some(Exit::Terminate(TerminationReason::KeepaliveLost));
        }
        if due {
            if let Some(keepalive) = self.keepalive.as_mut() {
                keepalive.ping_sent(now);
            }
            return self.issue(PING, false, Completion::Internal).await;
        }
        None
    }

    async fn issue(&mut self, text: &str, diagnostic: bool, completion: Completion) -> Option<Exit> {
        let now = Instant::now();
        let (sequence, line) = match self.engine.issue(text, diagnostic, completion, now) {
            Ok(issued) => issued,
            Err((err, completion)) => {
                debug!(command = text, error = %err, "command refused");
                completion.deliver(Err(err));
                return None;
            }
        };
        match self.connection.send_line(&line).await {
            Ok(()) => None,
            Err(err) => {
                if let Some(settled) = self
                    .engine
                    .fail(sequence, CommandError::Send(err.to_string()))
                {
                    self.settle(settled, now);
                }
                Some(Exit::Terminate(TerminationReason::Transport(err)))
            }
        }
    }

    fn settle(&mut self, settled: Settled, now: Instant) {
        if settled.completion.is_internal() && settled.text == PING {
            let heard = !matches!(
                settled.outcome,
                Err(CommandError::Timeout | CommandError::SessionClosed | CommandError::Send(_))
            );
            if heard {
                if let Some(keepalive) = self.keepalive.as_mut() {
                    keepalive.answered(now);
                }
            }
            return;
        }
        let sequence = settled.sequence;
        if catch_unwind(AssertUnwindSafe(|| settled.deliver())).is_err() {
            warn!(sequence, "command callback panicked");
        }
    }

    async fn teardown(&mut self, reason: TerminationReason) {
        let peer = self.connection.peer();
        match &reason {
            TerminationReason::ClosedByHost => info!(%peer, "closing session"),
            other => error!(%peer, reason = %other, "session terminated"),
        }
        self.shared.advance(SessionState::Closing);

        let now = Instant::now();
        for settled in self.engine.drain() {
            self.settle(settled, now);
        }
        self.registry.clear();
        self.keepalive = None;
        if let Some(mut lane) = self.lane.take() {
            lane.shutdown().await;
        }

        self.requests.close();
        while let Ok(request) = self.requests.try_recv() {
            request.fail();
        }

        self.connection.disconnect().await;
        self.shared.advance(SessionState::Disconnected);
        self.report(Diagnostic::Terminated(reason));
    }

    fn report(&self, diagnostic: Diagnostic) {
        // The host may never take the receiver.
        let _ = self.diagnostics.send(diagnostic);
    }
}

fn log_radio_message(message: &RadioMessage) {
    let number = message.number;
    let text = &message.text;
    match message.severity {
        MessageSeverity::Info => info!(number, %text, "radio message"),
        MessageSeverity::Warning => warn!(number, %text, "radio message"),
        MessageSeverity::Error | MessageSeverity::Fatal => {
            error!(number, %text, severity = ?message.severity, "radio message")
        }
    }
}
