//! Session loop: one task owns the `PeerSession` and feeds it channel events,
//! stdin commands, drain signals and ticks, one at a time.

use std::collections::VecDeque;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Context;
use handoff_core::view::TransferProgress;
use handoff_core::{
    Action, ChannelMessage, Direction, FileDescriptor, PeerSession, SessionSnapshot,
    TransferEvent,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

use crate::commands::{Command, CommandError, USAGE};
use crate::config::Config;
use crate::downloads;
use crate::transport::{self, ChannelEvent, ChannelHandle};

const TICK_INTERVAL: Duration = Duration::from_secs(1);
/// Minimum gap between two progress pushes.
const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

enum Flow {
    Continue(Vec<Action>),
    Quit,
}

pub struct Runner {
    session: PeerSession,
    download_dir: PathBuf,
    auto_accept: bool,
    shown_revision: u64,
    shown_at: Option<Instant>,
}

impl Runner {
    /// Session enters `Connecting`; call `run` once the stream is up.
    pub fn new(cfg: &Config) -> anyhow::Result<Self> {
        let mut session = PeerSession::new(cfg.name.clone(), cfg.session_config());
        session.connect()?;
        Ok(Self {
            shown_revision: session.revision(),
            session,
            download_dir: cfg.download_dir.clone(),
            auto_accept: cfg.auto_accept,
            shown_at: None,
        })
    }

    pub async fn run(
        mut self,
        stream: TcpStream,
        initial: Vec<PathBuf>,
        shutdown: impl Future<Output = ()>,
    ) -> anyhow::Result<()> {
        let low = self.session.config().send_buffer_high_watermark / 2;
        let (channel, mut events) = transport::spawn_channel(stream, low);
        let actions = self.session.on_channel_open();
        self.execute(&channel, actions).await;

        for path in initial {
            let actions = self.offer_file(&path).unwrap_or_else(|e| {
                println!("error: {:#}", e);
                Vec::new()
            });
            self.execute(&channel, actions).await;
        }
        println!("{}", USAGE);

        let mut stdin = BufReader::new(tokio::io::stdin()).lines();
        let mut stdin_open = true;
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        tokio::pin!(shutdown);

        loop {
            let actions = tokio::select! {
                event = events.recv() => match event {
                    Some(ChannelEvent::Text(text)) => self.session.on_text_message(&text),
                    Some(ChannelEvent::Binary(bytes)) => self.session.on_binary_message(&bytes),
                    Some(ChannelEvent::Closed) | None => {
                        let actions = self.session.on_channel_closed();
                        self.execute(&channel, actions).await;
                        break;
                    }
                },
                line = stdin.next_line(), if stdin_open => match line {
                    Ok(Some(line)) => match self.on_command(&line) {
                        Flow::Continue(actions) => actions,
                        Flow::Quit => {
                            let actions = self.session.disconnect();
                            self.execute(&channel, actions).await;
                            break;
                        }
                    },
                    Ok(None) => {
                        debug!("stdin closed");
                        stdin_open = false;
                        Vec::new()
                    }
                    Err(e) => {
                        warn!(error = %e, "stdin read failed");
                        stdin_open = false;
                        Vec::new()
                    }
                },
                _ = channel.drained() => Vec::new(),
                _ = ticker.tick() => self.session.tick(Instant::now()),
                _ = &mut shutdown => {
                    info!("shutting down");
                    let actions = self.session.disconnect();
                    self.execute(&channel, actions).await;
                    break;
                }
            };
            self.execute(&channel, actions).await;
            let more = self.pump(channel.buffered_amount());
            self.execute(&channel, more).await;
            self.push_progress(Instant::now());
        }
        Ok(())
    }

    /// File sources are blocking reads, so the worker thread is handed over while the pump runs.
    /// Needs the multi-thread runtime.
    fn pump(&mut self, buffered: usize) -> Vec<Action> {
        tokio::task::block_in_place(|| self.session.pump(buffered))
    }

    /// Print in-flight progress once the session has changed, at most every `PROGRESS_INTERVAL`.
    /// A throttled change is picked up by a later turn; the ticker guarantees one per second.
    fn push_progress(&mut self, now: Instant) {
        let revision = self.session.revision();
        if revision == self.shown_revision {
            return;
        }
        if self
            .shown_at
            .is_some_and(|at| now.saturating_duration_since(at) < PROGRESS_INTERVAL)
        {
            return;
        }
        self.shown_revision = revision;
        self.shown_at = Some(now);
        for line in progress_lines(&self.session.snapshot()) {
            println!("{}", line);
        }
    }

    /// Perform session actions. Auto-accept feeds follow-up actions back into the queue.
    async fn execute(&mut self, channel: &ChannelHandle, actions: Vec<Action>) {
        let mut queue: VecDeque<Action> = actions.into();
        while let Some(action) = queue.pop_front() {
            match action {
                Action::SendText(text) => send(channel, ChannelMessage::Text(text)),
                Action::SendBinary(bytes) => send(channel, ChannelMessage::Binary(bytes)),
                Action::DeliverFile {
                    id,
                    descriptor,
                    bytes,
                } => match downloads::save(&self.download_dir, &descriptor.name, &bytes).await {
                    Ok(path) => {
                        info!(transfer_id = %id, path = %path.display(), "file saved");
                        println!("saved {}", path.display());
                    }
                    Err(e) => {
                        error!(transfer_id = %id, error = %e, "could not save file");
                        println!("could not save {}: {}", descriptor.name, e);
                    }
                },
                Action::Event(event) => {
                    report(&event);
                    if let TransferEvent::OfferReceived { id, .. } = event {
                        if self.auto_accept {
                            match self.session.accept(id) {
                                Ok(more) => queue.extend(more),
                                Err(e) => warn!(transfer_id = %id, error = %e, "auto-accept failed"),
                            }
                        }
                    }
                }
            }
        }
    }

    fn on_command(&mut self, line: &str) -> Flow {
        let command = match line.parse::<Command>() {
            Ok(command) => command,
            Err(CommandError::Empty) => return Flow::Continue(Vec::new()),
            Err(e) => {
                println!("{}\n{}", e, USAGE);
                return Flow::Continue(Vec::new());
            }
        };
        let result = match command {
            Command::Send(path) => self.offer_file(&path),
            Command::Accept(id) => self.session.accept(id).map_err(anyhow::Error::from),
            Command::Reject(id) => self.session.reject(id).map_err(anyhow::Error::from),
            Command::Cancel(id) => self.session.cancel(id).map_err(anyhow::Error::from),
            Command::Status => self.print_status().map(|()| Vec::new()),
            Command::History => {
                self.print_history();
                Ok(Vec::new())
            }
            Command::Quit => return Flow::Quit,
        };
        match result {
            Ok(actions) => Flow::Continue(actions),
            Err(e) => {
                println!("error: {:#}", e);
                Flow::Continue(Vec::new())
            }
        }
    }

    /// The source is read lazily, chunk by chunk, as `pump` asks for it.
    fn offer_file(&mut self, path: &Path) -> anyhow::Result<Vec<Action>> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("opening {}", path.display()))?;
        let meta = file
            .metadata()
            .with_context(|| format!("reading metadata of {}", path.display()))?;
        if !meta.is_file() {
            anyhow::bail!("{} is not a regular file", path.display());
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        let (id, actions) = self.session.offer(
            FileDescriptor::new(name, meta.len()),
            Box::new(std::io::BufReader::new(file)),
        )?;
        println!("offered {} ({} bytes) as {}", path.display(), meta.len(), id);
        Ok(actions)
    }

    fn print_status(&self) -> anyhow::Result<()> {
        let snapshot = self.session.snapshot();
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        Ok(())
    }

    fn print_history(&self) {
        let records = self.session.history().records();
        if records.is_empty() {
            println!("no transfers yet");
        }
        for r in records {
            let arrow = match r.direction {
                Direction::Sent => "->",
                Direction::Received => "<-",
            };
            println!(
                "{} {} {} ({} bytes) {:?}",
                arrow, r.peer_name, r.file_name, r.file_size, r.status
            );
        }
    }
}

fn send(channel: &ChannelHandle, msg: ChannelMessage) {
    if let Err(e) = channel.send(&msg) {
        debug!(error = %e, "dropping outbound message");
    }
}

/// One line per transfer that is moving bytes right now.
fn progress_lines(snapshot: &SessionSnapshot) -> Vec<String> {
    let sending = snapshot
        .outgoing
        .iter()
        .filter(|p| p.state == "sending")
        .map(|p| ("->", p));
    let receiving = snapshot
        .incoming
        .iter()
        .filter(|p| p.state == "receiving")
        .map(|p| ("<-", p));
    sending
        .chain(receiving)
        .map(|(arrow, p)| progress_line(arrow, p))
        .collect()
}

fn progress_line(arrow: &str, p: &TransferProgress) -> String {
    format!(
        "{} {} {}% ({}/{} bytes, {:.1} KiB/s)",
        arrow,
        p.file_name,
        p.progress,
        p.bytes_transferred,
        p.total_bytes,
        p.speed / 1024.0
    )
}

fn report(event: &TransferEvent) {
    match event {
        TransferEvent::PeerIdentified { name } => println!("connected to {}", name),
        TransferEvent::OfferReceived { id, descriptor } => println!(
            "incoming {} ({} bytes): accept {} | reject {}",
            descriptor.name, descriptor.size, id, id
        ),
        TransferEvent::OfferAccepted { descriptor, .. } => {
            println!("{} accepted, sending", descriptor.name)
        }
        TransferEvent::OfferRejected { descriptor, .. } => {
            println!("{} was declined", descriptor.name)
        }
        TransferEvent::Completed {
            descriptor,
            direction,
            ..
        } => {
            let verb = match direction {
                Direction::Sent => "sent",
                Direction::Received => "received",
            };
            println!("{} {} ({} bytes)", verb, descriptor.name, descriptor.size);
        }
        TransferEvent::Failed {
            descriptor, error, ..
        } => println!("{} failed: {}", descriptor.name, error),
        TransferEvent::Disconnected => println!("disconnected"),
    }
}
