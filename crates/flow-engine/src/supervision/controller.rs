//! Controller side of the supervision protocol
//!
//! [`WorkerLink`] speaks the protocol over any reader/writer pair;
//! [`WorkerProcess`] launches the worker binary and links to its stdio.

use std::collections::HashMap;
use std::ops::Deref;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::channel::{channel, Channel, ChannelReceiver};
use super::messages::{ControllerMessage, WorkerMessage};
use crate::config::EngineConfig;
use crate::error::{EngineError, NodeError, Result};
use crate::events::EventSink;
use crate::status::StatusRelay;
use crate::types::{FlowGraph, NodeManifest};

/// Connection to one worker
pub struct WorkerLink {
    commands: Channel<ControllerMessage>,
    relay: Arc<StatusRelay>,
    flusher: JoinHandle<()>,
}

impl WorkerLink {
    /// Link to a worker reading its messages from `reader` and writing
    /// commands to `writer`
    ///
    /// Status broadcasts are batched into `status_sink` every
    /// `batch_interval`; every other worker message is returned on the
    /// receiver, which ends when the worker closes its output.
    pub fn connect<R, W>(
        reader: R,
        writer: W,
        status_sink: Arc<dyn EventSink>,
        batch_interval: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<WorkerMessage>)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let relay = Arc::new(StatusRelay::new(status_sink));
        // A zero period would make the ticker panic
        let flusher = relay.spawn_flusher(batch_interval.max(Duration::from_millis(1)));

        let (commands, outbound) = channel();
        spawn_writer(writer, outbound);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        spawn_reader(reader, Arc::clone(&relay), events_tx);

        (
            Self {
                commands,
                relay,
                flusher,
            },
            events_rx,
        )
    }

    /// Queue a command; `false` once the link is closed
    pub fn send(&self, message: ControllerMessage) -> bool {
        self.commands.send(message)
    }

    /// Provision and run a flow
    pub fn start(
        &self,
        config: EngineConfig,
        flow: FlowGraph,
        nodes: HashMap<String, NodeManifest>,
        direct_nodes: Option<Vec<String>>,
    ) -> bool {
        self.send(ControllerMessage::Start {
            config,
            flow,
            nodes,
            direct_nodes,
        })
    }

    /// Provision a flow without running it
    pub fn init(&self, config: EngineConfig, flow: FlowGraph, nodes: HashMap<String, NodeManifest>) -> bool {
        self.send(ControllerMessage::Init { config, flow, nodes })
    }

    pub fn run(&self) -> bool {
        self.send(ControllerMessage::Run)
    }

    /// Run only the given nodes
    pub fn direct(&self, direct_nodes: Vec<String>) -> bool {
        self.send(ControllerMessage::DirectNodes { direct_nodes })
    }

    pub fn stop(&self, error: Option<NodeError>) -> bool {
        self.send(ControllerMessage::Stop { error })
    }

    /// Stop sending; the worker sees end of input once queued commands
    /// are written
    pub fn close(&self) {
        self.commands.close();
    }

    pub fn relay(&self) -> &Arc<StatusRelay> {
        &self.relay
    }
}

impl Drop for WorkerLink {
    fn drop(&mut self) {
        self.flusher.abort();
        self.relay.flush();
        self.commands.close();
    }
}

fn spawn_writer<W>(writer: W, mut outbound: ChannelReceiver<ControllerMessage>) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut writer = writer;
        while let Some(message) = outbound.recv().await {
            let mut line = match serde_json::to_string(&message) {
                Ok(line) => line,
                Err(e) => {
                    log::error!("Failed to serialize '{}' command: {}", message.method(), e);
                    continue;
                }
            };
            line.push('\n');
            let written = async {
                writer.write_all(line.as_bytes()).await?;
                writer.flush().await
            };
            if let Err(e) = written.await {
                log::warn!("Worker unreachable: {}", e);
                break;
            }
        }
        let _ = writer.shutdown().await;
    })
}

fn spawn_reader<R>(
    reader: R,
    relay: Arc<StatusRelay>,
    events: mpsc::UnboundedSender<WorkerMessage>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    log::warn!("Failed to read from worker: {}", e);
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            match serde_json::from_str::<WorkerMessage>(&line) {
                Ok(WorkerMessage::BroadcastWebSocket { message }) => relay.push(message),
                Ok(message) => {
                    log::debug!("Worker message: {:?}", message);
                    // The receiver may have been dropped; messages are advisory
                    let _ = events.send(message);
                }
                Err(e) => log::warn!("Skipping unparseable worker line: {}", e),
            }
        }
        relay.flush();
        log::debug!("Worker output closed");
    })
}

/// A worker running as a child process
pub struct WorkerProcess {
    child: Child,
    link: WorkerLink,
}

impl WorkerProcess {
    /// Launch `config.worker.program` with piped stdio
    ///
    /// The worker's stderr is inherited so its logs reach the controller's
    /// terminal; the child is killed when this handle is dropped.
    pub fn spawn(
        config: &EngineConfig,
        status_sink: Arc<dyn EventSink>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<WorkerMessage>)> {
        let mut child = Command::new(&config.worker.program)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::precondition("worker stdin was not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::precondition("worker stdout was not captured"))?;

        log::info!(
            "Spawned worker {:?} (pid {:?})",
            config.worker.program,
            child.id()
        );

        let interval = Duration::from_millis(config.worker.status_batch_interval_ms);
        let (link, events) = WorkerLink::connect(stdout, stdin, status_sink, interval);
        Ok((Self { child, link }, events))
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Kill the worker and wait for it to exit
    pub async fn kill(&mut self) -> Result<()> {
        self.link.close();
        self.child.kill().await?;
        Ok(())
    }

    /// Wait for the worker to exit on its own
    pub async fn wait(&mut self) -> Result<ExitStatus> {
        Ok(self.child.wait().await?)
    }
}

impl Deref for WorkerProcess {
    type Target = WorkerLink;

    fn deref(&self) -> &WorkerLink {
        &self.link
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::VecEventSink;
    use crate::status::StatusMessage;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_reader_routes_messages() {
        let (worker_out, controller_in) = duplex(4096);
        let (controller_out, _worker_in) = duplex(4096);
        let sink = Arc::new(VecEventSink::new());

        let (link, mut events) =
            WorkerLink::connect(controller_in, controller_out, sink.clone(), Duration::from_secs(3600));

        let mut worker_out = worker_out;
        let broadcast = WorkerMessage::BroadcastWebSocket {
            message: StatusMessage::RemoveAllStatuses {
                node_id: "n".into(),
                flow_id: "f".into(),
            },
        };
        let mut payload = serde_json::to_string(&WorkerMessage::Init).unwrap();
        payload.push_str("\nnot json\n");
        payload.push_str(&serde_json::to_string(&broadcast).unwrap());
        payload.push('\n');
        payload.push_str(&serde_json::to_string(&WorkerMessage::Started).unwrap());
        payload.push('\n');
        worker_out.write_all(payload.as_bytes()).await.unwrap();
        drop(worker_out);

        assert!(matches!(events.recv().await, Some(WorkerMessage::Init)));
        assert!(matches!(events.recv().await, Some(WorkerMessage::Started)));
        assert!(events.recv().await.is_none());

        // End of worker output flushes pending broadcasts as one batch
        let sent = sink.messages();
        assert_eq!(sent.len(), 1);
        assert!(matches!(&sent[0], StatusMessage::Batch { messages } if messages.len() == 1));
        drop(link);
    }

    #[tokio::test]
    async fn test_commands_are_json_lines() {
        let (_worker_out, controller_in) = duplex(4096);
        let (controller_out, worker_in) = duplex(4096);
        let (link, _events) = WorkerLink::connect(
            controller_in,
            controller_out,
            Arc::new(VecEventSink::new()),
            Duration::from_secs(3600),
        );

        assert!(link.run());
        assert!(link.stop(None));
        link.close();
        assert!(!link.run());

        let mut lines = BufReader::new(worker_in).lines();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), r#"{"method":"run"}"#);
        assert_eq!(lines.next_line().await.unwrap().unwrap(), r#"{"method":"stop"}"#);
        assert!(lines.next_line().await.unwrap().is_none());
    }
}
